//! Remote authority strings: `ssh-remote+[user@]host[:port]`

use crate::error::ResolveError;
use crate::ssh::Destination;

pub const AUTHORITY_SCHEME: &str = "ssh-remote";

/// Parse an authority into its destination
pub fn parse_authority(authority: &str) -> Result<Destination, ResolveError> {
    let (scheme, dest) = authority.split_once('+').ok_or_else(|| {
        ResolveError::Parse(format!("Missing '+' separator in '{}'", authority))
    })?;

    if scheme != AUTHORITY_SCHEME {
        return Err(ResolveError::Parse(format!(
            "Unknown authority scheme '{}', expected '{}'",
            scheme, AUTHORITY_SCHEME
        )));
    }

    let destination = Destination::parse(dest);
    if destination.hostname.is_empty() {
        return Err(ResolveError::Parse(format!(
            "No host name in '{}'",
            authority
        )));
    }
    Ok(destination)
}

pub fn format_authority(destination: &Destination) -> String {
    format!("{}+{}", AUTHORITY_SCHEME, destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority() {
        let dest = parse_authority("ssh-remote+alice@build.example.com:2222").unwrap();
        assert_eq!(dest.hostname, "build.example.com");
        assert_eq!(dest.user.as_deref(), Some("alice"));
        assert_eq!(dest.port, Some(2222));
        assert_eq!(format_authority(&dest), "ssh-remote+alice@build.example.com:2222");
    }

    #[test]
    fn test_plain_host() {
        let dest = parse_authority("ssh-remote+devbox").unwrap();
        assert_eq!(dest.hostname, "devbox");
        assert_eq!(dest.user, None);
        assert_eq!(dest.port, None);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["devbox", "wsl+devbox", "ssh-remote+", "ssh-remote+alice@"] {
            let err = parse_authority(bad).unwrap_err();
            assert!(matches!(err, ResolveError::Parse(_)), "{}", bad);
        }
    }
}
