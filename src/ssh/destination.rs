//! SSH destination parsing
//!
//! Parses `[user@]host[:port]` strings and `ProxyJump` hop lists.

use std::fmt;

/// A parsed `[user@]host[:port]` destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Host alias or address (everything between the last `@` and the last `:`)
    pub hostname: String,
    /// User name (substring before the last `@`)
    pub user: Option<String>,
    /// Port (substring after the last `:`, `None` if it is not a number)
    pub port: Option<u16>,
}

impl Destination {
    pub fn new(hostname: impl Into<String>, user: Option<String>, port: Option<u16>) -> Self {
        Self {
            hostname: hostname.into(),
            user,
            port,
        }
    }

    /// Parse `[user@]host[:port]`
    ///
    /// No escaping is supported: a hostname containing `@` or `:` cannot be
    /// represented. The port is the leading digits after the last `:`
    /// (`host:22x` has port 22); no digits, or a value above 65535, yields
    /// `None` instead of an error.
    pub fn parse(dest: &str) -> Self {
        let at_pos = dest.rfind('@');
        let user = at_pos.map(|pos| dest[..pos].to_string());

        let colon_pos = dest.rfind(':');
        let port = colon_pos.and_then(|pos| parse_port(&dest[pos + 1..]));

        let start = at_pos.map_or(0, |pos| pos + 1);
        let end = colon_pos.unwrap_or(dest.len());
        // "host:22@user" has its last ':' before the last '@'
        let hostname = if start <= end {
            dest[start..end].to_string()
        } else {
            String::new()
        };

        Self {
            hostname,
            user,
            port,
        }
    }
}

/// Leading decimal digits, after optional whitespace and `+`
fn parse_port(text: &str) -> Option<u16> {
    let text = text.trim_start();
    let text = text.strip_prefix('+').unwrap_or(text);
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.hostname)?;
        if let Some(port) = self.port.filter(|p| *p != 0) {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Split a `ProxyJump` value into its hops
///
/// Entries are comma separated; blank entries are dropped and `none`
/// disables jumping altogether.
pub fn parse_proxy_jump(value: &str) -> Vec<Destination> {
    if value.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    value
        .split(',')
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(Destination::parse)
        .collect()
}
