//! Remote server bootstrap
//!
//! The bootstrap installs and starts the remote server over an exec channel
//! and reports where it listens. [`ScriptBootstrap`] runs a shell script (the
//! bundled one, or a configured command) and reads its report from a block of
//! `key==value==` lines fenced by `<id>: start` / `<id>: end` markers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ResolverSettings;
use crate::error::ResolveError;
use crate::forwarding::RemoteTarget;
use crate::ssh::RemoteSession;

/// Script run when no bootstrap command is configured
pub const DEFAULT_BOOTSTRAP_SCRIPT: &str = include_str!("bootstrap.sh");

/// What the remote side is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub download_url_template: String,
    pub extensions: Vec<String>,
    /// Variables whose remote values are echoed back
    pub env_var_names: Vec<String>,
    pub listen_on_socket: bool,
}

impl BootstrapRequest {
    pub fn from_settings(settings: &ResolverSettings) -> Self {
        Self {
            download_url_template: settings.server_download_url_template.clone(),
            extensions: settings.default_extensions.clone(),
            env_var_names: settings.server_env_vars.clone(),
            listen_on_socket: settings.remote_server_listen_on_socket,
        }
    }
}

/// What the remote side reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub exit_code: i32,
    pub listening_on: RemoteTarget,
    pub connection_token: String,
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait RemoteBootstrap: Send + Sync {
    async fn install(
        &self,
        session: &dyn RemoteSession,
        request: &BootstrapRequest,
    ) -> Result<BootstrapOutcome, ResolveError>;
}

/// Runs a shell script on the remote host and parses its report
pub struct ScriptBootstrap {
    script: String,
}

impl ScriptBootstrap {
    pub fn new() -> Self {
        Self {
            script: DEFAULT_BOOTSTRAP_SCRIPT.to_string(),
        }
    }

    /// Use `command` instead of the bundled script
    pub fn with_command(command: Option<String>) -> Self {
        match command {
            Some(script) => Self { script },
            None => Self::new(),
        }
    }

    /// Full remote command line: environment assignments, then the script
    pub fn command_line(&self, script_id: &str, request: &BootstrapRequest) -> String {
        let assignments = [
            ("SSH_REMOTE_SCRIPT_ID", script_id.to_string()),
            (
                "SSH_REMOTE_DOWNLOAD_URL",
                request.download_url_template.clone(),
            ),
            ("SSH_REMOTE_EXTENSIONS", request.extensions.join(",")),
            ("SSH_REMOTE_ENV_VARS", request.env_var_names.join(" ")),
            (
                "SSH_REMOTE_LISTEN_ON_SOCKET",
                request.listen_on_socket.to_string(),
            ),
        ];

        let mut line = String::new();
        for (name, value) in assignments {
            line.push_str(name);
            line.push('=');
            line.push_str(&shell_quote(&value));
            line.push(' ');
        }
        line.push_str("sh -c ");
        line.push_str(&shell_quote(&self.script));
        line
    }
}

impl Default for ScriptBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBootstrap for ScriptBootstrap {
    async fn install(
        &self,
        session: &dyn RemoteSession,
        request: &BootstrapRequest,
    ) -> Result<BootstrapOutcome, ResolveError> {
        let script_id = uuid::Uuid::new_v4().simple().to_string();
        info!("Running remote bootstrap {}", script_id);

        let output = session.exec(&self.command_line(&script_id, request)).await?;
        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        if !stderr.trim().is_empty() {
            debug!("Bootstrap stderr:\n{}", stderr.trim_end());
        }

        match parse_bootstrap_output(&stdout, &script_id, &request.env_var_names) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    "Bootstrap exited with status {:?}; stderr: {}",
                    output.exit_status,
                    stderr.trim_end()
                );
                Err(e)
            }
        }
    }
}

/// Parse the marker-fenced report of the bootstrap script
pub fn parse_bootstrap_output(
    output: &str,
    script_id: &str,
    env_var_names: &[String],
) -> Result<BootstrapOutcome, ResolveError> {
    let section = extract_section(
        output,
        &format!("{}: start", script_id),
        &format!("{}: end", script_id),
    )
    .ok_or_else(|| ResolveError::Bootstrap("Bootstrap output markers not found".to_string()))?;

    let mut fields = BTreeMap::new();
    for line in section.lines() {
        let Some(pair) = line.trim().strip_suffix("==") else {
            continue;
        };
        if let Some((key, value)) = pair.split_once("==") {
            fields.insert(key.to_string(), value.to_string());
        }
    }

    let exit_code = fields
        .get("exitCode")
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(|| ResolveError::Bootstrap("Missing exitCode in bootstrap output".to_string()))?;
    if exit_code != 0 {
        return Err(ResolveError::Bootstrap(format!(
            "Install script returned non-zero exit status {}",
            exit_code
        )));
    }

    let listening_on = match fields.get("listeningOn").map(String::as_str) {
        Some(value) if !value.is_empty() => match value.parse::<u16>() {
            Ok(port) => RemoteTarget::Port(port),
            Err(_) => RemoteTarget::Socket(value.to_string()),
        },
        _ => {
            return Err(ResolveError::Bootstrap(
                "Missing listeningOn in bootstrap output".to_string(),
            ))
        }
    };

    let env = env_var_names
        .iter()
        .filter_map(|name| fields.get(name).map(|v| (name.clone(), v.clone())))
        .collect();

    Ok(BootstrapOutcome {
        exit_code,
        listening_on,
        connection_token: fields.get("connectionToken").cloned().unwrap_or_default(),
        env,
    })
}

/// Extract text between two markers.
fn extract_section<'a>(text: &'a str, start_marker: &str, end_marker: &str) -> Option<&'a str> {
    let start = text.find(start_marker)?;
    let after_start = start + start_marker.len();
    let end = text[after_start..].find(end_marker)?;
    Some(&text[after_start..after_start + end])
}

/// Single-quote for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::session::tests::{MockSession, SessionEvent};
    use crate::ssh::ExecOutput;
    use std::sync::Arc;

    fn request() -> BootstrapRequest {
        BootstrapRequest {
            download_url_template: "https://example.com/${version}/server-${arch}.tar.gz".into(),
            extensions: vec!["ms-python.python".into(), "rust-lang.rust-analyzer".into()],
            env_var_names: vec!["DISPLAY".into(), "LANG".into()],
            listen_on_socket: false,
        }
    }

    fn report(id: &str, body: &str) -> String {
        format!("noise before\n{id}: start\n{body}{id}: end\ntrailing\n")
    }

    #[test]
    fn test_parse_port_report() {
        let output = report(
            "abc",
            "exitCode==0==\nlisteningOn==40211==\nconnectionToken==s3cr3t==\nDISPLAY==:1==\nLANG====\n",
        );
        let outcome = parse_bootstrap_output(&output, "abc", &request().env_var_names).unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.listening_on, RemoteTarget::Port(40211));
        assert_eq!(outcome.connection_token, "s3cr3t");
        assert_eq!(outcome.env.get("DISPLAY").map(String::as_str), Some(":1"));
        assert_eq!(outcome.env.get("LANG").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_socket_report() {
        let output = report(
            "abc",
            "exitCode==0==\nlisteningOn==/home/alice/.ssh-remote-server/server.sock==\nconnectionToken====\n",
        );
        let outcome = parse_bootstrap_output(&output, "abc", &[]).unwrap();
        assert_eq!(
            outcome.listening_on,
            RemoteTarget::Socket("/home/alice/.ssh-remote-server/server.sock".into())
        );
        assert!(outcome.connection_token.is_empty());
        assert!(outcome.env.is_empty());
    }

    #[test]
    fn test_non_zero_exit_is_bootstrap_error() {
        let output = report("abc", "exitCode==1==\nlisteningOn====\nconnectionToken====\n");
        let err = parse_bootstrap_output(&output, "abc", &[]).unwrap_err();
        assert!(matches!(err, ResolveError::Bootstrap(_)));
    }

    #[test]
    fn test_markers_of_other_run_ignored() {
        let output = report("other", "exitCode==0==\nlisteningOn==1==\n");
        assert!(matches!(
            parse_bootstrap_output(&output, "abc", &[]),
            Err(ResolveError::Bootstrap(_))
        ));
    }

    #[test]
    fn test_command_line_quotes_values() {
        let bootstrap = ScriptBootstrap::with_command(Some("echo 'hi'".into()));
        let line = bootstrap.command_line("abc", &request());

        assert!(line.starts_with("SSH_REMOTE_SCRIPT_ID='abc' "));
        assert!(line.contains(
            "SSH_REMOTE_DOWNLOAD_URL='https://example.com/${version}/server-${arch}.tar.gz'"
        ));
        assert!(line.contains("SSH_REMOTE_EXTENSIONS='ms-python.python,rust-lang.rust-analyzer'"));
        assert!(line.contains("SSH_REMOTE_ENV_VARS='DISPLAY LANG'"));
        assert!(line.contains("SSH_REMOTE_LISTEN_ON_SOCKET='false'"));
        assert!(line.ends_with("sh -c 'echo '\\''hi'\\'''"));
    }

    #[tokio::test]
    async fn test_install_runs_script_once() {
        let session = Arc::new(MockSession::new("web", "dial"));
        let bootstrap = ScriptBootstrap::new();

        // The script id is random, so no report can match it
        *session.exec_output.lock() = ExecOutput {
            exit_status: Some(0),
            stdout: b"abc: start\nexitCode==0==\nabc: end\n".to_vec(),
            stderr: Vec::new(),
        };
        let err = bootstrap.install(&session, &request()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Bootstrap(_)));

        let events = session.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Exec(command) => {
                assert!(command.contains("SSH_REMOTE_LISTEN_ON_SOCKET='false'"));
                assert!(command.contains("sh -c '"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_default_script_reports_markers() {
        assert!(DEFAULT_BOOTSTRAP_SCRIPT.contains("$SSH_REMOTE_SCRIPT_ID: start"));
        assert!(DEFAULT_BOOTSTRAP_SCRIPT.contains("$SSH_REMOTE_SCRIPT_ID: end"));
    }
}
