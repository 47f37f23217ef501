//! Credential prompting
//!
//! Authentication never talks to a terminal or UI directly. Passphrases,
//! passwords, keyboard-interactive answers and the "retry or give up"
//! decision all go through [`CredentialPrompt`].

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// Answers collected for a multi-prompt round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptOutcome {
    /// Responses in prompt order, up to the first cancelled prompt
    pub responses: Vec<String>,
    pub cancelled: bool,
}

/// What to do after a failed first attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureChoice {
    Retry,
    Close,
}

#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    /// Masked single input; `None` when the user cancelled
    async fn prompt_secret(&self, title: &str) -> Option<String>;

    async fn prompt_multiple(&self, title: &str, prompts: &[KbiPrompt]) -> PromptOutcome;

    async fn failure_choice(&self, message: &str) -> FailureChoice;
}

/// Prompts on the controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

fn read_visible(prompt: &str) -> io::Result<Option<String>> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn read_masked(prompt: &str) -> io::Result<Option<String>> {
    match rpassword::prompt_password(prompt) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

async fn blocking_read(prompt: String, echo: bool) -> Option<String> {
    let result = tokio::task::spawn_blocking(move || {
        if echo {
            read_visible(&prompt)
        } else {
            read_masked(&prompt)
        }
    })
    .await;

    match result {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!("Terminal prompt failed: {}", e);
            None
        }
        Err(e) => {
            warn!("Terminal prompt task failed: {}", e);
            None
        }
    }
}

#[async_trait]
impl CredentialPrompt for TerminalPrompt {
    async fn prompt_secret(&self, title: &str) -> Option<String> {
        blocking_read(format!("{}: ", title), false).await
    }

    async fn prompt_multiple(&self, title: &str, prompts: &[KbiPrompt]) -> PromptOutcome {
        if !title.is_empty() {
            eprintln!("{}", title);
        }

        let mut outcome = PromptOutcome::default();
        for prompt in prompts {
            match blocking_read(prompt.prompt.clone(), prompt.echo).await {
                Some(answer) => outcome.responses.push(answer),
                None => {
                    outcome.cancelled = true;
                    break;
                }
            }
        }
        outcome
    }

    async fn failure_choice(&self, message: &str) -> FailureChoice {
        let question = format!("{}\n[R]etry or [C]lose Remote? ", message);
        match blocking_read(question, true).await {
            Some(answer) if answer.trim().eq_ignore_ascii_case("r")
                || answer.trim().eq_ignore_ascii_case("retry") =>
            {
                FailureChoice::Retry
            }
            _ => FailureChoice::Close,
        }
    }
}
