//! Content scoring back-ends.
//!
//! Three interchangeable implementations behind one trait: the spamd TCP
//! protocol, a command-line client that prints `score/required`, and a
//! disabled scorer for deployments that gate on blacklists alone.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scorer protocol error: {0}")]
    Protocol(String),

    #[error("scorer unavailable: {0}")]
    Unavailable(String),
}

/// A content score: the numeric value when the back-end produced one, plus
/// its free-form report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentScore {
    pub score: Option<f64>,
    pub report: String,
}

#[async_trait]
pub trait ContentScorer: Send + Sync {
    /// Score one (subject, body, from) triple.
    ///
    /// # Errors
    /// Back-end unreachable or speaking an unexpected protocol.
    async fn score(
        &self,
        subject: &str,
        body: &str,
        from_email: &str,
    ) -> Result<ContentScore, ScoreError>;
}

/// No-op scorer: never produces a numeric score.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledScorer;

#[async_trait]
impl ContentScorer for DisabledScorer {
    async fn score(
        &self,
        _subject: &str,
        _body: &str,
        _from_email: &str,
    ) -> Result<ContentScore, ScoreError> {
        Ok(ContentScore {
            score: None,
            report: "content scoring disabled".to_string(),
        })
    }
}

/// SpamAssassin-daemon style scorer over TCP.
///
/// Sends a `REPORT` request with a `Content-length` header and a
/// CRLF-normalized message; reads the `Spam: True|False ; score / required`
/// line out of the response.
#[derive(Debug, Clone)]
pub struct SpamdScorer {
    addr: String,
    timeout: Duration,
}

impl SpamdScorer {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ContentScorer for SpamdScorer {
    async fn score(
        &self,
        subject: &str,
        body: &str,
        from_email: &str,
    ) -> Result<ContentScore, ScoreError> {
        let message = build_message(subject, body, from_email);
        let request = format!(
            "REPORT SPAMC/1.5\r\nContent-length: {}\r\n\r\n{message}",
            message.len()
        );

        let response = tokio::time::timeout(self.timeout, async {
            let mut stream = tokio::net::TcpStream::connect(&self.addr).await?;
            stream.write_all(request.as_bytes()).await?;
            stream.shutdown().await?;
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        })
        .await
        .map_err(|_| ScoreError::Unavailable(format!("spamd timeout at {}", self.addr)))??;

        let text = String::from_utf8_lossy(&response);
        parse_spamd_response(&text)
    }
}

/// Command-line scorer: runs a program that reads the message on stdin and
/// prints `score/required` on stdout.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    program: String,
    args: Vec<String>,
}

impl CommandScorer {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ContentScorer for CommandScorer {
    async fn score(
        &self,
        subject: &str,
        body: &str,
        from_email: &str,
    ) -> Result<ContentScore, ScoreError> {
        use std::process::Stdio;

        let message = build_message(subject, body, from_email);
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ScoreError::Unavailable(format!("{}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            drop(stdin);
        }
        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let score = stdout
            .lines()
            .find_map(parse_score_fraction)
            .ok_or_else(|| ScoreError::Protocol(format!("no score in output: {stdout:?}")))?;

        Ok(ContentScore {
            score: Some(score),
            report: stdout.trim().to_string(),
        })
    }
}

/// Render the triple as a minimal message for the scorer, CRLF-normalized.
fn build_message(subject: &str, body: &str, from_email: &str) -> String {
    let raw = format!("From: {from_email}\nSubject: {subject}\n\n{body}\n");
    raw.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn parse_spamd_response(text: &str) -> Result<ContentScore, ScoreError> {
    let spam_line = text
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("spam:"))
        .ok_or_else(|| ScoreError::Protocol("missing Spam: line".to_string()))?;

    // "Spam: True ; 5.2 / 5.0"
    let score = spam_line
        .split(';')
        .nth(1)
        .and_then(|fraction| parse_score_fraction(fraction));

    let report = text
        .split("\r\n\r\n")
        .nth(1)
        .unwrap_or(text)
        .trim()
        .to_string();

    debug!(?score, "spamd report parsed");
    Ok(ContentScore { score, report })
}

/// Parse `score / required` and return the score.
fn parse_score_fraction(text: &str) -> Option<f64> {
    let (score, _required) = text.split_once('/')?;
    score.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spamd_response() {
        let response = "SPAMD/1.1 0 EX_OK\r\nContent-length: 42\r\nSpam: True ; 6.2 / 5.0\r\n\r\nReport body here";
        let score = parse_spamd_response(response).unwrap();
        assert_eq!(score.score, Some(6.2));
        assert_eq!(score.report, "Report body here");
    }

    #[test]
    fn test_parse_spamd_response_without_score() {
        let response = "SPAMD/1.1 0 EX_OK\r\nSpam: False\r\n\r\n";
        let score = parse_spamd_response(response).unwrap();
        assert_eq!(score.score, None);
    }

    #[test]
    fn test_parse_score_fraction() {
        assert_eq!(parse_score_fraction(" 5.2 / 5.0"), Some(5.2));
        assert_eq!(parse_score_fraction("-1.0/5.0"), Some(-1.0));
        assert_eq!(parse_score_fraction("no slash"), None);
    }

    #[test]
    fn test_build_message_is_crlf_normalized() {
        let message = build_message("Hi", "line one\nline two", "a@b.example");
        assert!(message.contains("Subject: Hi\r\n"));
        assert!(message.contains("line one\r\nline two"));
        assert!(!message.replace("\r\n", "").contains('\r'));
    }

    #[tokio::test]
    async fn test_disabled_scorer() {
        let score = DisabledScorer
            .score("s", "b", "f@example.com")
            .await
            .unwrap();
        assert_eq!(score.score, None);
    }
}
