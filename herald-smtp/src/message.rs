//! Campaign message builder.
//!
//! Builds the injected RFC 5322 message: correlation headers (`Message-ID`,
//! `X-Job-ID`, `X-Campaign-ID`), `Date`, and either a plain text body or a
//! `multipart/alternative` rendering for HTML campaigns.

use std::fmt::Write;

use chrono::Utc;
use herald_common::SenderIdentity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Plain,
    Html,
}

/// One outbound message, fully rendered.
#[derive(Debug, Clone)]
pub struct CampaignMessage {
    pub from: SenderIdentity,
    pub to: String,
    pub subject: String,
    pub reply_to: Option<String>,
    pub format: BodyFormat,
    pub body: String,
    /// Preformatted `<...>` message-id carrying the correlation fields.
    pub message_id: String,
    pub job_id: String,
    pub campaign_id: String,
}

impl CampaignMessage {
    /// Render the full message, headers and body.
    #[must_use]
    pub fn build(&self) -> String {
        let mut message = String::with_capacity(self.body.len() + 512);

        let headers = [
            format!("From: {}\r\n", self.from.name_addr()),
            format!("To: {}\r\n", self.to),
            format!("Subject: {}\r\n", sanitize_header(&self.subject)),
            format!("Date: {}\r\n", Utc::now().to_rfc2822()),
            format!("Message-ID: {}\r\n", self.message_id),
            format!("X-Job-ID: {}\r\n", self.job_id),
            format!("X-Campaign-ID: {}\r\n", self.campaign_id),
        ];
        for header in headers {
            message.push_str(&header);
        }
        if let Some(reply_to) = &self.reply_to {
            let _ = write!(message, "Reply-To: {reply_to}\r\n");
        }
        message.push_str("MIME-Version: 1.0\r\n");

        match self.format {
            BodyFormat::Plain => {
                message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
                message.push_str(&self.body);
            }
            BodyFormat::Html => {
                let boundary = boundary_for(&self.message_id);
                let _ = write!(
                    message,
                    "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
                );
                let _ = write!(message, "--{boundary}\r\n");
                message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
                message.push_str(&strip_tags(&self.body));
                let _ = write!(message, "\r\n--{boundary}\r\n");
                message.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
                message.push_str(&self.body);
                let _ = write!(message, "\r\n--{boundary}--\r\n");
            }
        }

        message
    }
}

/// Strip CR/LF from header values so user-supplied subjects cannot inject
/// extra headers.
fn sanitize_header(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// A boundary derived from the message-id so rebuilds are reproducible.
fn boundary_for(message_id: &str) -> String {
    let digest: u64 = message_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |hash: u64, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    format!("=_herald_{digest:016x}")
}

/// Crude tag strip for the text/plain alternative part.
fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text
}
