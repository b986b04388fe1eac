//! SMTP submission client.
//!
//! One client owns one connection for its lifetime. Negative completion
//! replies surface as [`ClientError::Rejected`] with the code attached, so
//! callers sequence a transaction with plain `?` and classify failures from
//! the error alone. Transport security covers cleartext, STARTTLS upgrade
//! and implicit TLS.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, client::danger, pki_types};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::response::Reply;

/// Ceiling on one buffered reply; anything larger is a protocol violation.
const REPLY_LIMIT: usize = 256 * 1024;

/// Transport security for the submission connection.
///
/// `None` and `Plain` both mean cleartext; the former is the historical
/// spelling accepted from older campaign forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    Plain,
    None,
    StartTls,
    Ssl,
}

impl SecurityMode {
    #[must_use]
    pub const fn is_cleartext(self) -> bool {
        matches!(self, Self::Plain | Self::None)
    }
}

/// Object-safe alias for whatever stream the session currently runs over.
trait Wire: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Wire for T {}

pub struct SmtpClient {
    wire: Box<dyn Wire>,
    /// Bytes read but not yet consumed by a parsed reply.
    pending: Vec<u8>,
    host: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Connect to `host:port` and consume the greeting. Under
    /// [`SecurityMode::Ssl`] the TLS handshake precedes the greeting; for
    /// [`SecurityMode::StartTls`] call [`Self::starttls`] after the first
    /// [`Self::hello`].
    ///
    /// # Errors
    /// Connection or handshake failure, or a negative greeting.
    pub async fn connect(
        host: &str,
        port: u16,
        mode: SecurityMode,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let tcp = TcpStream::connect((host, port)).await?;
        let mut client = Self {
            wire: Box::new(tcp),
            pending: Vec::new(),
            host: host.to_string(),
            accept_invalid_certs,
        };
        if mode == SecurityMode::Ssl {
            client.upgrade_tls().await?;
        }

        let greeting = client.reply().await?;
        require_positive(greeting)?;
        Ok(client)
    }

    /// EHLO. The reply lists the server's extensions.
    ///
    /// # Errors
    /// Transport failure or a negative reply.
    pub async fn hello(&mut self, helo_domain: &str) -> Result<Reply> {
        let reply = self.exchange(&format!("EHLO {helo_domain}")).await?;
        require_positive(reply)
    }

    /// STARTTLS followed by the handshake. The caller re-issues
    /// [`Self::hello`] afterwards (RFC 3207 resets the session).
    ///
    /// # Errors
    /// [`ClientError::Rejected`] when the server declines, [`ClientError::Tls`]
    /// when the handshake fails.
    pub async fn starttls(&mut self) -> Result<()> {
        let reply = self.exchange("STARTTLS").await?;
        require_positive(reply)?;
        self.pending.clear();
        self.upgrade_tls().await
    }

    /// AUTH PLAIN, falling back to AUTH LOGIN if the mechanism is refused.
    ///
    /// # Errors
    /// [`ClientError::AuthFailed`] once both mechanisms are exhausted.
    pub async fn auth(&mut self, username: &str, password: &str) -> Result<()> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        let reply = self.exchange(&format!("AUTH PLAIN {token}")).await?;
        if reply.is_positive() {
            return Ok(());
        }

        let reply = self.exchange("AUTH LOGIN").await?;
        if reply.code != 334 {
            return Err(ClientError::AuthFailed(reply.text()));
        }
        let reply = self.exchange(&STANDARD.encode(username)).await?;
        if reply.code != 334 {
            return Err(ClientError::AuthFailed(reply.text()));
        }
        let reply = self.exchange(&STANDARD.encode(password)).await?;
        if reply.is_positive() {
            Ok(())
        } else {
            Err(ClientError::AuthFailed(reply.text()))
        }
    }

    /// # Errors
    /// Transport failure or a negative reply.
    pub async fn mail_from(&mut self, sender: &str) -> Result<Reply> {
        let reply = self.exchange(&format!("MAIL FROM:<{sender}>")).await?;
        require_positive(reply)
    }

    /// # Errors
    /// Transport failure or a negative reply.
    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<Reply> {
        let reply = self.exchange(&format!("RCPT TO:<{recipient}>")).await?;
        require_positive(reply)
    }

    /// The whole DATA phase: command, dot-stuffed payload, terminator.
    ///
    /// # Errors
    /// Transport failure, a DATA reply other than 354, or a negative reply
    /// to the payload.
    pub async fn send_message(&mut self, payload: &str) -> Result<Reply> {
        let reply = self.exchange("DATA").await?;
        if reply.code != 354 {
            return Err(ClientError::Rejected {
                code: reply.code,
                message: reply.text(),
            });
        }

        self.wire.write_all(&frame_payload(payload)).await?;
        let reply = self.reply().await?;
        require_positive(reply)
    }

    /// Abort the current envelope.
    ///
    /// # Errors
    /// Transport failure.
    pub async fn reset(&mut self) -> Result<Reply> {
        self.exchange("RSET").await
    }

    /// Polite hangup. The reply code is irrelevant by this point.
    ///
    /// # Errors
    /// Transport failure.
    pub async fn quit(&mut self) -> Result<Reply> {
        self.exchange("QUIT").await
    }

    /// Write one command line and read the reply to it.
    async fn exchange(&mut self, command: &str) -> Result<Reply> {
        let mut line = Vec::with_capacity(command.len() + 2);
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.wire.write_all(&line).await?;
        self.reply().await
    }

    /// Read until `pending` holds one complete reply, then consume it.
    async fn reply(&mut self) -> Result<Reply> {
        loop {
            if let Some((reply, used)) = Reply::parse(&self.pending)? {
                self.pending.drain(..used);
                return Ok(reply);
            }
            if self.pending.len() > REPLY_LIMIT {
                return Err(ClientError::BadReply(format!(
                    "reply exceeds {REPLY_LIMIT} bytes"
                )));
            }
            let read = self.wire.read_buf(&mut self.pending).await?;
            if read == 0 {
                return Err(ClientError::Disconnected);
            }
        }
    }

    /// Swap the wire for its TLS-wrapped self.
    async fn upgrade_tls(&mut self) -> Result<()> {
        let connector = tls_connector(self.accept_invalid_certs)?;
        let name = pki_types::ServerName::try_from(self.host.clone())
            .map_err(|e| ClientError::Tls(format!("bad server name {:?}: {e}", self.host)))?;

        // Park the wire on a dead pipe while the connector consumes it.
        let (parked, _closed) = tokio::io::duplex(1);
        let plain = std::mem::replace(&mut self.wire, Box::new(parked));
        let secured = connector
            .connect(name, plain)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        self.wire = Box::new(secured);
        Ok(())
    }
}

fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 || !native.errors.is_empty() {
        debug!(
            added,
            ignored,
            load_errors = native.errors.len(),
            "trust store assembled with omissions"
        );
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(TrustAnyCert));
    }
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Verifier that waves every certificate through. Reached only via the
/// explicit `accept_invalid_certs` switch.
#[derive(Debug)]
struct TrustAnyCert;

const TRUST_ANY_SCHEMES: &[rustls::SignatureScheme] = &[
    rustls::SignatureScheme::RSA_PKCS1_SHA256,
    rustls::SignatureScheme::RSA_PKCS1_SHA384,
    rustls::SignatureScheme::RSA_PSS_SHA256,
    rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
    rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
    rustls::SignatureScheme::ED25519,
];

fn signature_waved_through() -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error>
{
    Ok(danger::HandshakeSignatureValid::assertion())
}

impl danger::ServerCertVerifier for TrustAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &pki_types::CertificateDer<'_>,
        _intermediates: &[pki_types::CertificateDer<'_>],
        _server_name: &pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: pki_types::UnixTime,
    ) -> std::result::Result<danger::ServerCertVerified, rustls::Error> {
        Ok(danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
        signature_waved_through()
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
        signature_waved_through()
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        TRUST_ANY_SCHEMES.to_vec()
    }
}

fn require_positive(reply: Reply) -> Result<Reply> {
    if reply.is_positive() {
        Ok(reply)
    } else {
        Err(ClientError::Rejected {
            code: reply.code,
            message: reply.text(),
        })
    }
}

/// Dot-stuff the payload (RFC 5321 4.5.2), normalise the final line ending,
/// and append the end-of-data marker.
fn frame_payload(payload: &str) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 8);
    for line in payload.split_inclusive('\n') {
        if line.starts_with('.') {
            framed.push(b'.');
        }
        framed.extend_from_slice(line.as_bytes());
    }
    match payload.as_bytes() {
        [.., b'\r', b'\n'] => {}
        [.., b'\n'] => {
            framed.pop();
            framed.extend_from_slice(b"\r\n");
        }
        _ => framed.extend_from_slice(b"\r\n"),
    }
    framed.extend_from_slice(b".\r\n");
    framed
}
