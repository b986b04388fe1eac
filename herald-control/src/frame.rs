//! Length-delimited frame codec shared by the client and the server.
//!
//! One frame is a big-endian `u32` length followed by a bincode body. Both
//! directions use the same two functions, so the framing rules live in
//! exactly one place.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ControlError, Result};

/// Hard ceiling on one frame. Start requests carry whole recipient lists,
/// so the bound is generous.
pub(crate) const FRAME_LIMIT: u32 = 64 * 1024 * 1024;

/// Encode `value` and write it as one frame.
///
/// # Errors
/// Encoding failures, oversized values, or socket I/O.
pub(crate) async fn send<T, W>(writer: &mut W, value: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let length = u32::try_from(body.len())
        .ok()
        .filter(|length| *length <= FRAME_LIMIT)
        .ok_or_else(|| ControlError::Frame(format!("{} byte frame exceeds limit", body.len())))?;

    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it.
///
/// A clean EOF before the header is [`ControlError::Disconnected`]; an EOF
/// inside a frame is an I/O error.
///
/// # Errors
/// Framing violations, decode failures, or socket I/O.
pub(crate) async fn recv<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::Disconnected
        } else {
            e.into()
        });
    }

    let length = u32::from_be_bytes(header);
    if length > FRAME_LIMIT {
        return Err(ControlError::Frame(format!(
            "{length} byte frame exceeds limit"
        )));
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;
    let (value, _) = bincode::serde::decode_from_slice(&body, bincode::config::legacy())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Request, SystemCommand};

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut near, mut far) = tokio::io::duplex(1024);

        let request = Request::new(Command::System(SystemCommand::Ping));
        send(&mut near, &request).await.unwrap();

        let received: Request = recv(&mut far).await.unwrap();
        assert_eq!(received.version, request.version);
        assert!(matches!(
            received.command,
            Command::System(SystemCommand::Ping)
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_is_disconnected() {
        let (near, mut far) = tokio::io::duplex(64);
        drop(near);
        let result: Result<Request> = recv(&mut far).await;
        assert!(matches!(result, Err(ControlError::Disconnected)));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut near, mut far) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut near, &u32::MAX.to_be_bytes())
            .await
            .unwrap();
        let result: Result<Request> = recv(&mut far).await;
        assert!(matches!(result, Err(ControlError::Frame(_))));
    }
}
