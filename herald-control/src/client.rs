//! Control client used by `heraldctl`.

use std::time::Duration;

use tokio::net::UnixStream;

use crate::{
    error::{ControlError, Result},
    frame,
    protocol::{Command, Request, Response},
};

pub struct ControlClient {
    socket_path: String,
    deadline: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            deadline: Duration::from_secs(30),
        }
    }

    /// Send one command and await its response. One connection per request.
    ///
    /// # Errors
    /// Connection, framing, codec, or deadline failures.
    pub async fn request(&self, command: Command) -> Result<Response> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await?;
            frame::send(&mut stream, &Request::new(command)).await?;
            frame::recv(&mut stream).await
        };
        tokio::time::timeout(self.deadline, exchange)
            .await
            .map_err(|_| ControlError::Deadline)?
    }
}
