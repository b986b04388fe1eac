//! Control server.
//!
//! Listens on a Unix domain socket and serves framed request/response
//! exchanges. A connection may carry any number of exchanges; it ends when
//! the client hangs up or an exchange overruns its deadline. Shutdown is a
//! race at the top level: the accept loop is simply dropped when the
//! broadcast fires, and the socket file is removed on the way out.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::Signal;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ControlError, Result},
    frame,
    protocol::{FaultCode, Request, Response},
};

/// Budget for one full request/response exchange.
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(60);

/// Handler trait for processing control requests.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a request and return a response.
    ///
    /// # Errors
    /// Errors become `Internal` faults on the wire; the connection stays up.
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

pub struct ControlServer {
    socket_path: String,
    handler: Arc<dyn CommandHandler>,
}

impl ControlServer {
    #[must_use]
    pub fn new(socket_path: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    /// Run until a shutdown signal arrives.
    ///
    /// # Errors
    /// Binding failures, including another live instance on the socket.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let listener = self.bind().await?;
        info!(path = %self.socket_path, "control server listening");

        tokio::select! {
            () = Self::accept_loop(listener, self.handler.clone()) => {}
            _ = shutdown.recv() => {
                info!("control server shutting down");
            }
        }

        let _ = tokio::fs::remove_file(&self.socket_path).await;
        Ok(())
    }

    /// Bind the socket, reclaiming a path left behind by a dead process.
    /// Bind-first ordering: the probe only runs when the address is taken.
    async fn bind(&self) -> Result<UnixListener> {
        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if UnixStream::connect(&self.socket_path).await.is_ok() {
                    return Err(ControlError::Io(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another instance owns {}", self.socket_path),
                    )));
                }
                warn!(path = %self.socket_path, "reclaiming socket from a dead process");
                tokio::fs::remove_file(&self.socket_path).await?;
                UnixListener::bind(&self.socket_path)?
            }
            Err(e) => return Err(e.into()),
        };

        // Operator-only access to the socket.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = tokio::fs::metadata(&self.socket_path).await?.permissions();
            permissions.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, permissions).await?;
        }

        Ok(listener)
    }

    async fn accept_loop(listener: UnixListener, handler: Arc<dyn CommandHandler>) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, handler.clone()));
                }
                Err(e) => {
                    // Transient accept failures (fd pressure and the like)
                    // should not kill the server.
                    warn!(error = %e, "control accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Serve exchanges on one connection until the client hangs up.
async fn serve_connection(mut stream: UnixStream, handler: Arc<dyn CommandHandler>) {
    loop {
        let exchange = async {
            let request: Request = frame::recv(&mut stream).await?;
            debug!(version = request.version, "control request received");

            let response = match handler.handle_request(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "control handler failed");
                    Response::fault(FaultCode::Internal, e.to_string())
                }
            };
            frame::send(&mut stream, &response).await
        };

        match tokio::time::timeout(EXCHANGE_DEADLINE, exchange).await {
            Ok(Ok(())) => {}
            Ok(Err(ControlError::Disconnected)) => break,
            Ok(Err(e)) => {
                warn!(error = %e, "control exchange failed");
                break;
            }
            Err(_) => {
                warn!("control exchange overran its deadline");
                break;
            }
        }
    }
}
