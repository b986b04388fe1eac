//! Mock SMTP server for exercising submission end to end.
//!
//! Accepts connections on an ephemeral port, speaks just enough SMTP for a
//! full transaction, records every message body, and can be told to reject
//! RCPT TO with a configurable status for failure injection.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub rcpt_code: u16,
    pub rcpt_message: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            rcpt_code: 250,
            rcpt_message: "OK".to_string(),
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    messages: Arc<Mutex<Vec<String>>>,
}

impl MockSmtpServer {
    pub async fn start(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let messages = Arc::new(Mutex::new(Vec::new()));

        let recorded = messages.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let config = config.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = handle_session(stream, config, recorded).await;
                });
            }
        });

        Self { addr, messages }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

async fn handle_session(
    stream: TcpStream,
    config: MockConfig,
    recorded: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"220 mock ESMTP ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim().to_ascii_uppercase();

        if command.starts_with("EHLO") || command.starts_with("HELO") {
            write_half
                .write_all(b"250-mock greets you\r\n250 PIPELINING\r\n")
                .await?;
        } else if command.starts_with("AUTH") {
            write_half.write_all(b"235 ok\r\n").await?;
        } else if command.starts_with("MAIL FROM") {
            write_half.write_all(b"250 sender ok\r\n").await?;
        } else if command.starts_with("RCPT TO") {
            let response = format!("{} {}\r\n", config.rcpt_code, config.rcpt_message);
            write_half.write_all(response.as_bytes()).await?;
        } else if command.starts_with("DATA") {
            write_half.write_all(b"354 go ahead\r\n").await?;
            let mut message = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                message.push_str(&line);
            }
            recorded.lock().await.push(message);
            write_half.write_all(b"250 queued\r\n").await?;
        } else if command.starts_with("RSET") {
            write_half.write_all(b"250 ok\r\n").await?;
        } else if command.starts_with("QUIT") {
            write_half.write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else {
            write_half.write_all(b"250 ok\r\n").await?;
        }
    }
}
