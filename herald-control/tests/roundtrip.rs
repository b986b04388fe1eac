//! Client/server round trip over a real Unix socket.

use std::sync::Arc;

use async_trait::async_trait;
use herald_common::Signal;
use herald_control::{
    Command, CommandHandler, ControlClient, ControlServer, FaultCode, JobCommand, Request,
    Response, ResponseData, ResponsePayload, SystemCommand,
};
use tokio::sync::broadcast;

struct StubHandler;

#[async_trait]
impl CommandHandler for StubHandler {
    async fn handle_request(&self, request: Request) -> herald_control::Result<Response> {
        Ok(match request.command {
            Command::System(SystemCommand::Ping) => {
                Response::data(ResponseData::Message("pong".to_string()))
            }
            Command::Job(JobCommand::Status { job_id, .. }) => {
                Response::fault(FaultCode::NotFound, format!("no such job: {job_id}"))
            }
            _ => Response::ok(),
        })
    }
}

#[tokio::test]
async fn test_ping_and_fault_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("herald.sock");
    let socket_str = socket.to_str().unwrap().to_string();

    let (shutdown_tx, _) = broadcast::channel(4);
    let server = ControlServer::new(socket_str.clone(), Arc::new(StubHandler));
    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move { server.serve(server_shutdown).await });

    // Wait for the socket to appear.
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let client = ControlClient::new(socket_str);

    let response = client
        .request(Command::System(SystemCommand::Ping))
        .await
        .unwrap();
    match response.payload {
        ResponsePayload::Data(data) => match *data {
            ResponseData::Message(message) => assert_eq!(message, "pong"),
            other => panic!("unexpected data: {other:?}"),
        },
        other => panic!("unexpected payload: {other:?}"),
    }

    let response = client
        .request(Command::Job(JobCommand::Status {
            job_id: "missing".to_string(),
            history_limit: 10,
        }))
        .await
        .unwrap();
    match response.payload {
        ResponsePayload::Error(fault) => {
            assert_eq!(fault.code, FaultCode::NotFound);
            assert!(fault.message.contains("missing"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    shutdown_tx.send(Signal::Shutdown).unwrap();
    let _ = server_task.await;
}
