//! Two engines talking over a real WebSocket connection.

use std::time::Duration;

use fastacp::ProtocolState;
use fastacp::prelude::*;
use fastacp::websocket::{self, DEFAULT_ACP_PATH};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engines_exchange_requests_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let transport = websocket::accept(stream, DEFAULT_ACP_PATH).await.unwrap();
        let agent = Protocol::new(transport);
        agent.set_request_handler("echo", |_ctx, params| async move {
            Ok(params.unwrap_or(Value::Null))
        });
        agent.start().unwrap();
        agent
    });

    let url = websocket::acp_url(&format!("ws://{addr}"));
    let client = Protocol::new(websocket::connect(&url).await.unwrap());
    client.set_request_handler("whoami", |_ctx, _params| async {
        Ok(json!("client"))
    });
    client.start().unwrap();
    let agent = timeout(WAIT, server).await.unwrap().unwrap();

    let echoed = client
        .send_request("echo", Some(json!({"text": "over the wire"})))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"text": "over the wire"}));

    let name = agent.send_request("whoami", None).await.unwrap();
    assert_eq!(name, json!("client"));

    client.close();
    timeout(WAIT, agent.closed()).await.unwrap();
    assert_eq!(agent.state(), ProtocolState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_to_wrong_path_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        websocket::accept(stream, DEFAULT_ACP_PATH).await.is_err()
    });

    let result = websocket::connect(&format!("ws://{addr}/elsewhere")).await;
    assert!(result.is_err());
    assert!(timeout(WAIT, server).await.unwrap().unwrap());
}
