//! The action-dispatch surface and the JSON line server

mod common;

use common::{create_handler, fast_config};
use std::sync::Arc;
use terminal_agent_lib::testing::{FakeCommand, FakeSandbox};
use terminal_agent_lib::{
    TerminalAction, TerminalAgentServer, TerminalManager, TerminalToolHandler,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::test]
async fn test_exec_wait_round_trip_through_actions() {
    let sandbox = Arc::new(FakeSandbox::new().with_command(
        "make test",
        FakeCommand::new(["running 3 tests", "test result: ok"]).ticks(400),
    ));
    let handler = create_handler("chat-1", &sandbox);

    let exec = handler
        .handle(
            TerminalAction::from_json(r#"{"action":"exec","command":"make test","timeout":1}"#)
                .unwrap(),
            None,
            None,
        )
        .await;
    assert_eq!(exec.timed_out, Some(true));
    assert_eq!(exec.exit_code, Some(None));
    let session = exec.session.clone().unwrap();

    let wait = handler
        .handle(
            TerminalAction::Wait {
                session: session.clone(),
                timeout: 10,
            },
            None,
            None,
        )
        .await;
    assert_eq!(wait.timed_out, Some(false));
    assert_eq!(wait.exit_code, Some(Some(0)));
    assert_eq!(sandbox.submissions("make test"), 1);

    let kill = handler
        .handle(TerminalAction::Kill { session }, None, None)
        .await;
    assert_eq!(kill.killed, Some(true));
}

#[tokio::test]
async fn test_send_to_missing_session_suggests_exec() {
    let sandbox = Arc::new(FakeSandbox::new());
    let handler = create_handler("chat-1", &sandbox);

    let result = handler
        .handle(
            TerminalAction::Send {
                session: "s3".to_string(),
                input: "y".to_string(),
            },
            None,
            None,
        )
        .await;
    assert!(!result.is_error());
    assert!(result.output.contains("exec"));
}

#[tokio::test]
async fn test_server_over_duplex_stream() {
    let sandbox = Arc::new(FakeSandbox::new());
    let manager = TerminalManager::new("chat-1", sandbox, fast_config()).unwrap();
    let server = TerminalAgentServer::new(TerminalToolHandler::new(manager));

    let (client, server_end) = tokio::io::duplex(16 * 1024);
    let (server_read, server_write) = tokio::io::split(server_end);
    let (client_read, mut client_write) = tokio::io::split(client);

    let client_side = async move {
        let mut responses = BufReader::new(client_read).lines();

        client_write
            .write_all(b"{\"id\":1,\"action\":\"exec\",\"command\":\"echo over-the-wire\",\"session\":\"io\"}\n")
            .await
            .unwrap();
        let line = responses.next_line().await.unwrap().unwrap();
        let result: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(result["type"], "result");
        assert_eq!(result["id"], 1);
        assert_eq!(result["session"], "io");
        assert_eq!(result["output"], "over-the-wire");

        client_write
            .write_all(b"{\"id\":2,\"action\":\"list\"}\n")
            .await
            .unwrap();
        let line = responses.next_line().await.unwrap().unwrap();
        let result: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(result["id"], 2);
        assert_eq!(result["output"], "io\tta-chat-1-io\tidle");

        client_write.shutdown().await.unwrap();
    };

    let (served, ()) = tokio::join!(
        server.start_with_streams(server_read, server_write),
        client_side
    );
    served.unwrap();
}
