//! Connection lifecycle and request correlation against an in-memory hub

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ha_ws_client::{
    CalVer, CancellationToken, ClientConfig, ClientError, ConnectionState, ErrorCode, EventHandler,
    RawCommand,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

fn drain(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(state) = rx.try_recv() {
        states.push(state);
    }
    states
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_connect_then_close_notifications() {
    let mut hub = MockHub::new();
    let client = hub.client();
    let mut changes = client.state_changes();

    let _server = connect(&mut hub, &client).await;
    assert_eq!(
        drain(&mut changes),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected
        ]
    );
    assert_eq!(client.ha_version(), Some(CalVer::new(2024, 3, 0)));
    assert_eq!(client.ha_version().map(|v| v.to_string()).as_deref(), Some(HA_VERSION));

    assert_ok!(client.close(&CancellationToken::new()).await);
    assert_eq!(drain(&mut changes), vec![ConnectionState::Disconnected]);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(client.ha_version(), None);

    // Closing again has no effect
    assert_ok!(client.close(&CancellationToken::new()).await);
    assert!(drain(&mut changes).is_empty());
}

#[tokio::test]
async fn test_cancel_after_connected_has_no_effect() {
    let mut hub = MockHub::new();
    let client = hub.client();
    let cancel = CancellationToken::new();
    let params = params();

    let (result, mut server) = tokio::join!(client.connect(&params, &cancel), async {
        let mut server = hub.accept().await;
        server.handshake().await;
        server
    });
    assert_ok!(result);

    cancel.cancel();
    tokio::task::yield_now().await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    let ping = CancellationToken::new();
    let (rtt, ()) = tokio::join!(client.ping(&ping), server.pong());
    assert_ok!(rtt);
}

#[tokio::test]
async fn test_cancel_while_authenticating() {
    let mut hub = MockHub::new();
    let client = hub.client();
    let mut changes = client.state_changes();
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        async move { client.connect(&params(), &cancel).await }
    });

    let mut server = hub.accept().await;
    server.auth_required();
    server.expect_auth().await;
    assert_eq!(client.connection_state(), ConnectionState::Authenticating);

    cancel.cancel();
    assert_eq!(within(task).await.unwrap(), Err(ClientError::Cancelled));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        drain(&mut changes),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Disconnected
        ]
    );
    // The channel is given up
    assert!(server.closed().await);
}

#[tokio::test]
async fn test_close_while_connecting_cancels_connect() {
    let mut hub = MockHub::new();
    let client = hub.client();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let _server = hub.accept().await;
    assert_eq!(client.connection_state(), ConnectionState::Connecting);

    assert_ok!(client.close(&CancellationToken::new()).await);
    assert_eq!(within(task).await.unwrap(), Err(ClientError::Cancelled));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_close_with_cancelled_token_leaves_connect_alone() {
    let mut hub = MockHub::new();
    let client = hub.client();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let mut server = hub.accept().await;

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert_eq!(
        client.close(&cancelled).await,
        Err(ClientError::Cancelled)
    );
    assert_eq!(client.connection_state(), ConnectionState::Connecting);

    server.handshake().await;
    assert_ok!(within(task).await.unwrap());
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_second_connect_is_invalid() {
    let mut hub = MockHub::new();
    let client = hub.client();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let mut server = hub.accept().await;

    let second = client.connect(&params(), &CancellationToken::new()).await;
    assert!(matches!(second, Err(ClientError::InvalidOperation(_))));

    server.handshake().await;
    assert_ok!(within(task).await.unwrap());

    let third = client.connect(&params(), &CancellationToken::new()).await;
    assert!(matches!(third, Err(ClientError::InvalidOperation(_))));
    assert_eq!(hub.connector.attempts(), 1);
}

#[tokio::test]
async fn test_auth_invalid_fails_connect() {
    let mut hub = MockHub::new();
    let client = hub.client();
    let mut changes = client.state_changes();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let mut server = hub.accept().await;
    server.auth_required();
    server.expect_auth().await;
    server.send(json!({"type": "auth_invalid", "message": "Invalid access token or password"}));

    assert_eq!(
        within(task).await.unwrap(),
        Err(ClientError::Authentication(
            "Invalid access token or password".to_string()
        ))
    );
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        drain(&mut changes),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Disconnected
        ]
    );
    assert!(server.closed().await);
}

#[tokio::test]
async fn test_unexpected_handshake_message() {
    let mut hub = MockHub::new();
    let client = hub.client();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let server = hub.accept().await;
    server.send(json!({"type": "auth_ok"}));

    assert!(matches!(
        within(task).await.unwrap(),
        Err(ClientError::UnexpectedMessage(_))
    ));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_retries_after_transport_failure() {
    let mut hub = MockHub::new();
    let client = hub.client_with(ClientConfig {
        connect_retries: Some(2),
        retry_interval_secs: 0,
        ..ClientConfig::default()
    });
    hub.connector.fail_next(2);

    let _server = connect(&mut hub, &client).await;
    assert_eq!(hub.connector.attempts(), 3);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_transport_failure_without_retries() {
    let hub = MockHub::new();
    let client = hub.client();
    hub.connector.fail_next(1);

    let result = client.connect(&params(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(ClientError::Transport(_))));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let mut hub = MockHub::new();
    let client = hub.client();
    let mut changes = client.state_changes();
    let cancel = CancellationToken::new();
    let params = params();

    // The hub opens the channel but never sends auth_required
    let (result, _server) = tokio::join!(client.connect(&params, &cancel), hub.accept());
    assert_eq!(result, Err(ClientError::Timeout));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        drain(&mut changes),
        vec![ConnectionState::Connecting, ConnectionState::Disconnected]
    );
    assert_eq!(hub.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_retries_until_cancelled() {
    let hub = MockHub::new();
    let client = hub.client_with(ClientConfig {
        connect_retries: None,
        ..ClientConfig::default()
    });
    hub.connector.fail_next(u32::MAX);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        }
    });

    let result = client.connect(&params(), &cancel).await;
    assert_eq!(result, Err(ClientError::Cancelled));
    // One attempt every retry interval until the token fired
    assert!(hub.connector.attempts() >= 10);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_wait_for_connection() {
    let mut hub = MockHub::new();
    let client = hub.client();
    let cancel = CancellationToken::new();

    // No connect in progress
    assert_eq!(client.wait_for_connection(None, &cancel).await, Ok(false));

    let connecting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let mut server = hub.accept().await;
    let waiter = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .wait_for_connection(None, &CancellationToken::new())
                .await
        }
    });
    server.handshake().await;

    assert_ok!(within(connecting).await.unwrap());
    assert_eq!(within(waiter).await.unwrap(), Ok(true));
    assert_eq!(
        client.wait_for_connection(Some(Duration::from_secs(1)), &cancel).await,
        Ok(true)
    );

    client.dispose();
    assert_eq!(
        client.wait_for_connection(None, &cancel).await,
        Err(ClientError::Disposed)
    );
}

#[tokio::test]
async fn test_wait_for_connection_rejected() {
    let mut hub = MockHub::new();
    let client = hub.client();

    let connecting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let mut server = hub.accept().await;
    let waiter = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .wait_for_connection(None, &CancellationToken::new())
                .await
        }
    });
    server.auth_required();
    server.expect_auth().await;
    server.send(json!({"type": "auth_invalid", "message": "Invalid access token"}));

    assert_err!(within(connecting).await.unwrap());
    assert_eq!(within(waiter).await.unwrap(), Ok(false));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_connection_timeout_and_cancel() {
    let mut hub = MockHub::new();
    let client = hub.client();

    let _connecting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let _server = hub.accept().await;

    let cancel = CancellationToken::new();
    assert_eq!(
        client
            .wait_for_connection(Some(Duration::from_secs(1)), &cancel)
            .await,
        Err(ClientError::Timeout)
    );

    cancel.cancel();
    assert_eq!(
        client.wait_for_connection(None, &cancel).await,
        Err(ClientError::Cancelled)
    );
    assert_eq!(client.connection_state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn test_reconnect_after_close_restarts_ids() {
    let (mut hub, client, mut server) = connected().await;
    let cancel = CancellationToken::new();

    let request = RawCommand::new("get_config");
    let (_, first) = tokio::join!(
        client.send_command(&request, &cancel),
        server.ack("get_config")
    );
    assert_eq!(first["id"], 1);

    assert_ok!(client.close(&cancel).await);
    let mut server = connect(&mut hub, &client).await;

    let request = RawCommand::new("get_config");
    let (_, again) = tokio::join!(
        client.send_command(&request, &cancel),
        server.ack("get_config")
    );
    assert_eq!(again["id"], 1);
}

// =============================================================================
// Requests
// =============================================================================

#[tokio::test]
async fn test_send_command_before_connect_is_invalid() {
    let hub = MockHub::new();
    let client = hub.client();

    let result = client
        .send_command(&RawCommand::new("get_states"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ClientError::InvalidOperation(_))));
    assert_eq!(client.pending_requests_count(), 0);
}

#[tokio::test]
async fn test_command_result_is_matched() {
    let (_hub, client, mut server) = connected().await;
    let command = RawCommand::new("call_service")
        .field("domain", "light")
        .field("service", "turn_on");

    let token = CancellationToken::new();
    let (result, ()) = tokio::join!(
        client.send_command(&command, &token),
        async {
            let frame = server.recv().await;
            assert_eq!(
                frame,
                json!({"id": 1, "type": "call_service", "domain": "light", "service": "turn_on"})
            );
            server.result(&frame["id"], json!({"context": {"id": "01ABC"}}));
        }
    );
    let result = assert_ok!(result);
    assert!(result.success);
    assert_eq!(result.result, Some(json!({"context": {"id": "01ABC"}})));
    assert_eq!(client.pending_requests_count(), 0);
}

#[tokio::test]
async fn test_ids_increase_and_id_reuse_is_a_failed_result() {
    let (_hub, client, mut server) = connected().await;
    let cancel = CancellationToken::new();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let request = RawCommand::new("get_states");
        let (result, frame) = tokio::join!(
            client.send_command(&request, &cancel),
            server.ack("get_states")
        );
        assert_ok!(result);
        ids.push(frame["id"].as_u64().unwrap());
    }
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", ids);

    let request = RawCommand::new("get_states");
    let (result, ()) = tokio::join!(
        client.send_command(&request, &cancel),
        async {
            let frame = server.recv().await;
            server.failure(&frame["id"], "id_reuse", "Identifier values have to increase.");
        }
    );
    let result = assert_ok!(result);
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::IdReuse);
    assert!(matches!(result.into_result(), Err(ClientError::Remote(_))));
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_cancel_before_send_consumes_nothing() {
    let (_hub, client, mut server) = connected().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = client
        .send_command(&RawCommand::new("get_states"), &cancel)
        .await;
    assert_eq!(result, Err(ClientError::Cancelled));
    assert_eq!(client.pending_requests_count(), 0);
    assert!(server.try_recv().is_none());

    // The next command still gets the first id
    let token = CancellationToken::new();
    let request = RawCommand::new("get_states");
    let (_, frame) = tokio::join!(
        client.send_command(&request, &token),
        server.ack("get_states")
    );
    assert_eq!(frame["id"], 1);
}

#[tokio::test]
async fn test_cancel_after_send_removes_pending() {
    let (_hub, client, mut server) = connected().await;
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        async move {
            client
                .send_command(&RawCommand::new("get_states"), &cancel)
                .await
        }
    });
    let frame = server.recv().await;
    assert_eq!(client.pending_requests_count(), 1);

    cancel.cancel();
    assert_eq!(within(task).await.unwrap(), Err(ClientError::Cancelled));
    assert_eq!(client.pending_requests_count(), 0);

    // The late result is discarded; the session carries on
    server.result(&frame["id"], json!([]));
    let token = CancellationToken::new();
    let (rtt, ()) = tokio::join!(client.ping(&token), server.pong());
    assert_ok!(rtt);
    assert_eq!(client.pending_requests_count(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connection_lost_fails_pending_requests() {
    let (_hub, client, mut server) = connected().await;
    let mut changes = client.state_changes();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .send_command(&RawCommand::new("get_states"), &CancellationToken::new())
                .await
        }
    });
    server.recv().await;
    server.disconnect();

    assert_eq!(within(task).await.unwrap(), Err(ClientError::ConnectionLost));
    assert_eq!(client.pending_requests_count(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(drain(&mut changes), vec![ConnectionState::Disconnected]);
}

#[tokio::test]
async fn test_read_error_is_connection_lost() {
    let (_hub, client, mut server) = connected().await;

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.ping(&CancellationToken::new()).await }
    });
    server.recv().await;
    server.send_read_error();

    assert_eq!(within(task).await.unwrap(), Err(ClientError::ConnectionLost));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let (_hub, client, mut server) = connected().await;

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .send_command(&RawCommand::new("get_states"), &CancellationToken::new())
                .await
        }
    });
    server.recv().await;

    assert_ok!(client.close(&CancellationToken::new()).await);
    assert_eq!(within(task).await.unwrap(), Err(ClientError::ConnectionLost));
    assert_eq!(client.pending_requests_count(), 0);
}

#[tokio::test]
async fn test_unparseable_frame_is_discarded() {
    let (_hub, client, mut server) = connected().await;
    server.send_raw("this is not json".to_string());
    server.send(json!({"type": "something_new", "id": 4}));

    let token = CancellationToken::new();
    let (rtt, ()) = tokio::join!(client.ping(&token), server.pong());
    assert_ok!(rtt);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

// =============================================================================
// Disposal
// =============================================================================

#[tokio::test]
async fn test_dispose_rejects_everything() {
    let (_hub, client, mut server) = connected().await;
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .send_command(&RawCommand::new("get_states"), &CancellationToken::new())
                .await
        }
    });
    server.recv().await;

    client.dispose();
    client.dispose();
    assert!(client.is_disposed());
    assert_eq!(within(task).await.unwrap(), Err(ClientError::Disposed));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(client.pending_requests_count(), 0);
    assert_eq!(client.subscriptions_count(), 0);

    assert_eq!(
        client.connect(&params(), &cancel).await,
        Err(ClientError::Disposed)
    );
    assert_eq!(client.close(&cancel).await, Err(ClientError::Disposed));
    assert_eq!(
        client
            .send_command(&RawCommand::new("get_states"), &cancel)
            .await,
        Err(ClientError::Disposed)
    );
    assert_eq!(client.ping(&cancel).await, Err(ClientError::Disposed));

    let (handler, _queue) = EventHandler::queue();
    assert_eq!(
        client
            .add_event_handler("state_changed", handler.clone(), &cancel)
            .await,
        Err(ClientError::Disposed)
    );
    assert_err!(
        client
            .subscribe(&RawCommand::new("render_template"), handler, &cancel)
            .await
    );
}

#[tokio::test]
async fn test_dispose_while_connecting() {
    let mut hub = MockHub::new();
    let client = hub.client();

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(&params(), &CancellationToken::new()).await }
    });
    let _server = hub.accept().await;

    client.dispose();
    assert_eq!(within(task).await.unwrap(), Err(ClientError::Disposed));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}
