//! Connection lifecycle tests against a real WebSocket endpoint.

use std::sync::Arc;
use std::time::Duration;

use keel_config::TransportConfig;
use keel_test_utils::MockRpcServer;
use keel_transport::{
    ConnectionState, Credentials, ExchangeApi, RpcClient, RpcExchangeApi, TransportErrorKind,
};
use serde_json::json;

fn fast_config() -> TransportConfig {
    TransportConfig {
        heartbeat_interval_secs: 1,
        stale_after_secs: 90,
        call_timeout_secs: 1,
        initial_reconnect_delay_ms: 50,
        max_reconnect_delay_secs: 1,
        backoff_multiplier: 2.0,
        backoff_jitter: 0.2,
        max_reconnect_attempts: 5,
        requests_per_second: 100,
    }
}

fn credentials() -> Credentials {
    Credentials {
        client_id: "test-client".into(),
        client_secret: "test-secret".into(),
    }
}

async fn connect(server: &MockRpcServer) -> RpcClient {
    let _ = tracing_subscriber::fmt::try_init();
    RpcClient::connect(server.url(), credentials(), fast_config())
        .await
        .unwrap()
}

async fn await_state(client: &RpcClient, wanted: ConnectionState) {
    let mut watch = client.state_watch();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while *watch.borrow() != wanted {
        assert!(
            tokio::time::Instant::now() < deadline,
            "never reached {wanted:?}, stuck at {:?}",
            *watch.borrow()
        );
        let _ = tokio::time::timeout(Duration::from_millis(200), watch.changed()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_correlate_even_when_interleaved() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;

    let a = client.call("public/test", json!({}));
    let b = client.call("private/get_account_summary", json!({ "currency": "BTC" }));
    let (a, b) = tokio::join!(a, b);
    assert_eq!(a.unwrap()["version"], json!("mock"));
    assert_eq!(b.unwrap()["equity"], json!("10000"));

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_call_times_out_without_poisoning_the_connection() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;
    server.ignore_method("private/buy");

    let err = client
        .call("private/buy", json!({ "instrument_name": "BTC-PERPETUAL" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Timeout);

    // The reply slot was reclaimed; the connection keeps working.
    assert!(client.call("public/test", json!({})).await.is_ok());
    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_errors_map_onto_the_taxonomy() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;

    server.fail_method("private/buy", 10009, "not_enough_funds");
    let err = client
        .call("private/buy", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::InsufficientFunds);
    assert!(!err.is_retryable());

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_secret_is_an_authentication_error() {
    let server = MockRpcServer::spawn().await.unwrap();
    server.require_secret("a-different-secret");
    let _ = tracing_subscriber::fmt::try_init();

    let err = RpcClient::connect(server.url(), credentials(), fast_config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Authentication);
}

#[tokio::test(flavor = "multi_thread")]
async fn pushes_route_to_channel_subscribers() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;

    let mut orders = client.subscribe("user.orders.BTC-PERPETUAL").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.push("user.orders.BTC-PERPETUAL", json!({ "order_id": "42" }));

    let data = tokio::time::timeout(Duration::from_secs(2), orders.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data["order_id"], json!("42"));

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn every_reconnect_replays_the_full_subscription_set() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;

    client.subscribe("user.orders.BTC-PERPETUAL").await.unwrap();
    client.subscribe("user.portfolio.btc").await.unwrap();

    for round in 1..=3 {
        server.drop_all();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while server.connection_count() < round + 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no redial after drop {round}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        await_state(&client, ConnectionState::Ready).await;
    }

    let log = server.subscription_log();
    assert_eq!(log.len(), 4);
    for (index, connection) in log.iter().enumerate() {
        let mut channels = connection.clone();
        channels.sort();
        assert_eq!(
            channels,
            vec![
                "user.orders.BTC-PERPETUAL".to_string(),
                "user.portfolio.btc".to_string(),
            ],
            "connection {index} is missing subscriptions"
        );
    }

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_calls_fail_fast_when_the_connection_drops() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;
    server.ignore_method("private/buy");

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("private/buy", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.drop_all();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::ConnectionLost);

    await_state(&client, ConnectionState::Ready).await;
    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_query_failures_are_retried() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;
    let api = RpcExchangeApi::new(Arc::new(client.clone()), 100);

    server.fail_method_times("private/get_position", -32000, "busy", 2);
    let position = api.position("BTC-PERPETUAL").await.unwrap();
    assert!(position.is_none());
    let polls = server
        .method_log()
        .iter()
        .filter(|method| method.as_str() == "private/get_position")
        .count();
    assert_eq!(polls, 3);

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn business_rejections_pass_through_without_retry() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;
    let api = RpcExchangeApi::new(Arc::new(client.clone()), 100);

    server.fail_method("private/cancel", 11029, "order not found");
    let err = api.cancel_order(&"missing".to_string()).await.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::InvalidParams);
    let cancels = server
        .method_log()
        .iter()
        .filter(|method| method.as_str() == "private/cancel")
        .count();
    assert_eq!(cancels, 1);

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_every_handle_tears_the_connection_down() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;
    let mut state = client.state_watch();
    assert_eq!(server.live_connection_count(), 1);

    drop(client);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while *state.borrow() != ConnectionState::Disconnected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "supervisor kept running after the last handle was dropped"
        );
        let _ = tokio::time::timeout(Duration::from_millis(200), state.changed()).await;
    }
    while server.live_connection_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "socket still open after the last handle was dropped"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_disconnect_latches_for_good() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;
    assert_eq!(server.connection_count(), 1);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // Were the latch broken, the backoff schedule would redial well inside
    // this window.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.connection_count(), 1);

    let err = client.call("public/test", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::ConnectionLost);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_liveness_probe_is_answered() {
    let server = MockRpcServer::spawn().await.unwrap();
    let client = connect(&server).await;

    server.send_test_request();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server
        .method_log()
        .iter()
        .any(|method| method == "public/test"));

    client.disconnect().await;
}
