//! Integration tests for the graphql-ws protocol against an in-process
//! mock server.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::time::timeout;

use graphql_session::{Error, OperationPayload, Protocol, SubscriptionClient};

fn users() -> OperationPayload {
    OperationPayload::query("subscription{user(limit: 5){id,name}}")
}

#[tokio::test]
async fn next_and_complete_drive_a_subscription_to_its_end() {
    let addr = common::spawn_server(|mut ws| async move {
        common::ack_init(&mut ws).await.unwrap();
        let subscribe = common::recv_until(&mut ws, "subscribe").await.unwrap();
        let id = subscribe["id"].clone();
        common::send_json(
            &mut ws,
            json!({
                "type": "next",
                "id": id,
                "payload": {"data": {"user": [{"id": 1, "name": "alice"}]}},
            }),
        )
        .await;
        common::send_json(&mut ws, json!({"type": "complete", "id": id})).await;
        while common::recv_json(&mut ws).await.is_some() {}
    })
    .await;

    let data_seen = Arc::new(AtomicBool::new(false));
    let data_flag = data_seen.clone();
    let completed = Arc::new(Mutex::new(None));
    let completed_hook = completed.clone();

    let client = SubscriptionClient::new(format!("ws://{addr}"))
        .with_protocol(Protocol::GraphqlWs)
        .on_subscription_complete(move |sub| {
            *completed_hook.lock().unwrap() = Some(sub.key().to_string());
        });

    let key = client
        .subscribe(users(), move |result| {
            let data = result.expect("a data event");
            assert_eq!(data, &br#"{"user":[{"id":1,"name":"alice"}]}"#[..]);
            data_flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    // The server completes the only subscription, the registry empties,
    // and run returns on its own.
    let result = timeout(Duration::from_secs(5), client.run()).await.unwrap();
    assert!(result.is_ok());
    assert!(data_seen.load(Ordering::SeqCst));
    assert_eq!(completed.lock().unwrap().as_deref(), Some(key.as_str()));
    assert_eq!(client.subscriptions_len(None), 0);
}

#[tokio::test]
async fn server_pings_get_ponged_and_feed_the_alive_hook() {
    let ponged = Arc::new(Notify::new());
    let server_ponged = ponged.clone();
    let addr = common::spawn_server(move |mut ws| {
        let ponged = server_ponged.clone();
        async move {
            common::ack_init(&mut ws).await.unwrap();
            let subscribe = common::recv_until(&mut ws, "subscribe").await.unwrap();
            let id = subscribe["id"].clone();
            common::send_json(&mut ws, json!({"type": "ping", "payload": {"probe": 7}})).await;
            let pong = common::recv_until(&mut ws, "pong").await.unwrap();
            assert_eq!(pong["payload"]["probe"], 7);
            ponged.notify_one();
            common::send_json(&mut ws, json!({"type": "complete", "id": id})).await;
            while common::recv_json(&mut ws).await.is_some() {}
        }
    })
    .await;

    let alive = Arc::new(AtomicU32::new(0));
    let on_alive = alive.clone();
    let client = SubscriptionClient::new(format!("ws://{addr}"))
        .with_protocol(Protocol::GraphqlWs)
        .on_connection_alive(move || {
            on_alive.fetch_add(1, Ordering::SeqCst);
        });
    client.subscribe(users(), |_| Ok(())).unwrap();

    let result = timeout(Duration::from_secs(5), client.run()).await.unwrap();
    assert!(result.is_ok());
    timeout(Duration::from_secs(1), ponged.notified())
        .await
        .expect("server should have received a pong");
    assert!(alive.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn unsubscribe_stops_the_operation_with_a_complete_frame() {
    let stopped = Arc::new(Mutex::new(None));
    let server_stopped = stopped.clone();
    let addr = common::spawn_server(move |mut ws| {
        let stopped = server_stopped.clone();
        async move {
            common::ack_init(&mut ws).await.unwrap();
            let subscribe = common::recv_until(&mut ws, "subscribe").await.unwrap();
            let started_id = subscribe["id"].as_str().unwrap().to_string();
            if let Some(complete) = common::recv_until(&mut ws, "complete").await {
                *stopped.lock().unwrap() =
                    Some((started_id, complete["id"].as_str().unwrap().to_string()));
            }
            while common::recv_json(&mut ws).await.is_some() {}
        }
    })
    .await;

    let connected = Arc::new(Notify::new());
    let on_connect = connected.clone();
    let client = Arc::new(
        SubscriptionClient::new(format!("ws://{addr}"))
            .with_protocol(Protocol::GraphqlWs)
            .on_connected(move || on_connect.notify_one()),
    );
    let key = client.subscribe(users(), |_| Ok(())).unwrap();

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    connected.notified().await;
    // Give the replay a moment to put the subscription on the wire, so
    // the unsubscribe owes the server a stop frame.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while client.get_subscription(&key).is_some_and(|sub| {
        sub.status() != graphql_session::SubscriptionStatus::Running
    }) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    client.unsubscribe(&key).unwrap();

    let result = timeout(Duration::from_secs(3), runner).await.unwrap().unwrap();
    assert!(result.is_ok());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some((started, stopped)) = stopped.lock().unwrap().clone() {
            assert_eq!(started, stopped);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never saw the complete frame"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn unauthorized_close_surfaces_through_the_error_hook() {
    const REASON: &str = "invalid x-hasura-admin-secret/x-hasura-access-key";

    let addr = common::spawn_server(|mut ws| async move {
        // Reject the connection the way an auth layer does: read the
        // init, close 4400 without acking.
        let _ = common::recv_json(&mut ws).await;
        common::close_with(&mut ws, 4400, REASON).await;
    })
    .await;

    let hook_message = Arc::new(Mutex::new(None));
    let hook_capture = hook_message.clone();
    let client = SubscriptionClient::new(format!("ws://{addr}"))
        .with_protocol(Protocol::GraphqlWs)
        .with_connection_params(json!({
            "headers": {"x-hasura-admin-secret": "wrong"}
        }))
        .on_error(move |_, err| {
            *hook_capture.lock().unwrap() = Some(err.to_string());
            Some(err)
        });
    client.subscribe(users(), |_| Ok(())).unwrap();

    let err = timeout(Duration::from_secs(5), client.run())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_string(), REASON);
    assert!(matches!(err, Error::CloseStatus { code: 4400, .. }));
    assert_eq!(hook_message.lock().unwrap().as_deref(), Some(REASON));
}

#[tokio::test]
async fn suppressed_errors_keep_the_session_reconnecting() {
    let connections = Arc::new(AtomicU32::new(0));
    let server_conns = connections.clone();
    let addr = common::spawn_server(move |mut ws| {
        let n = server_conns.fetch_add(1, Ordering::SeqCst);
        async move {
            let _ = common::recv_json(&mut ws).await;
            if n == 0 {
                // Fatal close status on the first attempt only.
                common::close_with(&mut ws, 4401, "try later").await;
                return;
            }
            common::send_json(&mut ws, json!({"type": "connection_ack"})).await;
            while common::recv_json(&mut ws).await.is_some() {}
        }
    })
    .await;

    let connected = Arc::new(Notify::new());
    let on_connect = connected.clone();
    let suppressed = Arc::new(AtomicU32::new(0));
    let on_error_count = suppressed.clone();

    let client = Arc::new(
        SubscriptionClient::new(format!("ws://{addr}"))
            .with_protocol(Protocol::GraphqlWs)
            .with_retry_policy(graphql_session::RetryPolicy {
                first_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                growth: 2.0,
            })
            .on_connected(move || on_connect.notify_one())
            .on_error(move |_, _| {
                on_error_count.fetch_add(1, Ordering::SeqCst);
                None
            }),
    );
    client.subscribe(users(), |_| Ok(())).unwrap();

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    // The fatal 4401 was suppressed by the hook, so the session retried
    // and the second connection succeeded.
    timeout(Duration::from_secs(5), connected.notified())
        .await
        .expect("session should reconnect after the suppressed error");
    assert!(suppressed.load(Ordering::SeqCst) >= 1);
    assert!(connections.load(Ordering::SeqCst) >= 2);

    client.close().await.unwrap();
    let result = timeout(Duration::from_secs(3), runner).await.unwrap().unwrap();
    assert!(result.is_ok());
}
