use std::sync::Arc;

use serde_json::Value;

use livestream_core::{BroadcastHub, ConnectionHandle, StateSummary};

fn drain(connection: &mut ConnectionHandle) -> Vec<Value> {
    std::iter::from_fn(|| connection.try_recv())
        .map(|raw| serde_json::from_str(&raw).expect("valid json"))
        .collect()
}

#[test]
fn chat_reaches_every_connection_once() {
    let hub = BroadcastHub::default();
    let mut first = hub.join();
    let mut second = hub.join();

    hub.post_chat("x", "hi");

    for connection in [&mut first, &mut second] {
        let events = drain(connection);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "chat");
        assert_eq!(events[0]["username"], "x");
        assert_eq!(events[0]["message"], "hi");
        assert!(events[0]["timestamp"].as_f64().unwrap() > 0.0);
    }
    assert_eq!(hub.chat_history().len(), 1);
}

#[test]
fn chat_ring_keeps_the_latest_hundred_in_order() {
    let hub = BroadcastHub::default();
    for i in 1..=150 {
        hub.post_chat("x", format!("m{i}"));
    }
    let history: Vec<_> = hub.chat_history().into_iter().map(|m| m.message).collect();
    let expected: Vec<_> = (51..=150).map(|i| format!("m{i}")).collect();
    assert_eq!(history, expected);
}

#[test]
fn late_joiner_is_greeted_with_state_then_history() {
    let hub = BroadcastHub::default();
    hub.broadcast_state(&StateSummary::live("a.mp4", 3));
    hub.post_chat("x", "one");
    hub.post_chat("y", "two");

    let mut late = hub.join();
    let events = drain(&mut late);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["type"], "state_update");
    assert_eq!(events[0]["state"]["current_video"], "a.mp4");
    assert_eq!(events[0]["state"]["play_count"], 3);
    assert_eq!(events[1]["message"], "one");
    assert_eq!(events[2]["message"], "two");
}

#[test]
fn empty_state_serializes_as_empty_object() {
    let hub = BroadcastHub::default();
    let mut connection = hub.join();
    assert_eq!(hub.broadcast_state(&StateSummary::default()), 1);
    let events = drain(&mut connection);
    assert_eq!(events[0]["state"], serde_json::json!({}));
}

#[test]
fn malformed_inbound_is_dropped_without_closing() {
    let hub = BroadcastHub::default();
    let mut sender = hub.join();

    assert!(hub.handle_inbound(sender.id(), "not json").is_none());
    assert!(hub
        .handle_inbound(sender.id(), r#"{"type":"state_update"}"#)
        .is_none());
    assert!(hub.chat_history().is_empty());
    assert_eq!(hub.connection_count(), 1);

    let posted = hub
        .handle_inbound(sender.id(), r#"{"type":"chat","username":"x","message":"ok"}"#)
        .unwrap();
    assert_eq!(posted.message, "ok");
    assert_eq!(drain(&mut sender).len(), 1);
}

#[test]
fn dropped_connections_are_pruned_on_broadcast() {
    let hub = BroadcastHub::default();
    let gone = hub.join();
    let mut kept = hub.join();
    drop(gone);

    assert_eq!(hub.post_chat_message(livestream_core::ChatMessage::now("x", "hi")), 1);
    assert_eq!(hub.connection_count(), 1);
    assert_eq!(drain(&mut kept).len(), 1);
}

#[test]
fn full_queue_only_affects_that_connection() {
    let hub = BroadcastHub::new(2, 1);
    let mut slow = hub.join();
    let mut fast = hub.join();

    for i in 0..5 {
        hub.post_chat("x", format!("m{i}"));
        drain(&mut fast);
    }
    // capacity is chat ring + 1
    assert_eq!(drain(&mut slow).len(), 3);
    assert_eq!(hub.connection_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_posts_arrive_in_ring_order() {
    let hub = Arc::new(BroadcastHub::default());
    let mut first = hub.join();
    let mut second = hub.join();

    let mut tasks = Vec::new();
    for writer in 0..4 {
        let hub = Arc::clone(&hub);
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                hub.post_chat(format!("user{writer}"), format!("{writer}-{i}"));
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let history: Vec<String> = hub.chat_history().into_iter().map(|m| m.message).collect();
    assert_eq!(history.len(), 100);
    for connection in [&mut first, &mut second] {
        let received: Vec<String> = drain(connection)
            .into_iter()
            .map(|event| event["message"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(received, history);
    }
}
