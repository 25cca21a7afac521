//! Cross-worker fanout over the relay bus.

mod common;

use std::time::Duration;

use common::{connect, drain, test_state, test_state_on_bus};
use palaver_server::connection::dispatch;
use palaver_server::events::{ClientEvent, ServerEvent};
use palaver_server::relay::{self, RelayFrame};

#[tokio::test]
async fn channel_message_reaches_a_member_on_another_worker() {
    let a = test_state();
    let b = test_state_on_bus("worker-b", a.relay.bus());
    tokio::spawn(relay::run_consumer(b.clone(), b.relay.subscribe()));

    let mut alice = connect(&a, "s-alice");
    let mut bob = connect(&b, "s-bob");
    dispatch(&a, "s-alice", ClientEvent::Nick { name: "alice".into() });
    dispatch(&b, "s-bob", ClientEvent::Nick { name: "bob".into() });
    drain(&mut alice);
    drain(&mut bob);

    dispatch(
        &a,
        "s-alice",
        ClientEvent::Message { content: "hello pool".into(), channel: None, dedup_token: None },
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = drain(&mut bob);
    let hits = events
        .iter()
        .filter(|e| matches!(
            e,
            ServerEvent::NewMessage { content, channel, .. }
                if content == "hello pool" && channel == "general"
        ))
        .count();
    assert_eq!(hits, 1);
}

#[tokio::test]
async fn duplicate_frames_are_applied_once() {
    let a = test_state();
    let b = test_state_on_bus("worker-b", a.relay.bus());
    tokio::spawn(relay::run_consumer(b.clone(), b.relay.subscribe()));

    let mut bob = connect(&b, "s-bob");
    dispatch(&b, "s-bob", ClientEvent::Nick { name: "bob".into() });
    drain(&mut bob);

    let frame = RelayFrame {
        event_id: "test-worker:42".into(),
        origin: "test-worker".into(),
        channel: Some("general".into()),
        event: ServerEvent::NewMessage {
            id: 7,
            content: "retried".into(),
            nickname: "alice".into(),
            channel: "general".into(),
            created_at: 1_700_000_000_000,
        },
    };
    // At-least-once transport: the same frame arrives twice
    a.relay.bus().send(frame.clone()).unwrap();
    a.relay.bus().send(frame).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = drain(&mut bob);
    let hits = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::NewMessage { content, .. } if content == "retried"))
        .count();
    assert_eq!(hits, 1);
}

#[tokio::test]
async fn deletion_notice_arrives_before_peer_eviction() {
    let a = test_state();
    let b = test_state_on_bus("worker-b", a.relay.bus());
    tokio::spawn(relay::run_consumer(b.clone(), b.relay.subscribe()));

    let mut alice = connect(&a, "s-alice");
    let mut bob = connect(&b, "s-bob");
    dispatch(&a, "s-alice", ClientEvent::Nick { name: "alice".into() });
    dispatch(&b, "s-bob", ClientEvent::Nick { name: "bob".into() });
    drain(&mut alice);
    drain(&mut bob);
    assert!(b.is_bound("general", "s-bob"));

    dispatch(&a, "s-alice", ClientEvent::DeleteChannel { name: "general".into() });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The peer's member saw the notice, then lost its live binding
    assert!(drain(&mut bob).contains(&ServerEvent::ChannelDeleted { name: "general".into() }));
    assert!(!b.is_bound("general", "s-bob"));
}

#[tokio::test]
async fn rename_rebinds_the_peer_group_key() {
    let a = test_state();
    let b = test_state_on_bus("worker-b", a.relay.bus());
    tokio::spawn(relay::run_consumer(b.clone(), b.relay.subscribe()));

    let mut bob = connect(&b, "s-bob");
    dispatch(&b, "s-bob", ClientEvent::Nick { name: "bob".into() });
    drain(&mut bob);

    dispatch(&a, "s-alice", ClientEvent::RenameChannel {
        old_name: "general".into(),
        new_name: "lobby".into(),
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(drain(&mut bob).contains(&ServerEvent::ChannelRenamed {
        old_name: "general".into(),
        new_name: "lobby".into(),
    }));
    assert!(b.is_bound("lobby", "s-bob"));
    assert!(!b.is_bound("general", "s-bob"));
}
