//! Resync behavior across connects, losses and autonomous reconnects
//!
//! All tests run on paused time. The engine waits 2 s after a connect, sends
//! clear-all, pauses 500 ms, then pushes each dose with 300 ms after it.

mod test_helpers;

use dispenser_sync::model::NewDose;
use dispenser_sync::sync::SyncState;
use dispenser_sync::transport::{ConnectOrigin, SessionEvent, Transport};
use std::time::Duration;
use test_helpers::{settle, started_engine};

const SPACING: Duration = Duration::from_millis(300);
const CLEAR_SETTLE: Duration = Duration::from_millis(500);

fn dose(time: &str, compartment: u8, medication: &str) -> NewDose {
    NewDose::new(time.parse().unwrap(), compartment, medication)
}

#[tokio::test(start_paused = true)]
async fn test_insert_disconnect_reconnect_scenario() {
    let (engine, transport) = started_engine().await;
    transport.connect().await.unwrap();
    settle(&engine, Duration::from_secs(3)).await;
    assert_eq!(engine.sync_state(), SyncState::Synced);
    transport.clear_published().await;

    engine.add_dose(dose("07:30", 1, "A")).await.unwrap();
    engine.publisher().flush().await;
    assert_eq!(transport.published_topics().await, vec!["config/dose"]);
    transport.clear_published().await;

    transport.disconnect().await.unwrap();
    settle(&engine, Duration::from_millis(10)).await;
    assert_eq!(engine.sync_state(), SyncState::Unsynced);

    transport.connect().await.unwrap();
    settle(&engine, Duration::from_secs(5)).await;

    let published = transport.get_published().await;
    let topics: Vec<&str> = published.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(topics, vec!["clear-all", "config/dose"]);
    assert_eq!(published[0].payload_str(), "clear");
    assert_eq!(published[1].payload_json()["compartimiento"], 1);
    assert_eq!(published[1].payload_json()["hora"], "07:30");
    assert_eq!(engine.sync_state(), SyncState::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_resync_push_is_throttled() {
    let (engine, transport) = started_engine().await;
    for (compartment, time) in [(1, "08:00"), (2, "12:00"), (3, "20:00")] {
        engine.add_dose(dose(time, compartment, "A")).await.unwrap();
    }
    engine.publisher().flush().await;
    assert!(
        transport.get_published().await.is_empty(),
        "publishes while disconnected are dropped"
    );

    let connected_at = tokio::time::Instant::now();
    transport.connect().await.unwrap();
    settle(&engine, Duration::from_secs(5)).await;

    let published = transport.get_published().await;
    assert_eq!(published.len(), 4);
    assert_eq!(published[0].topic, "clear-all");
    assert!(published[0].at - connected_at >= Duration::from_secs(2));
    assert!(published[1].at - published[0].at >= CLEAR_SETTLE);
    for pair in published[1..].windows(2) {
        assert_eq!(pair[1].topic, "config/dose");
        assert!(pair[1].at - pair[0].at >= SPACING);
    }
}

#[tokio::test(start_paused = true)]
async fn test_same_generation_resyncs_once() {
    let (engine, transport) = started_engine().await;
    engine.add_dose(dose("07:30", 1, "A")).await.unwrap();
    // Drain the add while offline so only the resync reaches the broker
    engine.publisher().flush().await;

    let outcome = transport.connect().await.unwrap();
    // The connectivity poll reports the same physical link
    transport
        .inject_event(SessionEvent::Connected {
            generation: outcome.generation,
            origin: ConnectOrigin::AutoReconnect,
        })
        .await;
    settle(&engine, Duration::from_secs(5)).await;

    assert_eq!(transport.published_on("clear-all").await.len(), 1);
    assert_eq!(transport.published_on("config/dose").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_autonomous_reconnect_triggers_resync() {
    let (engine, transport) = started_engine().await;
    engine.add_dose(dose("07:30", 1, "A")).await.unwrap();
    transport.connect().await.unwrap();
    settle(&engine, Duration::from_secs(5)).await;
    transport.clear_published().await;

    transport.simulate_link_loss("keep-alive timeout").await;
    settle(&engine, Duration::from_millis(10)).await;
    assert_eq!(engine.sync_state(), SyncState::Unsynced);

    transport.simulate_auto_reconnect().await;
    settle(&engine, Duration::from_secs(5)).await;

    assert_eq!(
        transport.published_topics().await,
        vec!["clear-all", "config/dose"]
    );
    assert_eq!(engine.sync_state(), SyncState::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_loss_during_resync_restarts_on_next_link() {
    let (engine, transport) = started_engine().await;
    for compartment in 1..=5 {
        engine
            .add_dose(dose("09:00", compartment, "A"))
            .await
            .unwrap();
    }
    engine.publisher().flush().await;

    transport.connect().await.unwrap();
    // Mid-push; flushing here would wait for the whole batch
    tokio::time::sleep(Duration::from_millis(2_600)).await;
    assert_eq!(engine.sync_state(), SyncState::Resyncing);

    transport.simulate_link_loss("broker restart").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.sync_state(), SyncState::Unsynced);
    transport.clear_published().await;

    transport.simulate_auto_reconnect().await;
    settle(&engine, Duration::from_secs(5)).await;

    let topics = transport.published_topics().await;
    assert_eq!(topics.first().map(String::as_str), Some("clear-all"));
    assert_eq!(topics.iter().filter(|t| *t == "clear-all").count(), 1);
    assert_eq!(topics.iter().filter(|t| *t == "config/dose").count(), 5);
    assert_eq!(engine.sync_state(), SyncState::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_connection_signal_follows_transport() {
    let (engine, transport) = started_engine().await;
    let mut connection = engine.connection_state();
    assert!(!*connection.borrow());

    transport.connect().await.unwrap();
    connection.changed().await.unwrap();
    assert!(*connection.borrow());

    transport.simulate_link_loss("network down").await;
    connection.changed().await.unwrap();
    assert!(!*connection.borrow());
}
