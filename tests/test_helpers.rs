//! Test helpers and utilities for integration tests

use dispenser_sync::config::DispenserConfig;
use dispenser_sync::store::LocalStore;
use dispenser_sync::sync::{SyncEngine, SyncSettings};
use dispenser_sync::testing::MockTransport;
use std::sync::Arc;
use std::time::Duration;

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> DispenserConfig {
    DispenserConfig::from_toml_str(
        r#"
[broker]
broker_url = "mqtt://localhost:1883"
client_id = "dispenser-it"

[sync]
post_connect_delay_ms = 2000
clear_settle_ms = 500
dose_spacing_ms = 300

[store]
"#,
    )
    .expect("Test config should parse")
}

/// Engine wired to a fresh mock transport and in-memory store, already started
#[allow(dead_code)]
pub async fn started_engine() -> (Arc<SyncEngine>, Arc<MockTransport>) {
    started_engine_with(SyncSettings::from(&test_config())).await
}

#[allow(dead_code)]
pub async fn started_engine_with(settings: SyncSettings) -> (Arc<SyncEngine>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let engine = Arc::new(SyncEngine::new(
        transport.clone(),
        Arc::new(LocalStore::in_memory()),
        settings,
    ));
    engine.start().await.expect("Engine should start");
    (engine, transport)
}

/// Let the engine's run loop and publisher drain under paused time
#[allow(dead_code)]
pub async fn settle(engine: &SyncEngine, duration: Duration) {
    tokio::time::sleep(duration).await;
    engine.publisher().flush().await;
}
