//! Property tests for history bounds, reconciliation and decoding

use chrono::{TimeZone, Utc};
use dispenser_sync::dispatch::MessageDispatcher;
use dispenser_sync::history::HistoryLog;
use dispenser_sync::model::{DoseOutcome, HistoryEntry, NewDose};
use dispenser_sync::protocol::RemoteDoseSnapshot;
use dispenser_sync::store::{HistoryRepository, LocalStore};
use dispenser_sync::sync::{SyncEngine, SyncSettings};
use dispenser_sync::testing::MockTransport;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn entry(timestamp: i64) -> HistoryEntry {
    HistoryEntry {
        dose_id: None,
        medication: "A".to_string(),
        compartment: 1,
        outcome: DoseOutcome::Taken,
        timestamp: Utc.timestamp_opt(timestamp, 0).unwrap(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn history_keeps_the_newest_within_capacity(
        timestamps in prop::collection::vec(0i64..1_000_000, 0..60),
        capacity in 1usize..20,
    ) {
        let kept = runtime().block_on(async {
            let store = Arc::new(LocalStore::in_memory());
            let log = HistoryLog::new(store.clone(), capacity);
            for ts in &timestamps {
                log.append(entry(*ts)).await.unwrap();
            }
            store.list_history().await.unwrap()
        });

        prop_assert_eq!(kept.len(), timestamps.len().min(capacity));

        let mut expected = timestamps.clone();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        expected.truncate(capacity);
        let mut actual: Vec<i64> = kept.iter().map(|r| r.timestamp.timestamp()).collect();
        actual.sort_unstable_by(|a, b| b.cmp(a));
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn reconciliation_keeps_exactly_the_reported_compartments(
        local in prop::collection::btree_set(1u8..=8, 0..=8),
        reported in prop::collection::btree_set(1u8..=8, 0..=8),
    ) {
        let remaining = runtime().block_on(async {
            let engine = SyncEngine::new(
                Arc::new(MockTransport::new()),
                Arc::new(LocalStore::in_memory()),
                SyncSettings::default(),
            );
            for compartment in &local {
                engine
                    .add_dose(NewDose::new("08:00".parse().unwrap(), *compartment, "A"))
                    .await
                    .unwrap();
            }
            let snapshot = RemoteDoseSnapshot {
                compartments: reported.clone(),
                declared_total: reported.len() as u32,
                sequence: None,
            };
            engine.reconcile_active_doses(&snapshot, reported.len()).await.unwrap();
            engine
                .list_doses()
                .await
                .unwrap()
                .into_iter()
                .map(|d| d.compartment)
                .collect::<BTreeSet<_>>()
        });

        let expected: BTreeSet<u8> = local.intersection(&reported).copied().collect();
        prop_assert_eq!(remaining, expected);
    }

    #[test]
    fn decoding_arbitrary_payloads_never_panics(
        payload in prop::collection::vec(any::<u8>(), 0..256),
        topic in prop::sample::select(vec![
            "dose/confirmed",
            "dose/skipped",
            "alarm/active",
            "device/active-doses",
            "status",
            "config/dose",
        ]),
    ) {
        let _ = MessageDispatcher::new().decode(topic, &payload);
    }
}
