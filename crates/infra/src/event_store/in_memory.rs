use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use strata_core::EventUpcasters;
use strata_events::Event;

use super::r#trait::{
    AppendOutcome, EventStore, EventStoreError, LoadedStream, SnapshotCandidate, SnapshotPolicy,
    StoredSnapshot, StreamId, UncommittedEvent, upcast_event,
};

#[derive(Debug, Default)]
struct Stream {
    events: Vec<Event>,
    snapshot: Option<StoredSnapshot>,
}

impl Stream {
    fn current_version(&self) -> u64 {
        self.events.last().map(|e| e.version).unwrap_or(0)
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. The write lock makes the version check and the
/// append a single atomic step.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamId, Stream>>,
    upcasters: Arc<EventUpcasters>,
    policy: SnapshotPolicy,
    failing_appends: AtomicU32,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upcasters(mut self, upcasters: EventUpcasters) -> Self {
        self.upcasters = Arc::new(upcasters);
        self
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Make the next `n` appends fail with `Unavailable`.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Seed a stream with raw events as if written by an earlier release.
    ///
    /// Versions and schema versions are taken as given; no upcasting.
    pub fn seed(&self, stream: &StreamId, events: Vec<Event>) -> Result<(), EventStoreError> {
        let mut streams = self.write()?;
        streams.entry(stream.clone()).or_default().events.extend(events);
        Ok(())
    }

    /// Seed a snapshot as if written by an earlier release.
    pub fn seed_snapshot(&self, stream: &StreamId, snapshot: StoredSnapshot) -> Result<(), EventStoreError> {
        let mut streams = self.write()?;
        streams.entry(stream.clone()).or_default().snapshot = Some(snapshot);
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<StreamId, Stream>>, EventStoreError> {
        self.streams
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<StreamId, Stream>>, EventStoreError> {
        self.streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
        snapshot: Option<SnapshotCandidate>,
    ) -> Result<AppendOutcome, EventStoreError> {
        if self.take_injected_failure() {
            return Err(EventStoreError::Unavailable("injected append failure".to_string()));
        }

        let mut streams = self.write()?;
        let entry = streams.entry(stream.clone()).or_default();
        let current = entry.current_version();
        if current != expected_version {
            return Err(EventStoreError::VersionConflict {
                stream: stream.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        if events.is_empty() {
            return Ok(AppendOutcome {
                events: vec![],
                snapshot_version: None,
            });
        }

        let committed: Vec<Event> = events
            .into_iter()
            .enumerate()
            .map(|(i, e)| e.commit(stream, expected_version + i as u64 + 1))
            .collect();
        let new_version = expected_version + committed.len() as u64;
        entry.events.extend(committed.iter().cloned());

        let mut snapshot_version = None;
        if self.policy.should_persist(expected_version, new_version, snapshot.as_ref()) {
            if let Some(candidate) = snapshot {
                let newer = entry.snapshot.as_ref().is_none_or(|s| s.version < new_version);
                if newer {
                    entry.snapshot = Some(StoredSnapshot {
                        version: new_version,
                        state: candidate.state,
                        schema_version: candidate.schema_version,
                        created_at: Utc::now(),
                    });
                    snapshot_version = Some(new_version);
                }
            }
        }

        debug!(
            stream = %stream,
            expected_version,
            new_version,
            snapshot = snapshot_version.is_some(),
            "events appended"
        );
        Ok(AppendOutcome {
            events: committed,
            snapshot_version,
        })
    }

    async fn load(
        &self,
        stream: &StreamId,
        from_version: u64,
    ) -> Result<Option<LoadedStream>, EventStoreError> {
        let raw: Vec<Event> = {
            let streams = self.read()?;
            streams
                .get(stream)
                .map(|s| {
                    s.events
                        .iter()
                        .filter(|e| e.version > from_version)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        if raw.is_empty() && from_version == 0 {
            return Ok(None);
        }

        let version = raw.last().map(|e| e.version).unwrap_or(0).max(from_version);
        let events = raw
            .into_iter()
            .map(|e| upcast_event(&self.upcasters, e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(LoadedStream { events, version }))
    }

    async fn load_snapshot(&self, stream: &StreamId) -> Result<Option<StoredSnapshot>, EventStoreError> {
        let streams = self.read()?;
        Ok(streams.get(stream).and_then(|s| s.snapshot.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use strata_core::{AggregateId, MessageId, TenantId, UpcastChain};
    use strata_events::Metadata;

    fn stream(id: &str) -> StreamId {
        StreamId::new(TenantId::from("t1"), "order", AggregateId::from(id))
    }

    fn new_event(event_type: &str, n: i64) -> UncommittedEvent {
        UncommittedEvent {
            id: MessageId::generate(),
            event_type: event_type.to_string(),
            payload: json!({ "n": n }),
            metadata: Metadata::now(),
        }
    }

    fn candidate(n: i64) -> Option<SnapshotCandidate> {
        Some(SnapshotCandidate {
            state: json!({ "n": n }),
            schema_version: 1,
            force: false,
        })
    }

    #[tokio::test]
    async fn append_assigns_consecutive_versions() {
        let store = InMemoryEventStore::new();
        let s = stream("o1");
        let first = store
            .append(&s, vec![new_event("A", 1), new_event("B", 2)], 0, None)
            .await
            .unwrap();
        assert_eq!(first.events.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(first.events[0].aggregate_type, "order");

        let second = store.append(&s, vec![new_event("C", 3)], 2, None).await.unwrap();
        assert_eq!(second.version(), Some(3));
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts_and_writes_nothing() {
        let store = InMemoryEventStore::new();
        let s = stream("o1");
        store.append(&s, vec![new_event("A", 1)], 0, None).await.unwrap();

        let err = store
            .append(&s, vec![new_event("B", 2), new_event("C", 3)], 0, None)
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(store.load(&s, 0).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn snapshot_cadence_follows_version_boundaries() {
        let store = InMemoryEventStore::new();
        let s = stream("o1");

        store.append(&s, vec![new_event("A", 1)], 0, candidate(1)).await.unwrap();
        assert!(store.load_snapshot(&s).await.unwrap().is_none());

        let out = store.append(&s, vec![new_event("A", 2)], 1, candidate(2)).await.unwrap();
        assert_eq!(out.snapshot_version, Some(2));

        let out = store.append(&s, vec![new_event("A", 3)], 2, candidate(3)).await.unwrap();
        assert_eq!(out.snapshot_version, None);
        assert_eq!(store.load_snapshot(&s).await.unwrap().unwrap().version, 2);

        store.append(&s, vec![new_event("A", 4)], 3, candidate(4)).await.unwrap();
        let snap = store.load_snapshot(&s).await.unwrap().unwrap();
        assert_eq!(snap.version, 4);
        assert_eq!(snap.state, json!({ "n": 4 }));
    }

    #[tokio::test]
    async fn forced_snapshot_is_written_off_cadence() {
        let store = InMemoryEventStore::new();
        let s = stream("o1");
        let forced = Some(SnapshotCandidate {
            state: json!({}),
            schema_version: 1,
            force: true,
        });
        let out = store.append(&s, vec![new_event("A", 1)], 0, forced).await.unwrap();
        assert_eq!(out.snapshot_version, Some(1));
    }

    #[tokio::test]
    async fn load_semantics() {
        let store = InMemoryEventStore::new();
        let s = stream("o1");
        assert!(store.load(&s, 0).await.unwrap().is_none());

        // Nothing past the requested version still reports that version.
        let empty = store.load(&s, 3).await.unwrap().unwrap();
        assert!(empty.events.is_empty());
        assert_eq!(empty.version, 3);

        store
            .append(&s, vec![new_event("A", 1), new_event("A", 2), new_event("A", 3)], 0, None)
            .await
            .unwrap();
        let tail = store.load(&s, 1).await.unwrap().unwrap();
        assert_eq!(tail.events.iter().map(|e| e.version).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(tail.version, 3);
    }

    #[tokio::test]
    async fn streams_are_tenant_scoped() {
        let store = InMemoryEventStore::new();
        let a = stream("o1");
        let b = StreamId::new(TenantId::from("t2"), "order", AggregateId::from("o1"));
        store.append(&a, vec![new_event("A", 1)], 0, None).await.unwrap();
        assert!(store.load(&b, 0).await.unwrap().is_none());
        store.append(&b, vec![new_event("A", 1)], 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn load_upcasts_old_payloads() {
        let mut upcasters = EventUpcasters::new();
        upcasters
            .register(
                "A",
                UpcastChain::identity(1).with_step(1, |mut raw| {
                    raw["upcast"] = json!(true);
                    Ok(raw)
                }),
            )
            .unwrap();
        let store = InMemoryEventStore::new().with_upcasters(upcasters);
        let s = stream("o1");
        store.append(&s, vec![new_event("A", 1)], 0, None).await.unwrap();

        let loaded = store.load(&s, 0).await.unwrap().unwrap();
        assert_eq!(loaded.events[0].payload, json!({ "n": 1, "upcast": true }));
        assert_eq!(loaded.events[0].schema_version(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_have_exactly_one_winner() {
        let store = Arc::new(InMemoryEventStore::new());
        let s = stream("o1");
        let mut tasks = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                store.append(&s, vec![new_event("A", n)], 0, None).await
            }));
        }
        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_version_conflict()),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn injected_failures_are_unavailable() {
        let store = InMemoryEventStore::new();
        store.fail_next_appends(1);
        let s = stream("o1");
        assert!(matches!(
            store.append(&s, vec![new_event("A", 1)], 0, None).await,
            Err(EventStoreError::Unavailable(_))
        ));
        store.append(&s, vec![new_event("A", 1)], 0, None).await.unwrap();
    }

    proptest! {
        #[test]
        fn versions_stay_gap_free(batches in prop::collection::vec(1usize..4, 1..10)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let s = stream("o1");
                let mut expected = 0u64;
                for size in &batches {
                    let events = (0..*size).map(|i| new_event("A", i as i64)).collect();
                    let out = store.append(&s, events, expected, None).await.unwrap();
                    expected += *size as u64;
                    assert_eq!(out.version(), Some(expected));
                }
                let loaded = store.load(&s, 0).await.unwrap().unwrap();
                let versions: Vec<u64> = loaded.events.iter().map(|e| e.version).collect();
                let want: Vec<u64> = (1..=expected).collect();
                assert_eq!(versions, want);
            });
        }
    }
}
