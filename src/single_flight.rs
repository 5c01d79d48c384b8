//! Cooperative, best-effort deduplication of identical in-flight
//! subrequests, plus a rolling response-size estimator used to right-size
//! scratch buffers.
//!
//! Storage is sharded to bound lock contention. Within a shard, the first
//! task to register a key becomes the leader and performs the real call;
//! concurrent tasks with the same key become followers and wait for the
//! leader's published outcome. Entries are removed on completion, so the
//! next identical request starts fresh instead of replaying a stale result.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::sync::RwLock;

use crate::plan::GraphCoordinate;

const SHARD_COUNT: u64 = 64;

/// Rolling window length of the size estimator. When the window fills up,
/// the accumulated state collapses to its average, so old samples decay.
const SIZE_WINDOW: u64 = 50;

/// What a leader publishes and followers receive: the subrequest outcome,
/// shared verbatim.
pub type FlightOutcome = Result<FlightResponse, String>;

/// A successful subrequest response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlightResponse {
    pub status_code: Option<u16>,
    pub body: Bytes,
}

/// The two hash keys of one subrequest.
///
/// `sf_key` is exact (data source, full rendered body, header hash) and
/// decides true duplicates. `fetch_key` is coarse (data source, root-field
/// coordinates) and only feeds the size estimator, amortizing over similar
/// rather than identical requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlightKeys {
    pub sf_key: u64,
    pub fetch_key: u64,
}

type Slot = Arc<RwLock<Option<FlightOutcome>>>;

#[derive(Default)]
struct FetchSize {
    count: u64,
    total_bytes: u64,
}

#[derive(Default)]
struct Shard {
    flights: Mutex<HashMap<u64, Slot>>,
    sizes: Mutex<HashMap<u64, FetchSize>>,
}

/// The single-flight deduplicator. One instance per executor; explicitly
/// constructed and injected, never ambient state.
pub struct SingleFlight {
    shards: Vec<Shard>,
    hasher: RandomState,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
            hasher: RandomState::new(),
        }
    }

    /// Compute both keys for one subrequest. The hasher is seeded per
    /// instance, so keys are stable within a process but not across
    /// restarts.
    pub fn keys(
        &self,
        data_source_id: &str,
        rendered_input: &[u8],
        header_hash: u64,
        root_fields: &[GraphCoordinate],
    ) -> FlightKeys {
        let mut hasher = self.hasher.build_hasher();
        data_source_id.hash(&mut hasher);
        rendered_input.hash(&mut hasher);
        header_hash.hash(&mut hasher);
        let sf_key = hasher.finish();

        let mut hasher = self.hasher.build_hasher();
        data_source_id.hash(&mut hasher);
        root_fields.hash(&mut hasher);
        let fetch_key = hasher.finish();

        FlightKeys { sf_key, fetch_key }
    }

    /// Register a subrequest. The first caller for a key becomes the
    /// leader and must perform the call, then publish via
    /// [`FlightLeader::finish`]; followers get the leader's outcome once
    /// published.
    pub async fn get_or_create(&self, keys: FlightKeys) -> Flight<'_> {
        let shard = self.shard(keys.sf_key);
        let slot = {
            let mut flights = shard.flights.lock();
            match flights.get(&keys.sf_key) {
                Some(slot) => slot.clone(),
                None => {
                    let slot: Slot = Arc::new(RwLock::new(None));
                    let guard = slot
                        .clone()
                        .try_write_owned()
                        .expect("lock was just created and is uncontended");
                    flights.insert(keys.sf_key, slot);
                    return Flight::Leader(FlightLeader {
                        single_flight: self,
                        keys,
                        guard: Some(guard),
                    });
                }
            }
        };
        // follower: the read lock opens once the leader's write guard drops
        let outcome = slot.read().await.clone();
        Flight::Follower(outcome.unwrap_or_else(|| {
            Err("in-flight subrequest was abandoned by its leader".to_string())
        }))
    }

    /// The rolling average response size for this fetch shape, in bytes.
    /// Zero when no sample was recorded yet.
    pub fn size_hint(&self, keys: &FlightKeys) -> usize {
        let sizes = self.shard(keys.sf_key).sizes.lock();
        match sizes.get(&keys.fetch_key) {
            Some(size) if size.count > 0 => (size.total_bytes / size.count) as usize,
            _ => 0,
        }
    }

    fn shard(&self, sf_key: u64) -> &Shard {
        &self.shards[(sf_key % SHARD_COUNT) as usize]
    }

    fn remove(&self, keys: &FlightKeys) {
        self.shard(keys.sf_key).flights.lock().remove(&keys.sf_key);
    }

    fn record_size(&self, keys: &FlightKeys, sample: usize) {
        let mut sizes = self.shard(keys.sf_key).sizes.lock();
        let size = sizes.entry(keys.fetch_key).or_default();
        if size.count == SIZE_WINDOW {
            size.count = 1;
            size.total_bytes /= SIZE_WINDOW;
        }
        size.count += 1;
        size.total_bytes += sample as u64;
    }
}

/// The role assigned to one registered subrequest.
pub enum Flight<'a> {
    /// This task must perform the real call and publish the outcome.
    Leader(FlightLeader<'a>),
    /// Another task performed the call; this is its outcome.
    Follower(FlightOutcome),
}

/// The leader's handle on an in-flight entry.
///
/// Dropping the handle without calling [`finish`](Self::finish) removes
/// the entry and wakes followers with an abandonment error, so no exit
/// path can leave a key permanently in flight.
pub struct FlightLeader<'a> {
    single_flight: &'a SingleFlight,
    keys: FlightKeys,
    guard: Option<OwnedRwLockWriteGuard<Option<FlightOutcome>>>,
}

impl FlightLeader<'_> {
    /// Publish the outcome: the entry is removed first (so new identical
    /// requests start fresh), the size sample is recorded, and dropping
    /// the write guard wakes all followers.
    pub fn finish(mut self, outcome: FlightOutcome) {
        if let Some(mut guard) = self.guard.take() {
            let sample = outcome
                .as_ref()
                .map(|response| response.body.len())
                .unwrap_or_default();
            *guard = Some(outcome);
            self.single_flight.remove(&self.keys);
            self.single_flight.record_size(&self.keys, sample);
            drop(guard);
        }
    }
}

impl Drop for FlightLeader<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.single_flight.remove(&self.keys);
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn response(body: &'static [u8]) -> FlightResponse {
        FlightResponse {
            status_code: Some(200),
            body: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn follower_receives_the_leaders_outcome() {
        let single_flight = Arc::new(SingleFlight::new());
        let keys = single_flight.keys("users", b"{\"query\":\"...\"}", 0, &[]);

        let leader = match single_flight.get_or_create(keys).await {
            Flight::Leader(leader) => leader,
            Flight::Follower(_) => panic!("first registration must lead"),
        };

        let follower = tokio::spawn({
            let single_flight = Arc::clone(&single_flight);
            async move {
                match single_flight.get_or_create(keys).await {
                    Flight::Follower(outcome) => outcome,
                    Flight::Leader(_) => panic!("second registration must follow"),
                }
            }
        });
        // let the follower register before the leader publishes
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.finish(Ok(response(b"{\"data\":{}}")));
        let outcome = follower.await.expect("follower task");
        assert_eq!(outcome, Ok(response(b"{\"data\":{}}")));
    }

    #[tokio::test]
    async fn finished_entries_do_not_linger() {
        let single_flight = SingleFlight::new();
        let keys = single_flight.keys("users", b"body", 0, &[]);
        match single_flight.get_or_create(keys).await {
            Flight::Leader(leader) => leader.finish(Ok(response(b"one"))),
            Flight::Follower(_) => panic!("must lead"),
        }
        // a later identical request starts a fresh flight
        assert!(matches!(
            single_flight.get_or_create(keys).await,
            Flight::Leader(_)
        ));
    }

    #[tokio::test]
    async fn abandoned_leader_wakes_followers_with_an_error() {
        let single_flight = Arc::new(SingleFlight::new());
        let keys = single_flight.keys("users", b"body", 0, &[]);
        let leader = match single_flight.get_or_create(keys).await {
            Flight::Leader(leader) => leader,
            Flight::Follower(_) => panic!("must lead"),
        };
        let follower = tokio::spawn({
            let single_flight = Arc::clone(&single_flight);
            async move {
                match single_flight.get_or_create(keys).await {
                    Flight::Follower(outcome) => outcome,
                    Flight::Leader(_) => panic!("must follow"),
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(leader);
        let outcome = follower.await.expect("follower task");
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn size_estimate_halves_at_the_window_boundary() {
        let single_flight = SingleFlight::new();
        let keys = single_flight.keys("users", b"body", 0, &[]);
        for _ in 0..50 {
            match single_flight.get_or_create(keys).await {
                Flight::Leader(leader) => leader.finish(Ok(FlightResponse {
                    status_code: Some(200),
                    body: Bytes::from(vec![0u8; 100]),
                })),
                Flight::Follower(_) => panic!("must lead"),
            }
        }
        match single_flight.get_or_create(keys).await {
            Flight::Leader(leader) => leader.finish(Ok(FlightResponse {
                status_code: Some(200),
                body: Bytes::from(vec![0u8; 200]),
            })),
            Flight::Follower(_) => panic!("must lead"),
        }
        assert_eq!(single_flight.size_hint(&keys), 150);
    }

    #[tokio::test]
    async fn different_bodies_never_share_a_flight() {
        let single_flight = SingleFlight::new();
        let first = single_flight.keys("users", b"body-a", 0, &[]);
        let second = single_flight.keys("users", b"body-b", 0, &[]);
        assert_ne!(first.sf_key, second.sf_key);
        // coarse keys do collide on purpose: same data source, same shape
        assert_eq!(first.fetch_key, second.fetch_key);

        let _leader_a = match single_flight.get_or_create(first).await {
            Flight::Leader(leader) => leader,
            Flight::Follower(_) => panic!("must lead"),
        };
        assert!(matches!(
            single_flight.get_or_create(second).await,
            Flight::Leader(_)
        ));
    }
}
