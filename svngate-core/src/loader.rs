//! Bounded-memory content prefetcher.
//!
//! The producer walks the operation tree in depth-first insertion order and
//! fetches file content ahead of the response generator, which consumes the
//! same items in the same order via [`ItemLoader::try_rob`]. The upstream
//! download primitive buffers each response fully in memory, so both the
//! number of in-flight fetches and the total buffered bytes are capped.
//!
//! Every wait point observes cancellation and a bounded absolute deadline.
//! Waiters arm their wakeup before re-checking state, so a completion landing
//! between the check and the await still wakes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{GateError, Result};
use crate::item::{ContentSlot, LoadRequest};
use crate::source::{Credentials, SourceRepository};

/// Loader limits. The defaults mirror production behavior; tests shrink
/// them to keep wall time low.
#[derive(Debug, Clone)]
pub struct LoaderLimits {
    /// Concurrent upstream fetches.
    pub max_in_flight: usize,
    /// Cap on loaded-but-unconsumed bytes.
    pub max_buffered_bytes: u64,
    /// Absolute bound on producer wall time, measured from loader start.
    pub production_deadline: Duration,
    /// Bound on one stretch of waiting for the consumer to free space,
    /// measured from the start of that wait.
    pub consumption_deadline: Duration,
    /// Bound on a single wait iteration inside the capacity gate.
    pub consumption_step: Duration,
}

impl Default for LoaderLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            // 32-bit hosts keep the buffer small to avoid long-lived
            // large-object fragmentation.
            max_buffered_bytes: if cfg!(target_pointer_width = "64") {
                100 * 1024 * 1024
            } else {
                10 * 1024 * 1024
            },
            production_deadline: Duration::from_secs(4 * 60 * 60),
            consumption_deadline: Duration::from_secs(4 * 60 * 60),
            consumption_step: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    /// Bytes attached to slots and not yet robbed.
    buffered: u64,
    /// Expected bytes of fetches currently in flight.
    reserved: u64,
    /// Fetches currently in flight.
    in_flight: usize,
}

struct LoaderShared {
    ledger: Mutex<Ledger>,
    cancelled: AtomicBool,
    cancel_wake: Notify,
    /// Consumer freed buffer space (or a fetch failed, shrinking the total).
    space_freed: Notify,
    /// Edge-triggered completion signal; consumers re-check their own slot
    /// on every wake.
    data_ready: Notify,
}

/// Content robbed out of an item by the consumer.
#[derive(Debug, Clone, Default)]
pub struct RobbedContent {
    pub base64: String,
    pub md5: Option<String>,
    pub got_data: bool,
}

/// Snapshot of loader state, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderStats {
    pub buffered_bytes: u64,
    pub in_flight: usize,
    pub cancelled: bool,
}

/// Per-request prefetch pipeline. Shared between the producer task and the
/// response generator through an `Arc`.
pub struct ItemLoader {
    source: Arc<dyn SourceRepository>,
    creds: Credentials,
    limits: LoaderLimits,
    shared: Arc<LoaderShared>,
}

impl ItemLoader {
    pub fn new(source: Arc<dyn SourceRepository>, creds: Credentials, limits: LoaderLimits) -> Self {
        Self {
            source,
            creds,
            limits,
            shared: Arc::new(LoaderShared {
                ledger: Mutex::new(Ledger::default()),
                cancelled: AtomicBool::new(false),
                cancel_wake: Notify::new(),
                space_freed: Notify::new(),
                data_ready: Notify::new(),
            }),
        }
    }

    pub fn stats(&self) -> LoaderStats {
        let ledger = self.shared.ledger.lock().expect("loader ledger poisoned");
        LoaderStats {
            buffered_bytes: ledger.buffered,
            in_flight: ledger.in_flight,
            cancelled: self.shared.cancelled.load(Ordering::SeqCst),
        }
    }

    /// Arm the cancel flag and wake every producer and consumer wait point.
    /// Idempotent. In-flight fetches are not aborted; [`Self::start`] drains
    /// them before returning.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.cancel_wake.notify_waiters();
        self.shared.space_freed.notify_one();
        self.shared.data_ready.notify_waiters();
    }

    /// Run the producer loop over `plan` (depth-first tree order) to natural
    /// end, cancellation, or deadline. Always drains outstanding fetches
    /// before returning.
    pub async fn start(&self, plan: Vec<LoadRequest>) -> Result<()> {
        let production_deadline = Instant::now() + self.limits.production_deadline;
        let slots = Arc::new(Semaphore::new(self.limits.max_in_flight.max(1)));
        let mut fetches: JoinSet<()> = JoinSet::new();
        let mut outcome = Ok(());

        debug!(items = plan.len(), "item loader starting");
        for request in plan {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                outcome = Err(GateError::Cancelled);
                break;
            }
            if let Err(err) = self.wait_for_space(request.source.size).await {
                outcome = Err(err);
                break;
            }
            let permit = match self.wait_for_slot(&slots, production_deadline).await {
                Ok(permit) => permit,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };

            // Bookkeeping goes in before the fetch begins so a synchronous
            // completion cannot outrun it.
            {
                let mut ledger = self.shared.ledger.lock().expect("loader ledger poisoned");
                ledger.in_flight += 1;
                ledger.reserved += request.source.size;
            }

            let shared = self.shared.clone();
            let source = self.source.clone();
            let creds = self.creds.clone();
            fetches.spawn(async move {
                let fetched = source.read_file(&creds, &request.source).await;
                match fetched {
                    Ok(data) => {
                        let md5 = hex::encode(Md5::digest(&data));
                        {
                            let mut ledger = shared.ledger.lock().expect("loader ledger poisoned");
                            ledger.reserved = ledger.reserved.saturating_sub(request.source.size);
                            ledger.buffered += data.len() as u64;
                            ledger.in_flight -= 1;
                        }
                        request.slot.attach(data, md5);
                    }
                    Err(err) => {
                        // No retry: the item reaches the consumer with no
                        // data and downstream reports the error.
                        warn!(path = %request.path, error = %err, "item fetch failed");
                        {
                            let mut ledger = shared.ledger.lock().expect("loader ledger poisoned");
                            ledger.reserved = ledger.reserved.saturating_sub(request.source.size);
                            ledger.in_flight -= 1;
                        }
                        request.slot.mark_failed();
                    }
                }
                drop(permit);
                shared.space_freed.notify_one();
                shared.data_ready.notify_waiters();
            });
        }

        // Drain: cancel does not abort in-flight fetches.
        while let Some(joined) = fetches.join_next().await {
            if let Err(join_err) = joined {
                error!(error = %join_err, "fetch task aborted");
                if outcome.is_ok() {
                    outcome = Err(GateError::Upstream(anyhow::anyhow!(join_err)));
                }
            }
        }
        debug!(ok = outcome.is_ok(), "item loader finished");
        outcome
    }

    /// Block until the slot for `item` is loaded or `timeout` elapses, then
    /// move the bytes out, freeing buffer capacity.
    ///
    /// Observing cancellation yields an empty result rather than an error. A
    /// second rob of the same slot returns an empty buffer.
    pub async fn try_rob(&self, slot: &ContentSlot, timeout: Duration) -> Result<RobbedContent> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.shared.data_ready.notified();
            let cancel = self.shared.cancel_wake.notified();
            tokio::pin!(ready, cancel);
            // Register both wakeups before checking state; a completion
            // cannot slip between the check and the wait.
            ready.as_mut().enable();
            cancel.as_mut().enable();

            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Ok(RobbedContent::default());
            }
            if let Some((data, md5)) = slot.take() {
                return match data {
                    Some(bytes) => {
                        {
                            let mut ledger =
                                self.shared.ledger.lock().expect("loader ledger poisoned");
                            ledger.buffered = ledger.buffered.saturating_sub(bytes.len() as u64);
                        }
                        self.shared.space_freed.notify_one();
                        Ok(RobbedContent {
                            base64: BASE64.encode(&bytes),
                            md5,
                            got_data: true,
                        })
                    }
                    // Failed fetch, or the bytes were already moved out.
                    None => Ok(RobbedContent {
                        base64: String::new(),
                        md5,
                        got_data: false,
                    }),
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GateError::ProductionTimeout);
            }
            tokio::select! {
                _ = &mut ready => {}
                _ = &mut cancel => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(GateError::ProductionTimeout);
                }
            }
        }
    }

    /// Capacity gate. The next fetch must leave the buffer strictly under
    /// the cap unless nothing is outstanding, in which case a single
    /// oversized fetch may proceed alone.
    async fn wait_for_space(&self, next_size: u64) -> Result<()> {
        let deadline = Instant::now() + self.limits.consumption_deadline;
        loop {
            let space = self.shared.space_freed.notified();
            let cancel = self.shared.cancel_wake.notified();
            tokio::pin!(space, cancel);
            space.as_mut().enable();
            cancel.as_mut().enable();

            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(GateError::Cancelled);
            }
            let outstanding = {
                let ledger = self.shared.ledger.lock().expect("loader ledger poisoned");
                ledger.buffered + ledger.reserved
            };
            if outstanding == 0 || outstanding + next_size < self.limits.max_buffered_bytes {
                return Ok(());
            }

            let step_deadline = Instant::now() + self.limits.consumption_step;
            let wake_at = step_deadline.min(deadline);
            tokio::select! {
                _ = &mut space => {}
                _ = &mut cancel => {}
                _ = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= deadline {
                        // The consumer has stopped robbing items.
                        return Err(GateError::ConsumptionTimeout);
                    }
                }
            }
        }
    }

    /// In-flight slot gate, bounded by the absolute production deadline.
    async fn wait_for_slot(
        &self,
        slots: &Arc<Semaphore>,
        production_deadline: Instant,
    ) -> Result<tokio::sync::OwnedSemaphorePermit> {
        loop {
            let cancel = self.shared.cancel_wake.notified();
            tokio::pin!(cancel);
            cancel.as_mut().enable();

            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(GateError::Cancelled);
            }
            tokio::select! {
                permit = slots.clone().acquire_owned() => {
                    return Ok(permit.expect("loader semaphore closed"));
                }
                _ = &mut cancel => {}
                _ = tokio::time::sleep_until(production_deadline) => {
                    return Err(GateError::ProductionTimeout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_source::{MemChange, MemorySource};
    use crate::source::{DeletedState, ItemCategory, Recursion, VersionSpec};
    use bytes::Bytes;

    async fn seeded_plan(files: &[(&str, usize)]) -> (Arc<MemorySource>, Vec<LoadRequest>) {
        let source = Arc::new(MemorySource::new());
        let changes = files
            .iter()
            .map(|(path, size)| MemChange::AddFile {
                path: (*path).to_string(),
                data: Bytes::from(vec![b'x'; *size]),
            })
            .collect();
        let rev = source.commit("alice", "seed", changes).await;

        let creds = Credentials::default();
        let mut plan = Vec::new();
        for (path, _) in files {
            let items = source
                .query_items(
                    &creds,
                    path,
                    Recursion::None,
                    VersionSpec::Changeset(rev),
                    DeletedState::NonDeleted,
                    ItemCategory::Any,
                )
                .await
                .unwrap();
            plan.push(LoadRequest {
                path: (*path).to_string(),
                source: items[0].clone(),
                slot: ContentSlot::new(),
            });
        }
        (source, plan)
    }

    use crate::source::SourceRepository;

    fn small_limits() -> LoaderLimits {
        LoaderLimits {
            max_in_flight: 3,
            max_buffered_bytes: 4096,
            production_deadline: Duration::from_secs(5),
            consumption_deadline: Duration::from_secs(5),
            consumption_step: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_loads_all_and_robs_in_order() {
        let (source, plan) = seeded_plan(&[("$/p/a", 10), ("$/p/b", 20), ("$/p/c", 30)]).await;
        let loader = Arc::new(ItemLoader::new(
            source,
            Credentials::default(),
            LoaderLimits::default(),
        ));
        let slots: Vec<_> = plan.iter().map(|r| r.slot.clone()).collect();

        let producer = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.start(plan).await })
        };

        for (slot, expected_len) in slots.iter().zip([10usize, 20, 30]) {
            let robbed = loader.try_rob(slot, Duration::from_secs(2)).await.unwrap();
            assert!(robbed.got_data);
            let decoded = BASE64.decode(robbed.base64.as_bytes()).unwrap();
            assert_eq!(decoded.len(), expected_len);
            assert_eq!(robbed.md5.as_deref(), Some(hex::encode(Md5::digest(&decoded)).as_str()));
        }
        producer.await.unwrap().unwrap();
        assert_eq!(loader.stats().buffered_bytes, 0);
    }

    #[tokio::test]
    async fn test_rob_is_a_move() {
        let (source, plan) = seeded_plan(&[("$/p/a", 10)]).await;
        let loader = Arc::new(ItemLoader::new(
            source,
            Credentials::default(),
            LoaderLimits::default(),
        ));
        let slot = plan[0].slot.clone();

        let producer = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.start(plan).await })
        };
        producer.await.unwrap().unwrap();

        let first = loader.try_rob(&slot, Duration::from_secs(1)).await.unwrap();
        assert!(first.got_data);
        let second = loader.try_rob(&slot, Duration::from_secs(1)).await.unwrap();
        assert!(!second.got_data);
        assert!(second.base64.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_full_backpressure_then_cancel() {
        // 4 KiB cap, three 2 KiB files, no consumer: after the first fetch
        // lands, the producer must hold at the capacity gate.
        let (source, plan) = seeded_plan(&[("$/p/a", 2048), ("$/p/b", 2048), ("$/p/c", 2048)]).await;
        let loader = Arc::new(ItemLoader::new(
            source,
            Credentials::default(),
            small_limits(),
        ));

        let producer = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.start(plan).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = loader.stats();
        assert_eq!(stats.buffered_bytes, 2048, "exactly one item loaded");
        assert_eq!(stats.in_flight, 0);
        assert!(!producer.is_finished(), "producer must be waiting for space");

        loader.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("cancel must unblock the producer")
            .unwrap();
        assert!(matches!(outcome, Err(GateError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_during_long_fetch_drains() {
        let (source, plan) = seeded_plan(&[("$/p/slow", 64)]).await;
        source.set_read_delay(Duration::from_millis(500));
        let loader = Arc::new(ItemLoader::new(
            source,
            Credentials::default(),
            small_limits(),
        ));
        let slot = plan[0].slot.clone();

        let started = std::time::Instant::now();
        let producer = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.start(plan).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        loader.cancel();

        let _ = producer.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500), "fetch drained");
        assert!(slot.is_loaded(), "drained fetch still attaches its data");

        let robbed = loader.try_rob(&slot, Duration::from_secs(1)).await.unwrap();
        assert!(!robbed.got_data, "consumer observing cancel gets no data");
        assert!(robbed.base64.is_empty());
    }

    #[tokio::test]
    async fn test_consumption_deadline_diagnoses_stuck_consumer() {
        let (source, plan) = seeded_plan(&[("$/p/a", 3000), ("$/p/b", 3000)]).await;
        let limits = LoaderLimits {
            consumption_deadline: Duration::from_millis(200),
            consumption_step: Duration::from_millis(40),
            ..small_limits()
        };
        let loader = ItemLoader::new(source, Credentials::default(), limits);
        let outcome = loader.start(plan).await;
        assert!(matches!(outcome, Err(GateError::ConsumptionTimeout)));
    }

    #[tokio::test]
    async fn test_failed_fetch_reaches_consumer_without_data() {
        let (source, plan) = seeded_plan(&[("$/p/bad", 16), ("$/p/good", 16)]).await;
        source.fail_reads_of("$/p/bad");
        let loader = Arc::new(ItemLoader::new(
            source,
            Credentials::default(),
            small_limits(),
        ));
        let bad = plan[0].slot.clone();
        let good = plan[1].slot.clone();

        let producer = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.start(plan).await })
        };
        producer.await.unwrap().unwrap();

        let robbed = loader.try_rob(&bad, Duration::from_secs(1)).await.unwrap();
        assert!(!robbed.got_data);
        let robbed = loader.try_rob(&good, Duration::from_secs(1)).await.unwrap();
        assert!(robbed.got_data);
    }

    #[tokio::test]
    async fn test_rob_times_out_when_nothing_produces() {
        let (source, _) = seeded_plan(&[("$/p/a", 8)]).await;
        let loader = ItemLoader::new(source, Credentials::default(), small_limits());
        let slot = ContentSlot::new();
        let err = loader
            .try_rob(&slot, Duration::from_millis(80))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
