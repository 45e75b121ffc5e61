#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-consumer** – The command pipeline: clock tick, layout check,
//! locking, execution, append, index, notify.
//!
//! [`Command`] is generic over its own event and output types, so one
//! `publish` call per concrete command type is the natural Rust shape —
//! there is no single object-safe "run this command" trait to queue. To
//! still get a bounded, multi-worker intake queue (§4.7/§5 "a pool of N
//! workers pulling from a bounded FIFO queue"), each `publish` call
//! monomorphizes the whole pipeline into one boxed, type-erased future (a
//! "job") and hands that to the worker pool; the generic code runs inside
//! the job, never across the channel. Grounded on the teacher's
//! `toka-orchestration` use of `tokio::sync::mpsc` plus `tokio::spawn` for a
//! background worker, generalized from a single completion channel to a
//! shared job queue drained by several workers.

mod pipeline;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use aeon_bus::SubscriberRegistry;
use aeon_clock::HybridClock;
use aeon_codec::CodecError;
use aeon_index::IndexEngine;
use aeon_layout::{LayoutCache, LayoutError, LayoutValue};
use aeon_locks::LockProvider;
use aeon_store_core::{Journal, StorageError};
use aeon_types::Command;

use pipeline::{run_pipeline, PipelineContext};

/// Errors that terminate a command's publication, matching the error
/// taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The consumer has been stopped and is no longer accepting work.
    #[error("command consumer is shutting down")]
    ShuttingDown,
    /// The command's declared locks were not all acquired within the
    /// configured timeout.
    #[error("timed out acquiring lock(s) {0:?}")]
    LockTimeout(String),
    /// The durable append failed; nothing from this command is visible.
    #[error("journal error: {0}")]
    JournalError(#[from] StorageError),
    /// A layout could not be derived for the command or one of its event
    /// types.
    #[error("layout error: {0}")]
    LayoutError(#[from] LayoutError),
    /// The codec could not encode a value against its layout.
    #[error("serialization error: {0}")]
    SerializationError(#[from] CodecError),
    /// The command's `execute` panicked; captured as
    /// `CommandTerminatedExceptionally` + `HostErrorOccurred` and persisted.
    #[error("command execution failed: {0}")]
    HostError(String),
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Tuning knobs for the consumer's intake queue and lock acquisition,
/// matching §6's configuration table (`worker_count`, `queue_depth`,
/// `lock_timeout_ms`).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of worker tasks draining the intake queue.
    pub worker_count: usize,
    /// Bounded intake queue capacity; `publish` waits once full.
    pub queue_depth: usize,
    /// Per-lock acquisition timeout.
    pub lock_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            queue_depth: 1024,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrates the command pipeline: a bounded job queue drained by
/// `worker_count` workers, each running one job (one command's full
/// pipeline) to completion before pulling the next — "within one command,
/// execution is sequential" per the concurrency model, while different
/// workers run different commands in parallel.
pub struct CommandConsumer {
    ctx: Arc<PipelineContext>,
    job_tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
}

impl CommandConsumer {
    /// Start a consumer backed by the given infrastructure and configuration.
    pub fn start(
        clock: Arc<HybridClock>,
        journal: Arc<dyn Journal>,
        locks: Arc<dyn LockProvider>,
        layouts: LayoutCache,
        index: Arc<IndexEngine>,
        subscribers: Arc<SubscriberRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        let ctx = Arc::new(PipelineContext {
            clock,
            journal,
            locks,
            layouts,
            index,
            subscribers,
            lock_timeout: config.lock_timeout,
        });

        let (job_tx, job_rx) = mpsc::channel::<Job>(config.queue_depth);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let stopped = Arc::new(AtomicBool::new(false));

        let workers = (0..config.worker_count.max(1))
            .map(|worker_id| {
                let job_rx = job_rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { job_rx.lock().await.recv().await };
                        match job {
                            Some(job) => job().await,
                            None => {
                                tracing::debug!(worker_id, "intake queue closed, worker exiting");
                                break;
                            }
                        }
                    }
                })
            })
            .collect();

        Self { ctx, job_tx, workers, stopped }
    }

    /// Submit a command for execution, waiting for the pipeline to resolve
    /// its result. Blocks (asynchronously) once the intake queue is full,
    /// per the back-pressure contract in §4.7.
    pub async fn publish<C>(&self, command: C) -> Result<C::Output, ConsumerError>
    where
        C: Command + LayoutValue,
        C::Event: LayoutValue,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ConsumerError::ShuttingDown);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let ctx = self.ctx.clone();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = run_pipeline(ctx, command).await;
                let _ = result_tx.send(result);
            })
        });

        self.job_tx.send(job).await.map_err(|_| ConsumerError::ShuttingDown)?;
        result_rx.await.map_err(|_| ConsumerError::ShuttingDown)?
    }

    /// Stop accepting new work and wait for in-flight and queued commands to
    /// drain. Already-admitted commands run to completion; this only
    /// prevents new admissions.
    pub async fn stop(mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        drop(self.job_tx);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeon_locks::LocalLockProvider;
    use aeon_store_memory::MemoryJournal;
    use aeon_types::{CommandExecution, EntityLayoutIntroduced};
    use std::sync::atomic::AtomicU32;

    struct Deposit {
        account: String,
        amount: i64,
    }

    struct DepositEvent {
        amount: i64,
    }

    impl LayoutValue for DepositEvent {
        fn descriptor() -> aeon_layout::EntityDescriptor {
            aeon_layout::EntityDescriptor::new("DepositEvent", vec![("amount", aeon_layout::FieldType::I64)])
        }
        fn to_value(&self) -> aeon_layout::Value {
            aeon_layout::Value::Layout(vec![("amount".to_string(), aeon_layout::Value::I64(self.amount))])
        }
        fn from_value(value: aeon_layout::Value) -> Result<Self, LayoutError> {
            let mut fields = value.into_fields().unwrap();
            let amount = match aeon_layout::take_field(&mut fields, "amount")? {
                aeon_layout::Value::I64(n) => n,
                _ => return Err(LayoutError::MalformedSchema("expected i64".into())),
            };
            Ok(DepositEvent { amount })
        }
    }

    impl LayoutValue for Deposit {
        fn descriptor() -> aeon_layout::EntityDescriptor {
            aeon_layout::EntityDescriptor::new(
                "Deposit",
                vec![("account", aeon_layout::FieldType::Str), ("amount", aeon_layout::FieldType::I64)],
            )
        }
        fn to_value(&self) -> aeon_layout::Value {
            aeon_layout::Value::Layout(vec![
                ("account".to_string(), aeon_layout::Value::Str(self.account.clone())),
                ("amount".to_string(), aeon_layout::Value::I64(self.amount)),
            ])
        }
        fn from_value(value: aeon_layout::Value) -> Result<Self, LayoutError> {
            let mut fields = value.into_fields().unwrap();
            let account = match aeon_layout::take_field(&mut fields, "account")? {
                aeon_layout::Value::Str(s) => s,
                _ => return Err(LayoutError::MalformedSchema("expected str".into())),
            };
            let amount = match aeon_layout::take_field(&mut fields, "amount")? {
                aeon_layout::Value::I64(n) => n,
                _ => return Err(LayoutError::MalformedSchema("expected i64".into())),
            };
            Ok(Deposit { account, amount })
        }
    }

    impl Command for Deposit {
        type Event = DepositEvent;
        type Output = i64;

        fn lock_names(&self) -> Vec<String> {
            vec![format!("account:{}", self.account)]
        }

        fn execute(self: Box<Self>) -> CommandExecution<Self::Event, Self::Output> {
            let amount = self.amount;
            CommandExecution::new(std::iter::once(DepositEvent { amount }), move || amount)
        }
    }

    struct Panicky;

    impl LayoutValue for Panicky {
        fn descriptor() -> aeon_layout::EntityDescriptor {
            aeon_layout::EntityDescriptor::new("Panicky", vec![])
        }
        fn to_value(&self) -> aeon_layout::Value {
            aeon_layout::Value::Layout(vec![])
        }
        fn from_value(_value: aeon_layout::Value) -> Result<Self, LayoutError> {
            Ok(Panicky)
        }
    }

    impl Command for Panicky {
        type Event = DepositEvent;
        type Output = ();

        fn execute(self: Box<Self>) -> CommandExecution<Self::Event, Self::Output> {
            CommandExecution::new(
                std::iter::from_fn(|| panic!("boom")),
                || (),
            )
        }
    }

    fn new_consumer() -> CommandConsumer {
        let clock = Arc::new(HybridClock::new());
        let journal = Arc::new(MemoryJournal::new());
        let locks = Arc::new(LocalLockProvider::new());
        let layouts = LayoutCache::new();
        let index = Arc::new(IndexEngine::new());
        let subscribers = Arc::new(SubscriberRegistry::new(Duration::from_millis(200)));
        CommandConsumer::start(clock, journal, locks, layouts, index, subscribers, ConsumerConfig::default())
    }

    #[tokio::test]
    async fn publish_succeeds_and_returns_output() {
        let consumer = new_consumer();
        let result = consumer.publish(Deposit { account: "a".into(), amount: 42 }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn host_panic_resolves_to_host_error() {
        let consumer = new_consumer();
        let err = consumer.publish(Panicky).await.unwrap_err();
        assert!(matches!(err, ConsumerError::HostError(_)));
    }

    #[tokio::test]
    async fn many_concurrent_publishes_all_succeed() {
        let consumer = Arc::new(new_consumer());
        let successes = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for i in 0..20 {
            let consumer = consumer.clone();
            let successes = successes.clone();
            handles.push(tokio::spawn(async move {
                let result = consumer.publish(Deposit { account: format!("acc{i}"), amount: i }).await;
                if result.is_ok() {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(successes.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn layout_introduced_before_first_entity_of_its_fingerprint() {
        let clock = Arc::new(HybridClock::new());
        let journal = Arc::new(MemoryJournal::new());
        let locks = Arc::new(LocalLockProvider::new());
        let layouts = LayoutCache::new();
        let index = Arc::new(IndexEngine::new());
        let subscribers = Arc::new(SubscriberRegistry::new(Duration::from_millis(200)));
        let consumer = CommandConsumer::start(
            clock,
            journal.clone(),
            locks,
            layouts,
            index,
            subscribers,
            ConsumerConfig::default(),
        );

        consumer.publish(Deposit { account: "a".into(), amount: 1 }).await.unwrap();

        let entries = journal.iter_events(Default::default()).await.unwrap().collect::<Vec<_>>();
        let scratch_cache = LayoutCache::new();
        let deposit_fp = aeon_layout::canonicalize(&Deposit::descriptor(), &scratch_cache).unwrap().fingerprint;
        let intro_fp =
            aeon_layout::canonicalize(&EntityLayoutIntroduced::descriptor(), &scratch_cache).unwrap().fingerprint;

        let intro_index = entries.iter().position(|e| e.meta.fingerprint == intro_fp);
        let command_index = entries.iter().position(|e| e.meta.fingerprint == deposit_fp);

        assert!(intro_index.is_some());
        assert!(command_index.is_some());
        assert!(intro_index.unwrap() < command_index.unwrap());
    }
}
