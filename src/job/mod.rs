//! Per-job execution engine.
//!
//! A [`Job`] fans a set of key/value inputs out as HTTP POSTs to a backend
//! URL, with bounded admission, a fixed-size worker pool, and durable
//! per-key result storage.
//!
//! # Pipeline
//!
//! ```text
//! producer -> input queue -> workers -> backend
//!                               |
//!                               v
//!                        output channel -> collector -> result store
//! ```
//!
//! Control flow: the producer closes the input queue via
//! [`Job::close_inputs`]; workers exit when there is no work left; the
//! completion waiter observes all workers gone, advances the state, and
//! closes the output channel; the collector drains it and publishes the
//! completion signal.
//!
//! # Single-closer discipline
//!
//! Every channel has exactly one closing authority:
//! - input queue: the producer, inside `close_inputs`;
//! - retry channel: the work-done token (fired by whoever first observes
//!   `outputs == inputs` after the input set closed);
//! - output channel: the completion waiter, by dropping its guard sender;
//! - completion signal: the collector, exactly once after draining.

pub mod collector;
pub mod state;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::store::{self, ResultStore, StoreError};
use crate::types::{Input, JobId, Output, OutputError};

use collector::Collector;
use state::{JobState, StateCell, StateError};
use worker::Worker;

pub use worker::{HEADER_AUTH, HEADER_JOB, MAX_RETRIES};

/// Default per-request timeout for backend calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the output channel between workers and the collector.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Result-store keyspace for successful outputs.
pub(crate) const OK_PREFIX: &str = "ok:";

/// Result-store keyspace for terminally failed outputs.
pub(crate) const ERR_PREFIX: &str = "err:";

/// Errors surfaced by the job contract.
#[derive(Debug, Error)]
pub enum JobError {
    /// Operation issued against a job in the wrong state.
    #[error(transparent)]
    State(#[from] StateError),

    /// Results were requested before the job completed.
    #[error("job {id} is not complete; results are not ready")]
    NotReady { id: JobId },

    /// `start` was called a second time.
    #[error("job {id} is already started")]
    AlreadyStarted { id: JobId },

    /// The HTTP client could not be constructed.
    #[error("cannot build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// Result store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Construction parameters for a job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Shared secret sent to the backend in the `PMMAP-auth` header.
    pub secret: String,

    /// Base URL work is POSTed to; the input key becomes the last segment.
    pub backend_url: Url,

    /// Capacity of the bounded input queue. Producers block when full.
    pub queue_capacity: usize,

    /// Root directory for result stores. The job uses
    /// `<db_path>/job/<job_id>/`.
    pub db_path: PathBuf,

    /// Per-request timeout for backend calls.
    pub request_timeout: Duration,
}

impl JobConfig {
    /// Creates a config with the default db path and request timeout.
    pub fn new(secret: impl Into<String>, backend_url: Url, queue_capacity: usize) -> Self {
        JobConfig {
            secret: secret.into(),
            backend_url,
            queue_capacity,
            db_path: PathBuf::from("./db"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the root directory for result stores.
    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    /// Sets the per-request timeout for backend calls.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Identity snapshot of a job, the shape the REST surface serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub id: JobId,
    pub inputs: u64,
    pub outputs: u64,
    pub url: String,
}

/// Channel ends consumed by [`Job::start`].
struct LaunchState {
    input_rx: mpsc::Receiver<Input>,
    out_tx: mpsc::Sender<Output>,
    out_rx: mpsc::Receiver<Output>,
    completion_tx: watch::Sender<bool>,
}

/// A single parallel map-over-HTTP execution.
pub struct Job {
    id: JobId,
    secret: String,
    backend_url: Url,
    db_path: PathBuf,
    request_timeout: Duration,

    state: StateCell,
    inputs_received: AtomicU64,
    outputs_received: AtomicU64,

    /// Producer end of the input queue. `close_inputs` takes it; that drop
    /// is the queue's only close.
    input_tx: Mutex<Option<mpsc::Sender<Input>>>,

    /// Channel ends handed to the tasks at start; `None` afterwards.
    launch: Mutex<Option<LaunchState>>,

    /// The result store, present from collector start until teardown.
    store: RwLock<Option<ResultStore>>,

    completion_rx: watch::Receiver<bool>,

    /// Fired when every admitted input has a collected output.
    work_done: CancellationToken,

    /// Fired on deletion; all tasks observe it.
    shutdown: CancellationToken,

    /// Waiter and collector handles, awaited during teardown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Job {
    /// Creates a job in the `Created` state. No tasks are spawned until
    /// [`Job::start`].
    pub fn create(config: JobConfig) -> Arc<Job> {
        let (input_tx, input_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = watch::channel(false);

        Arc::new(Job {
            id: JobId::new(),
            secret: config.secret,
            backend_url: config.backend_url,
            db_path: config.db_path,
            request_timeout: config.request_timeout,
            state: StateCell::new(),
            inputs_received: AtomicU64::new(0),
            outputs_received: AtomicU64::new(0),
            input_tx: Mutex::new(Some(input_tx)),
            launch: Mutex::new(Some(LaunchState {
                input_rx,
                out_tx,
                out_rx,
                completion_tx,
            })),
            store: RwLock::new(None),
            completion_rx,
            work_done: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the completion waiter, the collector, and `concurrency`
    /// workers. Calling twice is a programming error and fails.
    pub async fn start(self: &Arc<Self>, concurrency: usize) -> Result<(), JobError> {
        let Some(launch) = self.launch.lock().await.take() else {
            return Err(JobError::AlreadyStarted { id: self.id });
        };

        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()?;

        let input_rx = Arc::new(Mutex::new(launch.input_rx));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let retry_rx = Arc::new(Mutex::new(retry_rx));

        let concurrency = concurrency.max(1);
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let worker = Worker {
                job: Arc::clone(self),
                client: client.clone(),
                input_rx: Arc::clone(&input_rx),
                retry_rx: Arc::clone(&retry_rx),
                retry_tx: retry_tx.clone(),
                out_tx: launch.out_tx.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        // The workers own the retry channel now.
        drop(retry_tx);

        let collector = Collector {
            job: Arc::clone(self),
            out_rx: launch.out_rx,
            completion_tx: launch.completion_tx,
        };
        let collector_handle = tokio::spawn(collector.run());

        // Completion waiter: the only party allowed to close the output
        // channel. It holds a guard sender, so the channel stays open until
        // the state has advanced, regardless of worker exit order.
        let waiter_job = Arc::clone(self);
        let out_tx_guard = launch.out_tx;
        let waiter_handle = tokio::spawn(async move {
            for handle in workers {
                if let Err(e) = handle.await {
                    error!(job_id = %waiter_job.id, error = %e, "worker task failed");
                }
            }
            if !waiter_job.shutdown.is_cancelled() {
                waiter_job.state.mark_all_output();
            }
            drop(out_tx_guard);
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(waiter_handle);
        tasks.push(collector_handle);

        info!(job_id = %self.id, concurrency, url = %self.backend_url, "job started");
        Ok(())
    }

    /// Adds one input.
    pub async fn add_input(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), JobError> {
        self.add_inputs(vec![Input::new(key, value)]).await
    }

    /// Adds a batch of inputs in order.
    ///
    /// The input counter is incremented by the batch size before anything is
    /// enqueued, so `inputs_count` is always an upper bound on in-flight
    /// work. Blocks while the bounded queue is full.
    pub async fn add_inputs(&self, inputs: Vec<Input>) -> Result<(), JobError> {
        let guard = self.input_tx.lock().await;
        let Some(input_tx) = guard.as_ref() else {
            return Err(StateError {
                operation: "accept inputs",
                state: self.state.get(),
            }
            .into());
        };
        self.state.admit_input()?;

        self.inputs_received
            .fetch_add(inputs.len() as u64, Ordering::SeqCst);
        for input in inputs {
            if input_tx.send(input).await.is_err() {
                // Workers are gone; the job was torn down under us.
                return Err(StateError {
                    operation: "accept inputs",
                    state: self.state.get(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Declares the input set closed. This is the only close of the input
    /// queue and is the workers' exit signal once the queue drains.
    ///
    /// Calling from any state but `ReceivingInputs` moves the job to
    /// `Error`, still closes the queue, and fails.
    pub async fn close_inputs(&self) -> Result<(), JobError> {
        let mut guard = self.input_tx.lock().await;
        match self.state.close_inputs() {
            Ok(()) => {
                guard.take();
                drop(guard);
                // All outputs may already be in by the time the set closes.
                self.check_work_complete();
                Ok(())
            }
            Err(e) => {
                guard.take();
                // The queue is closed even on the error path; with nothing
                // in flight the workers can be released right away.
                self.check_work_complete();
                Err(e.into())
            }
        }
    }

    /// A one-shot readable completion signal. The value flips to `true`
    /// when all outputs are durable; the channel closes without flipping if
    /// the job fails at the storage level or is torn down.
    pub fn completion_signal(&self) -> watch::Receiver<bool> {
        self.completion_rx.clone()
    }

    /// Waits until the job completes, errors, or is torn down.
    pub async fn wait_complete(&self) {
        let mut rx = self.completion_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing: error or teardown.
                return;
            }
        }
    }

    /// The result for one key, or `None` if the key is unknown or its
    /// backend call failed terminally. Requires `AllOutputReceived`.
    pub async fn get_result(&self, key: &str) -> Result<Option<Vec<u8>>, JobError> {
        self.require_complete("read result")?;
        let slot = self.store.read().await;
        let Some(store) = slot.as_ref() else {
            return Ok(None);
        };
        Ok(store.get(&format!("{}{}", OK_PREFIX, key)))
    }

    /// All successful results, ordered by key. Requires
    /// `AllOutputReceived`.
    pub async fn get_results(&self) -> Result<Vec<(String, Vec<u8>)>, JobError> {
        self.require_complete("read results")?;
        let slot = self.store.read().await;
        let Some(store) = slot.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(store
            .scan_prefix(OK_PREFIX)
            .into_iter()
            .map(|(key, value)| (key[OK_PREFIX.len()..].to_string(), value))
            .collect())
    }

    /// All terminally failed keys with their error details, ordered by key.
    /// Requires `AllOutputReceived`.
    pub async fn get_errors(&self) -> Result<Vec<(String, OutputError)>, JobError> {
        self.require_complete("read errors")?;
        let slot = self.store.read().await;
        let Some(store) = slot.as_ref() else {
            return Ok(Vec::new());
        };
        let mut errors = Vec::new();
        for (key, value) in store.scan_prefix(ERR_PREFIX) {
            let error: OutputError =
                serde_json::from_slice(&value).map_err(StoreError::from)?;
            errors.push((key[ERR_PREFIX.len()..].to_string(), error));
        }
        Ok(errors)
    }

    fn require_complete(&self, operation: &'static str) -> Result<(), JobError> {
        match self.state.get() {
            JobState::AllOutputReceived => Ok(()),
            JobState::Error => Err(StateError {
                operation,
                state: JobState::Error,
            }
            .into()),
            _ => Err(JobError::NotReady { id: self.id }),
        }
    }

    /// Number of inputs admitted so far.
    pub fn inputs_count(&self) -> u64 {
        self.inputs_received.load(Ordering::SeqCst)
    }

    /// Number of outputs collected so far.
    pub fn outputs_count(&self) -> u64 {
        self.outputs_received.load(Ordering::SeqCst)
    }

    /// `outputs / inputs`, or 0 when no inputs were received.
    pub fn completion_rate(&self) -> f64 {
        let inputs = self.inputs_count();
        if inputs == 0 {
            return 0.0;
        }
        self.outputs_count() as f64 / inputs as f64
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.state.get()
    }

    /// The job's identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Identity snapshot for the external JSON surface.
    pub fn describe(&self) -> JobDescription {
        JobDescription {
            id: self.id,
            inputs: self.inputs_count(),
            outputs: self.outputs_count(),
            url: self.backend_url.to_string(),
        }
    }

    /// Stops all tasks and waits for them: cancels workers (aborting any
    /// in-flight request), lets the collector drain, and releases the
    /// result store. Safe to call on a never-started or completed job.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        // Release the queue in case a producer never closed it.
        self.input_tx.lock().await.take();

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(job_id = %self.id, error = %e, "job task failed during shutdown");
            }
        }

        self.store.write().await.take();
    }

    /// Tears the job down and removes its result-store directory.
    pub async fn delete(&self) -> Result<(), JobError> {
        self.shutdown().await;
        store::remove_store_dir(&self.db_path, self.id).await?;
        info!(job_id = %self.id, "job deleted");
        Ok(())
    }

    // ─── Internal accessors for the worker/collector tasks ───

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }

    pub(crate) fn backend_url(&self) -> &Url {
        &self.backend_url
    }

    pub(crate) fn store_path(&self) -> PathBuf {
        store::store_dir(&self.db_path, self.id)
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub(crate) fn store_slot(&self) -> &RwLock<Option<ResultStore>> {
        &self.store
    }

    pub(crate) fn work_done_token(&self) -> &CancellationToken {
        &self.work_done
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Counts one collected output.
    pub(crate) fn record_output(&self) {
        self.outputs_received.fetch_add(1, Ordering::SeqCst);
    }

    /// Fires the work-done token once every admitted input has a collected
    /// output and no more can be admitted. Called by the collector after
    /// each output and by `close_inputs`, which together cover every
    /// interleaving of the two conditions becoming true.
    ///
    /// `Error` counts as "no more inputs": the state guard rejects
    /// admission on every path into that state, and in-flight inputs keep
    /// the counters unequal until their outputs land, so workers wind down
    /// instead of waiting for retries that can no longer come.
    pub(crate) fn check_work_complete(&self) {
        let inputs_closed = matches!(
            self.state.get(),
            JobState::AllInputReceived | JobState::AllOutputReceived | JobState::Error
        );
        if inputs_closed && self.outputs_count() == self.inputs_count() {
            self.work_done.cancel();
        }
    }
}
