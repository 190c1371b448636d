//! Worker pool: parallel HTTP dispatch with retry.
//!
//! Each job runs `concurrency` workers executing the same loop: take the
//! next input, POST it to the backend, classify the outcome, and either emit
//! an output or re-enqueue the input for another attempt.
//!
//! # Retry side channel
//!
//! Retries never go back onto the bounded input queue. Workers are the
//! queue's only consumers, so a worker re-enqueueing into a full queue could
//! deadlock the whole pool. Instead, retries travel on a dedicated unbounded
//! channel that every worker drains *before* taking fresh input, so progress
//! is guaranteed regardless of queue capacity.
//!
//! # Exit conditions
//!
//! A worker exits when any of these holds:
//! - the work-done token fired (every admitted input has a collected output),
//! - the shutdown token fired (job is being deleted),
//! - both channels are closed and drained.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, trace, warn};

use crate::types::{Input, Output, OutputError};

use super::Job;

/// Maximum number of re-enqueues per input after a retryable backend error.
/// One initial attempt plus `MAX_RETRIES` retries.
pub const MAX_RETRIES: u32 = 5;

/// Header carrying the job ID on every backend request.
pub const HEADER_JOB: &str = "PMMAP-job";

/// Header carrying the job's shared secret on every backend request.
pub const HEADER_AUTH: &str = "PMMAP-auth";

/// Classified result of one dispatch attempt.
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    /// 2xx reply; carries the response body.
    Success(Vec<u8>),

    /// The request never produced a response (connect, DNS, read, timeout).
    Transport,

    /// The backend replied with a non-2xx status.
    Backend { status: u16, body: String },

    /// Terminal failure with no retry (construction or body-read failure).
    Fatal(OutputError),
}

/// What to do with a non-2xx backend reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackendDecision {
    /// 5xx with retry budget left: re-enqueue.
    Retry,

    /// 5xx with the budget spent: emit a terminal error output.
    RetriesExhausted,

    /// Non-retryable status: emit a terminal error output immediately.
    Fatal,
}

/// Decides how to handle a backend status for an input that has already
/// been re-enqueued `retry_count` times. Only 5xx replies are retryable.
pub(crate) fn classify_backend(status: u16, retry_count: u32) -> BackendDecision {
    if (500..600).contains(&status) {
        if retry_count < MAX_RETRIES {
            BackendDecision::Retry
        } else {
            BackendDecision::RetriesExhausted
        }
    } else {
        BackendDecision::Fatal
    }
}

/// The backend URL for one key: `<base>/<key>`.
///
/// Plain string composition, not RFC 3986 reference resolution: the key is
/// always appended as a new trailing segment, whatever path the base has.
pub(crate) fn work_url(base: &reqwest::Url, key: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), key)
}

/// One worker of a job's pool.
pub(crate) struct Worker {
    pub job: Arc<Job>,
    pub client: reqwest::Client,
    pub input_rx: Arc<Mutex<mpsc::Receiver<Input>>>,
    pub retry_rx: Arc<Mutex<mpsc::UnboundedReceiver<Input>>>,
    pub retry_tx: mpsc::UnboundedSender<Input>,
    pub out_tx: mpsc::Sender<Output>,
}

impl Worker {
    /// Runs the worker loop until there is no more work or the job is torn
    /// down.
    pub async fn run(self) {
        trace!(job_id = %self.job.id(), "worker started");
        // Once the producer closes the input queue, recv on it returns None
        // immediately; remember that and stop polling it.
        let mut input_open = true;

        loop {
            let Some(input) = self.next_input(&mut input_open).await else {
                break;
            };
            tokio::select! {
                biased;
                _ = self.job.shutdown_token().cancelled() => break,
                () = self.process(input) => {}
            }
        }
        trace!(job_id = %self.job.id(), "worker exiting");
    }

    /// Obtains the next input, preferring retries over fresh work.
    ///
    /// Returns `None` when the worker should exit. The receivers are shared
    /// across the pool behind mutexes; only the worker currently waiting
    /// holds them, and lock order is always retry before input.
    async fn next_input(&self, input_open: &mut bool) -> Option<Input> {
        loop {
            {
                let mut retry_rx = self.retry_rx.lock().await;
                match retry_rx.try_recv() {
                    Ok(input) => return Some(input),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => return None,
                }
            }

            if *input_open {
                let mut retry_rx = self.retry_rx.lock().await;
                let mut input_rx = self.input_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.job.shutdown_token().cancelled() => return None,
                    _ = self.job.work_done_token().cancelled() => return None,
                    retry = retry_rx.recv() => match retry {
                        Some(input) => return Some(input),
                        None => return None,
                    },
                    input = input_rx.recv() => match input {
                        Some(input) => return Some(input),
                        None => *input_open = false,
                    },
                }
            } else {
                let mut retry_rx = self.retry_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.job.shutdown_token().cancelled() => return None,
                    _ = self.job.work_done_token().cancelled() => return None,
                    retry = retry_rx.recv() => match retry {
                        Some(input) => return Some(input),
                        None => return None,
                    },
                }
            }
        }
    }

    /// Dispatches one input and routes the outcome: emit an output, or
    /// re-enqueue for another attempt.
    async fn process(&self, mut input: Input) {
        match self.dispatch(&input).await {
            DispatchOutcome::Success(body) => {
                self.emit(Output::success(input.key.as_str(), body)).await;
            }
            DispatchOutcome::Fatal(error) => {
                warn!(
                    job_id = %self.job.id(),
                    key = %input.key,
                    message = %error.message,
                    "input failed terminally"
                );
                self.emit(Output::failed(input.key.as_str(), error)).await;
            }
            DispatchOutcome::Transport => {
                input.retry_count += 1;
                debug!(
                    job_id = %self.job.id(),
                    key = %input.key,
                    retry_count = input.retry_count,
                    "transport failure, re-enqueueing"
                );
                self.requeue(input);
            }
            DispatchOutcome::Backend { status, body } => {
                match classify_backend(status, input.retry_count) {
                    BackendDecision::Retry => {
                        input.retry_count += 1;
                        debug!(
                            job_id = %self.job.id(),
                            key = %input.key,
                            status,
                            retry_count = input.retry_count,
                            "backend error, re-enqueueing"
                        );
                        self.requeue(input);
                    }
                    BackendDecision::RetriesExhausted => {
                        let attempts = input.retry_count + 1;
                        warn!(
                            job_id = %self.job.id(),
                            key = %input.key,
                            status,
                            attempts,
                            "retries exhausted"
                        );
                        self.emit(Output::failed(
                            input.key.as_str(),
                            OutputError {
                                status_code: status,
                                message: format!(
                                    "backend returned {} after {} attempts",
                                    status, attempts
                                ),
                                body,
                            },
                        ))
                        .await;
                    }
                    BackendDecision::Fatal => {
                        warn!(
                            job_id = %self.job.id(),
                            key = %input.key,
                            status,
                            "backend rejected input"
                        );
                        self.emit(Output::failed(
                            input.key.as_str(),
                            OutputError {
                                status_code: status,
                                message: format!("backend returned {}", status),
                                body,
                            },
                        ))
                        .await;
                    }
                }
            }
        }
    }

    /// Performs one HTTP POST to the backend and classifies the result.
    async fn dispatch(&self, input: &Input) -> DispatchOutcome {
        let url = work_url(self.job.backend_url(), &input.key);

        let result = self
            .client
            .post(url)
            .header(HEADER_JOB, self.job.id().to_string())
            .header(HEADER_AUTH, self.job.secret())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(input.value.clone())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return DispatchOutcome::Fatal(OutputError {
                    status_code: 0,
                    message: "cannot construct request".to_string(),
                    body: String::new(),
                });
            }
            Err(e) => {
                debug!(
                    job_id = %self.job.id(),
                    key = %input.key,
                    error = %e,
                    is_timeout = e.is_timeout(),
                    is_connect = e.is_connect(),
                    "request failed"
                );
                return DispatchOutcome::Transport;
            }
        };

        let status = response.status();
        if status.is_success() {
            match response.bytes().await {
                Ok(bytes) => DispatchOutcome::Success(bytes.to_vec()),
                Err(_) => DispatchOutcome::Fatal(OutputError {
                    status_code: status.as_u16(),
                    message: "cannot read response body".to_string(),
                    body: String::new(),
                }),
            }
        } else {
            // Best-effort body read for diagnostics; an unreadable error
            // body is not itself an error.
            let body = response.text().await.unwrap_or_default();
            DispatchOutcome::Backend {
                status: status.as_u16(),
                body,
            }
        }
    }

    /// Emits the definitive output for a key.
    async fn emit(&self, output: Output) {
        if self.out_tx.send(output).await.is_err() {
            debug!(job_id = %self.job.id(), "output channel closed, dropping output");
        }
    }

    /// Puts an input back in flight via the retry channel. The input was
    /// already counted on admission, so the input counter is not touched.
    fn requeue(&self, input: Input) {
        if self.retry_tx.send(input).is_err() {
            debug!(job_id = %self.job.id(), "retry channel closed, dropping input");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_retry_until_budget_spent() {
        for retry_count in 0..MAX_RETRIES {
            assert_eq!(classify_backend(500, retry_count), BackendDecision::Retry);
            assert_eq!(classify_backend(503, retry_count), BackendDecision::Retry);
        }
        assert_eq!(
            classify_backend(500, MAX_RETRIES),
            BackendDecision::RetriesExhausted
        );
        assert_eq!(
            classify_backend(599, MAX_RETRIES),
            BackendDecision::RetriesExhausted
        );
    }

    #[test]
    fn client_errors_are_fatal_immediately() {
        assert_eq!(classify_backend(400, 0), BackendDecision::Fatal);
        assert_eq!(classify_backend(404, 0), BackendDecision::Fatal);
        assert_eq!(classify_backend(418, 3), BackendDecision::Fatal);
        // Redirects are not success and not retryable either.
        assert_eq!(classify_backend(301, 0), BackendDecision::Fatal);
    }

    #[test]
    fn work_url_appends_key_as_segment() {
        let base = reqwest::Url::parse("http://echo.example/wh").unwrap();
        assert_eq!(work_url(&base, "hello23"), "http://echo.example/wh/hello23");
    }

    #[test]
    fn work_url_tolerates_trailing_slash() {
        let base = reqwest::Url::parse("http://echo.example/wh/").unwrap();
        assert_eq!(work_url(&base, "k"), "http://echo.example/wh/k");

        // A bare host parses with path "/", which must not double the slash.
        let bare = reqwest::Url::parse("http://echo.example").unwrap();
        assert_eq!(work_url(&bare, "k"), "http://echo.example/k");
    }
}
