//! Task dispatch: the gateway-side path of one inference request.
//!
//! `process` is called once per HTTP request, on that request's thread. It
//! picks a worker, enqueues the encoded prompt, then pumps streamed chunks
//! from the response router to the caller's `on_chunk` callback until the
//! final chunk arrives. The timed channel wait doubles as the keep-alive
//! tick: every tick the dispatcher checks the shutdown flag, probes the
//! worker process and enforces an overall response deadline, so a crashed
//! worker turns into an error chunk in bounded time.

use crate::json;
use crate::manager::WorkerManager;
use crate::router::ResponseRouter;
use crossbeam::channel::RecvTimeoutError;
use spindle_common::METRICS;
use spindle_ipc::{CancelOutcome, IpcEndpoint};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval of the keep-alive tick while waiting for chunks.
const KEEPALIVE_TICK: Duration = Duration::from_millis(500);

/// Give up on a task when no chunk has completed it within this window.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Separator between the token budget and the prompt in a request payload.
const PAYLOAD_SEPARATOR: char = '\u{01}';

/// Front end of the dispatch fabric for the HTTP layer.
pub struct Dispatcher {
    ipc: Arc<IpcEndpoint>,
    manager: Arc<WorkerManager>,
    router: Arc<ResponseRouter>,
}

impl Dispatcher {
    pub fn new(
        ipc: Arc<IpcEndpoint>,
        manager: Arc<WorkerManager>,
        router: Arc<ResponseRouter>,
    ) -> Self {
        Self {
            ipc,
            manager,
            router,
        }
    }

    /// Run one request to completion, streaming every response chunk into
    /// `on_chunk` as a JSON object. `on_chunk` returning false means the
    /// client is gone; the dispatcher then stops emitting but keeps
    /// draining so the worker finishes cleanly.
    pub fn process<F>(&self, mut on_chunk: F, message: &str, max_tokens: usize)
    where
        F: FnMut(&[u8]) -> bool,
    {
        METRICS.dispatch.requests_total.inc();

        let Some(worker) = self.manager.assign() else {
            METRICS.dispatch.requests_failed.inc();
            on_chunk(json::error_object("no workers available").as_bytes());
            return;
        };

        self.manager.on_request_start(worker);
        METRICS.dispatch.active_requests.inc();
        let started = Instant::now();

        let payload = format!("{}{}{}", max_tokens, PAYLOAD_SEPARATOR, message);
        let mut registration = None;
        let enqueued = self.ipc.enqueue_with(worker, payload.as_bytes(), |task_id| {
            registration = Some((task_id, self.router.register(worker, task_id)));
        });

        let (task_id, rx) = match (enqueued, registration) {
            (Ok(_), Some((task_id, rx))) => (task_id, rx),
            (result, registration) => {
                if let Some((task_id, _)) = registration {
                    self.router.deregister(worker, task_id);
                }
                let reason = match result {
                    Err(e) => format!("failed to enqueue request: {}", e),
                    Ok(_) => "failed to enqueue request".to_string(),
                };
                warn!(worker, "{}", reason);
                self.finish(worker, started, true);
                on_chunk(json::error_object(&reason).as_bytes());
                return;
            }
        };

        debug!(worker, task_id, max_tokens, "task dispatched");

        let mut client_disconnected = false;
        let mut failed = false;

        loop {
            match rx.recv_timeout(KEEPALIVE_TICK) {
                Ok(chunk) => {
                    if !client_disconnected {
                        let framed = json::chunk_object(&chunk.payload, chunk.is_last);
                        METRICS.dispatch.chunks_streamed_total.inc();
                        if !on_chunk(framed.as_bytes()) {
                            client_disconnected = true;
                            METRICS.dispatch.client_disconnects.inc();
                            debug!(worker, task_id, "client disconnected, draining");
                            if let Ok(CancelOutcome::Canceled) = self.ipc.cancel(worker, task_id)
                            {
                                // The worker will skip the task entirely;
                                // no further chunks will arrive.
                                break;
                            }
                        }
                    }
                    if chunk.is_last {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.ipc.shutdown_requested() {
                        failed = true;
                        if !client_disconnected {
                            on_chunk(json::error_object("server shutting down").as_bytes());
                        }
                        break;
                    }
                    if !self.manager.is_worker_alive(worker) {
                        warn!(worker, task_id, "worker died mid-task");
                        failed = true;
                        if !client_disconnected {
                            on_chunk(json::error_object("worker crashed").as_bytes());
                        }
                        break;
                    }
                    if started.elapsed() > RESPONSE_TIMEOUT {
                        warn!(worker, task_id, "response deadline exceeded");
                        failed = true;
                        if !client_disconnected {
                            on_chunk(json::error_object("response timed out").as_bytes());
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    failed = true;
                    if !client_disconnected {
                        on_chunk(json::error_object("gateway is shutting down").as_bytes());
                    }
                    break;
                }
            }
        }

        self.router.deregister(worker, task_id);
        self.finish(worker, started, failed);
    }

    fn finish(&self, worker: usize, started: Instant, failed: bool) {
        self.manager.on_request_complete(worker);
        METRICS.dispatch.active_requests.dec();
        METRICS
            .dispatch
            .request_duration
            .observe(started.elapsed().as_secs_f64());
        if failed {
            METRICS.dispatch.requests_failed.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_common::{GatewayConfig, IpcNames};
    use std::path::PathBuf;

    #[test]
    fn test_no_workers_yields_single_error_chunk() {
        let names = IpcNames::scoped(&format!("disp_none_{}", std::process::id()));
        let ipc = Arc::new(IpcEndpoint::server(&names).unwrap());
        let config = GatewayConfig {
            worker_executable_path: PathBuf::from("/nonexistent/worker"),
            min_workers: 1,
            max_workers: 1,
            ipc: names,
            ..GatewayConfig::default()
        };
        let manager = Arc::new(WorkerManager::new(Arc::clone(&ipc), &config));
        let router = Arc::new(ResponseRouter::start(Arc::clone(&ipc)));
        let dispatcher = Dispatcher::new(ipc, manager, Arc::clone(&router));

        let mut emitted = Vec::new();
        dispatcher.process(
            |bytes| {
                emitted.push(String::from_utf8(bytes.to_vec()).unwrap());
                true
            },
            "hello",
            3,
        );

        assert_eq!(emitted.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&emitted[0]).unwrap();
        assert_eq!(value["error"], "no workers available");

        router.stop();
    }
}
