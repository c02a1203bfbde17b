//! The worker serve loop.
//!
//! Single thread per process: dequeue a request, run the model, stream
//! chunks into the response mailbox, signal completion. The shutdown flag
//! in the shared region and the process-local termination flag are checked
//! at every blocking point.

use crate::model::LanguageModel;
use spindle_common::{Result, SpindleError};
use spindle_ipc::{IpcEndpoint, TaskRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on tokens per request. An arbitrary per-request guard, not
/// a model limitation.
pub const MAX_TOKENS_HARD_CAP: usize = 50;

/// Separator between the token budget and the prompt in a request payload.
pub const PAYLOAD_SEPARATOR: u8 = 0x01;

/// Set by the SIGTERM handler; the loop never blocks across it unchecked.
pub static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Runs the serve loop for one worker slot.
pub struct WorkerRuntime<M> {
    ipc: Arc<IpcEndpoint>,
    index: usize,
    model: M,
    processed: u64,
}

impl<M: LanguageModel> WorkerRuntime<M> {
    pub fn new(ipc: Arc<IpcEndpoint>, index: usize, model: M) -> Self {
        Self {
            ipc,
            index,
            model,
            processed: 0,
        }
    }

    fn should_stop(&self) -> bool {
        TERM_REQUESTED.load(Ordering::SeqCst) || self.ipc.shutdown_requested()
    }

    /// Serve until shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        info!(index = self.index, "worker serving");

        while !self.should_stop() {
            match self.serve_next() {
                Ok(true) => self.processed += 1,
                Ok(false) => {}
                Err(SpindleError::Shutdown) => break,
                Err(e) => return Err(e),
            }
        }

        info!(index = self.index, processed = self.processed, "worker exiting");
        Ok(())
    }

    /// Dequeue and handle one request. Returns `Ok(true)` when a task was
    /// handled, `Ok(false)` on a transient wakeup.
    fn serve_next(&mut self) -> Result<bool> {
        let request = match self.ipc.dequeue(self.index) {
            Ok(request) => request,
            Err(e) if e.is_transient() => return Ok(false),
            Err(e) => return Err(e),
        };

        let outcome = self.handle(&request);

        // Exactly one completion signal per successful dequeue, whatever
        // the outcome.
        self.ipc.signal_request_handled(self.index)?;

        match outcome {
            Ok(()) => Ok(true),
            Err(SpindleError::Shutdown) => Err(SpindleError::Shutdown),
            Err(e) => {
                warn!(
                    index = self.index,
                    task_id = request.task_id,
                    "task failed: {}",
                    e
                );
                Ok(true)
            }
        }
    }

    fn handle(&mut self, request: &TaskRequest) -> Result<()> {
        if request.canceled {
            debug!(
                index = self.index,
                task_id = request.task_id,
                "skipping canceled task"
            );
            return Ok(());
        }

        let (max_tokens, prompt) = parse_payload(&request.payload)?;
        let max_tokens = max_tokens.min(MAX_TOKENS_HARD_CAP);

        self.model.init(prompt);
        let mut prev = None;
        let mut sent_last = false;

        for step in 0..max_tokens {
            let token = self.model.next_token(prev);
            if token == self.model.eos_token() {
                break;
            }

            let is_last = step == max_tokens - 1;
            let piece = self.model.decode(token);
            self.ipc
                .send_chunk(self.index, request.task_id, piece.as_bytes(), is_last)?;
            sent_last = is_last;

            if self.should_stop() {
                return Err(SpindleError::Shutdown);
            }
            prev = Some(token);
        }

        // EOS and max_tokens == 0 both end the stream without a marked
        // final chunk; the dispatcher still needs one.
        if !sent_last {
            self.ipc
                .send_chunk(self.index, request.task_id, b"", true)?;
        }

        Ok(())
    }
}

/// Split a `"<max_tokens>\x01<prompt>"` payload.
pub fn parse_payload(payload: &[u8]) -> Result<(usize, &str)> {
    let separator = payload
        .iter()
        .position(|b| *b == PAYLOAD_SEPARATOR)
        .ok_or_else(|| SpindleError::parse("request payload has no separator"))?;

    let budget = std::str::from_utf8(&payload[..separator])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| SpindleError::parse("invalid max_tokens prefix"))?;

    let prompt = std::str::from_utf8(&payload[separator + 1..])
        .map_err(|_| SpindleError::parse("prompt is not valid UTF-8"))?;

    Ok((budget, prompt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_common::IpcNames;
    use spindle_ipc::ResponseChunk;
    use std::time::Duration;

    /// Plays back a fixed token list, then EOS forever.
    struct ScriptedModel {
        tokens: Vec<u32>,
        pos: usize,
    }

    impl ScriptedModel {
        fn new(tokens: Vec<u32>) -> Self {
            Self { tokens, pos: 0 }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn init(&mut self, _prompt: &str) {
            self.pos = 0;
        }

        fn next_token(&mut self, _prev: Option<u32>) -> u32 {
            let token = self.tokens.get(self.pos).copied().unwrap_or(u32::MAX);
            self.pos += 1;
            token
        }

        fn decode(&self, token: u32) -> String {
            format!("t{} ", token)
        }

        fn eos_token(&self) -> u32 {
            u32::MAX
        }
    }

    /// Never emits EOS; used to exercise the hard cap.
    struct EndlessModel;

    impl LanguageModel for EndlessModel {
        fn init(&mut self, _prompt: &str) {}

        fn next_token(&mut self, _prev: Option<u32>) -> u32 {
            1
        }

        fn decode(&self, _token: u32) -> String {
            "x".to_string()
        }

        fn eos_token(&self) -> u32 {
            0
        }
    }

    fn test_endpoint(tag: &str) -> Arc<IpcEndpoint> {
        let names = IpcNames::scoped(&format!("wrk_{}_{}", tag, std::process::id()));
        Arc::new(IpcEndpoint::server(&names).unwrap())
    }

    /// Enqueue one payload, serve it on a side thread, collect the chunks.
    fn serve_and_collect<M>(
        endpoint: &Arc<IpcEndpoint>,
        model: M,
        payload: &[u8],
    ) -> Vec<ResponseChunk>
    where
        M: LanguageModel + Send + 'static,
    {
        endpoint.enqueue(0, payload).unwrap();

        let server = {
            let ipc = Arc::clone(endpoint);
            std::thread::spawn(move || {
                let mut runtime = WorkerRuntime::new(ipc, 0, model);
                runtime.serve_next().unwrap()
            })
        };

        let mut chunks = Vec::new();
        loop {
            let chunk = endpoint
                .recv_chunk(0, Duration::from_secs(2))
                .unwrap()
                .expect("worker stalled");
            let last = chunk.is_last;
            chunks.push(chunk);
            if last {
                break;
            }
        }

        assert!(server.join().unwrap());
        chunks
    }

    #[test]
    fn test_streams_requested_token_count() {
        let endpoint = test_endpoint("count");
        let chunks = serve_and_collect(
            &endpoint,
            ScriptedModel::new(vec![1, 2, 3, 4, 5]),
            b"3\x01hello",
        );

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].payload, b"t1 ");
        assert_eq!(chunks[2].payload, b"t3 ");
        assert!(chunks[2].is_last);
        assert!(chunks.iter().take(2).all(|c| !c.is_last));
    }

    #[test]
    fn test_eos_ends_stream_with_empty_final_chunk() {
        let endpoint = test_endpoint("eos");
        let chunks = serve_and_collect(&endpoint, ScriptedModel::new(vec![1, 2]), b"10\x01hi");

        assert_eq!(chunks.len(), 3);
        assert!(!chunks[0].is_last);
        assert!(!chunks[1].is_last);
        assert!(chunks[2].is_last);
        assert!(chunks[2].payload.is_empty());
    }

    #[test]
    fn test_zero_max_tokens_yields_single_final_chunk() {
        let endpoint = test_endpoint("zero");
        let chunks = serve_and_collect(&endpoint, ScriptedModel::new(vec![1]), b"0\x01hi");

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert!(chunks[0].payload.is_empty());
    }

    #[test]
    fn test_hard_cap_limits_generation() {
        let endpoint = test_endpoint("cap");
        let chunks = serve_and_collect(&endpoint, EndlessModel, b"51\x01go");

        assert_eq!(chunks.len(), MAX_TOKENS_HARD_CAP);
        assert!(chunks.last().unwrap().is_last);
    }

    #[test]
    fn test_canceled_task_is_skipped_but_completed() {
        let endpoint = test_endpoint("cancel");
        let task_id = endpoint.enqueue(0, b"5\x01doomed").unwrap();
        endpoint.cancel(0, task_id).unwrap();

        let mut runtime = WorkerRuntime::new(Arc::clone(&endpoint), 0, EndlessModel);
        assert!(runtime.serve_next().unwrap());

        // No chunks were produced, and the ring slot was released.
        assert!(endpoint.recv_chunk(0, Duration::from_millis(50)).unwrap().is_none());
        endpoint.enqueue(0, b"0\x01next").unwrap();
        assert!(runtime.serve_next().unwrap());
    }

    #[test]
    fn test_parse_payload() {
        let (budget, prompt) = parse_payload(b"42\x01tell me a story").unwrap();
        assert_eq!(budget, 42);
        assert_eq!(prompt, "tell me a story");

        let (budget, prompt) = parse_payload(b"0\x01").unwrap();
        assert_eq!(budget, 0);
        assert_eq!(prompt, "");

        assert!(parse_payload(b"no separator").is_err());
        assert!(parse_payload(b"abc\x01prompt").is_err());
    }

    #[test]
    fn test_malformed_payload_still_signals_completion() {
        let endpoint = test_endpoint("malformed");
        endpoint.enqueue(0, b"garbage").unwrap();

        let mut runtime = WorkerRuntime::new(Arc::clone(&endpoint), 0, EndlessModel);
        assert!(runtime.serve_next().unwrap());

        // The slot was released even though parsing failed.
        endpoint.enqueue(0, b"0\x01ok").unwrap();
        assert!(runtime.serve_next().unwrap());
    }
}
