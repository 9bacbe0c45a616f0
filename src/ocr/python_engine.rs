//! Python OCR worker IPC client.
//! Spawns the PaddleOCR worker script and talks to it over stdin/stdout with
//! MessagePack framing (4-byte BE length prefix + msgpack map payload).
//! Replies are read on a dedicated thread so every request has a deadline; a
//! worker that misses it is killed and respawned on the next request.
//! Health check: ping on an interval, 3 consecutive failures kill the worker
//! and mark the engine unavailable until the next successful spawn.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{OcrEngine, OcrError, OcrFragment, OcrRequest};

const MAX_FRAME_BYTES: usize = 50 * 1024 * 1024;

/// Default per-request deadline. Covers model warm-up on the first frame.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Write one length-prefixed frame.
pub(crate) fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), OcrError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| OcrError::ProcessingFailed(format!("message too large: {}", payload.len())))?;
    w.write_all(&len.to_be_bytes())
        .map_err(|e| OcrError::ProcessingFailed(format!("write len: {e}")))?;
    w.write_all(payload)
        .map_err(|e| OcrError::ProcessingFailed(format!("write payload: {e}")))?;
    w.flush()
        .map_err(|e| OcrError::ProcessingFailed(format!("flush: {e}")))?;
    Ok(())
}

/// Read one length-prefixed frame.
pub(crate) fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, OcrError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .map_err(|e| OcrError::ProcessingFailed(format!("read len: {e}")))?;
    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > MAX_FRAME_BYTES {
        return Err(OcrError::ProcessingFailed(format!("message too large: {msg_len}")));
    }
    let mut payload = vec![0u8; msg_len];
    r.read_exact(&mut payload)
        .map_err(|e| OcrError::ProcessingFailed(format!("read payload: {e}")))?;
    Ok(payload)
}

/// Request/reply channel to a worker: frames go out on `writer`, replies
/// arrive from a reader thread that stops at the first read error (EOF
/// included).
struct WorkerLink<W> {
    writer: W,
    replies: cb::Receiver<Result<Vec<u8>, OcrError>>,
}

impl<W: Write> WorkerLink<W> {
    fn new<R: Read + Send + 'static>(writer: W, mut reader: R) -> Result<Self, OcrError> {
        let (tx, replies) = cb::bounded(1);
        std::thread::Builder::new()
            .name("ocr-worker-reader".into())
            .spawn(move || loop {
                let frame = read_frame(&mut reader);
                let failed = frame.is_err();
                if tx.send(frame).is_err() || failed {
                    break;
                }
            })
            .map_err(|e| OcrError::ProcessingFailed(format!("failed to start reader thread: {e}")))?;
        Ok(Self { writer, replies })
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), OcrError> {
        write_frame(&mut self.writer, payload)
    }

    /// Send `payload` and wait up to `timeout` for the next reply frame.
    fn request(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, OcrError> {
        self.send(payload)?;
        match self.replies.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(cb::RecvTimeoutError::Timeout) => Err(OcrError::Timeout(timeout)),
            Err(cb::RecvTimeoutError::Disconnected) => {
                Err(OcrError::ProcessingFailed("worker closed its output".into()))
            }
        }
    }
}

struct WorkerProcess {
    child: Child,
    link: WorkerLink<ChildStdin>,
}

impl WorkerProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(bytes) = rmp_serde::to_vec_named(&WorkerMessage::Shutdown) {
            let _ = self.link.send(&bytes);
        }
        std::thread::sleep(Duration::from_millis(100));
        // killing the child closes its stdout, which ends the reader thread
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// --- IPC message types ---

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerMessage<'a> {
    Ping,
    Ocr {
        request_id: &'a str,
        #[serde(with = "serde_bytes")]
        image_data: &'a [u8],
        roi: RoiMsg,
    },
    Shutdown,
}

mod serde_bytes {
    use serde::Serializer;
    pub fn serialize<S: Serializer>(data: &&[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(data)
    }
}

#[derive(Serialize)]
struct RoiMsg {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

#[derive(Deserialize, Debug)]
struct WorkerResponse {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    fragments: Option<Vec<OcrFragment>>,
    #[serde(default)]
    elapsed_ms: Option<f64>,
    #[serde(default)]
    message: Option<String>,
}

/// PaddleOCR worker process manager.
pub struct PythonOcrEngine {
    worker: Mutex<Option<WorkerProcess>>,
    python_bin: String,
    worker_script: PathBuf,
    lang: String,
    request_timeout: Duration,
    available: AtomicBool,
    consecutive_health_failures: AtomicU32,
    max_health_failures: u32,
}

impl PythonOcrEngine {
    /// `python_bin`: interpreter (e.g. "python3" or a venv path).
    /// `worker_script`: path to `python-worker/worker.py`.
    pub fn new(python_bin: &str, worker_script: PathBuf, lang: &str) -> Self {
        Self {
            worker: Mutex::new(None),
            python_bin: python_bin.to_string(),
            worker_script,
            lang: lang.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            available: AtomicBool::new(false),
            consecutive_health_failures: AtomicU32::new(0),
            max_health_failures: 3,
        }
    }

    /// Deadline for a single worker reply.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn spawn_worker(&self) -> Result<WorkerProcess, OcrError> {
        info!(
            script = %self.worker_script.display(),
            python = %self.python_bin,
            lang = %self.lang,
            "spawning Python OCR worker"
        );

        let mut child = Command::new(&self.python_bin)
            .arg(&self.worker_script)
            .args(["--lang", &self.lang])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| OcrError::ProcessingFailed(format!("failed to spawn Python worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::ProcessingFailed("failed to get worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OcrError::ProcessingFailed("failed to get worker stdout".into()))?;
        let link = match WorkerLink::new(stdin, stdout) {
            Ok(link) => link,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        info!(pid = child.id(), "Python OCR worker spawned");
        self.available.store(true, Ordering::SeqCst);

        Ok(WorkerProcess { child, link })
    }

    /// Send one message and wait for its reply, spawning the worker if needed.
    fn send_recv(&self, msg: &WorkerMessage<'_>) -> Result<WorkerResponse, OcrError> {
        let mut guard = self.worker.lock();
        self.exchange(&mut guard, msg)
    }

    fn exchange(&self, slot: &mut Option<WorkerProcess>, msg: &WorkerMessage<'_>) -> Result<WorkerResponse, OcrError> {
        let needs_spawn = match slot.as_mut() {
            Some(w) => !w.is_alive(),
            None => true,
        };
        if needs_spawn {
            *slot = Some(self.spawn_worker()?);
        }
        let worker = slot.as_mut().ok_or(OcrError::WorkerNotRunning)?;

        let payload = rmp_serde::to_vec_named(msg)
            .map_err(|e| OcrError::ProcessingFailed(format!("serialize: {e}")))?;
        let bytes = match worker.link.request(&payload, self.request_timeout) {
            Ok(bytes) => bytes,
            Err(e) => {
                // a late or broken reply leaves the stream out of sync; start over next time
                if matches!(e, OcrError::Timeout(_)) {
                    warn!(timeout_ms = self.request_timeout.as_millis() as u64, "OCR worker hung, killing it");
                }
                *slot = None;
                return Err(e);
            }
        };
        rmp_serde::from_slice(&bytes).map_err(|e| OcrError::ProcessingFailed(format!("deserialize: {e}")))
    }

    /// Ping the worker. Returns true on pong, or when a request is in flight
    /// (that request carries its own deadline).
    pub fn health_check(&self) -> bool {
        let result = {
            let Some(mut guard) = self.worker.try_lock() else {
                debug!("health check skipped: request in flight");
                return true;
            };
            self.exchange(&mut guard, &WorkerMessage::Ping)
        };
        match result {
            Ok(resp) if resp.msg_type == "pong" => {
                self.consecutive_health_failures.store(0, Ordering::SeqCst);
                debug!("health check: pong received");
                true
            }
            Ok(resp) => {
                warn!(msg_type = %resp.msg_type, "unexpected health check response");
                self.record_health_failure();
                false
            }
            Err(e) => {
                warn!(error = %e, "health check failed");
                self.record_health_failure();
                false
            }
        }
    }

    fn record_health_failure(&self) {
        let failures = self.consecutive_health_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.max_health_failures {
            warn!(failures, "max health failures reached, marking unavailable and killing worker");
            self.available.store(false, Ordering::SeqCst);
            *self.worker.lock() = None;
        }
    }

    /// Ping the worker every `interval` until `shutdown` fires.
    pub fn spawn_health_loop(
        engine: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let idle = engine.worker.try_lock().is_some_and(|w| w.is_none());
                if !engine.available.load(Ordering::SeqCst) && idle {
                    continue;
                }
                let probe = Arc::clone(&engine);
                if let Err(e) = tokio::task::spawn_blocking(move || probe.health_check()).await {
                    warn!(error = %e, "health check task failed");
                }
            }
            debug!("OCR health loop stopped");
        })
    }
}

impl OcrEngine for PythonOcrEngine {
    fn recognize(&self, request: OcrRequest) -> Result<Vec<OcrFragment>, OcrError> {
        let msg = WorkerMessage::Ocr {
            request_id: &request.request_id,
            image_data: &request.image,
            roi: RoiMsg {
                x: request.roi.x,
                y: request.roi.y,
                w: request.roi.width,
                h: request.roi.height,
            },
        };

        let start = Instant::now();
        let response = self.send_recv(&msg)?;

        match response.msg_type.as_str() {
            "ocr_result" => {
                let fragments = response.fragments.unwrap_or_default();
                debug!(
                    request_id = %request.request_id,
                    fragments = fragments.len(),
                    elapsed_ms = response
                        .elapsed_ms
                        .unwrap_or_else(|| start.elapsed().as_secs_f64() * 1000.0),
                    "ocr done"
                );
                Ok(fragments)
            }
            "error" => Err(OcrError::ProcessingFailed(
                response.message.unwrap_or_else(|| "unknown error".into()),
            )),
            other => Err(OcrError::ProcessingFailed(format!("unexpected response type: {other}"))),
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.worker.lock().take().is_some() {
            info!("Python OCR worker stopped");
        }
        self.available.store(false, Ordering::SeqCst);
    }
}
