//! Detect-and-play loop.
//! Each tick: capture a frame → OCR the subtitle band → run the matching
//! engine once → sleep. Ticks never overlap. Per-tick failures are logged and
//! count as no match; only the shutdown signal ends the loop, and it is
//! checked between ticks so an in-flight playback always finishes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancellation::Shutdown;
use crate::capture::FrameSource;
use crate::dub::{DubEngine, Outcome};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::ocr::{join_fragments, OcrEngine, OcrError, OcrRequest};
use crate::state_machine::{DaemonState, StateMachine};

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub ticks: u64,
    pub replayed: u64,
    pub synthesized: u64,
    pub capture_failures: u64,
    pub extraction_failures: u64,
}

pub struct Daemon {
    frames: Arc<dyn FrameSource>,
    ocr: Arc<dyn OcrEngine>,
    engine: DubEngine,
    state: Arc<StateMachine>,
    metrics: Arc<MetricsRegistry>,
    interval: Duration,
    stats: DaemonStats,
}

impl Daemon {
    pub fn new(
        frames: Arc<dyn FrameSource>,
        ocr: Arc<dyn OcrEngine>,
        engine: DubEngine,
        metrics: Arc<MetricsRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            frames,
            ocr,
            engine,
            state: Arc::new(StateMachine::new()),
            metrics,
            interval,
            stats: DaemonStats::default(),
        }
    }

    pub fn state(&self) -> Arc<StateMachine> {
        Arc::clone(&self.state)
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// Poll until `shutdown` fires, then stop the OCR engine and report.
    pub async fn run(mut self, shutdown: Shutdown) -> DaemonStats {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            realtime = self.engine.realtime_enabled(),
            "detect-and-play loop started"
        );

        while !shutdown.is_triggered() {
            self.tick().await;
            if !shutdown.sleep(self.interval).await {
                break;
            }
        }

        let _ = self.state.transition(DaemonState::Stopped);
        let ocr = Arc::clone(&self.ocr);
        if let Err(e) = tokio::task::spawn_blocking(move || ocr.shutdown()).await {
            warn!(error = %e, "OCR shutdown task failed");
        }

        info!(
            ticks = self.stats.ticks,
            replayed = self.stats.replayed,
            synthesized = self.stats.synthesized,
            played_lines = self.engine.played().len(),
            "detect-and-play loop stopped"
        );
        self.metrics.log_summary();
        self.stats
    }

    /// Run one capture → extract → match cycle.
    pub async fn tick(&mut self) -> Outcome {
        let span = self.metrics.span(metric_names::TICK);
        let outcome = self.tick_inner().await;
        span.finish();
        self.state.reset_to_idle();

        self.stats.ticks += 1;
        match &outcome {
            Outcome::Replayed(_) => self.stats.replayed += 1,
            Outcome::Synthesized(_) => self.stats.synthesized += 1,
            Outcome::NoMatch => {}
        }
        outcome
    }

    async fn tick_inner(&mut self) -> Outcome {
        self.enter(DaemonState::Capturing);
        let span = self.metrics.span(metric_names::CAPTURE_DONE);
        let frames = Arc::clone(&self.frames);
        let frame = match tokio::task::spawn_blocking(move || frames.capture()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                warn!(error = %e, "CaptureFailed");
                return self.skip_tick(|s| s.capture_failures += 1);
            }
            Err(e) => {
                warn!(error = %e, "CaptureFailed: capture task aborted");
                return self.skip_tick(|s| s.capture_failures += 1);
            }
        };
        span.finish();

        self.enter(DaemonState::Extracting);
        let span = self.metrics.span(metric_names::OCR_DONE);
        let ocr = Arc::clone(&self.ocr);
        let request = OcrRequest::from_frame(frame);
        let result = tokio::task::spawn_blocking(move || ocr.recognize(request))
            .await
            .unwrap_or_else(|e| Err(OcrError::Aborted(e.to_string())));
        let fragments = match result {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!(error = %e, "ExtractionFailed");
                return self.skip_tick(|s| s.extraction_failures += 1);
            }
        };
        span.finish();

        let text = join_fragments(&fragments);
        if text.is_empty() {
            debug!("no text recognized");
            return self.skip_tick(|_| {});
        }
        debug!(text = %text, "subtitle text");

        self.enter(DaemonState::Matching);
        self.engine.match_once(&text).await
    }

    fn skip_tick(&mut self, count: impl FnOnce(&mut DaemonStats)) -> Outcome {
        count(&mut self.stats);
        self.engine.no_subtitle();
        Outcome::NoMatch
    }

    fn enter(&self, next: DaemonState) {
        // rejected transitions are logged by the state machine
        let _ = self.state.transition(next);
    }
}
