//! dubplay: watches on-screen subtitles and plays matching voice dubs.
//!
//! Captured subtitle text is matched against a corpus of pre-rendered lines
//! per character; a match is replayed once, and unmatched lines can be
//! synthesized on demand through the dubbing middleware.

pub mod audio;
pub mod cancellation;
pub mod capture;
pub mod config;
pub mod daemon;
pub mod dub;
pub mod history;
pub mod metrics;
pub mod ocr;
pub mod state_machine;
pub mod synth;

use tracing_subscriber::EnvFilter;

pub use config::{DaemonConfig, LogFormat};
pub use daemon::{Daemon, DaemonStats};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `dubplay=info` filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dubplay=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
