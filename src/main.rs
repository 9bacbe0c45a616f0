use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use dubplay::audio::{self, AudioSource, Player};
use dubplay::cancellation::Shutdown;
use dubplay::capture::ScreenCapture;
use dubplay::dub::{rank_candidates, DubCorpus, DubEngine, PlayedSet};
use dubplay::history::HistoryStore;
use dubplay::metrics::MetricsRegistry;
use dubplay::ocr::PythonOcrEngine;
use dubplay::synth::MiddlewareClient;
use dubplay::{Daemon, DaemonConfig};

/// dubplay - play voice dubs for on-screen subtitles
#[derive(Parser)]
#[command(name = "dubplay", version, about)]
struct Cli {
    /// Config file (JSON); missing file means defaults
    #[arg(short, long, env = "DUBPLAY_CONFIG", default_value = "dubplay.json")]
    config: PathBuf,

    /// Dub corpus manifest
    #[arg(long, env = "DUBPLAY_CORPUS")]
    corpus: Option<PathBuf>,

    /// Synthesize unmatched lines through the middleware
    #[arg(long)]
    realtime: bool,

    /// Middleware base URL
    #[arg(long, env = "DUBPLAY_MIDDLEWARE_URL")]
    middleware_url: Option<String>,

    /// Delay between polling ticks
    #[arg(long)]
    interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the detect-and-play loop (default)
    Run,
    /// Score subtitle text against the corpus without playing anything
    Match {
        /// Raw subtitle text, e.g. "Amber: I will protect this city UID1"
        #[arg(long)]
        text: String,
        /// Number of candidates to show
        #[arg(long, default_value = "5")]
        top: usize,
    },
    /// Play an audio file through the playback controller
    Play {
        file: PathBuf,
    },
    /// Show recent dubs from the history database
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Delete records older than this many days first
        #[arg(long)]
        prune_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dubplay: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    dubplay::init_tracing(config.log_format);

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::Match { text, top } => show_matches(&config, &text, top),
        Command::Play { file } => play_file(file).await,
        Command::History { limit, prune_days } => show_history(&config, limit, prune_days),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<DaemonConfig> {
    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(corpus) = &cli.corpus {
        config.corpus_path = corpus.clone();
    }
    if cli.realtime {
        config.realtime.enabled = true;
    }
    if let Some(url) = &cli.middleware_url {
        config.realtime.middleware_url = url.clone();
    }
    if let Some(ms) = cli.interval_ms {
        config.poll_interval_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

fn load_corpus(config: &DaemonConfig) -> anyhow::Result<DubCorpus> {
    DubCorpus::load_from_file(&config.corpus_path, &config.corpus_options())
        .with_context(|| format!("loading dub corpus {}", config.corpus_path.display()))
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    info!("dubplay starting");

    let corpus = Arc::new(load_corpus(&config)?);
    if corpus.is_empty() {
        warn!("dub corpus is empty, only realtime dubbing can play anything");
    }

    let screen = Arc::new(ScreenCapture::new(config.capture.backend, config.capture.region()));
    if !screen.is_available() {
        bail!("no screen capture tool found (install grim, maim, or scrot)");
    }

    let player: Arc<dyn Player> = Arc::new(audio::default_player().context("opening audio output")?);
    let metrics = Arc::new(MetricsRegistry::new());

    let history = match &config.history_db {
        Some(path) => Some(HistoryStore::open(path).context("opening history database")?),
        None => None,
    };

    let mut played = PlayedSet::with_capacity(config.played_capacity);
    if config.resume_from_history {
        if let Some(history) = &history {
            for key in history.played_keys()? {
                played.insert(&key);
            }
            info!(lines = played.len(), "played lines restored from history");
        }
    }

    let mut engine = DubEngine::new(Arc::clone(&corpus), player, Arc::clone(&metrics)).with_played(played);
    if let Some(history) = &history {
        engine = engine.with_history(Arc::clone(history));
    }

    if config.realtime.enabled {
        let client = MiddlewareClient::new(
            &config.realtime.middleware_url,
            config.realtime.timeout(),
            config.realtime.max_audio_bytes,
        )?;
        match client.info().await {
            Ok(info) => info!(url = client.base_url(), %info, "dubbing middleware reachable"),
            Err(e) => warn!(error = %e, url = client.base_url(), "dubbing middleware probe failed"),
        }
        engine = engine.with_realtime(Arc::new(client));
    }

    let shutdown = Shutdown::new();
    shutdown.install_ctrl_c();

    let ocr = Arc::new(PythonOcrEngine::new(
        &config.ocr.python_bin,
        config.ocr.worker_script.clone(),
        &config.ocr.lang,
    )
    .with_request_timeout(config.ocr.request_timeout()));
    let health = (config.ocr.health_interval_secs > 0).then(|| {
        PythonOcrEngine::spawn_health_loop(
            Arc::clone(&ocr),
            Duration::from_secs(config.ocr.health_interval_secs),
            shutdown.token(),
        )
    });

    let daemon = Daemon::new(screen, ocr, engine, metrics, config.poll_interval());
    let stats = daemon.run(shutdown.clone()).await;

    shutdown.trigger();
    if let Some(handle) = health {
        let _ = handle.await;
    }
    if let Some(history) = history {
        history.close().await;
    }

    info!(
        ticks = stats.ticks,
        replayed = stats.replayed,
        synthesized = stats.synthesized,
        "dubplay stopped"
    );
    Ok(())
}

fn show_matches(config: &DaemonConfig, text: &str, top: usize) -> anyhow::Result<()> {
    let corpus = load_corpus(config)?;
    let ranked = rank_candidates(&corpus, text);
    if ranked.is_empty() {
        println!("no known speaker (with available audio) found in text");
        return Ok(());
    }
    for r in ranked.iter().take(top) {
        println!(
            "{:.3}  lcs={:.2} edit={:.2} {}  [{}] {} -> {}",
            r.score.combined,
            r.score.lcs_ratio,
            r.score.edit_ratio,
            if r.score.is_match { "MATCH" } else { "-----" },
            r.character,
            r.candidate.reference_text,
            r.candidate.audio_path.display(),
        );
    }
    Ok(())
}

async fn play_file(file: PathBuf) -> anyhow::Result<()> {
    let player = audio::default_player().context("opening audio output")?;
    let source = AudioSource::File(file);
    tokio::task::spawn_blocking(move || player.play(source)).await??;
    Ok(())
}

fn show_history(config: &DaemonConfig, limit: usize, prune_days: Option<u32>) -> anyhow::Result<()> {
    let Some(path) = &config.history_db else {
        bail!("history_db is not configured");
    };
    let store = HistoryStore::open(path)?;
    if let Some(days) = prune_days {
        let removed = store.cleanup_older_than_days(days)?;
        println!("removed {removed} records older than {days} days");
    }
    for record in store.query_recent(limit)? {
        println!(
            "{}  {:<8} [{}] {} ({})",
            record.created_at,
            record.source.as_str(),
            record.character,
            record.line,
            record.audio,
        );
    }
    Ok(())
}
