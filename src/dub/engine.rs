//! Matching engine: one OCR snapshot in, at most one playback out.
//!
//! Per tick the engine scores every available line of each speaker whose
//! name appears in the text, replays the best unplayed match, and otherwise
//! (when realtime dubbing is on) synthesizes the speaker's line once it has
//! been read identically on two consecutive ticks.
//!
//! All mutable state (played lines, debounce) lives here and is only touched
//! through `&mut self`, so the daemon loop is its single owner.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::corpus::{Character, DubCandidate, DubCorpus};
use super::normalize::{canonical, realtime_line};
use super::played::PlayedSet;
use super::similarity::{self, MatchScore};
use crate::audio::{AudioSource, PlaybackError, Player};
use crate::history::{DubRecord, DubSource, HistoryStore};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::synth::Synthesizer;

/// Result of one matching tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Replayed(PathBuf),
    Synthesized(String),
    NoMatch,
}

/// Last realtime line seen, used to require two identical reads in a row.
#[derive(Debug, Clone, Default)]
pub struct DebounceState {
    last_extracted: String,
}

impl DebounceState {
    /// Record this tick's line. Returns true when it equals the previous
    /// tick's line (compared by canonical key).
    pub fn observe(&mut self, line: &str) -> bool {
        let key = canonical(line);
        let stable = !key.is_empty() && key == self.last_extracted;
        self.last_extracted = key;
        stable
    }

    /// Forget the previous line (a tick without a realtime candidate).
    pub fn reset(&mut self) {
        self.last_extracted.clear();
    }

    pub fn last(&self) -> &str {
        &self.last_extracted
    }
}

/// What the engine decided for a snapshot, before any side effect runs.
#[derive(Debug, Clone)]
pub enum Decision {
    Replay {
        character: String,
        candidate: DubCandidate,
        score: MatchScore,
    },
    Synthesize {
        character: String,
        line: String,
    },
    /// Unmatched line seen for the first time; wait for the next tick.
    Wait { line: String },
    NoMatch,
}

/// One scored corpus line, as shown by the `match` command.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub character: String,
    pub candidate: DubCandidate,
    pub score: MatchScore,
}

struct SpeakerBest<'a> {
    character: &'a Character,
    best: Option<(&'a DubCandidate, MatchScore)>,
}

impl SpeakerBest<'_> {
    fn combined(&self) -> f64 {
        self.best.as_ref().map_or(0.0, |(_, s)| s.combined)
    }
}

pub struct DubEngine {
    corpus: Arc<DubCorpus>,
    played: PlayedSet,
    debounce: DebounceState,
    player: Arc<dyn Player>,
    realtime: Option<Arc<dyn Synthesizer>>,
    metrics: Arc<MetricsRegistry>,
    history: Option<Arc<HistoryStore>>,
}

impl DubEngine {
    pub fn new(corpus: Arc<DubCorpus>, player: Arc<dyn Player>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            corpus,
            played: PlayedSet::new(),
            debounce: DebounceState::default(),
            player,
            realtime: None,
            metrics,
            history: None,
        }
    }

    /// Enable realtime dubbing through `synth`.
    pub fn with_realtime(mut self, synth: Arc<dyn Synthesizer>) -> Self {
        self.realtime = Some(synth);
        self
    }

    /// Replace the played set (capacity, or seeded from history).
    pub fn with_played(mut self, played: PlayedSet) -> Self {
        self.played = played;
        self
    }

    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn played(&self) -> &PlayedSet {
        &self.played
    }

    pub fn debounce(&self) -> &DebounceState {
        &self.debounce
    }

    pub fn realtime_enabled(&self) -> bool {
        self.realtime.is_some()
    }

    /// Best available candidate per speaker found in `text`, in corpus order.
    fn speaker_bests<'a>(corpus: &'a DubCorpus, text: &'a str) -> Vec<SpeakerBest<'a>> {
        corpus
            .speakers_in(text)
            .map(|character| {
                let mut best: Option<(&DubCandidate, MatchScore)> = None;
                for candidate in character.candidates.iter().filter(|c| c.is_available()) {
                    let score = similarity::score(text, &candidate.reference_text, &character.name);
                    // strict comparison keeps the earliest line on ties
                    if best.as_ref().map_or(true, |(_, b)| score.combined > b.combined) {
                        best = Some((candidate, score));
                    }
                }
                SpeakerBest { character, best }
            })
            .collect()
    }

    /// A tick that produced no subtitle text (capture or OCR failed, or
    /// nothing was recognized). Breaks any pending realtime debounce.
    pub fn no_subtitle(&mut self) {
        self.debounce.reset();
    }

    /// Decide what to do with `text`. Updates the debounce state only.
    pub fn decide(&mut self, text: &str) -> Decision {
        let span = self.metrics.span(metric_names::MATCH_DONE);
        let decision = self.decide_inner(text);
        span.finish();
        decision
    }

    fn decide_inner(&mut self, text: &str) -> Decision {
        let corpus = Arc::clone(&self.corpus);
        let speakers = Self::speaker_bests(&corpus, text);
        if speakers.is_empty() {
            self.debounce.reset();
            return Decision::NoMatch;
        }

        let mut replay: Option<(&Character, &DubCandidate, &MatchScore)> = None;
        for speaker in &speakers {
            let Some((candidate, score)) = &speaker.best else {
                continue;
            };
            if !score.is_match || self.played.contains(&candidate.reference_text) {
                continue;
            }
            if replay.map_or(true, |(_, _, s)| score.combined > s.combined) {
                replay = Some((speaker.character, *candidate, score));
            }
        }
        if let Some((character, candidate, score)) = replay {
            let decision = Decision::Replay {
                character: character.id.clone(),
                candidate: candidate.clone(),
                score: score.clone(),
            };
            self.debounce.reset();
            return decision;
        }

        if !self.realtime_enabled() {
            self.debounce.reset();
            return Decision::NoMatch;
        }

        // highest best score, then the longer name, then corpus order
        let mut top = &speakers[0];
        for speaker in &speakers[1..] {
            let better = speaker.combined() > top.combined()
                || (speaker.combined() == top.combined()
                    && speaker.character.name.len() > top.character.name.len());
            if better {
                top = speaker;
            }
        }

        let line = realtime_line(text, &top.character.name);
        if canonical(&line).is_empty() || self.played.contains(&line) {
            self.debounce.reset();
            return Decision::NoMatch;
        }

        let character = top.character.id.clone();
        if self.debounce.observe(&line) {
            Decision::Synthesize { character, line }
        } else {
            debug!(character = %character, line = %line, "realtime line not yet stable");
            Decision::Wait { line }
        }
    }

    /// Run one matching tick against `text`, playing at most one clip.
    pub async fn match_once(&mut self, text: &str) -> Outcome {
        match self.decide(text) {
            Decision::Replay {
                character,
                candidate,
                score,
            } => {
                info!(
                    character = %character,
                    reference = %candidate.reference_text,
                    combined = score.combined,
                    lcs_ratio = score.lcs_ratio,
                    edit_ratio = score.edit_ratio,
                    "replaying cached dub"
                );
                let key = PlayedSet::key(&candidate.reference_text);
                let result = self.play(AudioSource::File(candidate.audio_path.clone())).await;
                // marked even on failure so a broken asset is not retried every tick
                self.played.insert(&candidate.reference_text);
                match result {
                    Ok(()) => {
                        self.record(
                            &character,
                            &candidate.reference_text,
                            key,
                            DubSource::Replay,
                            candidate.audio_path.display().to_string(),
                        );
                        Outcome::Replayed(candidate.audio_path)
                    }
                    Err(e) => {
                        warn!(error = %e, path = %candidate.audio_path.display(), "PlaybackFailed");
                        Outcome::NoMatch
                    }
                }
            }
            Decision::Synthesize { character, line } => {
                let Some(synth) = self.realtime.clone() else {
                    return Outcome::NoMatch;
                };
                info!(character = %character, line = %line, "synthesizing realtime dub");

                let span = self.metrics.span(metric_names::SYNTHESIS_DONE);
                let audio = match synth.synthesize(&line, &character).await {
                    Ok(audio) => audio,
                    Err(e) => {
                        warn!(error = %e, character = %character, "SynthesisFailed");
                        return Outcome::NoMatch;
                    }
                };
                span.finish();

                let format = audio.format;
                let result = self
                    .play(AudioSource::Bytes {
                        data: audio.data,
                        format,
                    })
                    .await;
                self.played.insert(&line);
                match result {
                    Ok(()) => {
                        self.record(
                            &character,
                            &line,
                            PlayedSet::key(&line),
                            DubSource::Realtime,
                            format!("<synthesized {}>", format.extension()),
                        );
                        Outcome::Synthesized(line)
                    }
                    Err(e) => {
                        warn!(error = %e, character = %character, "PlaybackFailed");
                        Outcome::NoMatch
                    }
                }
            }
            Decision::Wait { .. } | Decision::NoMatch => Outcome::NoMatch,
        }
    }

    /// Play on the blocking pool so the runtime keeps servicing timers.
    async fn play(&self, source: AudioSource) -> Result<(), PlaybackError> {
        let span = self.metrics.span(metric_names::PLAYBACK_DONE);
        let player = Arc::clone(&self.player);
        let result = tokio::task::spawn_blocking(move || player.play(source))
            .await
            .map_err(|e| PlaybackError::Aborted(e.to_string()))?;
        span.finish();
        result
    }

    fn record(&self, character: &str, line: &str, played_key: String, source: DubSource, audio: String) {
        if let Some(history) = &self.history {
            history.record(DubRecord::new(character, line, played_key, source, audio));
        }
    }
}

/// Score every available line of every speaker in `text`, best first.
pub fn rank_candidates(corpus: &DubCorpus, text: &str) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = corpus
        .speakers_in(text)
        .flat_map(|character| {
            character
                .candidates
                .iter()
                .filter(|c| c.is_available())
                .map(move |candidate| RankedCandidate {
                    character: character.id.clone(),
                    candidate: candidate.clone(),
                    score: similarity::score(text, &candidate.reference_text, &character.name),
                })
        })
        .collect();
    ranked.sort_by(|a, b| b.score.combined.total_cmp(&a.score.combined));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::audio::AudioFormat;
    use crate::synth::{SynthesisError, SynthesizedAudio};

    #[derive(Default)]
    struct FakePlayer {
        played: Mutex<Vec<AudioSource>>,
        fail: AtomicBool,
    }

    impl FakePlayer {
        fn count(&self) -> usize {
            self.played.lock().len()
        }
    }

    impl Player for FakePlayer {
        fn play(&self, source: AudioSource) -> Result<(), PlaybackError> {
            self.played.lock().push(source);
            if self.fail.load(Ordering::SeqCst) {
                return Err(PlaybackError::Device("unplugged".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSynth {
        calls: Mutex<Vec<(String, String)>>,
        fail: AtomicBool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Synthesizer for FakeSynth {
        async fn synthesize(&self, text: &str, character: &str) -> Result<SynthesizedAudio, SynthesisError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SynthesisError::Status {
                    status: 500,
                    body: "model not loaded".into(),
                });
            }
            self.calls.lock().push((text.to_string(), character.to_string()));
            Ok(SynthesizedAudio {
                data: vec![1, 2, 3],
                format: AudioFormat::Aac,
            })
        }
    }

    fn candidate(dir: &Path, file: &str, text: &str, create: bool) -> DubCandidate {
        let path = dir.join(file);
        if create {
            std::fs::write(&path, b"fake").unwrap();
        }
        DubCandidate {
            reference_text: text.to_string(),
            audio_path: path,
        }
    }

    fn character(id: &str, name: &str, candidates: Vec<DubCandidate>) -> Character {
        Character {
            id: id.to_string(),
            name: name.to_string(),
            lang: None,
            candidates,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        player: Arc<FakePlayer>,
        synth: Arc<FakeSynth>,
        engine: DubEngine,
        amber_audio: PathBuf,
    }

    fn fixture(realtime: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let amber = candidate(dir.path(), "a.aac", "I will protect this city", true);
        let amber_audio = amber.audio_path.clone();
        let corpus = DubCorpus::from_characters(vec![character(
            "Amber",
            "Amber",
            vec![candidate(dir.path(), "b.aac", "Outrider Amber reporting", true), amber],
        )]);

        let player = Arc::new(FakePlayer::default());
        let synth = Arc::new(FakeSynth::default());
        let mut engine = DubEngine::new(
            Arc::new(corpus),
            player.clone(),
            Arc::new(MetricsRegistry::new()),
        );
        if realtime {
            engine = engine.with_realtime(synth.clone());
        }
        Fixture {
            _dir: dir,
            player,
            synth,
            engine,
            amber_audio,
        }
    }

    #[tokio::test]
    async fn test_replay_then_already_played() {
        let mut f = fixture(false);
        let text = "Amber: I will protect this city UID123456";

        assert_eq!(f.engine.match_once(text).await, Outcome::Replayed(f.amber_audio.clone()));
        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.player.count(), 1);
        assert!(f.engine.played().contains("I will protect this city"));
    }

    #[tokio::test]
    async fn test_unrelated_line_without_realtime() {
        let mut f = fixture(false);
        let text = "Amber: something totally unrelated UID999";
        for _ in 0..3 {
            assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        }
        assert_eq!(f.player.count(), 0);
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_realtime_waits_one_tick_then_synthesizes() {
        let mut f = fixture(true);
        let text = "Amber: brand new line UID1";

        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 0);

        assert_eq!(
            f.engine.match_once(text).await,
            Outcome::Synthesized("brand new line".to_string())
        );
        assert!(f.engine.played().contains("brand new line"));
        assert_eq!(
            f.synth.calls.lock()[0],
            ("brand new line".to_string(), "Amber".to_string())
        );
        assert!(matches!(f.player.played.lock()[0], AudioSource::Bytes { .. }));

        // played lines are never synthesized again
        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_audio_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = DubCorpus::from_characters(vec![character(
            "Amber",
            "Amber",
            vec![candidate(dir.path(), "gone.aac", "I will protect this city", false)],
        )]);
        let player = Arc::new(FakePlayer::default());
        let mut engine = DubEngine::new(Arc::new(corpus), player.clone(), Arc::new(MetricsRegistry::new()));

        assert_eq!(
            engine.match_once("Amber: I will protect this city UID123456").await,
            Outcome::NoMatch
        );
        assert_eq!(player.count(), 0);
        assert!(rank_candidates(&engine.corpus, "Amber: I will protect this city").is_empty());
    }

    #[tokio::test]
    async fn test_changing_line_restarts_debounce() {
        let mut f = fixture(true);
        assert_eq!(f.engine.match_once("Amber: first fresh line UID1").await, Outcome::NoMatch);
        assert_eq!(f.engine.match_once("Amber: second fresh line UID1").await, Outcome::NoMatch);
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.engine.match_once("Amber: second fresh line UID1").await,
            Outcome::Synthesized("second fresh line".to_string())
        );
    }

    #[tokio::test]
    async fn test_intervening_tick_resets_debounce() {
        let mut f = fixture(true);
        let text = "Amber: brand new line UID1";
        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.engine.match_once("loading screen").await, Outcome::NoMatch);
        assert_eq!(f.engine.debounce().last(), "");
        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_retried_on_next_stable_tick() {
        let mut f = fixture(true);
        let text = "Amber: brand new line UID1";
        f.synth.fail.store(true, Ordering::SeqCst);

        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 1);
        assert!(!f.engine.played().contains("brand new line"));

        f.synth.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            f.engine.match_once(text).await,
            Outcome::Synthesized("brand new line".to_string())
        );
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_replay_is_not_retried() {
        let mut f = fixture(false);
        f.player.fail.store(true, Ordering::SeqCst);
        let text = "Amber: I will protect this city UID123456";

        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        assert_eq!(f.player.count(), 1);
    }

    #[tokio::test]
    async fn test_replayed_line_blocks_realtime_of_same_text() {
        let mut f = fixture(true);
        let text = "Amber: I will protect this city UID123456";
        assert!(matches!(f.engine.match_once(text).await, Outcome::Replayed(_)));
        for _ in 0..3 {
            assert_eq!(f.engine.match_once(text).await, Outcome::NoMatch);
        }
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_best_match_across_speakers() {
        let dir = tempfile::tempdir().unwrap();
        let kaeya_line = candidate(dir.path(), "k.aac", "Well well what do we have here", true);
        let kaeya_audio = kaeya_line.audio_path.clone();
        let corpus = DubCorpus::from_characters(vec![
            character(
                "Amber",
                "Amber",
                vec![candidate(dir.path(), "a.aac", "Well well what is this", true)],
            ),
            character("Kaeya", "Kaeya", vec![kaeya_line]),
        ]);
        let player = Arc::new(FakePlayer::default());
        let mut engine = DubEngine::new(Arc::new(corpus), player.clone(), Arc::new(MetricsRegistry::new()));

        // both names appear; only the prefix length of each speaker is stripped
        let text = "Kaeya: Well well what do we have here UID5 Amber";
        assert_eq!(engine.match_once(text).await, Outcome::Replayed(kaeya_audio));
    }

    #[tokio::test]
    async fn test_lines_sharing_a_uid_word_replay_separately() {
        let dir = tempfile::tempdir().unwrap();
        let harbor = candidate(dir.path(), "h.aac", "Let me guide you to the harbor", true);
        let town = candidate(dir.path(), "t.aac", "Let me guide you back to town", true);
        let (harbor_audio, town_audio) = (harbor.audio_path.clone(), town.audio_path.clone());
        let corpus = DubCorpus::from_characters(vec![character("Amber", "Amber", vec![harbor, town])]);
        let player = Arc::new(FakePlayer::default());
        let mut engine = DubEngine::new(Arc::new(corpus), player.clone(), Arc::new(MetricsRegistry::new()));

        assert_eq!(
            engine.match_once("Amber: Let me guide you to the harbor UID1").await,
            Outcome::Replayed(harbor_audio)
        );
        assert_eq!(
            engine.match_once("Amber: Let me guide you back to town UID1").await,
            Outcome::Replayed(town_audio)
        );
        assert_eq!(player.count(), 2);
        assert_eq!(engine.played().len(), 2);
    }

    #[tokio::test]
    async fn test_realtime_lines_differing_after_uid_letters() {
        let mut f = fixture(true);
        let stop = "Amber: You idiot, stop UID1";
        let run = "Amber: You idiot, run UID1";

        assert_eq!(f.engine.match_once(stop).await, Outcome::NoMatch);
        assert_eq!(
            f.engine.match_once(stop).await,
            Outcome::Synthesized("you idiot, stop".to_string())
        );
        // a different line is not stable on its first read, and not already played
        assert_eq!(f.engine.match_once(run).await, Outcome::NoMatch);
        assert_eq!(
            f.engine.match_once(run).await,
            Outcome::Synthesized("you idiot, run".to_string())
        );
        assert_eq!(f.synth.attempts.load(Ordering::SeqCst), 2);
        assert!(f.engine.played().contains("you idiot, stop"));
        assert!(f.engine.played().contains("you idiot, run"));
    }

    #[test]
    fn test_debounce_state() {
        let mut debounce = DebounceState::default();
        assert!(!debounce.observe("Hello there"));
        assert!(debounce.observe("hello, there!"));
        assert!(debounce.observe("hello there"));
        debounce.reset();
        assert!(!debounce.observe("hello there"));
        assert!(!debounce.observe(""));
        assert!(!debounce.observe(""));

        // a partial read is not the full line
        assert!(!debounce.observe("you idiot"));
        assert!(!debounce.observe("you idiot, run"));
    }

    #[test]
    fn test_rank_candidates_orders_by_score() {
        let f = fixture(false);
        let ranked = rank_candidates(&f.engine.corpus, "Amber: I will protect this city UID1");
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].candidate.reference_text, "I will protect this city");
        assert!(ranked[0].score.is_match);
        assert!(ranked[0].score.combined >= ranked[1].score.combined);
    }
}
