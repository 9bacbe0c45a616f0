//! Dub corpus loading.
//! On-disk format: `{ character: { lineHash: { "text": ..., "dest": ... } } }`.
//! Line hashes are opaque; only (text, dest) pairs per character are kept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use super::normalize::split_character_id;

/// One cached dub: the reference line and the audio that voices it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DubCandidate {
    pub reference_text: String,
    pub audio_path: PathBuf,
}

impl DubCandidate {
    /// Whether the audio asset is present. Missing assets are skipped at match time.
    pub fn is_available(&self) -> bool {
        self.audio_path.is_file()
    }
}

/// A speaker and every cached line for it.
#[derive(Debug, Clone)]
pub struct Character {
    /// Identifier as written in the corpus file, e.g. `Amber(en)`.
    pub id: String,
    /// Display name searched for in subtitles, e.g. `Amber`.
    pub name: String,
    pub lang: Option<String>,
    pub candidates: Vec<DubCandidate>,
}

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("corpus IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corpus parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Load-time options.
#[derive(Debug, Clone, Default)]
pub struct CorpusOptions {
    /// Base directory for relative `dest` paths.
    pub audio_root: Option<PathBuf>,
    /// Speakers whose lines are never dubbed (`???`, `Crowd`, ...).
    pub ignored_characters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    text: String,
    dest: PathBuf,
}

type RawCorpus = HashMap<String, HashMap<String, RawEntry>>;

/// Read-only character → candidates mapping, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct DubCorpus {
    characters: Vec<Character>,
}

impl DubCorpus {
    /// Load the corpus from a JSON file.
    pub fn load_from_file(path: &Path, options: &CorpusOptions) -> Result<Self, CorpusError> {
        let content = std::fs::read_to_string(path)?;
        let corpus = Self::from_json_str(&content, options)?;
        info!(
            path = %path.display(),
            characters = corpus.characters.len(),
            lines = corpus.line_count(),
            "dub corpus loaded"
        );
        Ok(corpus)
    }

    /// Parse a corpus document.
    pub fn from_json_str(json: &str, options: &CorpusOptions) -> Result<Self, CorpusError> {
        let raw: RawCorpus = serde_json::from_str(json)?;
        Ok(Self::from_raw(raw, options))
    }

    fn from_raw(raw: RawCorpus, options: &CorpusOptions) -> Self {
        let mut characters: Vec<Character> = raw
            .into_iter()
            .filter_map(|(id, lines)| {
                let (name, lang) = split_character_id(&id);
                if options.ignored_characters.iter().any(|c| c == &id || c == name) {
                    debug!(character = %id, "ignored character skipped");
                    return None;
                }

                // sort by line hash so scoring order is stable across runs
                let mut lines: Vec<(String, RawEntry)> = lines.into_iter().collect();
                lines.sort_by(|a, b| a.0.cmp(&b.0));

                let candidates = lines
                    .into_iter()
                    .map(|(_, entry)| DubCandidate {
                        reference_text: entry.text,
                        audio_path: resolve(options.audio_root.as_deref(), entry.dest),
                    })
                    .collect();

                Some(Character {
                    name: name.to_string(),
                    lang: lang.map(str::to_string),
                    id,
                    candidates,
                })
            })
            .collect();
        characters.sort_by(|a, b| a.id.cmp(&b.id));
        Self { characters }
    }

    /// Build a corpus directly from characters (tests, tooling).
    pub fn from_characters(mut characters: Vec<Character>) -> Self {
        characters.sort_by(|a, b| a.id.cmp(&b.id));
        Self { characters }
    }

    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    /// Characters whose display name occurs verbatim in `text`.
    pub fn speakers_in<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a Character> + 'a {
        self.characters
            .iter()
            .filter(move |c| !c.name.is_empty() && text.contains(c.name.as_str()))
    }

    pub fn line_count(&self) -> usize {
        self.characters.iter().map(|c| c.candidates.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }
}

fn resolve(root: Option<&Path>, dest: PathBuf) -> PathBuf {
    match root {
        Some(root) if dest.is_relative() => root.join(dest),
        _ => dest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Amber(en)": {
            "b2": {"text": "Second line", "dest": "amber/b2.aac"},
            "a1": {"text": "I will protect this city", "dest": "amber/a1.aac"}
        },
        "Crowd": {
            "c1": {"text": "Hooray", "dest": "crowd/c1.aac"}
        },
        "Kaeya": {
            "k1": {"text": "Well well", "dest": "/abs/k1.aac", "extra": 1}
        }
    }"#;

    #[test]
    fn test_parse_corpus() {
        let corpus = DubCorpus::from_json_str(SAMPLE, &CorpusOptions::default()).unwrap();
        assert_eq!(corpus.characters().len(), 3);
        assert_eq!(corpus.line_count(), 4);

        let amber = &corpus.characters()[0];
        assert_eq!(amber.id, "Amber(en)");
        assert_eq!(amber.name, "Amber");
        assert_eq!(amber.lang.as_deref(), Some("en"));
        assert_eq!(amber.candidates[0].reference_text, "I will protect this city");
        assert_eq!(amber.candidates[0].audio_path, PathBuf::from("amber/a1.aac"));
    }

    #[test]
    fn test_ignored_characters_and_audio_root() {
        let options = CorpusOptions {
            audio_root: Some(PathBuf::from("/data/dubs")),
            ignored_characters: vec!["Crowd".to_string()],
        };
        let corpus = DubCorpus::from_json_str(SAMPLE, &options).unwrap();
        let ids: Vec<&str> = corpus.characters().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["Amber(en)", "Kaeya"]);

        assert_eq!(
            corpus.characters()[0].candidates[0].audio_path,
            PathBuf::from("/data/dubs/amber/a1.aac")
        );
        // absolute paths are left alone
        assert_eq!(
            corpus.characters()[1].candidates[0].audio_path,
            PathBuf::from("/abs/k1.aac")
        );
    }

    #[test]
    fn test_speakers_in_uses_display_name() {
        let corpus = DubCorpus::from_json_str(SAMPLE, &CorpusOptions::default()).unwrap();
        let found: Vec<&str> = corpus
            .speakers_in("Amber: I will protect this city UID1")
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(found, ["Amber(en)"]);
        assert_eq!(corpus.speakers_in("amber: lowercase label").count(), 0);
    }

    #[test]
    fn test_malformed_corpus() {
        let err = DubCorpus::from_json_str(r#"{"Amber": {"x": {"text": 1}}}"#, &CorpusOptions::default());
        assert!(matches!(err, Err(CorpusError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let corpus = DubCorpus::load_from_file(&path, &CorpusOptions::default()).unwrap();
        assert_eq!(corpus.line_count(), 4);

        let missing = DubCorpus::load_from_file(&dir.path().join("nope.json"), &CorpusOptions::default());
        assert!(matches!(missing, Err(CorpusError::Io(_))));
    }
}
