//! Subtitle-to-dub matching: normalization, scoring, the corpus of cached
//! dubs, and the engine that decides between replay and realtime synthesis.

pub mod corpus;
pub mod engine;
pub mod normalize;
pub mod played;
pub mod similarity;

pub use corpus::{Character, CorpusError, CorpusOptions, DubCandidate, DubCorpus};
pub use engine::{rank_candidates, DebounceState, Decision, DubEngine, Outcome, RankedCandidate};
pub use played::PlayedSet;
pub use similarity::MatchScore;
