//! Similarity scoring between an OCR read and a corpus reference line.
//! Two independent metrics must both clear [`MATCH_THRESHOLD`]: longest common
//! substring over the shorter string, and an indel edit ratio.

use super::normalize::normalize;

/// Both component ratios must be strictly above this to count as a match.
pub const MATCH_THRESHOLD: f64 = 0.5;

/// Score of one (extracted text, reference line) pair. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchScore {
    /// `lcs_ratio + edit_ratio` when matched, otherwise 0.
    pub combined: f64,
    pub reference_len: usize,
    pub is_match: bool,
    pub lcs_ratio: f64,
    pub edit_ratio: f64,
    pub normalized_extracted: String,
    pub normalized_reference: String,
}

/// Score raw OCR text against a raw reference line for `character_name`.
///
/// The extracted text has the speaker label stripped; the reference is
/// normalized without a prefix.
pub fn score(extracted_raw: &str, reference_raw: &str, character_name: &str) -> MatchScore {
    let extracted = normalize(extracted_raw, character_name);
    score_normalized(extracted, normalize(reference_raw, ""))
}

/// Score two already-normalized strings.
pub fn score_normalized(extracted: String, reference: String) -> MatchScore {
    let a = extracted.as_bytes();
    let b = reference.as_bytes();

    let shortest = a.len().min(b.len()).max(1);
    let lcs_ratio = longest_common_substring(a, b) as f64 / shortest as f64;
    let edit_ratio = edit_ratio(a, b);

    let is_match = edit_ratio > MATCH_THRESHOLD && lcs_ratio > MATCH_THRESHOLD;
    MatchScore {
        combined: if is_match { lcs_ratio + edit_ratio } else { 0.0 },
        reference_len: b.len(),
        is_match,
        lcs_ratio,
        edit_ratio,
        normalized_extracted: extracted,
        normalized_reference: reference,
    }
}

/// Length of the longest contiguous run shared by `a` and `b`.
pub fn longest_common_substring(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    let mut best = 0;

    for &x in a {
        for (j, &y) in b.iter().enumerate() {
            curr[j + 1] = if x == y { prev[j] + 1 } else { 0 };
            best = best.max(curr[j + 1]);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    best
}

/// Length of the longest (not necessarily contiguous) common subsequence.
fn longest_common_subsequence(a: &[u8], b: &[u8]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for &x in a {
        for (j, &y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized indel similarity in 0..=1, at whole-percent resolution.
///
/// Equivalent to `1 - indel_distance / (len(a) + len(b))`. Empty input on
/// either side scores 0.
pub fn edit_ratio(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let total = (a.len() + b.len()) as f64;
    let ratio = 2.0 * longest_common_subsequence(a, b) as f64 / total;
    (ratio * 100.0).round() / 100.0
}
