//! Text canonicalization for OCR reads and corpus reference lines.
//! Also splits `Name(lang)` character identifiers and pulls the spoken line
//! out of a raw subtitle for realtime dubbing.

use std::sync::LazyLock;

use regex::Regex;

/// Game UI watermark trailing every captured subtitle (`UID123456`).
pub const WATERMARK: &str = "uid";

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("valid literal regex"));

/// Watermark in canonical text: the tag directly followed by its digits.
static CANONICAL_WATERMARK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"uid[0-9]").expect("valid literal regex"));

/// Watermark in lower-cased raw text; separators may sit before the digits.
static RAW_WATERMARK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"uid[^a-z0-9]*[0-9]").expect("valid literal regex"));

/// ASCII letters and digits of `raw`, lower-cased. No watermark handling.
///
/// Used as the identity of a line (played set, debounce) so words such as
/// "guide" or "fluid" never collapse distinct lines.
pub fn canonical(raw: &str) -> String {
    NON_ALNUM.replace_all(raw, "").to_ascii_lowercase()
}

/// Canonicalize `raw` for comparison.
///
/// Keeps ASCII letters and digits only, lower-cases, drops as many leading
/// characters as the normalized `character_prefix` is long, then truncates at
/// the first [`WATERMARK`] followed by a digit. Output is always ASCII.
pub fn normalize(raw: &str, character_prefix: &str) -> String {
    let mut text = canonical(raw);

    if !character_prefix.is_empty() {
        let skip = label_len(character_prefix).min(text.len());
        text.drain(..skip);
    }

    if let Some(m) = CANONICAL_WATERMARK.find(&text) {
        text.truncate(m.start());
    }
    text
}

/// Number of characters a speaker label occupies once normalized.
fn label_len(label: &str) -> usize {
    NON_ALNUM.replace_all(label, "").len()
}

/// Split a corpus character identifier into display name and language tag.
///
/// `"Amber(en)"` → `("Amber", Some("en"))`, `"Amber"` → `("Amber", None)`.
pub fn split_character_id(id: &str) -> (&str, Option<&str>) {
    let trimmed = id.trim();
    if let Some(body) = trimmed.strip_suffix(')') {
        if let Some(open) = body.rfind('(') {
            let name = body[..open].trim_end();
            let lang = body[open + 1..].trim();
            if !name.is_empty() && !lang.is_empty() {
                return (name, Some(lang));
            }
        }
    }
    (trimmed, None)
}

/// Extract the line a speaker is saying from a raw subtitle read.
///
/// Takes the lower-cased text after the first occurrence of `name` up to the
/// next watermark tag (`uid` plus digits), with the label separator and surrounding whitespace
/// trimmed. If `name` is absent the line starts at the beginning.
pub fn realtime_line(raw: &str, name: &str) -> String {
    let lower = raw.to_lowercase();
    let name_lower = name.to_lowercase();

    let start = if name_lower.is_empty() {
        0
    } else {
        lower
            .find(&name_lower)
            .map(|pos| pos + name_lower.len())
            .unwrap_or(0)
    };
    let end = RAW_WATERMARK
        .find(&lower[start..])
        .map(|m| start + m.start())
        .unwrap_or(lower.len());

    lower[start..end]
        .trim_start_matches(|c: char| c == ':' || c == '：' || c.is_whitespace())
        .trim_end()
        .to_string()
}
