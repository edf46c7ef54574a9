//! Obfuscation normalizer.
//!
//! Produces a bounded, deterministic set of deobfuscated variants of a
//! string so the text channels can test each one: case and whitespace
//! folds, delimiter stripping, leet decoding, homoglyph folding, Base64 /
//! percent / escape-sequence decoding, reversal, and the four Unicode
//! normalization forms. `classify` separately reports which obfuscation
//! families are present in the *original* input, as evidence only.

use std::collections::HashMap;

use base64::Engine as _;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Characters treated as injected delimiters.
const DELIMITERS: &[char] = &['-', '_', '.', '|', '/', '\\', '+', '=', '*'];

/// Common words used by the reversal heuristic.
const COMMON_WORDS: &[&str] = &["the", "and", "for", "you", "all", "not", "but", "are"];

static LEET_MAP: Lazy<HashMap<char, char>> = Lazy::new(|| {
    [
        ('0', 'o'),
        ('1', 'i'),
        ('3', 'e'),
        ('4', 'a'),
        ('5', 's'),
        ('7', 't'),
        ('8', 'b'),
        ('9', 'g'),
        ('@', 'a'),
        ('$', 's'),
        ('!', 'i'),
        ('|', 'i'),
    ]
    .into_iter()
    .collect()
});

static HOMOGLYPH_MAP: Lazy<HashMap<char, char>> = Lazy::new(|| {
    [
        // Cyrillic lookalikes
        ('а', 'a'),
        ('е', 'e'),
        ('о', 'o'),
        ('р', 'p'),
        ('с', 'c'),
        ('у', 'y'),
        ('х', 'x'),
        ('і', 'i'),
        ('ј', 'j'),
        ('ѕ', 's'),
        // Greek lookalikes
        ('α', 'a'),
        ('β', 'b'),
        ('ε', 'e'),
        ('ι', 'i'),
        ('ο', 'o'),
        ('ρ', 'p'),
        ('τ', 't'),
        ('υ', 'u'),
        ('χ', 'x'),
        // Mathematical bold
        ('𝐚', 'a'),
        ('𝐛', 'b'),
        ('𝐜', 'c'),
        ('𝐝', 'd'),
        ('𝐞', 'e'),
        // Fullwidth forms
        ('ｉ', 'i'),
        ('ｇ', 'g'),
        ('ｎ', 'n'),
        ('ｏ', 'o'),
        ('ｒ', 'r'),
        ('ｅ', 'e'),
    ]
    .into_iter()
    .collect()
});

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static pattern"));
static HEX_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\x([0-9a-fA-F]{2})").expect("static pattern"));
static UNICODE_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\u([0-9a-fA-F]{4})").expect("static pattern"));
static BASE64_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]+=*$").expect("static pattern"));

/// The deduplicated variant set of one input.
#[derive(Debug, Clone)]
pub struct VariantSet {
    /// Variants in deterministic generation order; the original is first.
    pub variants: Vec<String>,
    /// True when the cap stopped further generation.
    pub truncated: bool,
}

impl VariantSet {
    /// Borrowed views for the pattern analyzer.
    pub fn views(&self) -> Vec<&str> {
        self.variants.iter().map(String::as_str).collect()
    }
}

/// Per-family indicator counts over the original input.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ObfuscationIndicators {
    pub leet_chars: usize,
    pub delimiters: usize,
    pub homoglyphs: usize,
    pub non_ascii: usize,
}

/// Which obfuscation families are present in an input.
#[derive(Debug, Clone, Default)]
pub struct ObfuscationReport {
    pub detected: bool,
    /// Family names, e.g. `leetspeak`, `delimiter_injection`.
    pub techniques: Vec<&'static str>,
    pub confidence: f64,
    pub indicators: ObfuscationIndicators,
}

/// Bounded variant generator.
#[derive(Debug, Clone)]
pub struct Normalizer {
    cap: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(32)
    }
}

impl Normalizer {
    /// Creates a normalizer with an explicit variant cap.
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1) }
    }

    /// Generates the deobfuscated variant set of `text`.
    ///
    /// Every transformation is idempotent and the output is deduplicated;
    /// generation stops (recording truncation) once the cap is reached, so
    /// the set never expands unboundedly.
    pub fn variants(&self, text: &str) -> VariantSet {
        let mut set = VariantSet {
            variants: Vec::new(),
            truncated: false,
        };

        let mut push = |set: &mut VariantSet, candidate: String| -> bool {
            if set.variants.len() >= self.cap {
                set.truncated = true;
                return false;
            }
            if !candidate.is_empty() && !set.variants.contains(&candidate) {
                set.variants.push(candidate);
            }
            true
        };

        if !push(&mut set, text.to_string()) {
            return set;
        }

        let collapsed = WHITESPACE_RUN.replace_all(text, " ").trim().to_string();
        let candidates: Vec<String> = vec![
            collapsed.clone(),
            text.to_lowercase(),
            text.to_uppercase(),
            collapsed.to_lowercase(),
            strip_delimiters(text),
            strip_delimiters(text).to_lowercase(),
            decode_leet(text),
            decode_leet(text).to_lowercase(),
            fold_homoglyphs(text),
            fold_homoglyphs(text).to_lowercase(),
        ];
        for candidate in candidates {
            if !push(&mut set, candidate) {
                return set;
            }
        }

        for decoded in decode_encodings(text) {
            if !push(&mut set, decoded.clone()) {
                return set;
            }
            if !push(&mut set, decoded.to_lowercase()) {
                return set;
            }
        }

        if might_be_reversed(text) {
            let reversed: String = text.chars().rev().collect();
            if !push(&mut set, reversed.clone()) {
                return set;
            }
            if !push(&mut set, reversed.to_lowercase()) {
                return set;
            }
        }

        let unicode_forms: Vec<String> = vec![
            text.nfc().collect(),
            text.nfd().collect(),
            text.nfkc().collect(),
            text.nfkd().collect(),
        ];
        for form in unicode_forms {
            if !push(&mut set, form.clone()) {
                return set;
            }
            if !push(&mut set, form.to_lowercase()) {
                return set;
            }
        }

        set
    }

    /// Inspects the original input for obfuscation families.
    ///
    /// Detection here is evidence, not a verdict: obfuscated text is not
    /// malicious by itself.
    pub fn classify(&self, text: &str) -> ObfuscationReport {
        let mut report = ObfuscationReport::default();
        if text.is_empty() {
            return report;
        }

        let indicators = ObfuscationIndicators {
            leet_chars: text.chars().filter(|c| LEET_MAP.contains_key(c)).count(),
            delimiters: text.chars().filter(|c| DELIMITERS.contains(c)).count(),
            homoglyphs: text
                .chars()
                .filter(|c| HOMOGLYPH_MAP.contains_key(c))
                .count(),
            non_ascii: text.chars().filter(|c| !c.is_ascii()).count(),
        };
        let total_chars = text.chars().count();

        if indicators.leet_chars > 2 {
            report.techniques.push("leetspeak");
        }
        if indicators.delimiters as f64 > total_chars as f64 * 0.2 {
            report.techniques.push("delimiter_injection");
        }
        if HEX_ESCAPE.is_match(text) {
            report.techniques.push("hex_encoding");
        }
        if UNICODE_ESCAPE.is_match(text) {
            report.techniques.push("unicode_escape");
        }
        if plausible_base64(text) {
            report.techniques.push("possible_base64");
        }
        if indicators.homoglyphs > 0 {
            report.techniques.push("homoglyphs");
        }
        if indicators.non_ascii as f64 > total_chars as f64 * 0.3 {
            report.techniques.push("unusual_unicode");
        }

        report.detected = !report.techniques.is_empty();
        report.confidence = (report.techniques.len() as f64 * 0.3).min(1.0);
        report.indicators = indicators;
        report
    }
}

fn strip_delimiters(text: &str) -> String {
    text.chars().filter(|c| !DELIMITERS.contains(c)).collect()
}

fn decode_leet(text: &str) -> String {
    text.chars()
        .map(|c| LEET_MAP.get(&c).copied().unwrap_or(c))
        .collect()
}

fn fold_homoglyphs(text: &str) -> String {
    text.chars()
        .map(|c| HOMOGLYPH_MAP.get(&c).copied().unwrap_or(c))
        .collect()
}

fn plausible_base64(text: &str) -> bool {
    text.len() >= 8 && text.len() % 4 == 0 && BASE64_SHAPE.is_match(text)
}

fn decode_encodings(text: &str) -> Vec<String> {
    let mut decoded = Vec::new();

    if plausible_base64(text) {
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(text) {
            if let Ok(utf8) = String::from_utf8(bytes) {
                if utf8.len() > 3 && utf8.chars().all(|c| !c.is_control() || c.is_whitespace()) {
                    decoded.push(utf8);
                }
            }
        }
    }

    if text.contains('%') {
        if let Ok(percent) = percent_decode_str(text).decode_utf8() {
            if percent != text {
                decoded.push(percent.into_owned());
            }
        }
    }

    if HEX_ESCAPE.is_match(text) {
        let hex = HEX_ESCAPE.replace_all(text, |caps: &regex::Captures<'_>| {
            u8::from_str_radix(&caps[1], 16)
                .ok()
                .map(|byte| (byte as char).to_string())
                .unwrap_or_else(|| caps[0].to_string())
        });
        decoded.push(hex.into_owned());
    }

    if UNICODE_ESCAPE.is_match(text) {
        let unicode = UNICODE_ESCAPE.replace_all(text, |caps: &regex::Captures<'_>| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        });
        decoded.push(unicode.into_owned());
    }

    decoded
}

fn might_be_reversed(text: &str) -> bool {
    let lower = text.to_lowercase();
    let reversed: String = lower.chars().rev().collect();
    let forward = COMMON_WORDS.iter().filter(|w| lower.contains(*w)).count();
    let backward = COMMON_WORDS.iter().filter(|w| reversed.contains(*w)).count();
    backward > forward
}
