//! Text normalization ahead of hashing and translation.
//! Strips markup so fingerprints only see visible text, filters fragments
//! that carry nothing to translate, and protects URLs / e-mail addresses
//! from being rewritten by the provider.

use std::sync::OnceLock;

use regex::Regex;

fn tag_pattern() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"(?s)<!--.*?-->|</?[A-Za-z][^>]*>").expect("static regex"))
}

/// Remove HTML tags and comments, decode the common entities.
pub fn strip_markup(text: &str) -> String {
    let stripped = tag_pattern().replace_all(text, " ");
    decode_entities(&stripped)
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Collapse whitespace runs to a single space and trim the ends.
pub fn fold_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text of a fragment, as the fingerprint sees it.
pub fn visible_text(text: &str) -> String {
    fold_whitespace(&strip_markup(text))
}

/// False for text with nothing a translator could change: empty, whitespace,
/// or only digits, punctuation and symbols.
pub fn needs_translation(text: &str) -> bool {
    visible_text(text).chars().any(|c| c.is_alphabetic())
}

/// A placeholder substitution that must be restored after translation.
#[derive(Debug, Clone)]
pub struct PlaceholderEntry {
    pub tag: String,      // e.g. "<<PH0>>"
    pub original: String, // e.g. "https://example.com"
}

/// Replaces untranslatable tokens (URLs, e-mail addresses) with placeholder
/// tags before the provider call.
pub struct PlaceholderProtector {
    patterns: Vec<Regex>,
}

impl PlaceholderProtector {
    pub fn new() -> Self {
        Self {
            patterns: vec![
                // URLs
                Regex::new(r"https?://[^\s,，。)）\]]+").expect("static regex"),
                // Emails
                Regex::new(r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}")
                    .expect("static regex"),
            ],
        }
    }

    /// Replace matched tokens with `<<PH0>>`, `<<PH1>>`, etc.
    pub fn protect(&self, text: &str) -> (String, Vec<PlaceholderEntry>) {
        let mut entries = Vec::new();
        let mut result = text.to_string();

        for pat in &self.patterns {
            let matches: Vec<String> = pat
                .find_iter(&result)
                .map(|m| m.as_str().to_string())
                .collect();

            for m in matches {
                let tag = format!("<<PH{}>>", entries.len());
                result = result.replacen(&m, &tag, 1);
                entries.push(PlaceholderEntry { tag, original: m });
            }
        }

        (result, entries)
    }

    pub fn restore(&self, text: &str, entries: &[PlaceholderEntry]) -> String {
        let mut result = text.to_string();
        for entry in entries {
            result = result.replace(&entry.tag, &entry.original);
        }
        result
    }
}

impl Default for PlaceholderProtector {
    fn default() -> Self {
        Self::new()
    }
}
