//! Page fingerprints: an order-sensitive digest over the visible source text
//! of a page's fragments. A change detector, not a security boundary.
//!
//! The digest covers the fragment count and, per fragment, the byte length
//! and bytes of its visible text. Markup is stripped first, so restyling a
//! page does not invalidate its translations, while editing, reordering,
//! inserting or removing text does.

use std::sync::Arc;

use crate::model::{now_unix, PageFingerprint, TextFragment};
use crate::translate::normalize::visible_text;

/// Digest function over the normalized fragment texts, in document order.
pub trait FragmentHasher: Send + Sync {
    fn hash_fragments(&self, texts: &[String]) -> String;
}

/// Default hasher: blake3, hex-encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl FragmentHasher for Blake3Hasher {
    fn hash_fragments(&self, texts: &[String]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(texts.len() as u64).to_le_bytes());
        for text in texts {
            hasher.update(&(text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[derive(Clone)]
pub struct FingerprintEngine {
    hasher: Arc<dyn FragmentHasher>,
}

impl FingerprintEngine {
    pub fn new(hasher: Arc<dyn FragmentHasher>) -> Self {
        Self { hasher }
    }

    /// Digest of the fragments' visible text in order. An empty sequence
    /// yields a fixed constant.
    pub fn fingerprint(&self, fragments: &[TextFragment]) -> String {
        let texts: Vec<String> = fragments
            .iter()
            .map(|f| visible_text(&f.source_text))
            .collect();
        self.hasher.hash_fragments(&texts)
    }

    pub fn page_fingerprint(&self, page_path: &str, fragments: &[TextFragment]) -> PageFingerprint {
        PageFingerprint {
            page_path: page_path.to_string(),
            hash: self.fingerprint(fragments),
            computed_at: now_unix(),
        }
    }
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(Arc::new(Blake3Hasher))
    }
}

/// Cache key digest of one exact source text (no normalization).
pub fn text_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frags(texts: &[&str]) -> Vec<TextFragment> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| TextFragment::body(format!("f{i}"), *t))
            .collect()
    }

    #[test]
    fn deterministic() {
        let engine = FingerprintEngine::default();
        let f = frags(&["首頁", "關於我們"]);
        assert_eq!(engine.fingerprint(&f), engine.fingerprint(&f));
    }

    #[test]
    fn sensitive_to_content_order_and_count() {
        let engine = FingerprintEngine::default();
        let base = engine.fingerprint(&frags(&["首頁", "關於我們"]));
        assert_ne!(base, engine.fingerprint(&frags(&["主頁", "關於我們"])));
        assert_ne!(base, engine.fingerprint(&frags(&["關於我們", "首頁"])));
        assert_ne!(base, engine.fingerprint(&frags(&["首頁", "關於我們", "購物車"])));
        assert_ne!(base, engine.fingerprint(&frags(&["首頁"])));
    }

    #[test]
    fn fragment_boundaries_matter() {
        let engine = FingerprintEngine::default();
        assert_ne!(
            engine.fingerprint(&frags(&["ab", "c"])),
            engine.fingerprint(&frags(&["a", "bc"]))
        );
        assert_ne!(
            engine.fingerprint(&frags(&["x"])),
            engine.fingerprint(&frags(&["x", ""]))
        );
    }

    #[test]
    fn insensitive_to_markup() {
        let engine = FingerprintEngine::default();
        assert_eq!(
            engine.fingerprint(&frags(&["<strong>首頁</strong>", "關於我們"])),
            engine.fingerprint(&frags(&["首頁", "<span class=\"x\">關於我們</span>"]))
        );
    }

    #[test]
    fn ids_and_roles_do_not_matter() {
        let engine = FingerprintEngine::default();
        let a = vec![TextFragment::new("a", "首頁", crate::model::FragmentRole::Navigation)];
        let b = vec![TextFragment::new("b", "首頁", crate::model::FragmentRole::Heading)];
        assert_eq!(engine.fingerprint(&a), engine.fingerprint(&b));
    }

    #[test]
    fn empty_is_constant() {
        let engine = FingerprintEngine::default();
        let empty = engine.fingerprint(&[]);
        assert_eq!(empty, Blake3Hasher.hash_fragments(&[]));
        assert_eq!(empty.len(), 64);
    }

    #[test]
    fn text_hash_is_exact() {
        assert_eq!(text_hash("購物車"), text_hash("購物車"));
        assert_ne!(text_hash("購物車"), text_hash("購物車 "));
    }
}
