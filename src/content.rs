//! Content provider interface: source-language fragments and last-modified
//! times for a page path. Page storage itself lives outside this crate.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::model::{now_unix, TextFragment};

#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Ordered source-language fragments of the page; empty if the page is unknown.
    async fn page_fragments(&self, page_path: &str) -> Vec<TextFragment>;

    /// Unix seconds of the page's last edit, if known. Only a hint: the
    /// content fingerprint decides whether a page changed.
    async fn page_last_modified(&self, page_path: &str) -> Option<i64>;
}

struct StaticPage {
    fragments: Vec<TextFragment>,
    last_modified: i64,
}

/// In-memory content provider, useful for embedding and tests.
#[derive(Default)]
pub struct StaticContent {
    pages: RwLock<HashMap<String, StaticPage>>,
}

impl StaticContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a page's fragments and bump its last-modified time.
    pub fn set_page(&self, page_path: &str, fragments: Vec<TextFragment>) {
        self.set_page_at(page_path, fragments, now_unix());
    }

    pub fn set_page_at(&self, page_path: &str, fragments: Vec<TextFragment>, last_modified: i64) {
        self.pages.write().insert(
            page_path.to_string(),
            StaticPage {
                fragments,
                last_modified,
            },
        );
    }

    pub fn remove_page(&self, page_path: &str) {
        self.pages.write().remove(page_path);
    }
}

#[async_trait]
impl ContentProvider for StaticContent {
    async fn page_fragments(&self, page_path: &str) -> Vec<TextFragment> {
        self.pages
            .read()
            .get(page_path)
            .map(|p| p.fragments.clone())
            .unwrap_or_default()
    }

    async fn page_last_modified(&self, page_path: &str) -> Option<i64> {
        self.pages.read().get(page_path).map(|p| p.last_modified)
    }
}
