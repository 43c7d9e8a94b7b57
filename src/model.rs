//! Core data model: fragments, fingerprints, cache entries, language profiles.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where a fragment sits on the rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentRole {
    Navigation,
    Heading,
    Body,
}

/// One unit of translatable source-language content. Created per rendering
/// pass and never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFragment {
    pub id: String,
    pub source_text: String,
    pub role: FragmentRole,
}

impl TextFragment {
    pub fn new(id: impl Into<String>, source_text: impl Into<String>, role: FragmentRole) -> Self {
        Self {
            id: id.into(),
            source_text: source_text.into(),
            role,
        }
    }

    pub fn body(id: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self::new(id, source_text, FragmentRole::Body)
    }
}

/// The current content digest of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFingerprint {
    pub page_path: String,
    pub hash: String,
    /// Unix seconds.
    pub computed_at: i64,
}

/// A stored translation. Only valid while `page_fingerprint_hash` equals the
/// current fingerprint of the page it was translated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source_lang: String,
    pub target_lang: String,
    pub text_hash: String,
    pub translated_text: String,
    pub page_fingerprint_hash: String,
    /// Unix seconds.
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub code: String,
    #[serde(default)]
    pub native_flag: bool,
    pub display_name: String,
}

impl LanguageProfile {
    pub fn new(code: &str, display_name: &str, native_flag: bool) -> Self {
        Self {
            code: code.to_string(),
            native_flag,
            display_name: display_name.to_string(),
        }
    }
}

/// Validated set of configured languages with exactly one native language.
#[derive(Debug, Clone)]
pub struct LanguageSet {
    profiles: Vec<LanguageProfile>,
    native_idx: usize,
}

impl LanguageSet {
    pub fn new(profiles: Vec<LanguageProfile>) -> Result<Self, ConfigError> {
        let natives: Vec<usize> = profiles
            .iter()
            .enumerate()
            .filter(|(_, p)| p.native_flag)
            .map(|(i, _)| i)
            .collect();
        if natives.len() != 1 {
            return Err(ConfigError::Invalid(format!(
                "exactly one native language required, found {}",
                natives.len()
            )));
        }
        for (i, p) in profiles.iter().enumerate() {
            if p.code.trim().is_empty() {
                return Err(ConfigError::Invalid("language code must not be empty".into()));
            }
            if profiles[..i].iter().any(|q| q.code == p.code) {
                return Err(ConfigError::Invalid(format!("duplicate language code: {}", p.code)));
            }
        }
        Ok(Self {
            native_idx: natives[0],
            profiles,
        })
    }

    pub fn native(&self) -> &LanguageProfile {
        &self.profiles[self.native_idx]
    }

    pub fn is_native(&self, code: &str) -> bool {
        self.native().code == code
    }

    pub fn get(&self, code: &str) -> Option<&LanguageProfile> {
        self.profiles.iter().find(|p| p.code == code)
    }

    /// Languages that require translation.
    pub fn targets(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.iter().filter(|p| !p.native_flag)
    }

    pub fn all(&self) -> &[LanguageProfile] {
        &self.profiles
    }
}

impl Default for LanguageSet {
    fn default() -> Self {
        Self {
            profiles: vec![
                LanguageProfile::new("zh-TW", "繁體中文", true),
                LanguageProfile::new("en", "English", false),
            ],
            native_idx: 0,
        }
    }
}

/// Current time as Unix timestamp (seconds).
pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_set_requires_single_native() {
        let none = vec![LanguageProfile::new("en", "English", false)];
        assert!(LanguageSet::new(none).is_err());

        let two = vec![
            LanguageProfile::new("en", "English", true),
            LanguageProfile::new("ja", "日本語", true),
        ];
        assert!(LanguageSet::new(two).is_err());

        let ok = LanguageSet::new(vec![
            LanguageProfile::new("zh-TW", "繁體中文", true),
            LanguageProfile::new("en", "English", false),
            LanguageProfile::new("ja", "日本語", false),
        ])
        .unwrap();
        assert_eq!(ok.native().code, "zh-TW");
        assert!(ok.is_native("zh-TW"));
        assert!(!ok.is_native("en"));
        let targets: Vec<&str> = ok.targets().map(|p| p.code.as_str()).collect();
        assert_eq!(targets, vec!["en", "ja"]);
    }

    #[test]
    fn language_set_rejects_duplicates() {
        let dup = vec![
            LanguageProfile::new("zh-TW", "繁體中文", true),
            LanguageProfile::new("en", "English", false),
            LanguageProfile::new("en", "English (US)", false),
        ];
        assert!(LanguageSet::new(dup).is_err());
    }

    #[test]
    fn fragment_role_serializes_snake_case() {
        let f = TextFragment::new("nav-1", "首頁", FragmentRole::Navigation);
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"navigation\""));
    }
}
