// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic cache keys for synthesized audio.
//!
//! A key is the SHA-256 of the normalized text, rendered as 64 lowercase hex
//! characters. Normalization is the same whitespace cleanup applied before the
//! text is sent for synthesis, so two requests that would produce the same
//! audio share one cache entry.
//!
//! # Example
//!
//! ```
//! use tts_cache::CacheKeyGenerator;
//!
//! let keys = CacheKeyGenerator::new();
//! let a = keys.key("Hello   Bitcoin\n");
//! let b = keys.key("Hello Bitcoin");
//! assert_eq!(a, b);
//! assert_eq!(a.as_str().len(), 64);
//! ```

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 fingerprint identifying one audio payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already computed hex digest (e.g. read back from a backend).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Collapse every run of whitespace to a single space and trim both ends.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Computes [`CacheKey`]s from text.
///
/// An optional namespace (voice and model) is hashed ahead of the text so
/// that audio rendered with different voices never shares a key in a tier
/// shared between instances.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator {
    namespace: Option<String>,
}

impl CacheKeyGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self { namespace: None }
    }

    /// Generator scoped to one voice/model pair.
    pub fn with_namespace(voice_id: &str, model_id: &str) -> Self {
        Self {
            namespace: Some(format!("{}/{}", voice_id, model_id)),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Key for `text` after normalization.
    #[must_use]
    pub fn key(&self, text: &str) -> CacheKey {
        self.key_normalized(&normalize_text(text))
    }

    /// Key for text that has already gone through [`normalize_text`].
    #[must_use]
    pub fn key_normalized(&self, normalized: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        if let Some(ref ns) = self.namespace {
            hasher.update(ns.as_bytes());
            // Separator byte can't appear in normalized UTF-8 text
            hasher.update([0xff]);
        }
        hasher.update(normalized.as_bytes());
        CacheKey(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  Hello \t\n  Bitcoin  "), "Hello Bitcoin");
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text(" \n\t "), "");
    }

    #[test]
    fn test_key_is_deterministic() {
        let keys = CacheKeyGenerator::new();
        assert_eq!(keys.key("Hello Bitcoin"), keys.key("Hello Bitcoin"));
        assert_eq!(keys.key("Hello Bitcoin"), keys.key(" Hello\nBitcoin "));
    }

    #[test]
    fn test_key_is_fixed_length_lowercase_hex() {
        let key = CacheKeyGenerator::new().key("anything at all");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        let key = CacheKeyGenerator::new().key("abc");
        assert_eq!(
            key.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_distinct_text_distinct_keys() {
        let keys = CacheKeyGenerator::new();
        assert_ne!(keys.key("Hello Bitcoin"), keys.key("Hello bitcoin"));
        assert_ne!(keys.key("a b"), keys.key("ab"));
    }

    #[test]
    fn test_namespace_separates_voices() {
        let rachel = CacheKeyGenerator::with_namespace("rachel", "turbo");
        let adam = CacheKeyGenerator::with_namespace("adam", "turbo");
        let plain = CacheKeyGenerator::new();

        assert_ne!(rachel.key("hi"), adam.key("hi"));
        assert_ne!(rachel.key("hi"), plain.key("hi"));
        assert_eq!(rachel.key("hi"), rachel.clone().key(" hi "));
        assert_eq!(rachel.namespace(), Some("rachel/turbo"));
    }

    #[test]
    fn test_display_matches_as_str() {
        let key = CacheKeyGenerator::new().key("x");
        assert_eq!(key.to_string(), key.as_str());
    }
}
