//! Label sets, fingerprints and filesystem-safe path derivation.
//!
//! A [`LabelSet`] is the unit of identity for a stream: two label sets with
//! the same key/value pairs, regardless of insertion order, are the same
//! stream and must fingerprint identically.

use std::collections::BTreeMap;

use blake2::digest::{Update, VariableOutput};
use blake2::VarBlake2b;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Characters that are not safe to use verbatim in a path segment.
const PATH_UNSAFE: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|');

const MAX_KEY_LEN: usize = 128;
const MAX_VALUE_LEN: usize = 2048;

/// A finite mapping from label keys to values, backed by a `BTreeMap` so
/// that iteration order is always the sorted order the fingerprint and
/// path segment derivations rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Self {
        Self(pairs.into_iter().collect())
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// Validates key/value character and length rules (§3). Does not
    /// reject an empty label set; callers that require at least one label
    /// check `is_empty()` themselves (ingest validation does; query
    /// selectors legitimately allow `{}`).
    pub fn validate(&self) -> Result<(), AppError> {
        for (key, value) in self.0.iter() {
            if key.is_empty() || key.len() > MAX_KEY_LEN {
                return Err(AppError::InvalidInput(format!(
                    "label key {:?} must be 1-{} characters",
                    key, MAX_KEY_LEN
                )));
            }
            let mut chars = key.chars();
            let first_ok = chars
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false);
            let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !first_ok || !rest_ok {
                return Err(AppError::InvalidInput(format!(
                    "label key {:?} must match [A-Za-z_][A-Za-z0-9_]*",
                    key
                )));
            }
            if value.is_empty() || value.len() > MAX_VALUE_LEN {
                return Err(AppError::InvalidInput(format!(
                    "label value for {:?} must be 1-{} characters",
                    key, MAX_VALUE_LEN
                )));
            }
            if value.contains('\n') {
                return Err(AppError::InvalidInput(format!(
                    "label value for {:?} must not contain a newline",
                    key
                )));
            }
        }
        Ok(())
    }

    /// True iff every `k=v` pair in `other` is present and equal here.
    /// Used only for exact-match chunk pre-filtering (see the query engine
    /// for the richer `!=`/`=~`/`!~` matching).
    pub fn matches(&self, other: &LabelSet) -> bool {
        other.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    /// Deterministic short hash: sort keys ascending, serialize `k=v,`
    /// pairs in order, hash with BLAKE2b, keep the first 8 bytes as hex.
    /// `BTreeMap` iteration is already key-sorted, so no extra sort step
    /// is needed here.
    pub fn fingerprint(&self) -> String {
        let mut buf = String::new();
        for (k, v) in self.0.iter() {
            buf.push_str(k);
            buf.push('=');
            buf.push_str(v);
            buf.push(',');
        }

        let mut hasher = VarBlake2b::new(8).expect("8 is a valid BLAKE2b output size");
        hasher.update(buf.as_bytes());
        let mut out = [0u8; 8];
        hasher.finalize_variable(|digest| out.copy_from_slice(digest));

        out.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Joins sorted `k=v` tokens with `_`, percent-escaping characters that
    /// are unsafe in a filesystem path, then appends the fingerprint as a
    /// trailing suffix. The token join alone is not collision-free (two
    /// label sets can legally produce the same joined string, e.g.
    /// `{a:"b", c:"d"}` and `{a:"b_c=d"}` both join to `a=b_c=d`); the
    /// fingerprint suffix is what actually guarantees distinct LabelSets
    /// never map to the same segment, and it is deterministic so two runs
    /// of this service still lay out the same stream under the same
    /// directory.
    pub fn path_segment(&self) -> String {
        let tokens = self
            .0
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, PATH_UNSAFE),
                    utf8_percent_encode(v, PATH_UNSAFE)
                )
            })
            .collect::<Vec<_>>()
            .join("_");
        format!("{}_{}", tokens, self.fingerprint())
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", k, v)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = labels(&[("service", "api"), ("env", "prod")]);
        let b = labels(&[("env", "prod"), ("service", "api")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_different_sets() {
        let a = labels(&[("service", "api")]);
        let b = labels(&[("service", "auth")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn path_segment_is_stable_and_escapes_slashes() {
        let a = labels(&[("service", "a/b")]);
        assert!(!a.path_segment().contains('/'));
    }

    #[test]
    fn path_segment_never_collides_across_distinct_label_sets() {
        let a = labels(&[("a", "b"), ("c", "d")]);
        let b = labels(&[("a", "b_c=d")]);
        assert_ne!(a.path_segment(), b.path_segment());
    }

    #[test]
    fn matches_is_superset_check() {
        let full = labels(&[("service", "api"), ("env", "prod")]);
        let query = labels(&[("service", "api")]);
        assert!(full.matches(&query));
        let other = labels(&[("service", "auth")]);
        assert!(!full.matches(&other));
    }

    #[test]
    fn validate_rejects_bad_keys_and_values() {
        let bad_key = labels(&[("1bad", "x")]);
        assert!(bad_key.validate().is_err());
        let bad_value = labels(&[("ok", "")]);
        assert!(bad_value.validate().is_err());
        let good = labels(&[("service", "api")]);
        assert!(good.validate().is_ok());
    }

    #[test]
    fn empty_label_set_is_legal_for_queries() {
        let empty = LabelSet::new();
        assert!(empty.validate().is_ok());
        assert!(empty.is_empty());
    }
}
