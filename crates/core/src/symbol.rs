//! Instrument symbols and target-set fingerprinting.
//!
//! A submitted target list is free-form client input. Everything downstream
//! (duplicate detection, job sizing, result keys) works on the **normalized**
//! set: trimmed, uppercased, de-duplicated, sorted. Two submissions that
//! differ only in order, case, whitespace, or repetition are the same batch.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A validated instrument symbol (canonical form: trimmed, uppercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Upper bound on symbol length; anything longer is client garbage.
    pub const MAX_LEN: usize = 32;

    /// Parse a raw client string into canonical form.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let canonical = raw.trim().to_ascii_uppercase();
        if canonical.is_empty() {
            return Err(DomainError::validation("symbol is empty"));
        }
        if canonical.len() > Self::MAX_LEN {
            return Err(DomainError::validation(format!(
                "symbol exceeds {} characters: {canonical:?}",
                Self::MAX_LEN
            )));
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Symbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a raw target list: trim, uppercase, de-duplicate, sort.
///
/// Whitespace-only entries contribute nothing to the set and are skipped;
/// an all-blank submission therefore normalizes to the empty set (rejected
/// later at job admission, not here). Over-long entries are a validation
/// error.
pub fn normalize_targets<I, S>(raws: I) -> DomainResult<Vec<Symbol>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for raw in raws {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        set.insert(Symbol::parse(trimmed)?);
    }
    Ok(set.into_iter().collect())
}

/// Canonical, order/case-insensitive key for a target set.
///
/// Used to detect semantically duplicate submissions: equal target sets,
/// however submitted, always produce equal fingerprints. The representation
/// is the sorted symbol list joined with `,` — stable, human-readable, and
/// directly usable as a storage lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a symbol set.
    ///
    /// Sorts and de-duplicates defensively, so callers holding an
    /// already-normalized slice and callers holding raw parse output get
    /// the same key.
    pub fn of(symbols: &[Symbol]) -> Self {
        let set: BTreeSet<&Symbol> = symbols.iter().collect();
        let joined = set
            .into_iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Self(joined)
    }

    /// Rehydrate a fingerprint previously produced by [`Fingerprint::of`]
    /// (e.g. read back from storage). Not validated: storage is trusted to
    /// hold canonical values.
    pub fn from_storage(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
