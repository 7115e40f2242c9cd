//! Filter sets: the optional dimensions that narrow a ledger query.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use unicode_normalization::UnicodeNormalization as _;

const CONSOLIDATED_SUFFIX: &str = "(consolidated)";
const PRIMARY_BOOK: u32 = 1;

/// Filter dimensions exactly as the formula supplied them.
///
/// Every dimension is optional; `None`, an empty string and `"All"` mean the
/// same thing (no restriction). An omitted accounting book means the primary
/// book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    pub subsidiary: Option<String>,
    pub department: Option<String>,
    pub location: Option<String>,
    pub class: Option<String>,
    pub accounting_book: Option<String>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subsidiary(mut self, value: impl Into<String>) -> Self {
        self.subsidiary = Some(value.into());
        self
    }

    pub fn department(mut self, value: impl Into<String>) -> Self {
        self.department = Some(value.into());
        self
    }

    pub fn location(mut self, value: impl Into<String>) -> Self {
        self.location = Some(value.into());
        self
    }

    pub fn class(mut self, value: impl Into<String>) -> Self {
        self.class = Some(value.into());
        self
    }

    pub fn accounting_book(mut self, value: impl Into<String>) -> Self {
        self.accounting_book = Some(value.into());
        self
    }

    /// Normalize into the form used for keys and collaborator calls.
    pub fn canonicalize(&self) -> Result<CanonicalFilters, String> {
        let (subsidiary, consolidated) = match normalize_dimension(self.subsidiary.as_deref()) {
            Some(name) => match strip_consolidated(&name) {
                Some(base) => {
                    if base.is_empty() {
                        return Err("subsidiary name is missing before (Consolidated)".to_string());
                    }
                    (Some(base.to_string()), true)
                }
                None => (Some(name), false),
            },
            None => (None, false),
        };

        let accounting_book = match normalize_dimension(self.accounting_book.as_deref()) {
            None => PRIMARY_BOOK,
            Some(book) => book
                .parse::<u32>()
                .map_err(|_| format!("accounting book must be a numeric id, got {book:?}"))?,
        };

        Ok(CanonicalFilters {
            subsidiary,
            consolidated,
            department: normalize_dimension(self.department.as_deref()),
            location: normalize_dimension(self.location.as_deref()),
            class: normalize_dimension(self.class.as_deref()),
            accounting_book,
        })
    }
}

/// Normalized filter set.
///
/// Values keep the caller's spelling (trimmed, whitespace collapsed, NFKC) so
/// the ledger can match names exactly. Identity ignores case: equality,
/// hashing and [`FilterSetHash`] all go through [`Self::canonical_string`],
/// so two `FilterSet`s that mean the same thing compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalFilters {
    pub subsidiary: Option<String>,
    pub consolidated: bool,
    pub department: Option<String>,
    pub location: Option<String>,
    pub class: Option<String>,
    pub accounting_book: u32,
}

impl Default for CanonicalFilters {
    fn default() -> Self {
        Self {
            subsidiary: None,
            consolidated: false,
            department: None,
            location: None,
            class: None,
            accounting_book: PRIMARY_BOOK,
        }
    }
}

impl PartialEq for CanonicalFilters {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_string() == other.canonical_string()
    }
}

impl Eq for CanonicalFilters {}

impl Hash for CanonicalFilters {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_string().hash(state);
    }
}

impl CanonicalFilters {
    /// Case-folded identity of the filter set.
    pub fn canonical_string(&self) -> String {
        let dim = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| escape_component(&fold_case(v)))
                .unwrap_or_default()
        };
        format!(
            "sub={}|cons={}|dept={}|loc={}|class={}|book={}",
            dim(&self.subsidiary),
            u8::from(self.consolidated),
            dim(&self.department),
            dim(&self.location),
            dim(&self.class),
            self.accounting_book,
        )
    }

    pub fn hash(&self) -> FilterSetHash {
        let digest = Sha256::digest(self.canonical_string().as_bytes());
        let mut hex = String::with_capacity(16);
        for byte in &digest[..8] {
            hex.push_str(&format!("{byte:02x}"));
        }
        FilterSetHash(hex)
    }
}

/// Short stable digest of a [`CanonicalFilters`], used in manifest topics and
/// as the leading component of canonical keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FilterSetHash(String);

impl FilterSetHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterSetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// NFKC, collapse internal whitespace; empty or `all` (any case) means "no filter".
fn normalize_dimension(raw: Option<&str>) -> Option<String> {
    let normalized: String = raw?.nfkc().collect();
    let collapsed = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.eq_ignore_ascii_case("all") {
        None
    } else {
        Some(collapsed)
    }
}

fn fold_case(value: &str) -> String {
    value.chars().flat_map(char::to_lowercase).collect()
}

/// `Celigo Inc. (Consolidated)` -> `Some("Celigo Inc.")`, suffix matched in any case.
fn strip_consolidated(name: &str) -> Option<&str> {
    let split = name.len().checked_sub(CONSOLIDATED_SUFFIX.len())?;
    if !name.is_char_boundary(split) || !name[split..].eq_ignore_ascii_case(CONSOLIDATED_SUFFIX) {
        return None;
    }
    Some(name[..split].trim_end())
}

/// Escape the characters that delimit canonical keys and persisted topics.
pub(crate) fn escape_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            ':' => out.push_str("%3A"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_empty_and_all_are_equivalent() {
        let a = FilterSet::new().canonicalize().unwrap();
        let b = FilterSet::new()
            .department("")
            .location("All")
            .class("  ")
            .canonicalize()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn names_compare_case_and_width_insensitively() {
        let a = FilterSet::new()
            .subsidiary("Celigo  Inc.")
            .canonicalize()
            .unwrap();
        let b = FilterSet::new()
            .subsidiary(" CELIGO inc. ")
            .canonicalize()
            .unwrap();
        // Fullwidth Latin letters normalize to ASCII under NFKC.
        let c = FilterSet::new()
            .subsidiary("ＣＥＬＩＧＯ Inc.")
            .canonicalize()
            .unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash(), c.hash());
    }

    #[test]
    fn consolidated_suffix_becomes_a_flag() {
        let plain = FilterSet::new().subsidiary("Celigo Inc.").canonicalize().unwrap();
        let consolidated = FilterSet::new()
            .subsidiary("Celigo Inc. (Consolidated)")
            .canonicalize()
            .unwrap();
        assert_eq!(consolidated.subsidiary.as_deref(), Some("Celigo Inc."));
        assert!(consolidated.consolidated);
        assert_ne!(plain.hash(), consolidated.hash());

        let shouted = FilterSet::new()
            .subsidiary("Celigo Inc. (CONSOLIDATED)")
            .canonicalize()
            .unwrap();
        assert_eq!(shouted, consolidated);
        assert!(FilterSet::new().subsidiary("(Consolidated)").canonicalize().is_err());
    }

    #[test]
    fn values_keep_the_callers_spelling() {
        let filters = FilterSet::new()
            .subsidiary("  Celigo   Inc. ")
            .department("Sales")
            .location("ALL")
            .canonicalize()
            .unwrap();
        assert_eq!(filters.subsidiary.as_deref(), Some("Celigo Inc."));
        assert_eq!(filters.department.as_deref(), Some("Sales"));
        assert_eq!(filters.location, None);

        let lower = FilterSet::new()
            .subsidiary("celigo inc.")
            .department("sales")
            .canonicalize()
            .unwrap();
        assert_eq!(filters, lower);
        assert_eq!(filters.hash(), lower.hash());
    }

    #[test]
    fn accounting_book_defaults_to_primary() {
        let omitted = FilterSet::new().canonicalize().unwrap();
        let explicit = FilterSet::new().accounting_book("01").canonicalize().unwrap();
        let secondary = FilterSet::new().accounting_book("2").canonicalize().unwrap();
        assert_eq!(omitted.hash(), explicit.hash());
        assert_ne!(omitted.hash(), secondary.hash());
        assert!(FilterSet::new().accounting_book("main").canonicalize().is_err());
    }

    #[test]
    fn delimiters_inside_values_cannot_forge_other_dimensions() {
        let forged = FilterSet::new()
            .department("x|loc=y")
            .canonicalize()
            .unwrap();
        let honest = FilterSet::new()
            .department("x")
            .location("y")
            .canonicalize()
            .unwrap();
        assert_ne!(forged.canonical_string(), honest.canonical_string());
        assert_eq!(forged.hash().as_str().len(), 16);
    }
}
