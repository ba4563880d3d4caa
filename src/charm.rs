//! Charm store identifier parsing
//!
//! A charm store id is a slash-delimited reference of up to three segments,
//! optionally prefixed with the `cs:` scheme:
//!
//! - `mysql` — bare name, default series applied
//! - `trusty/mysql-26` — series plus name and revision
//! - `~openstack-charmers/trusty/mysql-26` — owner, series, name, revision
//!
//! The trailing `-NN` suffix is only treated as a revision when it is purely
//! numeric; `ceph-osd` is a name, `ceph-osd-2` is `ceph-osd` at revision 2.
//! A series of `bundle` marks the id as referring to a bundle template rather
//! than a charm.
//!
//! Parsing is deliberately infallible: malformed input degrades to a
//! best-effort, name-only id (see [`ParseConfidence`]) instead of erroring.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Series applied to bare charm names that carry no series segment.
pub const DEFAULT_SERIES: &str = "xenial";

/// What kind of entity a charm store id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreIdKind {
    /// A deployable charm
    #[default]
    Charm,
    /// A bundle template (reserved series `bundle`)
    Bundle,
}

/// How much structure the parser recovered from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseConfidence {
    /// Owner/series/name/revision recovered as expected
    #[default]
    Full,
    /// Input did not match any known shape; the whole string became the name
    NameOnly,
}

/// A parsed charm store identifier
///
/// Immutable once parsed. Two ids compare equal when their canonical
/// (revision-stripped) renderings match.
#[derive(Debug, Clone)]
pub struct CharmStoreId {
    kind: StoreIdKind,
    owner: Option<String>,
    series: String,
    name: String,
    rev: Option<String>,
    confidence: ParseConfidence,
}

impl CharmStoreId {
    /// Parse a raw identifier string
    ///
    /// Never fails; unrecognized shapes produce a [`ParseConfidence::NameOnly`]
    /// id whose name is the scheme-stripped input.
    pub fn parse(raw: &str) -> Self {
        let stripped = raw.strip_prefix("cs:").unwrap_or(raw);
        let segments: Vec<&str> = stripped.split('/').collect();

        let (owner, series, namerev, confidence) = match segments.as_slice() {
            [namerev] => (None, DEFAULT_SERIES.to_string(), *namerev, ParseConfidence::Full),
            [series, namerev] => (None, (*series).to_string(), *namerev, ParseConfidence::Full),
            [owner, series, namerev] => {
                let owner = owner.strip_prefix('~').unwrap_or(owner);
                (
                    Some(owner.to_string()),
                    (*series).to_string(),
                    *namerev,
                    ParseConfidence::Full,
                )
            }
            _ => (None, String::new(), stripped, ParseConfidence::NameOnly),
        };

        let (name, rev) = match confidence {
            ParseConfidence::Full => split_name_rev(namerev),
            ParseConfidence::NameOnly => (namerev.to_string(), None),
        };

        let confidence = if name.is_empty() {
            ParseConfidence::NameOnly
        } else {
            confidence
        };

        let kind = if series == "bundle" {
            StoreIdKind::Bundle
        } else {
            StoreIdKind::Charm
        };

        CharmStoreId {
            kind,
            owner,
            series,
            name,
            rev,
            confidence,
        }
    }

    /// Canonical rendering without the revision: `cs:[~owner/][series/]name`
    pub fn canonical(&self) -> String {
        let mut s = String::from("cs:");
        if let Some(owner) = &self.owner {
            s.push('~');
            s.push_str(owner);
            s.push('/');
        }
        if !self.series.is_empty() {
            s.push_str(&self.series);
            s.push('/');
        }
        s.push_str(&self.name);
        s
    }

    /// Full rendering: [`canonical`](Self::canonical) with `-rev` appended
    /// when a revision is present
    pub fn full(&self) -> String {
        let mut s = self.canonical();
        if let Some(rev) = &self.rev {
            s.push('-');
            s.push_str(rev);
        }
        s
    }

    pub fn kind(&self) -> StoreIdKind {
        self.kind
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    pub fn confidence(&self) -> ParseConfidence {
        self.confidence
    }

    /// Whether the parser recovered the full owner/series/name structure
    pub fn is_fully_parsed(&self) -> bool {
        self.confidence == ParseConfidence::Full
    }
}

/// Split a `name-rev` segment, treating the suffix as a revision only when it
/// is purely numeric.
fn split_name_rev(namerev: &str) -> (String, Option<String>) {
    match namerev.rsplit_once('-') {
        Some((name, rev)) if !rev.is_empty() && rev.chars().all(|c| c.is_ascii_digit()) => {
            (name.to_string(), Some(rev.to_string()))
        }
        _ => (namerev.to_string(), None),
    }
}

impl PartialEq for CharmStoreId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for CharmStoreId {}

impl Hash for CharmStoreId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for CharmStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full())
    }
}
