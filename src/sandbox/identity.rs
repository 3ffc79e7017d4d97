use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum length of a canonical id and of a runtime unit name.
pub const MAX_ID_LEN: usize = 63;

/// Length of the hash-derived fallback id.
const HASH_ID_LEN: usize = 16;

/// A sanitized, bounded, deterministic sandbox identifier.
///
/// Always matches `^[a-z0-9._-]{1,63}$` and is never made only of dots, so it
/// is safe to use as a path component and as a cache key suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    /// Canonicalize an arbitrary caller-supplied identifier. Never fails.
    pub fn new(raw: &str) -> Self {
        Self(canonicalize(raw))
    }

    /// Accept a string only if it is already in canonical form.
    pub fn parse(s: &str) -> Option<Self> {
        let canonical = canonicalize(s);
        (canonical == s).then_some(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase, collapse runs of characters outside `[a-z0-9._-]` into a single
/// hyphen, trim hyphens at both ends and bound the result to 63 characters.
/// Falls back to a 16-character hash of the input when nothing usable remains.
pub fn canonicalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_ID_LEN + 1));
    let mut pending_hyphen = false;

    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-' {
            if out.is_empty() && c == '-' {
                pending_hyphen = false;
                continue;
            }
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
        if out.len() > MAX_ID_LEN {
            break;
        }
    }

    let mut canonical: String = out.trim_matches('-').chars().take(MAX_ID_LEN).collect();
    // Truncation can expose a new trailing hyphen.
    while canonical.ends_with('-') {
        canonical.pop();
    }

    if canonical.is_empty() || canonical.chars().all(|c| c == '.') {
        return hash_id(raw);
    }
    canonical
}

/// First 16 hex characters of the SHA-256 of `input`.
pub fn hash_id(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(HASH_ID_LEN);
    for byte in digest.iter().take(HASH_ID_LEN / 2) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// How runtime unit names are derived. Chosen once per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingScheme {
    /// Prefix + canonical id, with `.`/`_` mapped to `-`.
    #[default]
    Canonical,
    /// Prefix + raw id filtered to `[A-Za-z0-9_-]`, case preserved.
    Legacy,
}

/// Derives runtime unit names from sandbox ids under a fixed namespace prefix.
#[derive(Debug, Clone)]
pub struct UnitNamer {
    prefix: String,
    scheme: NamingScheme,
}

impl UnitNamer {
    pub fn new(prefix: impl Into<String>, scheme: NamingScheme) -> Self {
        Self {
            prefix: prefix.into(),
            scheme,
        }
    }

    pub fn scheme(&self) -> NamingScheme {
        self.scheme
    }

    /// Unit name for a canonical id under the configured scheme.
    pub fn unit_name(&self, id: &CanonicalId) -> String {
        match self.scheme {
            NamingScheme::Canonical => self.canonical_unit_name(id),
            NamingScheme::Legacy => container_name(&self.prefix, id.as_str()),
        }
    }

    fn canonical_unit_name(&self, id: &CanonicalId) -> String {
        let body: String = id
            .as_str()
            .chars()
            .map(|c| if c == '.' || c == '_' { '-' } else { c })
            .collect();
        bound_name(format!("{}{}", self.prefix, body))
    }
}

/// Legacy container name: keeps only `[A-Za-z0-9_-]` of the raw id (no
/// lowercasing) behind `prefix`. Not interchangeable with [`canonicalize`].
pub fn container_name(prefix: &str, raw: &str) -> String {
    let body: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    bound_name(format!("{}{}", prefix, body))
}

fn bound_name(name: String) -> String {
    let mut name: String = name.chars().take(MAX_ID_LEN).collect();
    while name.ends_with('-') || name.ends_with('_') {
        name.pop();
    }
    name
}
