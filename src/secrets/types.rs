//! Secret records, references and validation findings.
//!
//! Values live in [`SecretString`] so `Debug` output never shows them; the
//! only plaintext serialization is [`SealedPayload`], which is encrypted
//! before it leaves memory.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::Environment;
use crate::error::SecretError;

/// Number of superseded versions retained per key.
pub const RETAINED_VERSIONS: usize = 10;

/// Placeholder written by `init` for keys that still need a value.
pub const INIT_PLACEHOLDER: &str = "CHANGE_ME";

/// Marker replacing secret values that carry no pinned reference.
pub const REDACTED: &str = "<redacted>";

const REFERENCE_PREFIX: &str = "${secret:";
const PIN_SCHEME: &str = "secret://";

/// Extracts the key from a `${secret:KEY}` reference.
#[must_use]
pub fn parse_reference(value: &str) -> Option<&str> {
    value
        .strip_prefix(REFERENCE_PREFIX)
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|key| is_valid_key(key))
}

/// Checks a secret key name: letters, digits, `_`, `-` and `.`, not
/// starting with a digit or punctuation.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    key.len() <= 253
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// A reference pinned to one immutable version of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PinnedRef {
    /// Secret key.
    pub key: String,
    /// Pinned version.
    pub version: u64,
}

impl PinnedRef {
    /// Parses `secret://KEY#vN`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::MalformedReference`] for anything else.
    pub fn parse(reference: &str) -> Result<Self, SecretError> {
        let malformed = || SecretError::MalformedReference {
            reference: reference.to_string(),
        };
        let rest = reference.strip_prefix(PIN_SCHEME).ok_or_else(malformed)?;
        let (key, version) = rest.rsplit_once("#v").ok_or_else(malformed)?;
        let version = version.parse::<u64>().map_err(|_| malformed())?;
        if !is_valid_key(key) || version == 0 {
            return Err(malformed());
        }
        Ok(Self {
            key: key.to_string(),
            version,
        })
    }
}

impl fmt::Display for PinnedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PIN_SCHEME}{}#v{}", self.key, self.version)
    }
}

impl TryFrom<String> for PinnedRef {
    type Error = SecretError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PinnedRef> for String {
    fn from(pin: PinnedRef) -> Self {
        pin.to_string()
    }
}

/// One version of a secret value.
#[derive(Debug)]
pub struct SecretVersion {
    /// The value.
    pub value: SecretString,
    /// Version number, starting at 1.
    pub version: u64,
    /// When this version was written.
    pub rotated_at: DateTime<Utc>,
}

impl Clone for SecretVersion {
    fn clone(&self) -> Self {
        Self {
            value: SecretString::from(self.value.expose_secret().to_string()),
            version: self.version,
            rotated_at: self.rotated_at,
        }
    }
}

/// A key with its current value and retained history.
#[derive(Debug, Clone)]
pub struct SecretEntry {
    /// Current version.
    pub current: SecretVersion,
    /// Superseded versions, newest first, at most [`RETAINED_VERSIONS`].
    pub previous: Vec<SecretVersion>,
}

impl SecretEntry {
    /// Creates an entry at version 1.
    #[must_use]
    pub fn new(value: SecretString, now: DateTime<Utc>) -> Self {
        Self {
            current: SecretVersion {
                value,
                version: 1,
                rotated_at: now,
            },
            previous: Vec::new(),
        }
    }

    /// Replaces the value, bumping the version and retaining the old one.
    pub fn bump(&mut self, value: SecretString, now: DateTime<Utc>) -> u64 {
        let next = SecretVersion {
            value,
            version: self.current.version + 1,
            rotated_at: now,
        };
        let old = std::mem::replace(&mut self.current, next);
        self.previous.insert(0, old);
        self.previous.truncate(RETAINED_VERSIONS);
        self.current.version
    }

    /// Looks up a specific version.
    #[must_use]
    pub fn version(&self, version: u64) -> Option<&SecretVersion> {
        std::iter::once(&self.current)
            .chain(self.previous.iter())
            .find(|v| v.version == version)
    }
}

/// All secret material of one environment.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    /// Owning environment.
    pub environment: Environment,
    /// Entries by key.
    pub entries: BTreeMap<String, SecretEntry>,
}

impl SecretRecord {
    /// Creates an empty record.
    #[must_use]
    pub const fn new(environment: Environment) -> Self {
        Self {
            environment,
            entries: BTreeMap::new(),
        }
    }

    /// Current version of every key, without values.
    #[must_use]
    pub fn versions(&self) -> BTreeMap<String, u64> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.current.version))
            .collect()
    }

    /// Metadata for display: key, version and rotation time.
    #[must_use]
    pub fn summary(&self) -> Vec<SecretSummary> {
        self.entries
            .iter()
            .map(|(key, entry)| SecretSummary {
                key: key.clone(),
                version: entry.current.version,
                last_rotated_at: entry.current.rotated_at,
                retained: entry.previous.len(),
            })
            .collect()
    }
}

/// Value-free description of a key.
#[derive(Debug, Clone, Serialize)]
pub struct SecretSummary {
    /// Secret key.
    pub key: String,
    /// Current version.
    pub version: u64,
    /// When the current version was written.
    pub last_rotated_at: DateTime<Utc>,
    /// Number of retained older versions.
    pub retained: usize,
}

/// Plaintext form of a record; only ever serialized straight into the sealer.
#[derive(Serialize, Deserialize)]
pub struct SealedPayload {
    environment: Environment,
    entries: BTreeMap<String, Vec<PayloadVersion>>,
}

#[derive(Serialize, Deserialize)]
struct PayloadVersion {
    version: u64,
    value: String,
    rotated_at: DateTime<Utc>,
}

impl From<&SecretRecord> for SealedPayload {
    fn from(record: &SecretRecord) -> Self {
        let to_payload = |v: &SecretVersion| PayloadVersion {
            version: v.version,
            value: v.value.expose_secret().to_string(),
            rotated_at: v.rotated_at,
        };
        Self {
            environment: record.environment,
            entries: record
                .entries
                .iter()
                .map(|(key, entry)| {
                    let versions = std::iter::once(&entry.current)
                        .chain(entry.previous.iter())
                        .map(to_payload)
                        .collect();
                    (key.clone(), versions)
                })
                .collect(),
        }
    }
}

impl TryFrom<SealedPayload> for SecretRecord {
    type Error = SecretError;

    fn try_from(payload: SealedPayload) -> Result<Self, Self::Error> {
        let mut entries = BTreeMap::new();
        for (key, versions) in payload.entries {
            let mut versions = versions.into_iter().map(|v| SecretVersion {
                value: SecretString::from(v.value),
                version: v.version,
                rotated_at: v.rotated_at,
            });
            let current = versions.next().ok_or_else(|| SecretError::Unseal {
                message: format!("key '{key}' has no versions"),
            })?;
            entries.insert(
                key,
                SecretEntry {
                    current,
                    previous: versions.take(RETAINED_VERSIONS).collect(),
                },
            );
        }
        Ok(Self {
            environment: payload.environment,
            entries,
        })
    }
}

impl SealedPayload {
    /// Environment the payload belongs to.
    #[must_use]
    pub const fn environment(&self) -> Environment {
        self.environment
    }
}

/// A problem found by secret validation. Never carries the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum SecretIssue {
    /// The value matches a placeholder pattern.
    PlaceholderFound {
        /// Offending key.
        key: String,
    },
    /// The value is empty or whitespace.
    EmptyValue {
        /// Offending key.
        key: String,
    },
    /// The key name is not acceptable.
    MalformedKey {
        /// Offending key.
        key: String,
    },
    /// A manifest references a key that does not exist.
    MissingKey {
        /// Referenced key.
        key: String,
    },
}

impl fmt::Display for SecretIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlaceholderFound { key } => write!(f, "{key}: placeholder value"),
            Self::EmptyValue { key } => write!(f, "{key}: empty value"),
            Self::MalformedKey { key } => write!(f, "{key}: malformed key"),
            Self::MissingKey { key } => write!(f, "{key}: referenced but not set"),
        }
    }
}

/// How validation failures are treated for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Failures block the caller.
    Fatal,
    /// Failures are logged as warnings.
    Warn,
}

impl ValidationPolicy {
    /// Policy for an environment: production is fatal.
    #[must_use]
    pub const fn for_environment(environment: Environment) -> Self {
        if environment.is_production() {
            Self::Fatal
        } else {
            Self::Warn
        }
    }
}

/// Outcome of validating an environment's secrets.
#[derive(Debug, Clone, Serialize)]
pub struct SecretValidation {
    /// Environment validated.
    pub environment: Environment,
    /// Policy applied.
    pub policy: ValidationPolicy,
    /// Issues found, in key order.
    pub issues: Vec<SecretIssue>,
}

impl SecretValidation {
    /// Returns true if no issues were found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Explicit acknowledgement required to reveal one secret value.
#[derive(Debug, Clone)]
pub struct RevealAcknowledgement {
    /// Who asked.
    pub requested_by: String,
    /// Why.
    pub reason: String,
}

impl RevealAcknowledgement {
    /// Creates an acknowledgement.
    #[must_use]
    pub fn new(requested_by: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            requested_by: requested_by.into(),
            reason: reason.into(),
        }
    }
}

const PLACEHOLDER_PATTERNS: &[&str] = &[
    "CHANGE_ME",
    "CHANGEME",
    "REPLACE_ME",
    "TODO",
    "FIXME",
    "PLACEHOLDER",
    "XXX",
];

/// Returns true if a value looks like a placeholder.
#[must_use]
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.len() > 2 && trimmed.starts_with('<') && trimmed.ends_with('>') {
        return true;
    }
    let upper = trimmed.to_ascii_uppercase();
    upper
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|token| PLACEHOLDER_PATTERNS.contains(&token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        assert_eq!(parse_reference("${secret:DB_PASSWORD}"), Some("DB_PASSWORD"));
        assert_eq!(parse_reference("${secret:}"), None);
        assert_eq!(parse_reference("hunter2"), None);
        assert_eq!(parse_reference("${secret:bad key}"), None);
    }

    #[test]
    fn test_pinned_ref_parse() {
        let pin = PinnedRef::parse("secret://api.token#v12").unwrap();
        assert_eq!(pin.key, "api.token");
        assert_eq!(pin.version, 12);
        assert_eq!(pin.to_string(), "secret://api.token#v12");

        assert!(PinnedRef::parse("secret://KEY").is_err());
        assert!(PinnedRef::parse("secret://KEY#v0").is_err());
        assert!(PinnedRef::parse("vault://KEY#v1").is_err());
    }

    #[test]
    fn test_placeholder_patterns() {
        assert!(is_placeholder("CHANGE_ME"));
        assert!(is_placeholder("please-changeme"));
        assert!(is_placeholder("<your token here>"));
        assert!(is_placeholder("todo"));
        assert!(!is_placeholder("s3cr3t-Value"));
        assert!(!is_placeholder("mastodon"));
        assert!(!is_placeholder("<>"));
    }

    #[test]
    fn test_entry_retains_bounded_history() {
        let now = Utc::now();
        let mut entry = SecretEntry::new(SecretString::from("v1"), now);
        for i in 2..=15 {
            assert_eq!(entry.bump(SecretString::from(format!("v{i}")), now), i);
        }
        assert_eq!(entry.current.version, 15);
        assert_eq!(entry.previous.len(), RETAINED_VERSIONS);
        assert!(entry.version(14).is_some());
        assert!(entry.version(5).is_some());
        assert!(entry.version(4).is_none());
    }

    #[test]
    fn test_debug_never_shows_values() {
        let mut record = SecretRecord::new(Environment::Prod);
        record
            .entries
            .insert(String::from("DB"), SecretEntry::new(SecretString::from("hunter2"), Utc::now()));
        let debug = format!("{record:?}");
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_policy_by_environment() {
        assert_eq!(ValidationPolicy::for_environment(Environment::Prod), ValidationPolicy::Fatal);
        assert_eq!(ValidationPolicy::for_environment(Environment::Dev), ValidationPolicy::Warn);
    }
}
