//! Session identifier type and identity derivation.

use std::borrow::Borrow;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SessionError;
use crate::Result;

/// Prefix of every derived session ID.
pub const SESSION_ID_PREFIX: &str = "sess_";

/// Number of digest bytes kept in a derived ID (64 bits).
const HASH_BYTES: usize = 8;

/// Global counter mixed into fresh salts.
static FRESH_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of a pooled session.
///
/// Derived IDs look like `sess_0123456789abcdef`: the prefix followed by the
/// first 64 bits of a SHA-256 digest over the canonical JSON form of the
/// connection configuration. Arbitrary caller-chosen strings are accepted
/// too via [`SessionId::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a caller-supplied identifier verbatim.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an ID from a connection configuration.
    ///
    /// With `salt = None` the result is stable: the same configuration always
    /// maps to the same session, which is what makes pooling work. Passing a
    /// salt forces a distinct ID for an otherwise identical configuration.
    ///
    /// Object keys are sorted before hashing, so map ordering inside the
    /// configuration does not affect the result.
    pub fn derive<T>(config: &T, salt: Option<&str>) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value =
            serde_json::to_value(config).map_err(|e| SessionError::Identity(e.to_string()))?;
        let bytes = serde_json::to_vec(&canonicalize(value))
            .map_err(|e| SessionError::Identity(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        if let Some(salt) = salt {
            hasher.update([0u8]);
            hasher.update(salt.as_bytes());
        }
        let digest = hasher.finalize();

        let mut id = String::with_capacity(SESSION_ID_PREFIX.len() + HASH_BYTES * 2);
        id.push_str(SESSION_ID_PREFIX);
        for byte in &digest[..HASH_BYTES] {
            let _ = write!(&mut id, "{byte:02x}");
        }
        Ok(Self(id))
    }

    /// Derive an ID that is unique to this call, even for a configuration
    /// that has been seen before.
    pub fn fresh<T>(config: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let salt = format!(
            "{}-{}-{}",
            std::process::id(),
            nanos,
            FRESH_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self::derive(config, Some(&salt))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this ID has the shape produced by [`SessionId::derive`].
    pub fn is_derived(&self) -> bool {
        self.0
            .strip_prefix(SESSION_ID_PREFIX)
            .is_some_and(|hex| {
                hex.len() == HASH_BYTES * 2 && hex.bytes().all(|b| b.is_ascii_hexdigit())
            })
    }
}

/// Derive a session ID from a configuration and optional freshness salt.
///
/// See [`SessionId::derive`].
pub fn derive_session_id<T>(config: &T, salt: Option<&str>) -> Result<SessionId>
where
    T: Serialize + ?Sized,
{
    SessionId::derive(config, salt)
}

/// Rebuild objects with sorted keys so the serialized form is independent of
/// insertion order, whichever map backend serde_json was built with.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
