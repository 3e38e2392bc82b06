use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique token identifying one acquisition of a claim.
///
/// Tokens are UUID v7 so they sort by acquisition time. A holder proves
/// ownership of a claim by presenting its token to the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimToken({})", &self.0.simple().to_string()[..12])
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time-bounded exclusive right to act on one ledger entry.
///
/// A claim that is not renewed before `expires_at` lapses; any component may
/// then release it and another worker may take over the entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: ClaimToken,
    /// Human-readable holder name, for diagnostics only.
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// Time of the latest renewal; `acquired_at` until the first one.
    pub renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token: ClaimToken::new(),
            owner: owner.into(),
            acquired_at: now,
            renewed_at: now,
            expires_at: now + ttl,
        }
    }

    /// Returns `true` while the lease has not lapsed.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Extend the lease to `now + ttl`. Expiry never moves backwards.
    pub fn renewed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            renewed_at: self.renewed_at.max(now),
            expires_at: self.expires_at.max(now + ttl),
            ..self.clone()
        }
    }

    /// How long the claim has been held.
    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.acquired_at
    }
}
