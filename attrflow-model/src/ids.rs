//! Client-side identifiers.
//!
//! Every entity receives a [`ClientId`] at construction: a tag prefix plus a
//! process-wide monotonic counter (`c1`, `c2`, ...). It never changes, unlike
//! the entity's configured identity attribute.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Default prefix for generated client ids.
pub const DEFAULT_CID_PREFIX: &str = "c";

/// Process-unique client identifier of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generates the next client id with the given prefix.
    #[must_use]
    pub fn next(prefix: &str) -> Self {
        let n = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("{prefix}{n}"))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
