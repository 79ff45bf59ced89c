//! NewType wrappers for identifiers that flow through the auth pipeline.
//!
//! Token hashes, API key hashes and principal ids are all "just" strings or
//! integers on the wire; wrapping them keeps a raw token from ever being
//! passed where its hash is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a string NewType with the usual conversions.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

/// Numeric identity of a principal as known to the identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(u64);

impl PrincipalId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for PrincipalId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for PrincipalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

newtype_string!(
    /// SHA-256 hex digest of a raw bearer token.
    ///
    /// Verified-token cache entries are keyed by this value so the raw
    /// token never lands in the cache backend.
    TokenHash
);

newtype_string!(
    /// SHA-256 hash of an API key for storage and lookup.
    ///
    /// Configured keys are hashed once at startup and presented keys are
    /// hashed before lookup; raw keys are never retained.
    ApiKeyHash
);

newtype_string!(
    /// Display prefix of an API key (e.g., "ag_1a2b3c4d").
    ///
    /// Safe to show in logs and listings; it cannot authenticate on its own.
    ApiKeyPrefix
);
