//! NewType wrappers for strong typing throughout the scheduler.
//!
//! These types prevent accidental mixing of semantically different values
//! (e.g., passing a hardware address where a task name is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
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

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Dotted hardware/configuration address (e.g., "AWG1.CH1.Waveform").
    ///
    /// Commands target addresses, side effects are keyed by them, and the
    /// device configuration tree is queried with them.
    Address
);

newtype_string!(
    /// Human-readable task name used in logs and persisted records.
    TaskName
);

newtype_string!(
    /// Name of an exclusive hardware resource (e.g., a physical channel).
    ResourceName
);

newtype_string!(
    /// Salted SHA-256 hex digest of a user password.
    PasswordHash
);

/// Numeric task identifier, assigned once at first submission.
///
/// Id `0` is reserved for commands the scheduler itself issues (configuration
/// writes through [`crate::Scheduler::set`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Id used for out-of-band commands issued by the scheduler itself.
    pub const SYSTEM: TaskId = TaskId(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
