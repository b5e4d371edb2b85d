use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");

/// Prefix of every event bridge global. Lifecycle bridges use `sio_on_`
/// and the client object lives in `sio_client`, so the namespaces never meet.
pub const EVENT_IDENTIFIER_PREFIX: &str = "sio_evt_";

/// Digest bytes kept in an identifier (128 bits).
const DIGEST_BYTES: usize = 16;

/// Engine-global name under which the bridge for one event name is installed.
///
/// Derived from SHA-256 of the event name, so the same name maps to the same
/// identifier in every process. Collisions are not corrected here; the event
/// registry refuses a second name that lands on an occupied identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventIdentifier(String);

impl EventIdentifier {
    pub fn for_event(event_name: &str) -> Self {
        let digest = Sha256::digest(event_name.as_bytes());
        let mut id = String::with_capacity(EVENT_IDENTIFIER_PREFIX.len() + DIGEST_BYTES * 2);
        id.push_str(EVENT_IDENTIFIER_PREFIX);
        for byte in &digest[..DIGEST_BYTES] {
            let _ = write!(id, "{byte:02x}");
        }
        Self(id)
    }

    /// Wrap an already-computed identifier. Only used where a specific value
    /// is required, e.g. exercising collision handling.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
