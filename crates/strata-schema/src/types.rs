//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so state records stay
//! readable with ordinary JSON tooling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a layer, e.g. `03-database`. Unique within a pipeline.
    LayerName
);

string_newtype!(
    /// Name of an environment (workspace), e.g. `dev` or `production`.
    EnvName
);

string_newtype!(
    /// Hex blake3 digest over a layer's provisioning inputs.
    Fingerprint
);

string_newtype!(
    /// Opaque identifier handed out by a resource provider.
    ResourceHandle
);

impl Fingerprint {
    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_name_display_and_as_ref() {
        let name = LayerName::new("03-database");
        assert_eq!(name.to_string(), "03-database");
        assert_eq!(name.as_str(), "03-database");
        assert_eq!(AsRef::<str>::as_ref(&name), "03-database");
        assert_eq!(name, "03-database");
    }

    #[test]
    fn env_name_serializes_as_plain_string() {
        let env = EnvName::new("staging");
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, "\"staging\"");
        let back: EnvName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn fingerprint_short_prefix() {
        let fp = Fingerprint::new("0123456789abcdef0123");
        assert_eq!(fp.short(), "0123456789ab");
        assert_eq!(Fingerprint::new("abc").short(), "abc");
    }

    #[test]
    fn handles_order_lexically() {
        let mut handles = vec![ResourceHandle::from("res-b"), ResourceHandle::from("res-a")];
        handles.sort();
        assert_eq!(handles[0], "res-a");
    }
}
