//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

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
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
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
    /// Name of a layer, unique within a recipe.
    LayerName
);

string_newtype!(
    /// 64-character hex digest identifying a build node and its transitive inputs.
    Fingerprint
);

string_newtype!(
    /// OCI content digest in `<algorithm>:<hex>` form.
    Digest
);

impl Fingerprint {
    /// Truncated 12-character prefix, used for display and lock file names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl Digest {
    /// Build a `sha256:<hex>` digest from raw hash output.
    pub fn sha256(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(bytes)))
    }

    /// The algorithm part (`sha256`), or the whole string when no `:` is present.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(a, _)| a)
    }

    /// The hex-encoded part after the `:`.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, h)| h)
    }

    /// True when the digest is a well-formed `sha256:` digest.
    pub fn is_valid_sha256(&self) -> bool {
        self.algorithm() == "sha256"
            && self.hex().len() == 64
            && self.hex().bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_name_display_and_as_ref() {
        let name = LayerName::new("base");
        assert_eq!(name.to_string(), "base");
        assert_eq!(name.as_str(), "base");
        assert_eq!(name, "base");
    }

    #[test]
    fn fingerprint_serde_is_transparent() {
        let fp = Fingerprint::new("deadbeef");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn fingerprint_short_prefix() {
        let fp = Fingerprint::new("0123456789abcdef0123");
        assert_eq!(fp.short(), "0123456789ab");
        assert_eq!(Fingerprint::new("abc").short(), "abc");
    }

    #[test]
    fn digest_parts() {
        let d = Digest::sha256(&[0xab; 32]);
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.hex().len(), 64);
        assert!(d.is_valid_sha256());
    }

    #[test]
    fn digest_rejects_malformed() {
        assert!(!Digest::new("sha256:xyz").is_valid_sha256());
        assert!(!Digest::new("md5:abcd").is_valid_sha256());
        assert!(!Digest::new(format!("sha256:{}", "A".repeat(64))).is_valid_sha256());
    }
}
