//! External image references and the scheme registry that parses them.
//!
//! A reference is written `<scheme>:<rest>`. The registry maps each scheme to
//! a parser; `oci:` and `docker:` are registered by default and callers may
//! add their own before loading a recipe.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("unknown image reference scheme '{0}'")]
    UnknownScheme(String),
    #[error("invalid image reference '{reference}': {reason}")]
    Invalid { reference: String, reason: String },
}

/// A parsed reference to an image outside the recipe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImageRef {
    /// A tag inside a local OCI layout directory.
    Oci { dir: PathBuf, tag: String },
    /// A registry reference, resolved by an external copy tool.
    Docker { reference: String },
    /// A reference handled by a caller-registered scheme.
    Other { scheme: String, reference: String },
}

impl ImageRef {
    pub fn scheme(&self) -> &str {
        match self {
            Self::Oci { .. } => "oci",
            Self::Docker { .. } => "docker",
            Self::Other { scheme, .. } => scheme,
        }
    }

    /// A tag name safe for use inside an OCI layout index.
    pub fn cache_tag(&self) -> String {
        let raw = self.to_string();
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oci { dir, tag } => write!(f, "oci:{}:{tag}", dir.display()),
            Self::Docker { reference } => write!(f, "docker:{reference}"),
            Self::Other { scheme, reference } => write!(f, "{scheme}:{reference}"),
        }
    }
}

/// Parses the part of a reference after `<scheme>:`.
pub type SchemeParser = fn(&str) -> Result<ImageRef, ReferenceError>;

/// Injectable map from scheme name to parser.
#[derive(Clone)]
pub struct SchemeRegistry {
    parsers: BTreeMap<String, SchemeParser>,
}

impl fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemeRegistry")
            .field("schemes", &self.parsers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("oci", parse_oci);
        registry.register("docker", parse_docker);
        registry
    }
}

impl SchemeRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, scheme: &str, parser: SchemeParser) {
        self.parsers.insert(scheme.to_owned(), parser);
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.parsers.keys().map(String::as_str)
    }

    /// True when `input` starts with a registered `<scheme>:` prefix.
    pub fn is_reference(&self, input: &str) -> bool {
        input
            .split_once(':')
            .is_some_and(|(scheme, _)| self.parsers.contains_key(scheme))
    }

    pub fn parse(&self, input: &str) -> Result<ImageRef, ReferenceError> {
        let (scheme, rest) = input.split_once(':').ok_or_else(|| ReferenceError::Invalid {
            reference: input.to_owned(),
            reason: "missing '<scheme>:' prefix".to_owned(),
        })?;
        let parser = self
            .parsers
            .get(scheme)
            .ok_or_else(|| ReferenceError::UnknownScheme(scheme.to_owned()))?;
        parser(rest)
    }
}

/// `oci:<dir>:<tag>`; the tag is everything after the last `:`.
pub fn parse_oci(rest: &str) -> Result<ImageRef, ReferenceError> {
    let invalid = |reason: &str| ReferenceError::Invalid {
        reference: format!("oci:{rest}"),
        reason: reason.to_owned(),
    };
    let (dir, tag) = rest
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected oci:<dir>:<tag>"))?;
    if dir.is_empty() {
        return Err(invalid("empty layout directory"));
    }
    if tag.is_empty() || tag.contains('/') {
        return Err(invalid("invalid tag"));
    }
    Ok(ImageRef::Oci {
        dir: PathBuf::from(dir),
        tag: tag.to_owned(),
    })
}

/// `docker:<ref>` or `docker://<ref>`.
pub fn parse_docker(rest: &str) -> Result<ImageRef, ReferenceError> {
    let reference = rest.trim_start_matches("//");
    if reference.is_empty() {
        return Err(ReferenceError::Invalid {
            reference: format!("docker:{rest}"),
            reason: "empty registry reference".to_owned(),
        });
    }
    Ok(ImageRef::Docker {
        reference: format!("//{reference}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oci_with_tag() {
        let r = SchemeRegistry::default().parse("oci:dir/oci:foo").unwrap();
        assert_eq!(
            r,
            ImageRef::Oci {
                dir: PathBuf::from("dir/oci"),
                tag: "foo".to_owned()
            }
        );
        assert_eq!(r.to_string(), "oci:dir/oci:foo");
    }

    #[test]
    fn oci_requires_tag() {
        assert!(SchemeRegistry::default().parse("oci:dir").is_err());
        assert!(SchemeRegistry::default().parse("oci:dir:").is_err());
    }

    #[test]
    fn docker_normalizes_slashes() {
        let reg = SchemeRegistry::default();
        let a = reg.parse("docker://alpine:3.19").unwrap();
        let b = reg.parse("docker:alpine:3.19").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "docker://alpine:3.19");
    }

    #[test]
    fn unknown_scheme_rejected() {
        let err = SchemeRegistry::default().parse("ftp:thing").unwrap_err();
        assert_eq!(err, ReferenceError::UnknownScheme("ftp".to_owned()));
    }

    #[test]
    fn custom_scheme_can_be_registered() {
        fn parse_zot(rest: &str) -> Result<ImageRef, ReferenceError> {
            Ok(ImageRef::Other {
                scheme: "zot".to_owned(),
                reference: rest.to_owned(),
            })
        }
        let mut reg = SchemeRegistry::default();
        reg.register("zot", parse_zot);
        assert!(reg.is_reference("zot:repo/img"));
        assert_eq!(reg.parse("zot:repo/img").unwrap().scheme(), "zot");
    }

    #[test]
    fn cache_tag_is_index_safe() {
        let r = SchemeRegistry::default().parse("docker://alpine:3.19").unwrap();
        assert_eq!(r.cache_tag(), "docker___alpine_3.19");
    }
}
