use crate::definition::{ConfigSpec, LayerDefinition, LayerOutput};
use crate::imports::ImportDigest;
use crate::types::{Digest, Fingerprint};
use serde::Serialize;
use std::collections::BTreeMap;

/// Bumped whenever the authoring pipeline changes its output for equal inputs.
/// Every cached artifact from an older version becomes a miss.
pub const FORMAT_VERSION: u8 = 1;

/// The resolved identity of a layer's starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum BaseInput<'a> {
    Scratch,
    Built(&'a Fingerprint),
    /// Manifest digest as resolved against the local base cache.
    External(&'a Digest),
}

/// Everything that determines a layer's output, in canonical form.
#[derive(Serialize)]
struct FingerprintDocument<'a> {
    format_version: u8,
    name: &'a str,
    base: BaseInput<'a>,
    run: &'a [String],
    imports: &'a [ImportDigest],
    environment: &'a BTreeMap<String, String>,
    build_env: &'a BTreeMap<String, String>,
    build_env_passthrough: Option<&'a [String]>,
    config: &'a ConfigSpec,
    annotations: &'a BTreeMap<String, String>,
    preserve_timestamps: bool,
    output: &'a LayerOutput,
}

/// Compute the fingerprint of a layer from its definition and resolved inputs.
///
/// Maps are `BTreeMap`s and struct fields serialize in declaration order, so
/// the JSON document is canonical. The hash also folds the base identity and
/// each import digest as tagged fields, after the document.
pub fn compute_fingerprint(
    def: &LayerDefinition,
    base: BaseInput<'_>,
    imports: &[ImportDigest],
    output: &LayerOutput,
) -> Result<Fingerprint, serde_json::Error> {
    let doc = FingerprintDocument {
        format_version: FORMAT_VERSION,
        name: def.name.as_str(),
        base,
        run: &def.run,
        imports,
        environment: &def.environment,
        build_env: &def.build_env,
        build_env_passthrough: def.build_env_passthrough.as_deref(),
        config: &def.config,
        annotations: &def.annotations,
        preserve_timestamps: def.preserve_timestamps,
        output,
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"lamina-fingerprint\0");
    hasher.update(&[FORMAT_VERSION]);
    hasher.update(serde_json::to_string(&doc)?.as_bytes());

    match base {
        BaseInput::Scratch => hasher.update(b"base:scratch"),
        BaseInput::Built(fp) => hasher.update(format!("base:built:{fp}").as_bytes()),
        BaseInput::External(d) => hasher.update(format!("base:external:{d}").as_bytes()),
    };
    for import in imports {
        hasher.update(format!("import:{}", import.digest).as_bytes());
    }

    Ok(Fingerprint::new(hasher.finalize().to_hex().to_string()))
}
