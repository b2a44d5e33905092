//! Layer definitions as consumed by the build core.
//!
//! Definitions are produced by the recipe loader and never mutated afterwards.

use crate::reference::ImageRef;
use crate::types::LayerName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where a layer's root filesystem starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImageSource {
    /// Empty root filesystem.
    Scratch,
    /// Another layer of the same recipe.
    Built { layer: LayerName },
    /// An image resolved by the image-copy collaborator.
    External { image: ImageRef },
}

impl ImageSource {
    pub fn built_layer(&self) -> Option<&LayerName> {
        match self {
            Self::Built { layer } => Some(layer),
            _ => None,
        }
    }
}

/// A host path bound read-only into the build under `/stacker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub path: PathBuf,
    /// Expected hex SHA-256 of a file import's contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// A read-write host directory bound into the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub source: PathBuf,
    pub dest: String,
}

/// Image configuration produced by a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpec {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// Replaces the entrypoint and clears `cmd`.
    pub full_command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub runtime_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDefinition {
    pub name: LayerName,
    pub from: ImageSource,
    /// Participates in the graph but is never published under a tag.
    pub build_only: bool,
    pub run: Vec<String>,
    pub imports: Vec<Import>,
    /// Written into the image config.
    pub environment: BTreeMap<String, String>,
    /// Visible to `run` steps only.
    pub build_env: BTreeMap<String, String>,
    /// Anchored patterns selecting host variables passed to `run` steps.
    /// `None` selects the default proxy/terminal set.
    pub build_env_passthrough: Option<Vec<String>>,
    pub config: ConfigSpec,
    pub annotations: BTreeMap<String, String>,
    pub binds: Vec<Bind>,
    /// Per-layer step timeout in seconds.
    pub timeout: Option<u64>,
    pub preserve_timestamps: bool,
}

impl LayerDefinition {
    /// A definition with no steps and no configuration.
    pub fn new(name: impl Into<LayerName>, from: ImageSource) -> Self {
        Self {
            name: name.into(),
            from,
            build_only: false,
            run: Vec::new(),
            imports: Vec::new(),
            environment: BTreeMap::new(),
            build_env: BTreeMap::new(),
            build_env_passthrough: None,
            config: ConfigSpec::default(),
            annotations: BTreeMap::new(),
            binds: Vec::new(),
            timeout: None,
            preserve_timestamps: false,
        }
    }

    /// Layers with read-write binds depend on unfingerprinted host state.
    pub fn is_cacheable(&self) -> bool {
        self.binds.is_empty()
    }

    /// Shell script materialized from the `run` steps.
    ///
    /// A `#!/bin/sh -xe` header is added unless the first step carries its
    /// own interpreter line.
    pub fn run_script(&self) -> Option<String> {
        if self.run.is_empty() {
            return None;
        }
        let mut script = String::new();
        if !self.run[0].starts_with("#!") {
            script.push_str("#!/bin/sh -xe\n");
        }
        for step in &self.run {
            script.push_str(step);
            if !step.ends_with('\n') {
                script.push('\n');
            }
        }
        Some(script)
    }
}

/// Container format of an authored layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerFormat {
    #[default]
    Tar,
    Squashfs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl std::str::FromStr for LayerFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tar" => Ok(Self::Tar),
            "squashfs" => Ok(Self::Squashfs),
            other => Err(format!("unknown layer type '{other}' (expected tar or squashfs)")),
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!(
                "unknown compression '{other}' (expected none, gzip or zstd)"
            )),
        }
    }
}

/// How the pipeline packages a layer. Part of every fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerOutput {
    pub format: LayerFormat,
    pub compression: Compression,
    pub verity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_script_adds_default_shebang() {
        let mut def = LayerDefinition::new("a", ImageSource::Scratch);
        def.run = vec!["echo hi".to_owned(), "touch /x\n".to_owned()];
        assert_eq!(
            def.run_script().unwrap(),
            "#!/bin/sh -xe\necho hi\ntouch /x\n"
        );
    }

    #[test]
    fn run_script_keeps_custom_interpreter() {
        let mut def = LayerDefinition::new("a", ImageSource::Scratch);
        def.run = vec!["#!/bin/bash\nset -e".to_owned()];
        assert_eq!(def.run_script().unwrap(), "#!/bin/bash\nset -e\n");
    }

    #[test]
    fn no_steps_no_script() {
        assert!(LayerDefinition::new("a", ImageSource::Scratch)
            .run_script()
            .is_none());
    }

    #[test]
    fn binds_disable_caching() {
        let mut def = LayerDefinition::new("a", ImageSource::Scratch);
        assert!(def.is_cacheable());
        def.binds.push(Bind {
            source: PathBuf::from("/src"),
            dest: "/src".to_owned(),
        });
        assert!(!def.is_cacheable());
    }

    #[test]
    fn output_options_parse() {
        assert_eq!("squashfs".parse::<LayerFormat>(), Ok(LayerFormat::Squashfs));
        assert_eq!("zstd".parse::<Compression>(), Ok(Compression::Zstd));
        assert!("xz".parse::<Compression>().is_err());
    }
}
