//! TOML recipe loading.
//!
//! A recipe is a list of `[[layer]]` tables; their order is the insertion
//! order of the dependency graph.

use crate::dag::{Dag, DagError};
use crate::definition::{Bind, ConfigSpec, ImageSource, Import, LayerDefinition};
use crate::env::compile_passthrough;
use crate::reference::{ReferenceError, SchemeRegistry};
use crate::types::LayerName;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RECIPE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read recipe file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse recipe: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported format_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("layer name must not be empty")]
    EmptyName,
    #[error("invalid layer name '{0}': must not start with '.' or contain '/' or control characters")]
    InvalidName(String),
    #[error("layer '{layer}': {source}")]
    Reference {
        layer: String,
        #[source]
        source: ReferenceError,
    },
    #[error("layer '{layer}' is built from unknown layer '{base}'")]
    UnknownBase { layer: String, base: String },
    #[error("layer '{layer}': invalid build_env_passthrough pattern: {source}")]
    InvalidPattern {
        layer: String,
        #[source]
        source: regex::Error,
    },
    #[error("layer '{layer}': invalid bind '{spec}', expected '<host> -> <dest>'")]
    InvalidBind { layer: String, spec: String },
    #[error("unresolved substitution '{0}' and no default given")]
    Substitution(String),
    #[error(transparent)]
    Graph(#[from] DagError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecipe {
    format_version: u32,
    #[serde(default, rename = "layer")]
    layers: Vec<RawLayer>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawImport {
    Path(PathBuf),
    Detailed {
        path: PathBuf,
        #[serde(default)]
        hash: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBind {
    Spec(String),
    Detailed { source: PathBuf, dest: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLayer {
    name: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    build_only: bool,
    #[serde(default)]
    run: Option<StringOrList>,
    #[serde(default)]
    imports: Vec<RawImport>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    build_env: BTreeMap<String, String>,
    #[serde(default)]
    build_env_passthrough: Option<Vec<String>>,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    full_command: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    runtime_user: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    binds: Vec<RawBind>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    preserve_timestamps: bool,
}

/// A loaded recipe: definitions in file order plus the directory relative
/// imports resolve against.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub layers: Vec<LayerDefinition>,
    pub reference_dir: PathBuf,
}

impl Recipe {
    pub fn layer(&self, name: &str) -> Option<&LayerDefinition> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Dependency graph with one vertex per layer and one edge per built base.
    pub fn graph(&self) -> Result<Dag<LayerDefinition>, RecipeError> {
        let mut dag = Dag::new();
        for layer in &self.layers {
            dag.add_vertex(layer.name.as_str(), layer.clone())?;
        }
        for layer in &self.layers {
            if let Some(base) = layer.from.built_layer() {
                if !dag.contains(base) {
                    return Err(RecipeError::UnknownBase {
                        layer: layer.name.to_string(),
                        base: base.to_string(),
                    });
                }
                dag.add_edge(&layer.name, base)?;
            }
        }
        Ok(dag)
    }
}

/// Replace `${{KEY}}` and `${{KEY:default}}` placeholders.
pub fn substitute(input: &str, vars: &BTreeMap<String, String>) -> Result<String, RecipeError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            return Err(RecipeError::Substitution(rest[start..].to_owned()));
        };
        let body = &after[..end];
        let (key, default) = match body.split_once(':') {
            Some((k, d)) => (k.trim(), Some(d)),
            None => (body.trim(), None),
        };
        match (vars.get(key), default) {
            (Some(v), _) => out.push_str(v),
            (None, Some(d)) => out.push_str(d),
            (None, None) => return Err(RecipeError::Substitution(key.to_owned())),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn parse_bind(layer: &str, raw: RawBind) -> Result<Bind, RecipeError> {
    match raw {
        RawBind::Detailed { source, dest } => Ok(Bind { source, dest }),
        RawBind::Spec(spec) => {
            let (source, dest) = match spec.split_once("->") {
                Some((s, d)) => (s.trim(), d.trim()),
                None => (spec.trim(), spec.trim()),
            };
            if source.is_empty() || dest.is_empty() {
                return Err(RecipeError::InvalidBind {
                    layer: layer.to_owned(),
                    spec,
                });
            }
            Ok(Bind {
                source: PathBuf::from(source),
                dest: dest.to_owned(),
            })
        }
    }
}

fn resolve_from(
    layer: &str,
    from: Option<&str>,
    schemes: &SchemeRegistry,
) -> Result<ImageSource, RecipeError> {
    match from.map(str::trim) {
        None | Some("" | "scratch") => Ok(ImageSource::Scratch),
        Some(s) if schemes.is_reference(s) => {
            let image = schemes.parse(s).map_err(|source| RecipeError::Reference {
                layer: layer.to_owned(),
                source,
            })?;
            Ok(ImageSource::External { image })
        }
        Some(s) => Ok(ImageSource::Built {
            layer: LayerName::new(s),
        }),
    }
}

fn convert(raw: RawLayer, schemes: &SchemeRegistry) -> Result<LayerDefinition, RecipeError> {
    let name = raw.name.trim().to_owned();
    if name.is_empty() {
        return Err(RecipeError::EmptyName);
    }
    if name.starts_with('.') || name.contains('/') || name.chars().any(char::is_control) {
        return Err(RecipeError::InvalidName(name));
    }
    if let Some(patterns) = &raw.build_env_passthrough {
        compile_passthrough(patterns).map_err(|source| RecipeError::InvalidPattern {
            layer: name.clone(),
            source,
        })?;
    }

    let binds = raw
        .binds
        .into_iter()
        .map(|b| parse_bind(&name, b))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LayerDefinition {
        from: resolve_from(&name, raw.from.as_deref(), schemes)?,
        build_only: raw.build_only,
        run: raw.run.map(StringOrList::into_vec).unwrap_or_default(),
        imports: raw
            .imports
            .into_iter()
            .map(|i| match i {
                RawImport::Path(path) => Import { path, hash: None },
                RawImport::Detailed { path, hash } => Import { path, hash },
            })
            .collect(),
        environment: raw.environment,
        build_env: raw.build_env,
        build_env_passthrough: raw.build_env_passthrough,
        config: ConfigSpec {
            entrypoint: raw.entrypoint,
            cmd: raw.cmd,
            full_command: raw.full_command,
            working_dir: raw.working_dir,
            labels: raw.labels,
            volumes: raw.volumes,
            runtime_user: raw.runtime_user,
        },
        annotations: raw.annotations,
        binds,
        timeout: raw.timeout,
        preserve_timestamps: raw.preserve_timestamps,
        name: LayerName::new(name),
    })
}

pub fn parse_recipe_str(
    input: &str,
    vars: &BTreeMap<String, String>,
    schemes: &SchemeRegistry,
    reference_dir: &Path,
) -> Result<Recipe, RecipeError> {
    let expanded = substitute(input, vars)?;
    let raw: RawRecipe = toml::from_str(&expanded)?;
    if raw.format_version != RECIPE_FORMAT_VERSION {
        return Err(RecipeError::UnsupportedVersion(raw.format_version));
    }
    let layers = raw
        .layers
        .into_iter()
        .map(|l| convert(l, schemes))
        .collect::<Result<Vec<_>, _>>()?;
    let recipe = Recipe {
        layers,
        reference_dir: reference_dir.to_path_buf(),
    };
    // Reject duplicates, unknown bases and cycles at load time.
    recipe.graph()?;
    Ok(recipe)
}

pub fn parse_recipe_file(
    path: impl AsRef<Path>,
    vars: &BTreeMap<String, String>,
    schemes: &SchemeRegistry,
) -> Result<Recipe, RecipeError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    parse_recipe_str(&content, vars, schemes, dir)
}
