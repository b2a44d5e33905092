//! Layer definitions, recipes, the dependency graph, and fingerprints for Lamina.
//!
//! This crate defines the schema layer: TOML recipe loading (`Recipe`), the
//! immutable `LayerDefinition` consumed by the build core, external image
//! references with an injectable scheme registry, the generic `Dag`, import
//! content digests, and deterministic fingerprint computation.

pub mod dag;
pub mod definition;
pub mod env;
pub mod fingerprint;
pub mod imports;
pub mod recipe;
pub mod reference;
pub mod types;

pub use dag::{Dag, DagError};
pub use definition::{
    Bind, Compression, ConfigSpec, ImageSource, Import, LayerDefinition, LayerFormat, LayerOutput,
};
pub use env::{build_environment, DEFAULT_PASSTHROUGH, LAYER_NAME_VAR};
pub use fingerprint::{compute_fingerprint, BaseInput, FORMAT_VERSION};
pub use imports::{digest_imports, digest_path, sha256_file, ImportDigest, ImportError};
pub use recipe::{parse_recipe_file, parse_recipe_str, substitute, Recipe, RecipeError};
pub use reference::{ImageRef, ReferenceError, SchemeParser, SchemeRegistry};
pub use types::{Digest, Fingerprint, LayerName};
