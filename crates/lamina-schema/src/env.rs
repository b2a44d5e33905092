//! Environment visible to `run` steps.

use crate::definition::LayerDefinition;
use regex::Regex;
use std::collections::BTreeMap;

/// Host variables passed through when a layer does not choose its own.
pub const DEFAULT_PASSTHROUGH: &[&str] = &[
    "ftp_proxy",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "FTP_PROXY",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "TERM",
];

/// Name of the variable carrying the layer name into `run` steps.
pub const LAYER_NAME_VAR: &str = "LAMINA_LAYER_NAME";

/// Compile passthrough patterns, anchored at both ends.
pub fn compile_passthrough(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("^{p}$")))
        .collect()
}

/// Compose the build environment of a layer from the host environment.
///
/// Passthrough matches come first, then `build_env`, then the layer name.
pub fn build_environment(
    def: &LayerDefinition,
    host: impl IntoIterator<Item = (String, String)>,
) -> Result<BTreeMap<String, String>, regex::Error> {
    let patterns: Vec<String> = match &def.build_env_passthrough {
        Some(p) => p.clone(),
        None => DEFAULT_PASSTHROUGH.iter().map(|s| (*s).to_owned()).collect(),
    };
    let matchers = compile_passthrough(&patterns)?;

    let mut env: BTreeMap<String, String> = host
        .into_iter()
        .filter(|(k, _)| matchers.iter().any(|m| m.is_match(k)))
        .collect();
    for (k, v) in &def.build_env {
        env.insert(k.clone(), v.clone());
    }
    env.insert(LAYER_NAME_VAR.to_owned(), def.name.to_string());
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ImageSource;

    fn host() -> Vec<(String, String)> {
        [
            ("http_proxy", "http://proxy:3128"),
            ("HOME", "/home/bob"),
            ("TERM", "xterm"),
            ("MY_TOKEN", "secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    #[test]
    fn default_passthrough_keeps_proxies_only() {
        let def = LayerDefinition::new("web", ImageSource::Scratch);
        let env = build_environment(&def, host()).unwrap();
        assert_eq!(env.get("http_proxy").unwrap(), "http://proxy:3128");
        assert_eq!(env.get("TERM").unwrap(), "xterm");
        assert!(!env.contains_key("HOME"));
        assert!(!env.contains_key("MY_TOKEN"));
        assert_eq!(env.get(LAYER_NAME_VAR).unwrap(), "web");
    }

    #[test]
    fn patterns_are_anchored() {
        let mut def = LayerDefinition::new("web", ImageSource::Scratch);
        def.build_env_passthrough = Some(vec!["MY_.*".to_owned(), "HOM".to_owned()]);
        let env = build_environment(&def, host()).unwrap();
        assert!(env.contains_key("MY_TOKEN"));
        assert!(!env.contains_key("HOME"));
        assert!(!env.contains_key("http_proxy"));
    }

    #[test]
    fn build_env_overrides_passthrough() {
        let mut def = LayerDefinition::new("web", ImageSource::Scratch);
        def.build_env
            .insert("http_proxy".to_owned(), "http://other".to_owned());
        let env = build_environment(&def, host()).unwrap();
        assert_eq!(env.get("http_proxy").unwrap(), "http://other");
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let mut def = LayerDefinition::new("web", ImageSource::Scratch);
        def.build_env_passthrough = Some(vec!["(".to_owned()]);
        assert!(build_environment(&def, host()).is_err());
    }
}
