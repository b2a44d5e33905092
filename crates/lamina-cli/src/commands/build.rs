use super::{colorize_state, json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use lamina_core::{BuildOptions, BuildReport, CoreError, NodeState, Orchestrator};
use lamina_schema::{parse_recipe_file, SchemeRegistry};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub fn run(
    recipe_path: &Path,
    options: BuildOptions,
    substitutions: &[String],
    json: bool,
) -> Result<u8, CoreError> {
    let vars = parse_substitutions(substitutions)?;
    let recipe = parse_recipe_file(recipe_path, &vars, &SchemeRegistry::default())?;
    debug!(
        "loaded {} layers from {}",
        recipe.layers.len(),
        recipe_path.display()
    );
    let orchestrator = Orchestrator::new(options)?;

    let pb = spinner(&format!("building {} layers...", recipe.layers.len()), json);
    let report = match orchestrator.build(&recipe) {
        Ok(report) => report,
        Err(e) => {
            spin_fail(pb.as_ref(), "build failed");
            return Err(e);
        }
    };
    if report.is_success() {
        spin_ok(pb.as_ref(), "build complete");
    } else {
        spin_fail(pb.as_ref(), "build failed");
    }

    if json {
        println!("{}", json_pretty(&summary_json(&report))?);
    } else {
        print_summary(&report);
    }
    report.into_result()?;
    Ok(EXIT_SUCCESS)
}

/// Parse `KEY=VALUE` pairs for recipe substitution.
fn parse_substitutions(raw: &[String]) -> Result<BTreeMap<String, String>, CoreError> {
    raw.iter()
        .map(|s| {
            s.split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| {
                    CoreError::Config(format!("invalid substitution '{s}', expected KEY=VALUE"))
                })
        })
        .collect()
}

fn summary_json(report: &BuildReport) -> serde_json::Value {
    let layers: Vec<_> = report
        .states
        .iter()
        .map(|(name, state)| {
            let artifact = report.artifacts.get(name);
            serde_json::json!({
                "name": name,
                "state": state,
                "cached": report.cache_hits.contains(name),
                "fingerprint": artifact.map(|a| a.fingerprint.to_string()),
                "manifest": artifact.map(|a| a.manifest_descriptor.digest.to_string()),
                "layer": artifact.map(|a| a.descriptor.digest.to_string()),
                "media_type": artifact.map(|a| a.descriptor.media_type.clone()),
                "verity_root_hash": artifact.and_then(|a| a.verity_root_hash.clone()),
            })
        })
        .collect();
    let error = report.error.as_ref().map(|e| {
        serde_json::json!({
            "kind": e.kind().to_string(),
            "message": e.to_string(),
        })
    });
    serde_json::json!({
        "built": report.built,
        "cache_hits": report.cache_hits,
        "layers": layers,
        "error": error,
    })
}

fn print_summary(report: &BuildReport) {
    for (name, state) in &report.states {
        match report.artifacts.get(name) {
            Some(artifact) if *state == NodeState::Complete => {
                let how = if report.cache_hits.contains(name) {
                    "cached"
                } else {
                    "built"
                };
                println!(
                    "{name}: {} {} ({how})",
                    colorize_state(*state),
                    artifact.manifest_descriptor.digest
                );
            }
            _ => println!("{name}: {}", colorize_state(*state)),
        }
    }
    println!(
        "{} built, {} cached",
        report.built.len(),
        report.cache_hits.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutions_split_on_first_equals() {
        let vars = parse_substitutions(&["TAG=1.2".to_owned(), "URL=a=b".to_owned()]).unwrap();
        assert_eq!(vars["TAG"], "1.2");
        assert_eq!(vars["URL"], "a=b");
    }

    #[test]
    fn substitution_without_key_is_config_error() {
        let err = parse_substitutions(&["=x".to_owned()]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(parse_substitutions(&["novalue".to_owned()]).is_err());
    }

    #[test]
    fn summary_lists_every_layer() {
        let mut report = BuildReport::default();
        report.states.insert("app".to_owned(), NodeState::Cancelled);
        report.error = Some(CoreError::Cancelled);
        let json = summary_json(&report);
        assert_eq!(json["layers"][0]["name"], "app");
        assert_eq!(json["layers"][0]["state"], "cancelled");
        assert_eq!(json["error"]["kind"], "cancelled");
    }
}
