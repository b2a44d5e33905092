use super::{json_pretty, EXIT_SUCCESS};
use lamina_core::CoreError;
use lamina_store::{ImageStore, OciLayout};
use std::path::Path;

pub fn run(oci_dir: &Path, tag: &str, json: bool) -> Result<u8, CoreError> {
    if !OciLayout::new(oci_dir).is_initialized() {
        return Err(CoreError::Unknown(format!(
            "{} is not an OCI image layout",
            oci_dir.display()
        )));
    }
    let images = ImageStore::open(oci_dir)?;
    let descriptor = images.lookup_descriptor(tag)?;
    let manifest = images.read_manifest(&descriptor)?;
    let config = images.lookup_config(&manifest.config)?;

    if json {
        let payload = serde_json::json!({
            "tag": tag,
            "descriptor": descriptor,
            "manifest": manifest,
            "config": config,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("tag:          {tag}");
    println!("manifest:     {} ({} bytes)", descriptor.digest, descriptor.size);
    println!("config:       {}", manifest.config.digest);
    println!("platform:     {}/{}", config.os, config.architecture);
    if let Some(created) = &config.created {
        println!("created:      {created}");
    }
    let c = &config.config;
    if let Some(entrypoint) = &c.entrypoint {
        println!("entrypoint:   {entrypoint:?}");
    }
    if let Some(cmd) = &c.cmd {
        println!("cmd:          {cmd:?}");
    }
    if let Some(user) = &c.user {
        println!("user:         {user}");
    }
    if let Some(dir) = &c.working_dir {
        println!("working dir:  {dir}");
    }
    for env in &c.env {
        println!("env:          {env}");
    }
    for (k, v) in &c.labels {
        println!("label:        {k}={v}");
    }
    for (k, v) in &manifest.annotations {
        println!("annotation:   {k}={v}");
    }
    println!("layers:");
    for (i, layer) in manifest.layers.iter().enumerate() {
        println!("  [{i}] {} {} ({} bytes)", layer.media_type, layer.digest, layer.size);
        if let Some(root_hash) = layer.verity_root_hash() {
            println!("      verity root hash: {root_hash}");
        }
    }
    Ok(EXIT_SUCCESS)
}
