use anyhow::Context;
use cbc_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path, invoke_url: Option<&str>, local: bool) -> anyhow::Result<()> {
    println!("Initializing cbc in: {}", root.display());

    let dir = paths::cbc_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  .cbc/config.yaml");
    } else {
        let url = invoke_url.unwrap_or_default();
        let cfg = if local {
            Config::local(url)
        } else {
            let mut cfg = Config::default();
            cfg.endpoint.invoke_url = url.to_string();
            cfg
        };
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: .cbc/config.yaml");
    }

    if local {
        let objects = paths::objects_dir(root);
        io::ensure_dir(&objects)
            .with_context(|| format!("failed to create {}", objects.display()))?;
        println!("  ready:   .cbc/objects/");
    }

    if invoke_url.is_none() {
        println!("\nSet endpoint.invoke_url in .cbc/config.yaml (or CBC_INVOKE_URL) before submitting.");
    }
    Ok(())
}
