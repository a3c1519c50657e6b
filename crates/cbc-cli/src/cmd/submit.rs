use crate::cmd::runs::print_run;
use crate::output::print_json;
use anyhow::Context;
use cbc_core::config::Config;
use cbc_core::event::TriggerEvent;
use cbc_core::workflow::{Engine, RunStatus};
use std::io::Read;
use std::path::Path;

pub fn run(root: &Path, file: &Path, wait: bool, json: bool) -> anyhow::Result<()> {
    let data = if file.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read event from stdin")?;
        buf
    } else {
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?
    };
    let event = TriggerEvent::from_slice(&data).context("invalid trigger event")?;

    let config = Config::load(root).context("failed to load config")?;
    let engine = Engine::open(root, &config).context("failed to start engine")?;
    let run = engine.start(event)?;

    if !wait {
        if json {
            print_json(&run)?;
        } else {
            println!("Run {} queued at {}", run.id, run.state);
        }
        return Ok(());
    }

    let run = engine.run_to_completion(run.id)?;
    if json {
        print_json(&run)?;
    } else {
        print_run(&run);
    }
    if let RunStatus::Failed { error, cause } = &run.status {
        anyhow::bail!("run {} failed: {error}: {cause}", run.id);
    }
    Ok(())
}
