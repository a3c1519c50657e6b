use anyhow::Context;
use cbc_core::config::Config;
use cbc_core::workflow::StateMachine;
use cbc_core::CbcError;
use std::path::Path;

/// Print the state machine the configured retry knobs produce. Without a
/// project, the defaults are shown.
pub fn run(root: &Path) -> anyhow::Result<()> {
    let config = match Config::load(root) {
        Ok(cfg) => cfg,
        Err(CbcError::NotInitialized) => Config::default(),
        Err(e) => return Err(e).context("failed to load config"),
    };
    let definition = StateMachine::standard(&config.definition_params());
    definition.validate()?;
    println!("{}", definition.to_json()?);
    Ok(())
}
