use anyhow::Context;
use cbc_core::config::Config;
use cbc_core::workflow::Engine;
use std::path::Path;
use std::sync::Arc;

pub fn run(root: &Path, port: u16) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let engine = Arc::new(Engine::open(root, &config).context("failed to start engine")?);
    engine.recover(config.recovery_max_age())?;
    if let Some(retention) = config.retention() {
        engine.prune(retention)?;
    }
    let tick_interval = config.tick_interval();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        let actual_port = listener.local_addr()?.port();
        println!("cbc API → http://localhost:{actual_port}");

        tokio::select! {
            res = cbc_server::serve_on(engine, listener, tick_interval) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    })
}
