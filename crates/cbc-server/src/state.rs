use cbc_core::workflow::Engine;
use std::sync::Arc;

/// Shared application state passed to all route handlers.
///
/// The engine is synchronous; handlers call it through `spawn_blocking`.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run `f` against the engine on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, crate::error::AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> cbc_core::Result<T> + Send + 'static,
    {
        let engine = self.engine.clone();
        let out = tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| crate::error::AppError(anyhow::anyhow!("task join error: {e}")))??;
        Ok(out)
    }
}
