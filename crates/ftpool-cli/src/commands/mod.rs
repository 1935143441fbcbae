use std::path::Path;

use anyhow::Context;
use ftpool::{ConnectionConfig, FtpService};

mod check;
mod files;

pub use check::{check, stats};
pub use files::{get, ls, put, rm};

pub fn load_config(path: &Path) -> anyhow::Result<ConnectionConfig> {
    let config = ConnectionConfig::from_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        host = %config.host(),
        port = config.port(),
        transport = config.transport().name(),
        data_mode = config.data_mode().name(),
        "loaded config"
    );
    Ok(config)
}

/// Run `op` against a fresh service, then shut the service down whatever
/// the outcome.
async fn with_service<T, F>(config: ConnectionConfig, op: F) -> anyhow::Result<T>
where
    F: AsyncFnOnce(&FtpService) -> anyhow::Result<T>,
{
    let service = FtpService::new(config)?;
    let result = op(&service).await;
    service.shutdown().await;
    result
}
