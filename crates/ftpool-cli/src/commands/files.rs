use std::path::{Path, PathBuf};

use anyhow::Context;
use ftpool::ConnectionConfig;
use serde_json::json;

use super::with_service;
use crate::Format;

pub async fn ls(config: ConnectionConfig, path: &str, format: Format) -> anyhow::Result<()> {
    let entries = with_service(config, async |service| Ok(service.list(path).await?)).await?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&json!(entries))?),
        Format::Text => {
            for entry in &entries {
                println!("{entry}");
            }
        }
    }
    Ok(())
}

pub async fn get(
    config: ConnectionConfig,
    remote: &str,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let output = match output {
        Some(path) => path,
        None => Path::new(remote)
            .file_name()
            .map(PathBuf::from)
            .with_context(|| format!("cannot derive a local file name from {remote:?}"))?,
    };
    let data = with_service(config, async |service| Ok(service.retrieve(remote).await?)).await?;
    tokio::fs::write(&output, &data)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    println!("✓ {remote} → {} ({} bytes)", output.display(), data.len());
    Ok(())
}

pub async fn put(config: ConnectionConfig, local: &Path, remote: &str) -> anyhow::Result<()> {
    let data = tokio::fs::read(local)
        .await
        .with_context(|| format!("reading {}", local.display()))?;
    let written =
        with_service(config, async |service| Ok(service.store(remote, &data).await?)).await?;
    println!("✓ {} → {remote} ({written} bytes)", local.display());
    Ok(())
}

pub async fn rm(config: ConnectionConfig, remote: &str) -> anyhow::Result<()> {
    with_service(config, async |service| Ok(service.delete(remote).await?)).await?;
    println!("✓ deleted {remote}");
    Ok(())
}
