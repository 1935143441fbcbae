use ftpool::{ConnectionConfig, DiagnosticReport, HealthManager};
use serde_json::json;

use super::with_service;
use crate::Format;

pub async fn check(config: ConnectionConfig, format: Format) -> anyhow::Result<()> {
    let reports = [
        (
            "reachability",
            HealthManager::check_server_reachability(&config).await,
        ),
        ("tls", HealthManager::check_tls_configuration(&config)),
        ("active mode", HealthManager::check_active_mode(&config)),
    ];
    let address = config.address();
    let live = with_service(config, async |service| Ok(service.test_connection().await)).await?;

    match format {
        Format::Json => {
            let diagnostics: serde_json::Map<String, serde_json::Value> = reports
                .iter()
                .map(|(name, report)| (name.to_string(), report_json(report)))
                .collect();
            let out = json!({
                "address": address,
                "connection_test": live,
                "diagnostics": diagnostics,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Format::Text => {
            println!("{address}");
            for (name, report) in &reports {
                let mark = if report.success { "ok" } else { "FAIL" };
                println!("  [{mark}] {name}: {}", report.message);
                for issue in &report.issues {
                    println!("      issue: {issue}");
                }
                for rec in &report.recommendations {
                    println!("      hint:  {rec}");
                }
            }
            let mark = if live { "ok" } else { "FAIL" };
            println!("  [{mark}] connection test");
        }
    }

    if !live || reports.iter().any(|(_, report)| !report.success) {
        anyhow::bail!("check failed for {address}");
    }
    Ok(())
}

pub async fn stats(config: ConnectionConfig, format: Format) -> anyhow::Result<()> {
    let (live, stats) = with_service(config, async |service| {
        let live = service.test_connection().await;
        Ok((live, service.connection_stats().await))
    })
    .await?;

    match format {
        Format::Json => {
            let out = json!({ "connection_test": live, "stats": stats });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Format::Text => {
            println!("connection_test: {live}");
            for (name, value) in &stats {
                println!("{name}: {value}");
            }
        }
    }
    Ok(())
}

fn report_json(report: &DiagnosticReport) -> serde_json::Value {
    json!({
        "success": report.success,
        "message": report.message,
        "issues": report.issues,
        "recommendations": report.recommendations,
    })
}
