use crate::output::UserOutput;
use devfleet::{Config, Orchestrator, ServiceStatus};
use std::path::PathBuf;

pub async fn run_status(
    config: Config,
    work_dir: PathBuf,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::builder()
        .config(config)
        .work_dir(work_dir)
        .build()?;
    let records = orchestrator.status();

    if json {
        out.status(&serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    out.status("Service Status:");
    out.status(&format!("{:-<72}", ""));

    if records.is_empty() {
        out.status("  No services registered");
        return Ok(());
    }

    for record in records {
        let status_icon = match record.status {
            ServiceStatus::Healthy => "+",
            ServiceStatus::Stopped => "o",
            ServiceStatus::Starting | ServiceStatus::Stopping => ".",
            ServiceStatus::Unhealthy => "x",
            ServiceStatus::Unknown => "?",
        };
        let pid = match record.pid {
            Some(pid) if orchestrator.supervisor().is_alive(pid) => pid.to_string(),
            Some(pid) => format!("{} (gone)", pid),
            None => "-".to_string(),
        };
        out.status(&format!(
            "  {} {:<24} {:<10} port {:<6} pid {}",
            status_icon,
            record.name,
            record.status.to_string(),
            record.port,
            pid
        ));
        if let Some(error) = &record.last_error {
            out.status(&format!("      last error: {}", error));
        }
    }

    Ok(())
}
