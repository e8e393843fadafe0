use crate::output::UserOutput;
use devfleet::{Config, Orchestrator};
use std::path::PathBuf;

pub async fn run_down(config: Config, work_dir: PathBuf, out: &dyn UserOutput) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::builder()
        .config(config)
        .work_dir(work_dir)
        .build()?;

    if orchestrator.status().is_empty() {
        out.status("No services registered");
        return Ok(());
    }

    out.status("Stopping all services...");
    let stopped = orchestrator.teardown().await?;
    for name in &stopped {
        out.status(&format!("  o {}", name));
    }
    out.success(&format!("Stopped {} service(s)", stopped.len()));
    Ok(())
}
