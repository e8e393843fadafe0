use crate::output::UserOutput;
use devfleet::recovery::ReportStore;
use devfleet::Config;
use std::path::Path;

pub fn run_reports(
    config: &Config,
    work_dir: &Path,
    service: Option<String>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let store = ReportStore::new(config.state_path(work_dir).join("reports"));
    let reports = match &service {
        Some(name) => store.for_service(name)?,
        None => store.list()?,
    };

    if json {
        out.status(&serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        out.status("No crash reports");
        return Ok(());
    }

    for report in reports {
        let outcome = if report.resolved { "resolved" } else { "UNRESOLVED" };
        out.status(&format!(
            "{} {} [{}] {} after {} attempt(s)",
            report.detected_at.format("%Y-%m-%d %H:%M:%S"),
            report.service_name,
            report.severity,
            outcome,
            report.attempt_count()
        ));
        for detection in report.detections.iter().filter(|d| d.is_crashed) {
            out.status(&format!("    {}: {}", detection.method, detection.message));
        }
        if !report.resolved {
            for hint in &report.suggestions {
                out.status(&format!("    - {}", hint));
            }
        }
    }
    Ok(())
}
