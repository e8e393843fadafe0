use crate::output::UserOutput;
use devfleet::shutdown::{signals, ExitGuard};
use devfleet::{Config, ExitPolicy, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;

pub async fn run_up(
    config: Config,
    work_dir: PathBuf,
    services: Vec<String>,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .config(config)
            .work_dir(work_dir)
            .exit_policy(ExitPolicy::Exit(1))
            .build()?,
    );
    orchestrator.install_cleanup_handlers()?;

    let shutdown = Arc::clone(orchestrator.shutdown());
    let guard = ExitGuard::new(Arc::clone(&shutdown));
    guard.install_panic_hook();
    tokio::spawn(signals::watch(Arc::clone(&shutdown)));

    let started = tokio::select! {
        started = orchestrator.start_all(&services) => started,
        _ = shutdown.wait_completed() => {
            shutdown.mark_clean_exit();
            out.warning("Startup aborted");
            return Ok(());
        }
    };

    let started = match started {
        Ok(names) => names,
        Err(_) if shutdown.is_shutting_down() => {
            shutdown.wait_completed().await;
            shutdown.mark_clean_exit();
            out.warning("Startup aborted");
            return Ok(());
        }
        Err(e) => {
            out.error(&format!("Startup failed: {}", e));
            shutdown.initiate_shutdown("startup failed").await;
            shutdown.mark_clean_exit();
            return Err(e.into());
        }
    };

    for record in orchestrator.status() {
        out.status(&format!("  + {:<24} port {:<6} pid {}", record.name, record.port, record.pid.unwrap_or(0)));
    }
    out.success(&format!(
        "{} service(s) healthy. Press Ctrl+C to stop.",
        started.len()
    ));

    orchestrator.run_background_tasks();
    shutdown.wait_completed().await;
    shutdown.mark_clean_exit();
    drop(guard);

    out.success("All services stopped");
    Ok(())
}
