use super::Orchestrator;
use crate::error::Result;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub const PRIORITY_BACKGROUND: i32 = 0;
pub const PRIORITY_STOP_SERVICES: i32 = 10;
pub const PRIORITY_KILL_TREES: i32 = 100;
pub const PRIORITY_PERSIST: i32 = 200;
pub const PRIORITY_RELEASE_PORTS: i32 = 210;

impl Orchestrator {
    /// Register the orchestrator's own cleanup handlers with its shutdown
    /// coordinator:
    ///
    /// | priority | handler | critical |
    /// |---|---|---|
    /// | 0 | stop-background-tasks | no |
    /// | 10 | stop-services | yes |
    /// | 100 | kill-process-trees | yes |
    /// | 200 | persist-registry | no |
    /// | 210 | release-ports | no |
    ///
    /// Handlers hold a weak reference; once the orchestrator is dropped they
    /// do nothing.
    pub fn install_cleanup_handlers(self: &Arc<Self>) -> Result<()> {
        let settings = self.config.shutdown.clone();
        let per_service = settings.stop_grace + Duration::from_secs(2);
        let stop_budget = per_service * self.config.services.len().max(1) as u32;

        self.register(
            "stop-background-tasks",
            PRIORITY_BACKGROUND,
            settings.handler_timeout,
            false,
            |o| async move {
                o.stop_background_tasks().await;
                Ok(())
            },
        )?;
        self.register(
            "stop-services",
            PRIORITY_STOP_SERVICES,
            stop_budget,
            true,
            |o| async move { o.stop_all().await },
        )?;
        self.register(
            "kill-process-trees",
            PRIORITY_KILL_TREES,
            settings.handler_timeout,
            true,
            |o| async move { o.kill_process_trees().await },
        )?;
        self.register(
            "persist-registry",
            PRIORITY_PERSIST,
            settings.handler_timeout,
            false,
            |o| async move { o.registry.persist() },
        )?;
        self.register(
            "release-ports",
            PRIORITY_RELEASE_PORTS,
            settings.handler_timeout,
            false,
            |o| async move {
                o.allocator.release_all();
                Ok(())
            },
        )?;
        Ok(())
    }

    fn register<F, Fut>(self: &Arc<Self>, name: &str, priority: i32, timeout: Duration, critical: bool, f: F) -> Result<()>
    where
        F: Fn(Arc<Orchestrator>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let weak: Weak<Orchestrator> = Arc::downgrade(self);
        let f = Arc::new(f);
        self.shutdown.register_cleanup(name, priority, timeout, critical, move || {
            let weak = weak.clone();
            let f = Arc::clone(&f);
            async move {
                match weak.upgrade() {
                    Some(orchestrator) => f(orchestrator).await,
                    None => Ok(()),
                }
            }
        })
    }
}
