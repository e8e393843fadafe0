//! Last-resort cleanup on abnormal exit.

use super::ShutdownCoordinator;
use std::sync::Arc;

/// Runs emergency cleanup when dropped, unless the coordinator already shut
/// down or a clean exit was marked. Keep it alive for the whole of `main`.
pub struct ExitGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl ExitGuard {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Also run last-resort cleanup when the main thread panics. Panics on
    /// other threads (including runtime workers) are left to the default hook.
    pub fn install_panic_hook(&self) {
        let coordinator = Arc::clone(&self.coordinator);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            if std::thread::current().name() == Some("main") {
                coordinator.last_resort(&format!("panic: {}", info));
            }
        }));
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.coordinator.last_resort("exited without shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownSettings;
    use crate::shutdown::ExitPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn coordinator_with_counter() -> (Arc<ShutdownCoordinator>, Arc<AtomicUsize>) {
        let coordinator = Arc::new(ShutdownCoordinator::new(ShutdownSettings::default(), ExitPolicy::Return));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        coordinator
            .register_cleanup("stop", 10, Duration::from_secs(1), true, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();
        (coordinator, runs)
    }

    #[test]
    fn dropping_guard_runs_cleanup_once() {
        let (coordinator, runs) = coordinator_with_counter();
        drop(ExitGuard::new(Arc::clone(&coordinator)));
        drop(ExitGuard::new(coordinator));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guard_is_inert_after_normal_shutdown() {
        let (coordinator, runs) = coordinator_with_counter();
        let guard = ExitGuard::new(Arc::clone(&coordinator));
        coordinator.initiate_shutdown("done").await.unwrap();
        // Drop blocks on a helper thread only if cleanup is still pending
        drop(guard);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
