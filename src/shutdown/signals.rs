//! OS shutdown signals.
//!
//! Unix listens for SIGINT and SIGTERM; Windows for Ctrl+C, Ctrl+Break and
//! console close. The first signal starts a graceful shutdown, any further
//! signal escalates it to emergency cleanup.

use super::ShutdownCoordinator;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    ConsoleClose,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownSignal::Interrupt => "interrupt",
            ShutdownSignal::Terminate => "terminate",
            ShutdownSignal::ConsoleClose => "console close",
        };
        f.write_str(s)
    }
}

#[cfg(unix)]
mod platform {
    use super::ShutdownSignal;
    use tokio::signal::unix::{signal, Signal, SignalKind};

    pub struct Signals {
        interrupt: Option<Signal>,
        terminate: Option<Signal>,
    }

    fn install(kind: SignalKind, label: &str) -> Option<Signal> {
        match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("Failed to create {} handler: {}", label, e);
                None
            }
        }
    }

    async fn next(signal: &mut Option<Signal>) -> Option<()> {
        match signal {
            Some(s) => s.recv().await,
            None => std::future::pending().await,
        }
    }

    impl Signals {
        pub fn new() -> Option<Self> {
            let interrupt = install(SignalKind::interrupt(), "SIGINT");
            let terminate = install(SignalKind::terminate(), "SIGTERM");
            if interrupt.is_none() && terminate.is_none() {
                return None;
            }
            Some(Self { interrupt, terminate })
        }

        pub async fn recv(&mut self) -> ShutdownSignal {
            tokio::select! {
                _ = next(&mut self.interrupt) => ShutdownSignal::Interrupt,
                _ = next(&mut self.terminate) => ShutdownSignal::Terminate,
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::ShutdownSignal;
    use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, CtrlBreak, CtrlC, CtrlClose};

    pub struct Signals {
        ctrl_c: CtrlC,
        ctrl_break: CtrlBreak,
        ctrl_close: CtrlClose,
    }

    impl Signals {
        pub fn new() -> Option<Self> {
            let built = (|| Ok::<_, std::io::Error>(Self {
                ctrl_c: ctrl_c()?,
                ctrl_break: ctrl_break()?,
                ctrl_close: ctrl_close()?,
            }))();
            match built {
                Ok(signals) => Some(signals),
                Err(e) => {
                    tracing::warn!("Failed to create console event handlers: {}", e);
                    None
                }
            }
        }

        pub async fn recv(&mut self) -> ShutdownSignal {
            tokio::select! {
                _ = self.ctrl_c.recv() => ShutdownSignal::Interrupt,
                _ = self.ctrl_break.recv() => ShutdownSignal::Terminate,
                _ = self.ctrl_close.recv() => ShutdownSignal::ConsoleClose,
            }
        }
    }
}

/// Route OS signals to `coordinator` until the process exits.
///
/// Returns immediately (after logging) when no signal can be observed; the
/// process can then only be stopped externally.
pub async fn watch(coordinator: Arc<ShutdownCoordinator>) {
    let Some(mut signals) = platform::Signals::new() else {
        tracing::warn!("No signal handlers available - process can only be terminated externally");
        return;
    };

    let mut signal_count = 0;
    loop {
        let signal = signals.recv().await;
        signal_count += 1;

        if signal_count == 1 {
            eprintln!("\nStopping services... (signal again to force quit)");
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .initiate_shutdown(&format!("received {} signal", signal))
                    .await;
            });
        } else {
            eprintln!("\nForce quitting...");
            tracing::warn!(%signal, "second signal, forcing shutdown");
            coordinator.escalate();
        }
    }
}
