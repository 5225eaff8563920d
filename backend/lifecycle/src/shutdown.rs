//! Interrupt routing.
//!
//! OS signals are turned into a watch flag the orchestrator's polling loops
//! select on, so an interrupt always reaches the cleanup path instead of
//! killing the process mid-session.

use tokio::sync::watch;
use tracing::{info, warn};

/// Sending half, held by the signal listener.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Receiving half, handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers left
        self.0.send_replace(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown is requested. Pends forever if the trigger is
    /// dropped without firing.
    pub async fn wait(&mut self) {
        let closed = self.0.wait_for(|fired| *fired).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Fire `trigger` on SIGINT or SIGTERM. The first signal requests shutdown;
/// later ones are only logged, so cleanup is never cut short.
pub fn listen_for_os_signals(trigger: ShutdownTrigger) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                None
            }
        };

        let mut fired = false;
        loop {
            #[cfg(unix)]
            let terminated = async {
                match term.as_mut() {
                    Some(sig) => {
                        sig.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            #[cfg(not(unix))]
            let terminated = std::future::pending::<()>();

            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!(error = %e, "Cannot listen for Ctrl-C");
                        return;
                    }
                }
                _ = terminated => {}
            }

            if fired {
                warn!("Already shutting down; waiting for cleanup to finish");
            } else {
                info!("Interrupt received; shutting down after cleanup");
                trigger.trigger();
                fired = true;
            }
        }
    })
}
