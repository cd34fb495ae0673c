use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Waits for SIGTERM or SIGINT (ctrl-c only on non-unix targets).
/// Returns `None` when no handler could be installed at all.
pub async fn wait_for_signal() -> Option<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        return match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => Some(ShutdownSignal::Terminate),
                    _ = sigint.recv() => Some(ShutdownSignal::Interrupt),
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!("failed to install signal handler: error={err}");
                ctrl_c().await
            }
        };
    }

    #[cfg(not(unix))]
    ctrl_c().await
}

async fn ctrl_c() -> Option<ShutdownSignal> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some(ShutdownSignal::Interrupt),
        Err(err) => {
            warn!("failed to listen for ctrl-c: error={err}");
            None
        }
    }
}

/// Cancels `token` on the first shutdown signal. Returns early, without
/// cancelling, if the token is cancelled by someone else first.
pub async fn listen_shutdown(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        signal = wait_for_signal() => {
            if let Some(signal) = signal {
                warn!("shutdown signal received: {signal}");
                token.cancel();
            }
        }
    }
}
