//! Shutdown signal handling
//!
//! [`shutdown_signal`] resolves on SIGINT or SIGTERM (Ctrl+C on Windows) so a
//! run can be abandoned while its containers are still cleaned up.

use anyhow::Result;
use tokio::signal;
use tracing::info;

pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
