//! Process stop signals.
//!
//! On Unix the bot stops on SIGINT, SIGTERM or SIGQUIT. Elsewhere only
//! Ctrl-C is awaited.

use std::fmt;

/// The signal that asked the bot to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
    Quit,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Quit => "SIGQUIT",
        })
    }
}

/// Completes with the first stop signal the process receives.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<StopSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = interrupt.recv() => StopSignal::Interrupt,
        _ = terminate.recv() => StopSignal::Terminate,
        _ = quit.recv() => StopSignal::Quit,
    };
    tracing::info!("Received {}", received);
    Ok(received)
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<StopSignal> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    Ok(StopSignal::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(StopSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(StopSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(StopSignal::Quit.to_string(), "SIGQUIT");
    }
}
