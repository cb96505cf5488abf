//! # Termination signals for [`AppContext::run_until_signal`](crate::AppContext::run_until_signal).
//!
//! [`ShutdownSignals`] installs the handlers up front so a signal that
//! arrives before anyone awaits is not lost, then [`ShutdownSignals::recv`]
//! reports which one ended the wait.
//!
//! ```text
//! install() ─► SIGINT | SIGTERM | SIGQUIT   (unix)
//!           ─► Ctrl-C                       (other platforms)
//! recv()    ─► ShutdownSignal ─► AppContext::shutdown
//! ```

use std::fmt;
use std::io;

/// The signal that asked the process to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Quit,
    CtrlC,
}

impl ShutdownSignal {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::CtrlC => "ctrl_c",
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Installed termination signal handlers.
///
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct ShutdownSignals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigquit: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Registers the handlers. Fails if the OS refuses a registration.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Waits for the next termination signal.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> io::Result<ShutdownSignal> {
        let signal = tokio::select! {
            _ = self.sigint.recv() => ShutdownSignal::Interrupt,
            _ = self.sigterm.recv() => ShutdownSignal::Terminate,
            _ = self.sigquit.recv() => ShutdownSignal::Quit,
        };
        Ok(signal)
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> io::Result<ShutdownSignal> {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownSignal::CtrlC)
    }
}

/// Installs the handlers and waits for the first termination signal.
pub async fn wait_for_shutdown_signal() -> io::Result<ShutdownSignal> {
    ShutdownSignals::install()?.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_labels() {
        assert_eq!(ShutdownSignal::Terminate.as_label(), "SIGTERM");
        assert_eq!(ShutdownSignal::CtrlC.to_string(), "ctrl_c");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reports_received_signal() {
        let mut signals = ShutdownSignals::install().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-QUIT", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let got = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("signal delivered")
            .unwrap();
        assert_eq!(got, ShutdownSignal::Quit);
    }
}
