use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::Result;

use crate::os::signal_name;

const MANUAL_CANCEL: i32 = -1;

static SIGNALS_ROUTED: AtomicBool = AtomicBool::new(false);

/// Cooperative cancellation flag checked by long-running jobs between steps.
///
/// Holds the number of the signal that requested cancellation, `0` while the
/// job should keep going.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<AtomicI32>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn cancel(&self) {
        self.state.store(MANUAL_CANCEL, Ordering::SeqCst);
    }

    pub fn cancel_with_signal(&self, signal: i32) {
        self.state.store(signal, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) != 0
    }

    /// Human readable cause, e.g. `SIGINT`.
    pub fn reason(&self) -> Option<String> {
        match self.state.load(Ordering::SeqCst) {
            0 => None,
            MANUAL_CANCEL => Some("cancellation request".to_string()),
            signal => Some(signal_name(signal)),
        }
    }

    /// Routes SIGINT and SIGTERM into this token instead of terminating the
    /// process. Only the first token installed receives signals; later calls
    /// return `Ok(false)`.
    pub fn install_signal_handlers(&self) -> Result<bool> {
        if SIGNALS_ROUTED.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        if let Err(err) = forward_signals(self.clone()) {
            SIGNALS_ROUTED.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(true)
    }
}

#[cfg(unix)]
fn forward_signals(token: CancellationToken) -> Result<()> {
    use anyhow::Context;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use tracing::debug;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
    std::thread::Builder::new()
        .name("signal-forwarder".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                debug!(signal = %signal_name(signal), "cancellation requested");
                token.cancel_with_signal(signal);
            }
        })
        .context("failed to spawn signal forwarding thread")?;
    Ok(())
}

#[cfg(not(unix))]
fn forward_signals(_token: CancellationToken) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
    }

    #[test]
    fn signal_cancellation_is_visible_through_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        token.cancel_with_signal(2);
        assert!(observer.is_cancelled());
        assert_eq!(observer.reason().as_deref(), Some("SIGINT"));
    }

    #[cfg(unix)]
    #[test]
    fn delivered_signal_cancels_with_its_name() {
        use std::thread;
        use std::time::{Duration, Instant};

        use signal_hook::consts::SIGTERM;

        let token = CancellationToken::new();
        assert!(token.install_signal_handlers().unwrap());
        assert!(!CancellationToken::new().install_signal_handlers().unwrap());

        signal_hook::low_level::raise(SIGTERM).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !token.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(token.reason().as_deref(), Some("SIGTERM"));
    }

    #[test]
    fn manual_cancellation_has_generic_reason() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(token.reason().as_deref(), Some("cancellation request"));
    }
}
