//! Cooperative stop flag for the capture loops.
//!
//! The loops poll the flag once per frame; nothing is interrupted mid-frame.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Raises a [`StopSignal`] when the user presses Enter on the terminal.
pub struct StdinStop {
    signal: StopSignal,
    reader: JoinHandle<()>,
}

impl StdinStop {
    pub fn spawn() -> std::io::Result<Self> {
        let signal = StopSignal::new();
        let raised = signal.clone();
        let reader = std::thread::Builder::new()
            .name("facegate-stdin".into())
            .spawn(move || {
                let mut line = String::new();
                let _ = std::io::stdin().lock().read_line(&mut line);
                raised.request_stop();
            })?;
        Ok(Self { signal, reader })
    }

    pub fn signal(&self) -> &StopSignal {
        &self.signal
    }

    /// Wait for the reader thread so it does not swallow later menu input.
    ///
    /// If the loop ended on its own (camera gone), the user still has to
    /// press Enter once to release the terminal.
    pub fn finish(self) {
        if !self.signal.is_stop_requested() {
            println!("Press Enter to continue...");
        }
        if self.reader.join().is_err() {
            tracing::warn!("stdin reader thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_shared_between_clones() {
        let signal = StopSignal::new();
        let other = signal.clone();
        assert!(!other.is_stop_requested());
        signal.request_stop();
        assert!(other.is_stop_requested());
    }
}
