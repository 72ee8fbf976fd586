use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::serial::SerialManager;

pub const DEFAULT_STEP_DELAY_MS: u64 = 800;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MacroError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Another macro is already running")]
    AlreadyRunning,
}

/// Sends macro steps one at a time, one run at a time
pub struct MacroRunner {
    step_delay: Duration,
    executing: AtomicBool,
}

/// Clears the executing flag on every exit path
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MacroRunner {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            executing: AtomicBool::new(false),
        }
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    /// Returns the number of steps actually sent
    pub async fn run(&self, manager: &SerialManager, steps: &[&str]) -> Result<usize, MacroError> {
        if !manager.is_connected() {
            return Err(MacroError::NotConnected);
        }
        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MacroError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.executing);

        let mut sent = 0;
        for (i, step) in steps.iter().enumerate() {
            if !manager.is_connected() {
                log::warn!("Connection lost, stopping macro after {} of {} steps", sent, steps.len());
                break;
            }
            log::info!("Macro step {}/{}: {}", i + 1, steps.len(), step);
            manager.send(step).await;
            sent += 1;
            if i + 1 < steps.len() {
                tokio::time::sleep(self.step_delay).await;
            }
        }
        Ok(sent)
    }
}

impl Default for MacroRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_STEP_DELAY_MS))
    }
}
