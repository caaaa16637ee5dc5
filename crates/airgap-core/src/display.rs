//! Rotating fragment display
//!
//! Cycles through a payload's fragments on a fixed period so a camera on
//! the other device eventually sees every one of them. The rotation task is
//! owned by the display and never outlives it.

use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Time each fragment stays on screen
pub const DEFAULT_DISPLAY_PERIOD: Duration = Duration::from_millis(200);

/// Owned fragment rotation with explicit start/stop
#[derive(Debug)]
pub struct RotatingDisplay {
    fragments: Arc<[String]>,
    cursor: Arc<AtomicUsize>,
    period: Duration,
    task: Option<JoinHandle<()>>,
}

impl RotatingDisplay {
    /// Fragments are rendered upper case so they fit QR alphanumeric mode
    pub fn new(fragments: Vec<String>, period: Duration) -> Result<Self> {
        if fragments.is_empty() {
            return Err(Error::Display("nothing to display".into()));
        }
        if period.is_zero() {
            return Err(Error::InvalidConfig("display period must be non-zero".into()));
        }

        Ok(Self {
            fragments: to_display_form(fragments),
            cursor: Arc::new(AtomicUsize::new(0)),
            period,
            task: None,
        })
    }

    /// Start rotating on the current tokio runtime
    pub fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let handle = Handle::try_current()
            .map_err(|e| Error::Display(format!("no async runtime for display timer: {e}")))?;

        let len = self.fragments.len();
        if len == 1 {
            // a bare fragment is shown statically
            return Ok(());
        }

        let cursor = Arc::clone(&self.cursor);
        let period = self.period;
        self.task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let prev = cursor.load(Ordering::Relaxed);
                cursor.store((prev + 1) % len, Ordering::Relaxed);
            }
        }));

        debug!(fragments = len, period_ms = self.period.as_millis() as u64, "Display started");
        Ok(())
    }

    /// Halt rotation; the current fragment stays put
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Display stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Swap in a new fragment list. The old timer is stopped first and the
    /// cursor is replaced, so nothing keeps ticking against the old list.
    pub fn replace(&mut self, fragments: Vec<String>) -> Result<()> {
        if fragments.is_empty() {
            return Err(Error::Display("nothing to display".into()));
        }
        self.stop();
        self.fragments = to_display_form(fragments);
        self.cursor = Arc::new(AtomicUsize::new(0));
        Ok(())
    }

    pub fn current_index(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) % self.fragments.len()
    }

    pub fn current_fragment(&self) -> &str {
        &self.fragments[self.current_index()]
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for RotatingDisplay {
    fn drop(&mut self) {
        self.stop();
    }
}

fn to_display_form(fragments: Vec<String>) -> Arc<[String]> {
    fragments
        .into_iter()
        .map(|f| f.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ur:bytes/{}of{n}/digest/seg{i}", i + 1)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotates_and_wraps() {
        let mut display = RotatingDisplay::new(fragments(3), DEFAULT_DISPLAY_PERIOD).unwrap();
        display.start().unwrap();
        assert_eq!(display.current_fragment(), "UR:BYTES/1OF3/DIGEST/SEG0");

        // sample half way between ticks
        tokio::time::sleep(DEFAULT_DISPLAY_PERIOD / 2).await;
        let mut seen = Vec::new();
        for _ in 0..4 {
            tokio::time::sleep(DEFAULT_DISPLAY_PERIOD).await;
            seen.push(display.current_index());
        }
        assert_eq!(seen, vec![1, 2, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_cursor() {
        let mut display = RotatingDisplay::new(fragments(4), DEFAULT_DISPLAY_PERIOD).unwrap();
        display.start().unwrap();
        tokio::time::sleep(DEFAULT_DISPLAY_PERIOD * 3 / 2).await;

        display.stop();
        let frozen = display.current_index();
        tokio::time::sleep(DEFAULT_DISPLAY_PERIOD * 10).await;
        tokio::task::yield_now().await;

        assert!(!display.is_running());
        assert_eq!(display.current_index(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_detaches_old_timer() {
        let mut display = RotatingDisplay::new(fragments(2), DEFAULT_DISPLAY_PERIOD).unwrap();
        display.start().unwrap();
        let old_cursor = Arc::clone(&display.cursor);

        display.replace(fragments(5)).unwrap();
        tokio::time::sleep(DEFAULT_DISPLAY_PERIOD * 3).await;
        tokio::task::yield_now().await;

        assert!(!display.is_running());
        assert_eq!(display.current_index(), 0);
        assert_eq!(display.fragments().len(), 5);
        assert_eq!(Arc::strong_count(&old_cursor), 1);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let mut display = RotatingDisplay::new(fragments(2), DEFAULT_DISPLAY_PERIOD).unwrap();
        assert!(matches!(display.start(), Err(Error::Display(_))));
    }

    #[test]
    fn test_empty_display_rejected() {
        assert!(RotatingDisplay::new(Vec::new(), DEFAULT_DISPLAY_PERIOD).is_err());
        assert!(RotatingDisplay::new(fragments(2), Duration::ZERO).is_err());
    }
}
