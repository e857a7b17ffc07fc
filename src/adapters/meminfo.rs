//! System memory pressure source.
//!
//! Polls `/proc/meminfo` and yields a [`PressureSignal`] on each poll where
//! available memory is below a fraction of total memory.

use std::path::PathBuf;
use std::time::Duration;

use futures::Stream;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::cache::{PressureConfig, PressureSignal};
use crate::error::{Error, Result};

/// Default location of the kernel memory statistics
pub const PROC_MEMINFO: &str = "/proc/meminfo";

/// The fields of `/proc/meminfo` the watcher needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemInfo {
    /// Parse the contents of `/proc/meminfo`
    pub fn parse(contents: &str) -> Option<Self> {
        let mut total = None;
        let mut available = None;

        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            let field = parts.next();
            let value = parts.next().and_then(|v| v.parse::<u64>().ok());
            match field {
                Some("MemTotal:") => total = value,
                Some("MemAvailable:") => available = value,
                _ => {}
            }
            if total.is_some() && available.is_some() {
                break;
            }
        }

        Some(Self {
            total_kb: total?,
            available_kb: available?,
        })
    }

    /// Available memory as a fraction of total
    pub fn available_ratio(&self) -> f64 {
        if self.total_kb == 0 {
            return 1.0;
        }
        self.available_kb as f64 / self.total_kb as f64
    }
}

/// Polls a meminfo file for low available memory
#[derive(Debug, Clone)]
pub struct MemInfoWatcher {
    path: PathBuf,
    interval: Duration,
    threshold: f64,
}

impl MemInfoWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, threshold: f64) -> Self {
        Self {
            path: path.into(),
            interval,
            threshold,
        }
    }

    /// Watcher on `/proc/meminfo` using the pressure configuration
    pub fn from_config(config: &PressureConfig) -> Self {
        Self::new(
            PROC_MEMINFO,
            config.poll_interval(),
            f64::from(config.available_ratio_threshold_percent) / 100.0,
        )
    }

    /// Read and parse the meminfo file once
    pub async fn read(&self) -> Result<MemInfo> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        MemInfo::parse(&contents).ok_or_else(|| {
            Error::Internal(format!(
                "{} lacks MemTotal or MemAvailable",
                self.path.display()
            ))
        })
    }

    /// Endless stream of signals, one per poll below the threshold
    pub fn into_stream(self) -> impl Stream<Item = PressureSignal> + Send + 'static {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        futures::stream::unfold((self, ticker), |(watcher, mut ticker)| async move {
            loop {
                ticker.tick().await;
                match watcher.read().await {
                    Ok(info) => {
                        let ratio = info.available_ratio();
                        trace!(ratio, "Polled system memory");
                        if ratio < watcher.threshold {
                            let signal = PressureSignal {
                                available_ratio: Some(ratio),
                            };
                            return Some((signal, (watcher, ticker)));
                        }
                    }
                    Err(e) => debug!(error = %e, "Failed to read memory statistics"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = "MemTotal:       16318412 kB\n\
                          MemFree:          734520 kB\n\
                          MemAvailable:    8159206 kB\n\
                          Buffers:          312412 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let info = MemInfo::parse(SAMPLE).unwrap();
        assert_eq!(info.total_kb, 16_318_412);
        assert_eq!(info.available_kb, 8_159_206);
        assert!((info.available_ratio() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_parse_requires_both_fields() {
        assert!(MemInfo::parse("MemTotal: 100 kB\n").is_none());
        assert!(MemInfo::parse("").is_none());
    }

    #[tokio::test]
    async fn test_stream_signals_below_threshold() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "MemTotal: 1000 kB\nMemAvailable: 50 kB\n").unwrap();

        let watcher = MemInfoWatcher::new(file.path(), Duration::from_millis(10), 0.10);
        let mut signals = Box::pin(watcher.into_stream());

        let signal = tokio::time::timeout(Duration::from_secs(2), signals.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.available_ratio, Some(0.05));
    }

    #[tokio::test]
    async fn test_stream_quiet_above_threshold() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "MemTotal: 1000 kB\nMemAvailable: 900 kB\n").unwrap();

        let watcher = MemInfoWatcher::new(file.path(), Duration::from_millis(10), 0.10);
        let mut signals = Box::pin(watcher.into_stream());

        let result = tokio::time::timeout(Duration::from_millis(100), signals.next()).await;
        assert!(result.is_err());
    }
}
