// ABOUTME: Buffered log persistence policy
// ABOUTME: Lines accumulate until a line count or elapsed time threshold is reached

use kernel_config::KernelConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_lines: usize,
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_lines: kernel_config::settings::DEFAULT_FLUSH_MAX_LINES,
            interval: Duration::from_millis(kernel_config::settings::DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

impl FlushPolicy {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            max_lines: config.flush_max_lines.max(1),
            interval: config.flush_interval,
        }
    }
}

/// Lines emitted since the last durable write.
#[derive(Debug)]
pub struct LogBuffer {
    pending: Vec<String>,
    last_flush: Instant,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.pending.push(line.into());
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True when there is something to write and a threshold has been crossed.
    pub fn is_due(&self, policy: &FlushPolicy) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= policy.max_lines
                || self.last_flush.elapsed() >= policy.interval)
    }

    /// Drain the buffer as newline-terminated text and restart the interval.
    pub fn take(&mut self) -> Option<String> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return None;
        }
        let mut chunk = self.pending.join("\n");
        chunk.push('\n');
        self.pending.clear();
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_lines: usize, interval_ms: u64) -> FlushPolicy {
        FlushPolicy {
            max_lines,
            interval: Duration::from_millis(interval_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_threshold_triggers_flush() {
        let policy = policy(3, 60_000);
        let mut buffer = LogBuffer::new();

        buffer.push("a");
        buffer.push("b");
        assert!(!buffer.is_due(&policy));

        buffer.push("c");
        assert!(buffer.is_due(&policy));
        assert_eq!(buffer.take(), Some("a\nb\nc\n".to_string()));
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_threshold_triggers_flush() {
        let policy = policy(100, 2_000);
        let mut buffer = LogBuffer::new();
        buffer.push("slow line");

        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert!(!buffer.is_due(&policy));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(buffer.is_due(&policy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_is_never_due() {
        let policy = policy(1, 10);
        let mut buffer = LogBuffer::new();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!buffer.is_due(&policy));
        assert_eq!(buffer.take(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_restarts_interval() {
        let policy = policy(100, 1_000);
        let mut buffer = LogBuffer::new();

        tokio::time::advance(Duration::from_millis(1_500)).await;
        buffer.push("first");
        assert!(buffer.is_due(&policy));
        buffer.take();

        buffer.push("second");
        assert!(!buffer.is_due(&policy));
    }

    #[test]
    fn test_policy_from_config() {
        let config = KernelConfig {
            flush_max_lines: 5,
            flush_interval: Duration::from_millis(250),
            ..KernelConfig::default()
        };

        assert_eq!(FlushPolicy::from_config(&config), policy(5, 250));
    }
}
