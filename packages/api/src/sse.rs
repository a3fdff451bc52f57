// ABOUTME: Server-Sent Events infrastructure for run log streams
// ABOUTME: Per-IP connection limits, guard-carrying streams and run event encoding

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use kernel_runtime::StreamEvent;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Event name of the final message on every run stream
pub const COMPLETE_EVENT: &str = "complete";

/// Error returned when SSE connection limit is exceeded
#[derive(Debug)]
pub struct SseConnectionLimitExceeded;

/// Tracks concurrent SSE connections per IP address
#[derive(Clone)]
pub struct SseConnectionTracker {
    connections: Arc<Mutex<HashMap<IpAddr, usize>>>,
    max_connections_per_ip: usize,
}

impl SseConnectionTracker {
    pub fn new(max_connections_per_ip: usize) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_connections_per_ip: max_connections_per_ip.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
        self.connections.lock().unwrap_or_else(|poisoned| {
            warn!(
                audit = true,
                "SSE connection tracker mutex poisoned, recovering - this indicates a panic occurred while holding the lock"
            );
            poisoned.into_inner()
        })
    }

    /// Try to acquire a connection slot for the given IP
    /// Returns Ok(guard) if successful, Err if limit exceeded
    pub fn try_acquire(
        &self,
        ip: IpAddr,
    ) -> Result<SseConnectionGuard, SseConnectionLimitExceeded> {
        let mut connections = self.lock();
        let count = connections.entry(ip).or_insert(0);

        if *count >= self.max_connections_per_ip {
            warn!(
                ip = %ip,
                current = %count,
                max = self.max_connections_per_ip,
                audit = true,
                "SSE connection limit exceeded"
            );
            return Err(SseConnectionLimitExceeded);
        }

        *count += 1;
        info!(
            ip = %ip,
            count = %count,
            max = self.max_connections_per_ip,
            "SSE connection acquired"
        );

        Ok(SseConnectionGuard {
            ip,
            tracker: self.clone(),
        })
    }

    pub fn active_connections(&self, ip: IpAddr) -> usize {
        self.lock().get(&ip).copied().unwrap_or(0)
    }

    /// Release a connection slot for the given IP
    fn release(&self, ip: IpAddr) {
        let mut connections = self.lock();
        if let Some(count) = connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            info!(
                ip = %ip,
                remaining = %count,
                "SSE connection released"
            );

            // Clean up entry if count reaches zero
            if *count == 0 {
                connections.remove(&ip);
            }
        }
    }
}

/// RAII guard that automatically releases an SSE connection slot when dropped
pub struct SseConnectionGuard {
    ip: IpAddr,
    tracker: SseConnectionTracker,
}

impl Drop for SseConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.ip);
    }
}

/// Wrapper that guarantees guard cleanup even if stream is dropped without being consumed
pub struct GuardedSseStream<S> {
    stream: std::pin::Pin<Box<S>>,
    _guard: SseConnectionGuard,
}

impl<S> GuardedSseStream<S> {
    pub fn new(stream: S, guard: SseConnectionGuard) -> Self {
        Self {
            stream: Box::pin(stream),
            _guard: guard,
        }
    }
}

impl<S, T, E> Stream for GuardedSseStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// Helper to create SSE response with standard keep-alive settings
pub fn create_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// One `data:` message per log line; the completion marker is a named event.
pub fn run_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Line(line) => Event::default().data(line),
        StreamEvent::Complete => Event::default().event(COMPLETE_EVENT).data("done"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracker_basic() {
        let tracker = SseConnectionTracker::new(3);
        let ip = "127.0.0.1".parse().unwrap();

        // Should be able to acquire connections up to the limit
        let mut guards = Vec::new();
        for _ in 0..3 {
            let guard = tracker.try_acquire(ip);
            assert!(guard.is_ok());
            guards.push(guard.unwrap());
        }

        // Next connection should fail
        let result = tracker.try_acquire(ip);
        assert!(result.is_err());

        // Drop one guard and try again
        guards.pop();
        let guard = tracker.try_acquire(ip);
        assert!(guard.is_ok());
    }

    #[test]
    fn test_connection_guard_drop() {
        let tracker = SseConnectionTracker::new(1);
        let ip = "127.0.0.1".parse().unwrap();

        {
            let _guard = tracker.try_acquire(ip).unwrap();
            assert_eq!(tracker.active_connections(ip), 1);
        }

        assert_eq!(tracker.active_connections(ip), 0);
        assert!(tracker.try_acquire(ip).is_ok());
    }

    #[test]
    fn test_multiple_ips() {
        let tracker = SseConnectionTracker::new(1);
        let ip1 = "127.0.0.1".parse().unwrap();
        let ip2 = "127.0.0.2".parse().unwrap();

        // Each IP should have its own limit
        let _guard1 = tracker.try_acquire(ip1).unwrap();
        let _guard2 = tracker.try_acquire(ip2).unwrap();

        assert!(tracker.try_acquire(ip1).is_err());
        assert!(tracker.try_acquire(ip2).is_err());
    }

    #[test]
    fn test_zero_limit_still_allows_one_stream() {
        let tracker = SseConnectionTracker::new(0);
        let ip = "10.0.0.1".parse().unwrap();

        let _guard = tracker.try_acquire(ip).unwrap();
        assert!(tracker.try_acquire(ip).is_err());
    }
}
