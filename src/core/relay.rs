//! Bidirectional relay with idle-timeout detection
//!
//! The pump and a watchdog run as a first-completion race: the compound
//! operation finishes as soon as either direction ends or the shared
//! alive timestamp goes stale, and the losers are cancelled. Traffic on
//! an attached safety record keeps pushing its blacklist deadline
//! forward so an active, authenticated connection never ages out.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;

use super::safety::{SafetyRecord, BASE_PENALTY};

/// Result of a bidirectional relay
#[derive(Debug, Clone, Copy)]
pub struct RelayOutcome {
    /// Bytes transferred from A to B
    pub a_to_b: u64,
    /// Bytes transferred from B to A
    pub b_to_a: u64,
    /// Whether the relay ended normally (false = idle watchdog fired)
    pub completed: bool,
}

pin_project! {
    /// A stream wrapper that refreshes the shared alive timestamp and the
    /// safety deadline on every transferred byte
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        safety: Option<Arc<SafetyRecord>>,
        transferred: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        safety: Option<Arc<SafetyRecord>>,
        transferred: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            safety,
            transferred,
        }
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.last_activity
                    .store(this.start_time.elapsed().as_secs(), Ordering::Release);
                this.transferred
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
                if let Some(record) = this.safety {
                    record.extend(BASE_PENALTY);
                }
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.last_activity
                    .store(this.start_time.elapsed().as_secs(), Ordering::Release);
                if let Some(record) = this.safety {
                    record.extend(BASE_PENALTY);
                }
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Watchdog poll interval for a given idle timeout
fn watchdog_tick(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(30))
}

/// Relay bytes in both directions until either side finishes or the
/// session sits idle for `idle_timeout`.
///
/// Both streams are shut down before returning, whichever participant
/// won the race.
pub async fn copy_bidirectional_idle<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    safety: Option<Arc<SafetyRecord>>,
) -> std::io::Result<RelayOutcome>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let mut stream_a = TimedStream::new(
        a,
        start_time,
        Arc::clone(&last_activity),
        safety.clone(),
        Arc::clone(&a_to_b),
    );
    let mut stream_b = TimedStream::new(
        b,
        start_time,
        Arc::clone(&last_activity),
        safety,
        Arc::clone(&b_to_a),
    );

    let copy_task = tokio::io::copy_bidirectional(&mut stream_a, &mut stream_b);

    let idle_secs = idle_timeout.as_secs().max(1);
    let watchdog = async {
        let mut interval = tokio::time::interval(watchdog_tick(idle_timeout));
        interval.tick().await;
        loop {
            interval.tick().await;
            let last_active = last_activity.load(Ordering::Acquire);
            let elapsed = start_time.elapsed().as_secs();
            if elapsed.saturating_sub(last_active) >= idle_secs {
                return;
            }
        }
    };

    let outcome = tokio::select! {
        result = copy_task => {
            let (up, down) = result?;
            RelayOutcome { a_to_b: up, b_to_a: down, completed: true }
        }
        () = watchdog => {
            RelayOutcome {
                a_to_b: a_to_b.load(Ordering::Relaxed),
                b_to_a: b_to_a.load(Ordering::Relaxed),
                completed: false,
            }
        }
    };

    // Tear down both directions regardless of which participant finished
    let _ = stream_a.shutdown().await;
    let _ = stream_b.shutdown().await;

    Ok(outcome)
}
