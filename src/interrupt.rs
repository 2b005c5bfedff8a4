#![forbid(unsafe_code)]

//! Process-wide cancellation flag. Signal delivery sets it once; workers and
//! the process supervisor only ever read it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Debug, Default)]
struct InterruptInner {
    token: CancellationToken,
    requests: AtomicUsize,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Returns `true` only for the request that actually
    /// flipped it; later requests are counted and otherwise ignored.
    pub fn trigger(&self) -> bool {
        let previous = self.inner.requests.fetch_add(1, Ordering::SeqCst);
        self.inner.token.cancel();
        previous == 0
    }

    pub fn is_set(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the flag is set.
    pub async fn wait(&self) {
        self.inner.token.cancelled().await
    }

    pub fn requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }
}

/// Routes SIGINT and SIGTERM into `interrupt` for the rest of the process
/// lifetime. Repeated signals only log; shutdown latency is bounded by the
/// supervisor's grace/kill escalation instead.
pub fn install_signal_handlers(interrupt: Interrupt) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            let received = tokio::select! {
                result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
                _ = terminate.recv() => Ok("SIGTERM"),
            };
            #[cfg(not(unix))]
            let received = tokio::signal::ctrl_c().await.map(|()| "Ctrl+C");

            match received {
                Ok(name) => {
                    if interrupt.trigger() {
                        tracing::info!(signal = name, "interrupt received, shutting down gracefully");
                    } else {
                        tracing::warn!(
                            signal = name,
                            count = interrupt.requests(),
                            "already shutting down; waiting for running tools to exit"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!("failed to listen for interrupt signals: {err}");
                    break;
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_trigger_wins() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.is_set());
        assert!(interrupt.trigger());
        assert!(!interrupt.trigger());
        assert!(interrupt.is_set());
        assert_eq!(interrupt.requests(), 2);
    }

    #[test]
    fn clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let observer = interrupt.clone();
        interrupt.trigger();
        assert!(observer.is_set());
    }

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let interrupt = Interrupt::new();
        let observer = interrupt.clone();
        let waiter = tokio::spawn(async move { observer.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupt.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
