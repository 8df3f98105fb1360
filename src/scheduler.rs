//! Injected periodic-timer abstraction. The dispatcher's `Processor` never
//! touches `tokio::time` directly, so tests can substitute a manual
//! scheduler and advance flushes deterministically.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Handle returned by `schedule_periodic`; dropping or calling `cancel`
/// stops future firings.
pub struct CancelHandle {
    cancel: Box<dyn FnOnce() + Send>,
}

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Box::new(cancel) }
    }

    pub fn cancel(self) {
        (self.cancel)();
    }
}

pub trait Scheduler: Send + Sync {
    /// Invokes `callback` every `period`, starting after the first
    /// elapsed period (not immediately).
    fn schedule_periodic(
        &self,
        period: Duration,
        callback: Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>,
    ) -> CancelHandle;
}

/// Production scheduler backed by `tokio::time::interval`, run as a
/// detached task per timer.
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_periodic(
        &self,
        period: Duration,
        callback: Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>,
    ) -> CancelHandle {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately; consume it
            loop {
                ticker.tick().await;
                callback().await;
            }
        });
        CancelHandle::new(move || handle.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_fires_periodically() {
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = TokioScheduler;
        let counted = count.clone();
        let handle = scheduler.schedule_periodic(
            Duration::from_millis(10),
            Box::new(move || {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(count.load(Ordering::SeqCst) >= 3);
        handle.cancel();
    }
}
