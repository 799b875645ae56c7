//! Single-slot delayed task scheduler
//!
//! At most one task is pending at any time. Every [`Debouncer::reset`]
//! aborts the pending task (if any) and schedules a fresh one, so a burst of
//! resets fires the action once, `delay` after the last reset.
//!
//! [`Debouncer::reset_unless_cancelled`] ties a reset to a
//! [`CancellationToken`]: once the token is cancelled no new task is
//! scheduled, and a pending one does not fire.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type Action = Arc<dyn Fn() + Send + Sync>;

pub struct Debouncer {
    delay: Duration,
    runtime: Handle,
    action: Action,
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// `action` runs on the blocking pool since it may touch the OS.
    pub fn new(delay: Duration, runtime: Handle, action: Action) -> Self {
        Self {
            delay,
            runtime,
            action,
            slot: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancel the pending task and schedule the action `delay` from now.
    ///
    /// Safe to call from any thread, including non-runtime threads.
    pub fn reset(&self) {
        let mut slot = self.lock_slot();
        self.schedule(&mut slot, None);
    }

    /// Like [`reset`](Self::reset), but a no-op once `token` is cancelled.
    ///
    /// The token is checked under the slot lock, so cancelling the token and
    /// then calling [`cancel`](Self::cancel) leaves nothing pending.
    pub fn reset_unless_cancelled(&self, token: &CancellationToken) {
        let mut slot = self.lock_slot();
        if token.is_cancelled() {
            return;
        }
        self.schedule(&mut slot, Some(token.clone()));
    }

    fn schedule(&self, slot: &mut Option<JoinHandle<()>>, token: Option<CancellationToken>) {
        if let Some(pending) = slot.take() {
            pending.abort();
        }

        let action = Arc::clone(&self.action);
        let delay = self.delay;
        *slot = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if token.is_some_and(|t| t.is_cancelled()) {
                return;
            }
            let _ = tokio::task::spawn_blocking(move || action()).await;
        }));
    }

    /// Cancel the pending task, if any
    pub fn cancel(&self) {
        if let Some(pending) = self.lock_slot().take() {
            pending.abort();
        }
    }

    /// True while a scheduled action has not fired yet
    pub fn is_pending(&self) -> bool {
        self.lock_slot()
            .as_ref()
            .is_some_and(|pending| !pending.is_finished())
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_debouncer(delay: Duration) -> (Debouncer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let debouncer = Debouncer::new(
            delay,
            Handle::current(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (debouncer, fired)
    }

    async fn wait_until_fired(debouncer: &Debouncer) {
        while debouncer.is_pending() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_once() {
        let (debouncer, fired) = counting_debouncer(Duration::from_secs(3));

        for _ in 0..5 {
            debouncer.reset();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        wait_until_fired(&debouncer).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (debouncer, fired) = counting_debouncer(Duration::from_secs(3));
        assert_eq!(debouncer.delay(), Duration::from_secs(3));

        debouncer.reset();
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        wait_until_fired(&debouncer).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (debouncer, fired) = counting_debouncer(Duration::from_secs(3));

        debouncer.reset();
        debouncer.cancel();
        assert!(!debouncer.is_pending());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Cancelling an idle debouncer is harmless
        debouncer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_blocks_reset() {
        let (debouncer, fired) = counting_debouncer(Duration::from_secs(3));
        let token = CancellationToken::new();

        debouncer.reset_unless_cancelled(&token);
        assert!(debouncer.is_pending());
        wait_until_fired(&debouncer).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        token.cancel();
        debouncer.reset_unless_cancelled(&token);
        assert!(!debouncer.is_pending());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_cancelled_while_pending() {
        let (debouncer, fired) = counting_debouncer(Duration::from_secs(3));
        let token = CancellationToken::new();

        debouncer.reset_unless_cancelled(&token);
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        wait_until_fired(&debouncer).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_fire_separately() {
        let (debouncer, fired) = counting_debouncer(Duration::from_secs(1));

        debouncer.reset();
        wait_until_fired(&debouncer).await;
        debouncer.reset();
        wait_until_fired(&debouncer).await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
