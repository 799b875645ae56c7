//! Self-healing watcher for the DNS override
//!
//! Other processes (NetworkManager, dhclient, systemd-resolved) rewrite
//! resolv.conf whenever they feel like it. While the override is active the
//! watcher puts it back: it waits for a change, lets the settle period pass
//! so a series of rapid writes is handled once, then rewrites the override
//! and re-arms.

use super::resolv::ResolvFile;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Delay between detecting an external change and restoring the override
pub const SETTLE_PERIOD: Duration = Duration::from_secs(2);

/// Handle to a running watcher task
pub(crate) struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signal the watcher and wait for it to finish its current step
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Start watching `resolv` and keep `addr` in place until stopped
pub(crate) fn spawn(resolv: Arc<ResolvFile>, addr: IpAddr, settle: Duration) -> WatcherHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(resolv, addr, settle, cancel.clone()));
    WatcherHandle { cancel, task }
}

async fn run(resolv: Arc<ResolvFile>, addr: IpAddr, settle: Duration, cancel: CancellationToken) {
    if let Err(e) = watch_loop(&resolv, addr, settle, &cancel).await {
        error!("Failed to run DNS-change monitoring (notify error): {}", e);
    }
    info!("DNS-change monitoring stopped");
}

async fn watch_loop(
    resolv: &ResolvFile,
    addr: IpAddr,
    settle: Duration,
    cancel: &CancellationToken,
) -> Result<(), notify::Error> {
    let (events_tx, mut events_rx) = mpsc::channel::<notify::Result<Event>>(16);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = events_tx.try_send(res);
        },
        Config::default(),
    )?;

    info!("DNS-change monitoring started");

    loop {
        watcher.watch(resolv.path(), RecursiveMode::NonRecursive)?;

        let event = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = events_rx.recv() => match received {
                    Some(Ok(event)) if is_external_change(&event) => break event,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
            }
        };

        // The watch may already be gone if the file was replaced
        if let Err(e) = watcher.unwatch(resolv.path()) {
            warn!("Failed to remove DNS file watch: {}", e);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(settle) => {}
        }

        while events_rx.try_recv().is_ok() {}

        info!(
            "DNS-change monitoring: DNS was changed outside [{:?}]. Restoring ...",
            event.kind
        );
        if let Err(e) = resolv.reapply_override(addr) {
            error!("{}", e);
        }
    }
}

/// Reads (open/close-nowrite/access) are not changes
fn is_external_change(event: &Event) -> bool {
    !matches!(event.kind, EventKind::Access(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    #[test]
    fn test_is_external_change() {
        assert!(is_external_change(&Event::new(EventKind::Modify(ModifyKind::Any))));
        assert!(is_external_change(&Event::new(EventKind::Create(CreateKind::File))));
        assert!(!is_external_change(&Event::new(EventKind::Access(AccessKind::Any))));
    }

    #[test]
    fn test_settle_period() {
        assert_eq!(SETTLE_PERIOD, Duration::from_secs(2));
    }
}
