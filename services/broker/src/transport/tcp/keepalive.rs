// Periodic heartbeat timer owned by the publisher server.
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::RegistryHandle;

/// Reference heartbeat interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Ticks at a fixed interval and asks the registry to heartbeat every
/// member. Runs whether or not anyone is connected; the first tick fires
/// immediately. Dropping the scheduler stops it.
#[derive(Debug)]
pub struct KeepaliveScheduler {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KeepaliveScheduler {
    pub fn start(registry: RegistryHandle, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => registry.heartbeat(),
                }
            }
            tracing::debug!("keepalive scheduler stopped");
        });
        tracing::info!(interval_ms = interval.as_millis() as u64, "keepalive scheduler started");
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancels the timer and waits for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for KeepaliveScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::RegistryCommand;

    fn drain_heartbeats(
        inbox: &mut tokio::sync::mpsc::UnboundedReceiver<RegistryCommand>,
    ) -> usize {
        let mut count = 0;
        while let Ok(command) = inbox.try_recv() {
            if matches!(command, RegistryCommand::Heartbeat) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_fixed_interval_with_empty_registry() {
        let (registry, mut inbox) = RegistryHandle::detached();
        let scheduler = KeepaliveScheduler::start(registry, Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert_eq!(drain_heartbeats(&mut inbox), 1);

        tokio::time::sleep(Duration::from_millis(15_001)).await;
        assert_eq!(drain_heartbeats(&mut inbox), 3);
        assert!(scheduler.is_running());

        scheduler.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain_heartbeats(&mut inbox), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_scheduler_cancels_it() {
        let (registry, mut inbox) = RegistryHandle::detached();
        let scheduler = KeepaliveScheduler::start(registry, Duration::from_secs(1));
        tokio::task::yield_now().await;
        drop(scheduler);
        drain_heartbeats(&mut inbox);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(drain_heartbeats(&mut inbox), 0);
    }
}
