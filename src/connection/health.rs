//! Health monitor
//!
//! One periodic task for the whole registry. Each tick probes every
//! connected mount through the backend's control channel; the registry
//! decides what a failure means. The task only holds a weak reference; it
//! exits once the registry is dropped or no mount is left connected, and the
//! next successful connect starts it again.

use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::registry::ConnectionRegistry;

pub struct HealthMonitor {
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: Mutex::new(None),
        }
    }

    /// Start the sweep task unless it is already running
    pub fn ensure_running(&self, registry: Weak<ConnectionRegistry>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let period = self.interval;
        *task = Some(tokio::spawn(run(registry, period)));
        info!("Health monitor started (interval={}s)", period.as_secs());
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Health monitor stopped");
        }
    }

    /// Clear the task slot if nothing is connected.
    ///
    /// Checked under the slot lock so a concurrent connect either sees the
    /// task still registered (and the task keeps going) or an empty slot
    /// (and spawns a new one).
    fn release_if_idle(&self, registry: &ConnectionRegistry) -> bool {
        let mut task = self.task.lock();
        if registry.has_connected() {
            return false;
        }
        task.take();
        true
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run(registry: Weak<ConnectionRegistry>, period: Duration) {
    // 第一次检查在一个周期之后进行，刚挂载的连接不需要立即探测
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(registry) = registry.upgrade() else {
            debug!("Registry dropped, health monitor exiting");
            break;
        };
        if !registry.has_connected() && registry.monitor().release_if_idle(&registry) {
            info!("No connected mounts, health monitor stopped");
            break;
        }
        registry.run_health_check().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connection::testing::harness;

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = harness();
        let monitor = h.registry.monitor();
        assert!(!monitor.is_running());

        monitor.ensure_running(Arc::downgrade(&h.registry));
        monitor.ensure_running(Arc::downgrade(&h.registry));
        assert!(monitor.is_running());

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_idle_and_restarts_on_connect() {
        let h = harness();
        h.add_with_password("a", "pw").await;
        h.registry.monitor().ensure_running(Arc::downgrade(&h.registry));

        let interval = h.registry.options().health_interval();
        tokio::time::sleep(interval + Duration::from_secs(1)).await;
        assert!(!h.registry.is_monitoring());

        h.registry.connect("a").await.unwrap();
        assert!(h.registry.is_monitoring());

        tokio::time::sleep(interval * 2 + Duration::from_secs(1)).await;
        assert!(h.registry.is_monitoring());
        assert_eq!(h.backend.probe_count(), 2);
    }
}
