use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::adapter::AdapterControl;
use crate::queue::{ConnectivityChannel, TelemetryQueue};
use crate::tracker::{PresenceAggregator, PresenceTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCycleState {
    Discovering,
    Draining,
}

/// Periodic state machine alternating between a discovery window and a
/// drain. Each timer tick stops discovery, converts the visible-set
/// snapshot into one presence reading per configured device, flushes the
/// telemetry queue, and restarts discovery.
pub struct ScanCycleController<A: AdapterControl, C: ConnectivityChannel> {
    adapter: A,
    channel: C,
    tracker: PresenceTracker,
    aggregator: PresenceAggregator,
    queue: TelemetryQueue,
    remove_matched: bool,
    state: ScanCycleState,
}

fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<A: AdapterControl, C: ConnectivityChannel> ScanCycleController<A, C> {
    pub fn new(
        adapter: A,
        channel: C,
        tracker: PresenceTracker,
        aggregator: PresenceAggregator,
        remove_matched: bool,
    ) -> Self {
        ScanCycleController {
            adapter,
            channel,
            tracker,
            aggregator,
            queue: TelemetryQueue::new(),
            remove_matched,
            state: ScanCycleState::Discovering,
        }
    }

    pub fn state(&self) -> ScanCycleState {
        self.state
    }

    /// Power the adapter and open the first discovery window. Neither
    /// failure is fatal: an unpowered or unscannable adapter simply yields
    /// no appeared events, and zero-presence readings still flow.
    pub async fn start(&mut self) {
        if let Err(err) = self.adapter.power_on().await {
            warn!("unable to enable the adapter: {err}");
        }
        if let Err(err) = self.adapter.start_scan().await {
            warn!("unable to scan for devices: {err}");
        }
        self.state = ScanCycleState::Discovering;
    }

    /// One timer tick: the Discovering -> Draining -> Discovering pass.
    pub async fn tick(&mut self) {
        if let Err(err) = self.adapter.stop_scan().await {
            // Stay in Discovering; the next tick retries the stop rather
            // than silently ending all telemetry.
            warn!("unable to stop discovery, retrying next tick: {err}");
            return;
        }
        self.state = ScanCycleState::Draining;

        let visible = self.tracker.take_visible();
        debug!("drain: {} address(es) visible", visible.len());
        let matched = self.aggregator.observe(&visible);

        if self.remove_matched {
            for address in &matched {
                if let Err(err) = self.adapter.remove_device(address).await {
                    warn!("unable to remove {address}: {err}");
                }
            }
        }

        let timestamp = unix_timestamp_ms();
        for (device_key, reading) in self.aggregator.readings(timestamp) {
            let reference = reading.reference.clone();
            if let Err(err) = self.queue.put(&device_key, &reference, reading) {
                warn!("discarding reading for `{device_key}`: {err}");
            }
        }
        self.aggregator.reset();

        self.queue.publish(&self.channel).await;
        if !self.queue.is_empty() {
            info!("{} reading(s) retained for a later cycle", self.queue.len());
        }

        self.state = ScanCycleState::Discovering;
        if let Err(err) = self.adapter.start_scan().await {
            warn!("unable to scan for devices: {err}");
        }
    }

    /// Drive the cycle from a periodic timer until the process exits.
    pub async fn run(mut self, period: Duration) {
        self.start().await;
        info!("scan cycle running every {period:?}");

        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // An interval's first tick fires immediately; the first drain
        // should come a full period after start().
        timer.tick().await;

        loop {
            timer.tick().await;
            self.tick().await;
        }
    }

    #[cfg(test)]
    pub fn queue(&self) -> &TelemetryQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::config::DeviceConfig;
    use crate::error::{AdapterError, ChannelError};
    use crate::readings::Reading;
    use crate::tracker::DeviceEvents as _;

    #[derive(Default)]
    struct MockAdapter {
        scanning: bool,
        fail_stop: Rc<RefCell<bool>>,
        calls: Rc<RefCell<Vec<&'static str>>>,
        removed: Rc<RefCell<Vec<String>>>,
    }

    impl AdapterControl for MockAdapter {
        async fn power_on(&mut self) -> Result<(), AdapterError> {
            self.calls.borrow_mut().push("power_on");
            Ok(())
        }

        async fn start_scan(&mut self) -> Result<(), AdapterError> {
            self.calls.borrow_mut().push("start_scan");
            self.scanning = true;
            Ok(())
        }

        async fn stop_scan(&mut self) -> Result<(), AdapterError> {
            self.calls.borrow_mut().push("stop_scan");
            if *self.fail_stop.borrow() {
                return Err(AdapterError::new("StopDiscovery", "dbus timeout"));
            }
            self.scanning = false;
            Ok(())
        }

        async fn remove_device(&mut self, address: &str) -> Result<(), AdapterError> {
            self.removed.borrow_mut().push(address.to_string());
            Ok(())
        }

        fn is_scanning(&self) -> bool {
            self.scanning
        }
    }

    #[derive(Default)]
    struct MockChannel {
        healthy: RefCell<bool>,
        delivered: RefCell<Vec<(String, Vec<Reading>)>>,
    }

    impl ConnectivityChannel for MockChannel {
        async fn publish(&self, device_key: &str, batch: &[Reading]) -> Result<(), ChannelError> {
            if !*self.healthy.borrow() {
                return Err(ChannelError::new(device_key, "broker unreachable"));
            }
            self.delivered
                .borrow_mut()
                .push((device_key.to_string(), batch.to_vec()));
            Ok(())
        }
    }

    impl ConnectivityChannel for Rc<MockChannel> {
        async fn publish(&self, device_key: &str, batch: &[Reading]) -> Result<(), ChannelError> {
            self.as_ref().publish(device_key, batch).await
        }
    }

    fn delivered_values(channel: &MockChannel, device_key: &str) -> Vec<f64> {
        channel
            .delivered
            .borrow()
            .iter()
            .filter(|(key, _)| key == device_key)
            .flat_map(|(_, batch)| batch.iter().map(|r| r.value))
            .collect()
    }

    const DEV1_ADDR: &str = "AA:BB:CC:DD:EE:FF";
    const DEV2_ADDR: &str = "11:22:33:44:55:66";

    fn devices() -> Vec<DeviceConfig> {
        vec![
            DeviceConfig {
                key: "DEV1".to_string(),
                address: DEV1_ADDR.parse().unwrap(),
                reference: None,
            },
            DeviceConfig {
                key: "DEV2".to_string(),
                address: DEV2_ADDR.parse().unwrap(),
                reference: None,
            },
        ]
    }

    fn controller(
        remove_matched: bool,
    ) -> (
        ScanCycleController<MockAdapter, Rc<MockChannel>>,
        PresenceTracker,
        Rc<MockChannel>,
    ) {
        let tracker = PresenceTracker::new();
        let aggregator = PresenceAggregator::new(&devices());
        let channel = Rc::new(MockChannel {
            healthy: RefCell::new(true),
            ..MockChannel::default()
        });
        let controller = ScanCycleController::new(
            MockAdapter::default(),
            channel.clone(),
            tracker.clone(),
            aggregator,
            remove_matched,
        );
        (controller, tracker, channel)
    }

    /// Presence value delivered for a device key in the n-th drained cycle.
    fn delivered_value(channel: &MockChannel, cycle: usize, device_key: &str) -> f64 {
        let delivered = channel.delivered.borrow();
        let batches: Vec<_> = delivered
            .iter()
            .filter(|(key, _)| key == device_key)
            .collect();
        batches[cycle].1[0].value
    }

    #[tokio::test]
    async fn test_three_cycle_scenario() {
        let (mut controller, tracker, channel) = controller(false);
        controller.start().await;
        assert_eq!(controller.state(), ScanCycleState::Discovering);

        // Cycle 1: DEV1 appears then disappears before the drain.
        tracker.device_appeared(DEV1_ADDR);
        tracker.device_disappeared(DEV1_ADDR);
        controller.tick().await;

        assert_eq!(delivered_value(&channel, 0, "DEV1"), 0.0);
        assert_eq!(delivered_value(&channel, 0, "DEV2"), 0.0);
        assert!(controller.queue().is_empty());

        // Cycle 2: DEV2 appears and stays visible through the drain.
        tracker.device_appeared(DEV2_ADDR);
        controller.tick().await;

        assert_eq!(delivered_value(&channel, 1, "DEV1"), 0.0);
        assert_eq!(delivered_value(&channel, 1, "DEV2"), 1.0);

        // Cycle 3: channel down; both readings are enqueued and retained.
        *channel.healthy.borrow_mut() = false;
        tracker.device_appeared(DEV1_ADDR);
        controller.tick().await;

        assert_eq!(controller.queue().len(), 2);
        assert_eq!(channel.delivered.borrow().len(), 4);

        // Next cycle the backlog goes out ahead of the fresh readings.
        *channel.healthy.borrow_mut() = true;
        controller.tick().await;
        assert!(controller.queue().is_empty());
        assert_eq!(delivered_values(&channel, "DEV1"), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(delivered_values(&channel, "DEV2"), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_presence_resets_after_every_drain() {
        let (mut controller, tracker, channel) = controller(false);
        controller.start().await;

        tracker.device_appeared(DEV1_ADDR);
        tracker.device_appeared(DEV2_ADDR);
        controller.tick().await;
        assert_eq!(delivered_value(&channel, 0, "DEV1"), 1.0);
        assert_eq!(delivered_value(&channel, 0, "DEV2"), 1.0);

        // Nothing seen in the next window: both report absent again.
        controller.tick().await;
        assert_eq!(delivered_value(&channel, 1, "DEV1"), 0.0);
        assert_eq!(delivered_value(&channel, 1, "DEV2"), 0.0);
    }

    #[tokio::test]
    async fn test_failed_stop_scan_retries_next_tick() {
        let (mut controller, tracker, channel) = controller(false);
        let fail_stop = controller.adapter.fail_stop.clone();
        let calls = controller.adapter.calls.clone();
        controller.start().await;

        assert!(controller.adapter.is_scanning());

        tracker.device_appeared(DEV1_ADDR);
        *fail_stop.borrow_mut() = true;
        controller.tick().await;

        // No drain happened: nothing delivered, nothing queued, state
        // still Discovering, the scanning flag untouched by the failed
        // stop, and the visible set intact.
        assert!(channel.delivered.borrow().is_empty());
        assert!(controller.queue().is_empty());
        assert_eq!(controller.state(), ScanCycleState::Discovering);
        assert!(controller.adapter.is_scanning());

        *fail_stop.borrow_mut() = false;
        controller.tick().await;
        assert!(controller.adapter.is_scanning());

        assert_eq!(delivered_value(&channel, 0, "DEV1"), 1.0);
        assert_eq!(
            calls.borrow().as_slice(),
            [
                "power_on",
                "start_scan",
                "stop_scan",
                "stop_scan",
                "start_scan"
            ]
        );
    }

    #[tokio::test]
    async fn test_matched_devices_removed_when_enabled() {
        let (mut controller, tracker, _channel) = controller(true);
        let removed = controller.adapter.removed.clone();
        controller.start().await;

        tracker.device_appeared(DEV2_ADDR);
        tracker.device_appeared("77:88:99:AA:BB:CC");
        controller.tick().await;

        // Only configured matches are forgotten, not every visible device.
        assert_eq!(removed.borrow().as_slice(), [DEV2_ADDR]);
    }
}
