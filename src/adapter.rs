use std::sync::Arc;

use bluer::AdapterEvent;
use futures::{Stream, StreamExt as _, pin_mut};
use log::debug;

use crate::error::AdapterError;
use crate::tracker::DeviceEvents;

/// Control surface of the platform Bluetooth adapter. Every call is a
/// bounded round-trip; failures are surfaced so the cycle controller can
/// decide whether to retry, and the scanning flag only moves on success.
#[allow(async_fn_in_trait)]
pub trait AdapterControl {
    async fn power_on(&mut self) -> Result<(), AdapterError>;
    async fn start_scan(&mut self) -> Result<(), AdapterError>;
    async fn stop_scan(&mut self) -> Result<(), AdapterError>;
    async fn remove_device(&mut self, address: &str) -> Result<(), AdapterError>;
    fn is_scanning(&self) -> bool;
}

/// BlueZ-backed adapter control. Discovery doubles as the device event
/// source: while a scan runs, a pump task forwards DeviceAdded and
/// DeviceRemoved events into the registered sink.
pub struct BluerAdapter {
    adapter: bluer::Adapter,
    events: Arc<dyn DeviceEvents>,
    discovery: Option<tokio::task::JoinHandle<()>>,
}

impl BluerAdapter {
    pub fn new(adapter: bluer::Adapter, events: Arc<dyn DeviceEvents>) -> Self {
        BluerAdapter {
            adapter,
            events,
            discovery: None,
        }
    }
}

async fn pump_events(
    stream: impl Stream<Item = AdapterEvent> + Send + 'static,
    events: Arc<dyn DeviceEvents>,
) {
    pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            AdapterEvent::DeviceAdded(address) => events.device_appeared(&address.to_string()),
            AdapterEvent::DeviceRemoved(address) => {
                events.device_disappeared(&address.to_string());
            }
            AdapterEvent::PropertyChanged(property) => {
                debug!("adapter property changed: {property:?}");
            }
        }
    }
    debug!("discovery event stream closed");
}

impl AdapterControl for BluerAdapter {
    async fn power_on(&mut self) -> Result<(), AdapterError> {
        self.adapter
            .set_powered(true)
            .await
            .map_err(|err| AdapterError::new("Powered", err))
    }

    async fn start_scan(&mut self) -> Result<(), AdapterError> {
        if self.discovery.is_some() {
            return Ok(());
        }
        let stream = self
            .adapter
            .discover_devices()
            .await
            .map_err(|err| AdapterError::new("StartDiscovery", err))?;
        let events = self.events.clone();
        self.discovery = Some(tokio::spawn(pump_events(stream, events)));
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), AdapterError> {
        // Stopping an idle adapter is a no-op. Dropping the event stream
        // ends the BlueZ discovery session.
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }
        Ok(())
    }

    async fn remove_device(&mut self, address: &str) -> Result<(), AdapterError> {
        let address: bluer::Address = address
            .parse()
            .map_err(|err| AdapterError::new("RemoveDevice", err))?;
        self.adapter
            .remove_device(address)
            .await
            .map_err(|err| AdapterError::new("RemoveDevice", err))
    }

    fn is_scanning(&self) -> bool {
        self.discovery.is_some()
    }
}
