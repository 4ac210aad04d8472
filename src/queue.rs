use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};

use crate::error::{ChannelError, ParseError};
use crate::readings::{Reading, decode_key, encode_key};

/// Maximum readings submitted in one publish attempt.
pub const BATCH_SIZE: usize = 50;

/// Outbound boundary the queue drains into. A batch is an ordered slice of
/// readings for one device; delivery is all-or-nothing per batch.
#[allow(async_fn_in_trait)]
pub trait ConnectivityChannel {
    async fn publish(&self, device_key: &str, batch: &[Reading]) -> Result<(), ChannelError>;
}

/// Store-and-forward queue of readings, one FIFO per `deviceKey+reference`
/// compound key. Entries are removed only after the channel confirms the
/// batch that contained them, so transient outages lose nothing and
/// deliver nothing twice.
#[derive(Default)]
pub struct TelemetryQueue {
    fifos: BTreeMap<String, VecDeque<Reading>>,
}

impl TelemetryQueue {
    pub fn new() -> Self {
        TelemetryQueue::default()
    }

    /// Append a reading to its key's FIFO, creating the FIFO if absent.
    /// Components carrying the reserved delimiter are rejected here, before
    /// they could ever decode into the wrong device.
    pub fn put(
        &mut self,
        device_key: &str,
        reference: &str,
        reading: Reading,
    ) -> Result<(), ParseError> {
        let key = encode_key(device_key, reference)?;
        self.fifos.entry(key).or_default().push_back(reading);
        Ok(())
    }

    /// Total queued readings across all keys.
    pub fn len(&self) -> usize {
        self.fifos.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fifos.is_empty()
    }

    /// Drain the queue against the channel. Each sweep peeks up to
    /// BATCH_SIZE readings per key; on success exactly the delivered
    /// prefix is removed, on failure the FIFO is left untouched and the
    /// sweep moves on to the next key. Sweeps repeat while the queue is
    /// non-empty, but only as long as the previous sweep removed at least
    /// one entry; a persistently failing channel therefore stops the loop
    /// instead of spinning on it.
    pub async fn publish<C: ConnectivityChannel>(&mut self, channel: &C) {
        loop {
            let mut progress = false;

            let keys: Vec<String> = self.fifos.keys().cloned().collect();
            for key in keys {
                let device_key = match decode_key(&key) {
                    Ok((device_key, _reference)) => device_key,
                    Err(err) => {
                        warn!("dropping unpublishable queue entries: {err}");
                        self.fifos.remove(&key);
                        progress = true;
                        continue;
                    }
                };

                let Some(fifo) = self.fifos.get(&key) else {
                    continue;
                };
                let batch: Vec<Reading> = fifo.iter().take(BATCH_SIZE).cloned().collect();

                match channel.publish(&device_key, &batch).await {
                    Ok(()) => {
                        debug!("published {} reading(s) for `{key}`", batch.len());
                        if let Some(fifo) = self.fifos.get_mut(&key) {
                            fifo.drain(..batch.len());
                            if fifo.is_empty() {
                                self.fifos.remove(&key);
                            }
                        }
                        progress = true;
                    }
                    Err(err) => {
                        warn!("retaining {} reading(s) for `{key}`: {err}", batch.len());
                    }
                }
            }

            if self.fifos.is_empty() || !progress {
                break;
            }
        }
    }
}
