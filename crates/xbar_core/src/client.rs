//! In-Process Client Devices
//!
//! An in-process client is the software counterpart of a hardware device: a
//! real ring buffer plus an event queue. An application holds the device,
//! writes PCM into the ring buffer of a source (or reads from the buffer of
//! a sink) and signals `Start`/`Stop` through the event queue so the
//! routing zone can resynchronize when the application's stream stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::device::{DeviceBackend, DeviceEvent, DeviceParams, DeviceType};
use crate::error::XbarResult;
use crate::ringbuf::{RingBuffer, RingBufferFactory};

/// Application-side handle of an in-process client: the shared ring buffer
/// plus the event injection point. Obtained before the client is handed to
/// an [`crate::device::AudioDevice`].
#[derive(Clone)]
pub struct ClientHandle {
    ring: Arc<RingBuffer>,
    event_tx: Sender<DeviceEvent>,
    queue_enabled: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn ring_buffer(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Signal a stream state change to the consumer. Ignored while the
    /// consumer has not enabled the event queue.
    pub fn push_event(&self, event: DeviceEvent) {
        if self.queue_enabled.load(Ordering::Relaxed) {
            let _ = self.event_tx.send(event);
        }
    }
}

/// Device backend living inside the engine process.
pub struct InProcClient {
    name: String,
    ring: Arc<RingBuffer>,
    event_tx: Sender<DeviceEvent>,
    event_rx: Receiver<DeviceEvent>,
    queue_enabled: Arc<AtomicBool>,
}

impl InProcClient {
    pub fn new(params: &DeviceParams, device_type: DeviceType) -> XbarResult<Self> {
        params.validate()?;
        let ring_name = format!("InProcClient_{}", params.name);
        let ring = RingBufferFactory::instance().create_real(
            &ring_name,
            params.period_size,
            params.num_periods,
            params.num_channels,
            params.format,
        )?;
        debug!(
            "created in-process client {} ({:?}, {} periods of {})",
            params.name, device_type, params.num_periods, params.period_size
        );
        let (event_tx, event_rx) = unbounded();
        Ok(Self {
            name: params.name.clone(),
            ring,
            event_tx,
            event_rx,
            queue_enabled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for the application side, valid after the client has been
    /// boxed into a device.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            ring: Arc::clone(&self.ring),
            event_tx: self.event_tx.clone(),
            queue_enabled: Arc::clone(&self.queue_enabled),
        }
    }

    /// Application-side handle to the shared ring buffer.
    pub fn client_ring_buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    /// Application-side event injection. Ignored while the consumer has not
    /// enabled the queue.
    pub fn push_event(&self, event: DeviceEvent) {
        if self.queue_enabled.load(Ordering::Relaxed) {
            let _ = self.event_tx.send(event);
        }
    }
}

impl Drop for InProcClient {
    fn drop(&mut self) {
        RingBufferFactory::instance().destroy(&self.ring);
    }
}

impl DeviceBackend for InProcClient {
    fn ring_buffer(&self) -> XbarResult<Arc<RingBuffer>> {
        Ok(Arc::clone(&self.ring))
    }

    fn start(&self) -> XbarResult<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn set_non_block_mode(&self, _non_blocking: bool) -> XbarResult<()> {
        // Real buffers never block; nothing to switch.
        Ok(())
    }

    fn enable_event_queue(&self, enable: bool) {
        self.queue_enabled.store(enable, Ordering::Relaxed);
        if !enable {
            while self.event_rx.try_recv().is_ok() {}
        }
    }

    fn next_event(&self) -> DeviceEvent {
        self.event_rx.try_recv().unwrap_or(DeviceEvent::NoEvent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn params(name: &str) -> DeviceParams {
        DeviceParams {
            name: name.into(),
            num_channels: 2,
            sample_rate: 48_000,
            format: SampleFormat::Int16,
            clock_type: crate::device::ClockType::Provided,
            period_size: 32,
            num_periods: 4,
            num_periods_asrc_buffer: 0,
        }
    }

    #[test]
    fn test_ring_buffer_shared() {
        let client = InProcClient::new(&params("cl_shared"), DeviceType::Source).unwrap();
        let app_side = client.client_ring_buffer();
        let engine_side = client.ring_buffer().unwrap();
        assert!(Arc::ptr_eq(&app_side, &engine_side));
    }

    #[test]
    fn test_events_gated_by_enable() {
        let client = InProcClient::new(&params("cl_events"), DeviceType::Sink).unwrap();

        // Queue disabled: events are dropped.
        client.push_event(DeviceEvent::Stop);
        assert_eq!(client.next_event(), DeviceEvent::NoEvent);

        client.enable_event_queue(true);
        client.push_event(DeviceEvent::Start);
        client.push_event(DeviceEvent::Stop);
        assert_eq!(client.next_event(), DeviceEvent::Start);
        assert_eq!(client.next_event(), DeviceEvent::Stop);
        assert_eq!(client.next_event(), DeviceEvent::NoEvent);

        // Disabling drains leftovers.
        client.push_event(DeviceEvent::Stop);
        client.enable_event_queue(false);
        client.enable_event_queue(true);
        assert_eq!(client.next_event(), DeviceEvent::NoEvent);
    }

    #[test]
    fn test_duplicate_device_name_rejected() {
        let _first = InProcClient::new(&params("cl_dup"), DeviceType::Source).unwrap();
        assert!(InProcClient::new(&params("cl_dup"), DeviceType::Source).is_err());
    }
}
