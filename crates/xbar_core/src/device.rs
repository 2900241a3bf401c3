//! Audio Device Model
//!
//! A device is one endpoint of the crossbar: an ALSA PCM or an in-process
//! client. The concrete transport lives behind [`DeviceBackend`]; the model
//! layer only carries the parameters and the audio ports of the device.
//!
//! [`OwnerRef`] is the polymorphic "port owner" view shared by devices and
//! routing zones: whoever owns a port answers for its sample rate, period
//! size and format.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{XbarError, XbarResult};
use crate::format::SampleFormat;
use crate::port::AudioPort;
use crate::ringbuf::RingBuffer;
use crate::worker::ZoneWorker;

/// Clock relationship of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockType {
    /// The device provides the clock (in-process sources).
    Provided,
    /// The device receives the clock synchronously (sink of a base zone).
    Received,
    /// The device runs on its own clock; an ASRC buffer decouples it.
    ReceivedAsync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Source,
    Sink,
}

/// Configuration of one audio device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceParams {
    pub name: String,
    pub num_channels: u32,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub clock_type: ClockType,
    pub period_size: u32,
    pub num_periods: u32,
    /// Depth of the ASRC buffer in periods, asynchronous devices only.
    pub num_periods_asrc_buffer: u32,
}

impl DeviceParams {
    pub fn validate(&self) -> XbarResult<()> {
        if self.name.is_empty() {
            return Err(XbarError::invalid_param("device name must not be empty"));
        }
        if self.num_channels == 0 || self.period_size == 0 || self.num_periods == 0 {
            return Err(XbarError::invalid_param(format!(
                "device {}: channels, period_size and num_periods must not be 0",
                self.name
            )));
        }
        if self.sample_rate == 0 {
            return Err(XbarError::invalid_param(format!(
                "device {}: sample rate must not be 0",
                self.name
            )));
        }
        if self.clock_type == ClockType::ReceivedAsync && self.num_periods_asrc_buffer < 1 {
            return Err(XbarError::invalid_param(format!(
                "device {}: num_periods_asrc_buffer must be >= 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Event reported by a device to its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    NoEvent,
    Start,
    Stop,
}

/// Concrete transport behind an [`AudioDevice`].
pub trait DeviceBackend: Send + Sync {
    /// The ring buffer external users exchange PCM through. For an
    /// asynchronous ALSA handler this is the ASRC buffer, otherwise the
    /// mirror or client buffer.
    fn ring_buffer(&self) -> XbarResult<Arc<RingBuffer>>;

    /// Open/prepare the device for streaming.
    fn start(&self) -> XbarResult<()>;

    fn stop(&self);

    /// Switch the device side between blocking and non-blocking
    /// availability checks.
    fn set_non_block_mode(&self, non_blocking: bool) -> XbarResult<()>;

    fn enable_event_queue(&self, enable: bool);

    /// Next queued device event; `NoEvent` when the queue is empty or
    /// disabled.
    fn next_event(&self) -> DeviceEvent;

    /// Drop stale PCM left over from a previous connection (used when a
    /// source device is re-connected). Hardware handlers clear their
    /// adaptation buffers here; client devices keep their buffer so an
    /// application may prefill before connecting.
    fn reset_source_buffers(&self) {}

    /// True for handlers driven by real hardware (changes the prefill
    /// bookkeeping of derived zones).
    fn is_hardware(&self) -> bool {
        false
    }
}

/// One audio device of the topology.
pub struct AudioDevice {
    device_type: DeviceType,
    params: DeviceParams,
    backend: Box<dyn DeviceBackend>,
    ports: Mutex<Vec<Arc<AudioPort>>>,
}

impl AudioDevice {
    pub fn new(
        device_type: DeviceType,
        params: DeviceParams,
        backend: Box<dyn DeviceBackend>,
    ) -> XbarResult<Arc<Self>> {
        params.validate()?;
        Ok(Arc::new(Self {
            device_type,
            params,
            backend,
            ports: Mutex::new(Vec::new()),
        }))
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    pub fn period_size(&self) -> u32 {
        self.params.period_size
    }

    pub fn num_periods(&self) -> u32 {
        self.params.num_periods
    }

    pub fn format(&self) -> SampleFormat {
        self.params.format
    }

    pub fn clock_type(&self) -> ClockType {
        self.params.clock_type
    }

    pub fn ring_buffer(&self) -> XbarResult<Arc<RingBuffer>> {
        self.backend.ring_buffer()
    }

    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    pub fn add_port(&self, port: Arc<AudioPort>) {
        self.ports.lock().push(port);
    }

    pub fn ports(&self) -> Vec<Arc<AudioPort>> {
        self.ports.lock().clone()
    }

    pub fn has_port(&self, port: &Arc<AudioPort>) -> bool {
        self.ports.lock().iter().any(|p| Arc::ptr_eq(p, port))
    }

    pub fn start(&self) -> XbarResult<()> {
        self.backend.start()
    }

    pub fn stop(&self) {
        self.backend.stop();
    }

    pub fn enable_event_queue(&self, enable: bool) {
        self.backend.enable_event_queue(enable);
    }

    pub fn next_event(&self) -> DeviceEvent {
        self.backend.next_event()
    }
}

/// Polymorphic owner of an audio port: a device or a routing zone.
#[derive(Clone)]
pub enum OwnerRef {
    Device(Weak<AudioDevice>),
    Zone(Weak<ZoneWorker>),
}

impl OwnerRef {
    pub fn sample_rate(&self) -> Option<u32> {
        match self {
            OwnerRef::Device(d) => d.upgrade().map(|d| d.sample_rate()),
            OwnerRef::Zone(z) => z.upgrade().map(|z| z.sample_rate()),
        }
    }

    pub fn period_size(&self) -> Option<u32> {
        match self {
            OwnerRef::Device(d) => d.upgrade().map(|d| d.period_size()),
            OwnerRef::Zone(z) => z.upgrade().map(|z| z.period_size()),
        }
    }

    /// For ports owned by a routing zone: whether the zone is active. Ports
    /// owned by devices have no activation state.
    pub fn zone_is_active(&self) -> Option<bool> {
        match self {
            OwnerRef::Device(_) => None,
            OwnerRef::Zone(z) => z.upgrade().map(|z| z.is_active()),
        }
    }

    pub fn as_device(&self) -> Option<Arc<AudioDevice>> {
        match self {
            OwnerRef::Device(d) => d.upgrade(),
            OwnerRef::Zone(_) => None,
        }
    }

    /// Drop stale source-side PCM before a new connection starts.
    pub fn reset_source_buffers(&self) {
        if let Some(device) = self.as_device() {
            device.backend().reset_source_buffers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InProcClient;

    fn params(name: &str) -> DeviceParams {
        DeviceParams {
            name: name.into(),
            num_channels: 2,
            sample_rate: 48_000,
            format: SampleFormat::Int16,
            clock_type: ClockType::Provided,
            period_size: 64,
            num_periods: 4,
            num_periods_asrc_buffer: 0,
        }
    }

    #[test]
    fn test_params_validation() {
        assert!(params("dev_ok").validate().is_ok());

        let mut p = params("dev_bad");
        p.period_size = 0;
        assert!(p.validate().is_err());

        let mut p = params("dev_async");
        p.clock_type = ClockType::ReceivedAsync;
        p.num_periods_asrc_buffer = 0;
        assert!(p.validate().is_err());
        p.num_periods_asrc_buffer = 4;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_device_accessors() {
        let p = params("dev_access");
        let backend = InProcClient::new(&p, DeviceType::Source).unwrap();
        let device = AudioDevice::new(DeviceType::Source, p, Box::new(backend)).unwrap();
        assert_eq!(device.name(), "dev_access");
        assert_eq!(device.sample_rate(), 48_000);
        assert!(device.ring_buffer().is_ok());
        assert!(!device.backend().is_hardware());
    }
}
