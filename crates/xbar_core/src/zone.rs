//! Routing Zones
//!
//! A routing zone is the unit of scheduling tied to one output clock
//! domain. The zone object is the setup-side owner: it links the sink
//! device, creates the conversion buffers of its input ports, manages the
//! pipeline slot and the derived zones, and starts/stops the worker. The
//! real-time work lives in [`crate::worker::ZoneWorker`]; the zone holds
//! the worker and must call [`RoutingZone::stop`] before releasing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::device::{AudioDevice, ClockType, DeviceType};
use crate::error::{XbarError, XbarResult};
use crate::events::EventProvider;
use crate::format::SampleFormat;
use crate::matrix::SwitchMatrix;
use crate::pipeline::Pipeline;
use crate::port::AudioPort;
use crate::ringbuf::{RingBuffer, RingBufferFactory};
use crate::worker::{StateAction, ZoneParams, ZoneWorker};

/// One routing zone of the topology.
pub struct RoutingZone {
    params: ZoneParams,
    worker: Arc<ZoneWorker>,
    events: Arc<EventProvider>,
    sink_device: Mutex<Option<Arc<AudioDevice>>>,
    derived_zones: Mutex<Vec<Arc<RoutingZone>>>,
    base_zone: Mutex<Weak<RoutingZone>>,
    is_derived: AtomicBool,
    /// Off by default; when enabled, derived zones with a period multiple
    /// above one run on shared runner threads instead of inline.
    use_runner_threads: AtomicBool,
    started: AtomicBool,
}

impl RoutingZone {
    pub fn new(name: &str, events: Arc<EventProvider>) -> Arc<Self> {
        let params = ZoneParams {
            name: name.to_string(),
        };
        let worker = ZoneWorker::new(params.clone(), Arc::clone(&events));
        Arc::new(Self {
            params,
            worker,
            events,
            sink_device: Mutex::new(None),
            derived_zones: Mutex::new(Vec::new()),
            base_zone: Mutex::new(Weak::new()),
            is_derived: AtomicBool::new(false),
            use_runner_threads: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn worker(&self) -> &Arc<ZoneWorker> {
        &self.worker
    }

    pub fn is_derived_zone(&self) -> bool {
        self.is_derived.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.worker.is_active()
    }

    pub fn sample_rate(&self) -> u32 {
        self.worker.sample_rate()
    }

    pub fn period_size(&self) -> u32 {
        self.worker.period_size()
    }

    pub fn switch_matrix(&self) -> Option<Arc<SwitchMatrix>> {
        self.worker.switch_matrix()
    }

    pub fn set_runner_threads_enabled(&self, enabled: bool) {
        self.use_runner_threads.store(enabled, Ordering::Relaxed);
    }

    pub fn sink_device(&self) -> Option<Arc<AudioDevice>> {
        self.sink_device.lock().clone()
    }

    pub fn has_linked_sink_device(&self) -> bool {
        self.sink_device.lock().is_some()
    }

    /// Link the sink device that provides this zone's clock. For a base
    /// zone this also creates the zone's switch matrix, sized by the sink's
    /// period and rate.
    pub fn link_sink_device(&self, device: Arc<AudioDevice>) -> XbarResult<()> {
        if device.device_type() != DeviceType::Sink {
            return Err(XbarError::invalid_param(format!(
                "device {} is not a sink device",
                device.name()
            )));
        }
        info!(
            "zone {}: linking sink device {} (clock type {:?})",
            self.params.name,
            device.name(),
            device.clock_type()
        );
        self.worker.link_sink_device(Arc::clone(&device))?;

        if !self.is_derived_zone() && self.worker.switch_matrix().is_none() {
            let matrix = SwitchMatrix::new(
                &format!("{}_worker", self.params.name),
                device.period_size(),
                device.sample_rate(),
                Arc::clone(&self.events),
            )?;
            self.worker.set_switch_matrix(matrix);
        }
        *self.sink_device.lock() = Some(device);
        Ok(())
    }

    pub fn unlink_sink_device(&self) {
        debug_assert!(!self.is_active());
        self.worker.unlink_sink_device();
        *self.sink_device.lock() = None;
    }

    /// Create the conversion buffer of a zone input port. The buffer's
    /// channel count follows the port; the format may be chosen
    /// independently of the sink format (default: sink format).
    pub fn create_conversion_buffer(
        &self,
        port: &Arc<AudioPort>,
        format: Option<SampleFormat>,
    ) -> XbarResult<Arc<RingBuffer>> {
        let sink = self.sink_device.lock().clone().ok_or_else(|| {
            error!("zone {}: no sink device linked", self.params.name);
            XbarError::NotInitialized("no sink device linked to routing zone")
        })?;
        if self.worker.conversion_buffer(port).is_some() {
            error!(
                "zone {}: already includes a conversion buffer for port {}",
                self.params.name,
                port.name()
            );
            return Err(XbarError::failed("conversion buffer already exists"));
        }

        let format = format.unwrap_or(sink.format());
        let name = format!("RoutingZone_conv_{}_{}", self.params.name, port.name());
        info!(
            "zone {}: creating conversion buffer {} ({} periods of {}, {} channels, {})",
            self.params.name,
            name,
            sink.num_periods(),
            sink.period_size(),
            port.num_channels(),
            format
        );
        let buffer = RingBufferFactory::instance().create_real(
            &name,
            sink.period_size(),
            sink.num_periods(),
            port.num_channels(),
            format,
        )?;
        self.worker.add_conversion_buffer(port, Arc::clone(&buffer))?;
        port.set_ring_buffer(Arc::clone(&buffer));
        Ok(buffer)
    }

    pub fn destroy_conversion_buffer(&self, port: &Arc<AudioPort>) -> XbarResult<()> {
        let buffer = self
            .worker
            .conversion_buffer(port)
            .ok_or_else(|| XbarError::failed("no conversion buffer for port"))?;
        self.worker.delete_conversion_buffer(port);
        port.clear_ring_buffer();
        RingBufferFactory::instance().destroy(&buffer);
        Ok(())
    }

    /// Bind a zone input port to a sink device input port; the port's
    /// channel range of the sink receives this input's PCM directly.
    pub fn link_audio_ports(
        &self,
        zone_port: &Arc<AudioPort>,
        sink_device_port: &Arc<AudioPort>,
    ) -> XbarResult<()> {
        self.worker.link_ports(zone_port, sink_device_port)
    }

    pub fn unlink_audio_ports(&self, zone_port: &Arc<AudioPort>) {
        self.worker.unlink_ports(zone_port);
    }

    pub fn linked_sink_port(&self, zone_port: &Arc<AudioPort>) -> Option<Arc<AudioPort>> {
        self.worker.linked_sink_port(zone_port)
    }

    pub fn add_pipeline(&self, pipeline: Box<dyn Pipeline>) -> XbarResult<()> {
        self.worker.add_pipeline(pipeline)
    }

    pub fn delete_pipeline(&self) {
        self.worker.delete_pipeline();
    }

    /// Turn `derived` into a derived zone of this base zone. The derived
    /// zone gives up its own clock and switch matrix and is scheduled by
    /// this zone at its period-size multiple.
    pub fn add_derived_zone(self: &Arc<Self>, derived: &Arc<RoutingZone>) -> XbarResult<()> {
        if self.is_derived_zone() {
            error!(
                "zone {}: cannot add derived zones to a zone that is already derived",
                self.params.name
            );
            return Err(XbarError::failed(
                "derived zones cannot own derived zones",
            ));
        }
        derived.set_zone_derived(true, Arc::downgrade(self));
        self.worker.add_derived_zone_worker(
            Arc::clone(derived.worker()),
            self.use_runner_threads.load(Ordering::Relaxed),
        )?;

        // The derived zone is serviced by the base zone's switch matrix.
        if let Some(matrix) = self.worker.switch_matrix() {
            derived.worker().set_switch_matrix(matrix);
        }
        self.derived_zones.lock().push(Arc::clone(derived));
        Ok(())
    }

    pub fn delete_derived_zone(&self, derived: &Arc<RoutingZone>) {
        self.worker.delete_derived_zone_worker(derived.worker());
        self.derived_zones
            .lock()
            .retain(|z| !Arc::ptr_eq(z, derived));

        // Give the former derived zone an independent switch matrix again.
        derived.set_zone_derived(false, Weak::new());
        if let Some(sink) = derived.sink_device() {
            if let Ok(matrix) = SwitchMatrix::new(
                &format!("{}_worker", derived.name()),
                sink.period_size(),
                sink.sample_rate(),
                Arc::clone(&derived.events),
            ) {
                derived.worker().set_switch_matrix(matrix);
            }
        }
    }

    fn set_zone_derived(&self, derived: bool, base: Weak<RoutingZone>) {
        self.is_derived.store(derived, Ordering::Relaxed);
        self.worker.set_derived(derived);
        *self.base_zone.lock() = base;
    }

    pub fn base_zone(&self) -> Option<Arc<RoutingZone>> {
        self.base_zone.lock().upgrade()
    }

    pub fn derived_zones(&self) -> Vec<Arc<RoutingZone>> {
        self.derived_zones.lock().clone()
    }

    /// Start streaming. A base zone spawns its worker thread and becomes
    /// active immediately; a derived zone only enters the prepared state
    /// and is activated by its base zone once the sink drains its prefill.
    pub fn start(&self) -> XbarResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            info!("zone {}: already started", self.params.name);
            return Ok(());
        }

        if !self.is_derived_zone() {
            let sink = self.sink_device.lock().clone().ok_or_else(|| {
                error!("zone {}: cannot start without a sink device", self.params.name);
                XbarError::failed("zone has no sink device")
            })?;
            // A base zone is clocked by its sink; the sink must receive the
            // clock from us.
            if sink.clock_type() == ClockType::Provided {
                error!(
                    "zone {}: sink device {} must have a received clock type, found {:?}",
                    self.params.name,
                    sink.name(),
                    sink.clock_type()
                );
                self.started.store(false, Ordering::SeqCst);
                return Err(XbarError::invalid_param(
                    "base zone sink must have clock type Received",
                ));
            }
        }

        if let Err(e) = self.worker.prepare_states() {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if self.is_derived_zone() {
            self.worker.change_state(StateAction::Prepare, true);
        } else {
            self.worker.start()?;
            self.worker.change_state(StateAction::Prepare, true);
            self.worker.change_state(StateAction::Activate, true);
        }
        Ok(())
    }

    /// Stop streaming and join all owned threads. Must be called before
    /// the zone is dropped while connections exist.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.is_derived_zone() {
            self.worker.change_state(StateAction::Inactivate, true);
            if let Some(sink) = self.sink_device.lock().as_ref() {
                sink.stop();
            }
        } else {
            for derived in self.derived_zones.lock().iter() {
                derived.stop();
            }
            self.worker.stop();
        }
    }
}

impl Drop for RoutingZone {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InProcClient;
    use crate::device::{DeviceParams, OwnerRef};
    use crate::pipeline::{Pipeline, PipelineParams};
    use crate::port::{PortDirection, PortParams};

    fn sink_device(name: &str, sample_rate: u32, period: u32) -> Arc<AudioDevice> {
        let params = DeviceParams {
            name: name.into(),
            num_channels: 2,
            sample_rate,
            format: SampleFormat::Int16,
            clock_type: ClockType::Received,
            period_size: period,
            num_periods: 4,
            num_periods_asrc_buffer: 0,
        };
        let backend = InProcClient::new(&params, DeviceType::Sink).unwrap();
        let device = AudioDevice::new(DeviceType::Sink, params, Box::new(backend)).unwrap();
        let port = AudioPort::new(PortParams {
            name: format!("{}_in", name),
            id: 1000,
            direction: PortDirection::Input,
            num_channels: 2,
            index: 0,
        });
        port.set_ring_buffer(device.ring_buffer().unwrap());
        port.set_owner(OwnerRef::Device(Arc::downgrade(&device)));
        device.add_port(port);
        device
    }

    fn zone_port(name: &str, id: i32) -> Arc<AudioPort> {
        AudioPort::new(PortParams {
            name: name.into(),
            id,
            direction: PortDirection::Input,
            num_channels: 2,
            index: 0,
        })
    }

    #[test]
    fn test_link_creates_matrix() {
        let events = EventProvider::new();
        let zone = RoutingZone::new("zn_link", Arc::clone(&events));
        assert!(zone.switch_matrix().is_none());

        let sink = sink_device("zn_link_sink", 48_000, 192);
        zone.link_sink_device(sink).unwrap();
        let matrix = zone.switch_matrix().unwrap();
        assert_eq!(matrix.copy_size(), 192);
        assert_eq!(matrix.sample_rate(), 48_000);
    }

    #[test]
    fn test_conversion_buffer_lifecycle() {
        let events = EventProvider::new();
        let zone = RoutingZone::new("zn_conv", events);
        let port = zone_port("zn_conv_port", 1);

        // Without a sink device the zone cannot size the buffer.
        assert!(zone.create_conversion_buffer(&port, None).is_err());

        let sink = sink_device("zn_conv_sink", 48_000, 192);
        zone.link_sink_device(sink).unwrap();
        let buffer = zone.create_conversion_buffer(&port, None).unwrap();
        assert_eq!(buffer.num_channels(), 2);
        assert_eq!(buffer.period_size(), 192);
        assert_eq!(buffer.format(), SampleFormat::Int16);
        // The port now references the buffer.
        assert!(Arc::ptr_eq(&port.ring_buffer().unwrap(), &buffer));

        // A second buffer for the same port is refused.
        assert!(zone.create_conversion_buffer(&port, None).is_err());

        zone.destroy_conversion_buffer(&port).unwrap();
        assert!(port.ring_buffer().is_err());
        // Now a new one can be created with an independent format.
        let buffer = zone
            .create_conversion_buffer(&port, Some(SampleFormat::Float32))
            .unwrap();
        assert_eq!(buffer.format(), SampleFormat::Float32);
    }

    #[test]
    fn test_start_requires_received_clock() {
        let events = EventProvider::new();
        let zone = RoutingZone::new("zn_clock", events);
        let params = DeviceParams {
            name: "zn_clock_sink".into(),
            num_channels: 2,
            sample_rate: 48_000,
            format: SampleFormat::Int16,
            clock_type: ClockType::Provided,
            period_size: 192,
            num_periods: 4,
            num_periods_asrc_buffer: 0,
        };
        let backend = InProcClient::new(&params, DeviceType::Sink).unwrap();
        let device = AudioDevice::new(DeviceType::Sink, params, Box::new(backend)).unwrap();
        zone.link_sink_device(device).unwrap();

        let port = zone_port("zn_clock_port", 2);
        zone.create_conversion_buffer(&port, None).unwrap();

        assert!(matches!(
            zone.start(),
            Err(XbarError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_derived_zone_rules() {
        let events = EventProvider::new();
        let base = RoutingZone::new("zn_base", Arc::clone(&events));
        base.link_sink_device(sink_device("zn_base_sink", 48_000, 192))
            .unwrap();

        // Derived zone at twice the period: multiple 2.
        let derived = RoutingZone::new("zn_derived", Arc::clone(&events));
        derived
            .link_sink_device(sink_device("zn_derived_sink", 48_000, 384))
            .unwrap();
        base.add_derived_zone(&derived).unwrap();
        assert!(derived.is_derived_zone());
        assert!(Arc::ptr_eq(&derived.base_zone().unwrap(), &base));
        // The derived zone shares the base matrix.
        assert!(Arc::ptr_eq(
            &derived.switch_matrix().unwrap(),
            &base.switch_matrix().unwrap()
        ));

        // A derived zone must not own derived zones.
        let third = RoutingZone::new("zn_third", Arc::clone(&events));
        third
            .link_sink_device(sink_device("zn_third_sink", 48_000, 192))
            .unwrap();
        assert!(derived.add_derived_zone(&third).is_err());

        // Deleting restores independence.
        base.delete_derived_zone(&derived);
        assert!(!derived.is_derived_zone());
        assert!(derived.base_zone().is_none());
        assert!(!Arc::ptr_eq(
            &derived.switch_matrix().unwrap(),
            &base.switch_matrix().unwrap()
        ));
    }

    #[test]
    fn test_derived_zone_non_integer_multiple_rejected() {
        let events = EventProvider::new();
        let base = RoutingZone::new("zn_base_ni", Arc::clone(&events));
        base.link_sink_device(sink_device("zn_base_ni_sink", 48_000, 192))
            .unwrap();

        // Period 288 against base 192: multiple 1.5, not allowed.
        let derived = RoutingZone::new("zn_derived_ni", Arc::clone(&events));
        derived
            .link_sink_device(sink_device("zn_derived_ni_sink", 48_000, 288))
            .unwrap();
        assert!(base.add_derived_zone(&derived).is_err());
    }

    struct NullPipeline {
        params: PipelineParams,
    }

    impl Pipeline for NullPipeline {
        fn params(&self) -> &PipelineParams {
            &self.params
        }

        fn provide_input_data(
            &mut self,
            _port_id: i32,
            _input: crate::format::AreaView<'_>,
            _frames_to_read: u32,
            frames_to_write: u32,
        ) -> XbarResult<u32> {
            Ok(frames_to_write)
        }

        fn process(&mut self) {}

        fn retrieve_output_data(
            &mut self,
            _sink: &mut crate::format::AreaViewMut<'_>,
            _frames: u32,
        ) {
        }
    }

    #[test]
    fn test_pipeline_must_match_sink() {
        let events = EventProvider::new();
        let zone = RoutingZone::new("zn_pipe", events);
        zone.link_sink_device(sink_device("zn_pipe_sink", 48_000, 192))
            .unwrap();

        // Period mismatch is refused.
        let bad = NullPipeline {
            params: PipelineParams {
                name: "bad".into(),
                period_size: 256,
                sample_rate: 48_000,
            },
        };
        assert!(zone.add_pipeline(Box::new(bad)).is_err());

        let good = NullPipeline {
            params: PipelineParams {
                name: "good".into(),
                period_size: 192,
                sample_rate: 48_000,
            },
        };
        zone.add_pipeline(Box::new(good)).unwrap();

        // Only one pipeline per zone.
        let second = NullPipeline {
            params: PipelineParams {
                name: "second".into(),
                period_size: 192,
                sample_rate: 48_000,
            },
        };
        assert!(zone.add_pipeline(Box::new(second)).is_err());
        zone.delete_pipeline();
    }
}
