//! Configuration Registry and Engine Facade
//!
//! The registry maps human-facing ids to the object graph: source output
//! ports, zone input ports, devices and routing zones. During setup it is
//! a builder; `freeze` turns it read-only for the runtime phase (the
//! real-time threads only ever see immutable snapshots handed over through
//! queues, the freeze protects the maps themselves).
//!
//! [`Engine`] bundles registry, event provider and routing facade and
//! offers the convenience setup calls used by applications and tests:
//! create a device together with its default port, create zones and their
//! input ports, wire everything, start and stop. A topology can be
//! captured as JSON ([`Engine::dump_topology`]) so a setup can be attached
//! to a bug report or replayed by tooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::{ClientHandle, InProcClient};
use crate::device::{AudioDevice, DeviceBackend, DeviceParams, DeviceType, OwnerRef};
use crate::error::{XbarError, XbarResult};
use crate::events::{EngineEvent, EventProvider};
use crate::format::SampleFormat;
use crate::port::{AudioPort, PortDirection, PortParams};
use crate::probe::ProbeParams;
use crate::routing::Routing;
use crate::zone::RoutingZone;

/// Serializable capture of one routing zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub name: String,
    pub is_derived: bool,
    pub sink_device: Option<String>,
}

/// Serializable capture of a registered topology: everything needed to
/// rebuild the same setup, minus the device backends themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub devices: Vec<DeviceParams>,
    pub source_ports: Vec<PortParams>,
    pub sink_ports: Vec<PortParams>,
    pub zones: Vec<ZoneSnapshot>,
    pub connections: Vec<(i32, i32)>,
}

/// Id-addressable object graph of the topology.
pub struct Registry {
    source_ports: Mutex<HashMap<i32, Arc<AudioPort>>>,
    sink_ports: Mutex<HashMap<i32, Arc<AudioPort>>>,
    devices: Mutex<HashMap<String, Arc<AudioDevice>>>,
    zones: Mutex<HashMap<String, Arc<RoutingZone>>>,
    frozen: AtomicBool,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            source_ports: Mutex::new(HashMap::new()),
            sink_ports: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            zones: Mutex::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        })
    }

    fn check_mutable(&self) -> XbarResult<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(XbarError::failed(
                "topology is frozen while the engine is running",
            ));
        }
        Ok(())
    }

    /// Make the registry read-only (runtime phase).
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn add_source_port(&self, port: Arc<AudioPort>) -> XbarResult<()> {
        self.check_mutable()?;
        let mut ports = self.source_ports.lock();
        if ports.contains_key(&port.id()) {
            return Err(XbarError::invalid_param(format!(
                "source id {} already registered",
                port.id()
            )));
        }
        ports.insert(port.id(), port);
        Ok(())
    }

    pub fn add_sink_port(&self, port: Arc<AudioPort>) -> XbarResult<()> {
        self.check_mutable()?;
        let mut ports = self.sink_ports.lock();
        if ports.contains_key(&port.id()) {
            return Err(XbarError::invalid_param(format!(
                "sink id {} already registered",
                port.id()
            )));
        }
        ports.insert(port.id(), port);
        Ok(())
    }

    pub fn source_port(&self, id: i32) -> XbarResult<Arc<AudioPort>> {
        self.source_ports
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| XbarError::invalid_param(format!("unknown source id {}", id)))
    }

    pub fn sink_port(&self, id: i32) -> XbarResult<Arc<AudioPort>> {
        self.sink_ports
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| XbarError::invalid_param(format!("unknown sink id {}", id)))
    }

    pub fn add_device(&self, device: Arc<AudioDevice>) -> XbarResult<()> {
        self.check_mutable()?;
        let mut devices = self.devices.lock();
        if devices.contains_key(device.name()) {
            return Err(XbarError::invalid_param(format!(
                "device {} already registered",
                device.name()
            )));
        }
        devices.insert(device.name().to_string(), device);
        Ok(())
    }

    pub fn device(&self, name: &str) -> XbarResult<Arc<AudioDevice>> {
        self.devices
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| XbarError::invalid_param(format!("unknown device {}", name)))
    }

    pub fn add_zone(&self, zone: Arc<RoutingZone>) -> XbarResult<()> {
        self.check_mutable()?;
        let mut zones = self.zones.lock();
        if zones.contains_key(zone.name()) {
            return Err(XbarError::invalid_param(format!(
                "zone {} already registered",
                zone.name()
            )));
        }
        zones.insert(zone.name().to_string(), zone);
        Ok(())
    }

    pub fn zone(&self, name: &str) -> XbarResult<Arc<RoutingZone>> {
        self.zones
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| XbarError::invalid_param(format!("unknown zone {}", name)))
    }

    pub fn zones(&self) -> Vec<Arc<RoutingZone>> {
        self.zones.lock().values().cloned().collect()
    }

    /// All registered devices, ordered by name.
    pub fn devices(&self) -> Vec<Arc<AudioDevice>> {
        let mut devices: Vec<_> = self.devices.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        devices
    }

    /// All registered source output ports, ordered by id.
    pub fn source_ports(&self) -> Vec<Arc<AudioPort>> {
        let mut ports: Vec<_> = self.source_ports.lock().values().cloned().collect();
        ports.sort_by_key(|p| p.id());
        ports
    }

    /// All registered zone input ports, ordered by id.
    pub fn sink_ports(&self) -> Vec<Arc<AudioPort>> {
        let mut ports: Vec<_> = self.sink_ports.lock().values().cloned().collect();
        ports.sort_by_key(|p| p.id());
        ports
    }
}

/// The engine: registry, events, routing and the setup convenience API.
pub struct Engine {
    registry: Arc<Registry>,
    events: Arc<EventProvider>,
    routing: Routing,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            events: EventProvider::new(),
            routing: Routing::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventProvider> {
        &self.events
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    /// Next queued engine event, non-blocking.
    pub fn poll_event(&self) -> Option<EngineEvent> {
        self.events.try_next()
    }

    fn make_default_port(
        device: &Arc<AudioDevice>,
        port_id: i32,
        direction: PortDirection,
    ) -> XbarResult<Arc<AudioPort>> {
        let suffix = match direction {
            PortDirection::Output => "out",
            PortDirection::Input => "in",
        };
        let port = AudioPort::new(PortParams {
            name: format!("{}_{}", device.name(), suffix),
            id: port_id,
            direction,
            num_channels: device.params().num_channels,
            index: 0,
        });
        port.set_ring_buffer(device.ring_buffer()?);
        port.set_owner(OwnerRef::Device(Arc::downgrade(device)));
        device.add_port(Arc::clone(&port));
        Ok(port)
    }

    /// Create an in-process source device together with its default output
    /// port. Returns the application-side client handle.
    pub fn create_source_device(
        &self,
        params: DeviceParams,
        port_id: i32,
    ) -> XbarResult<ClientHandle> {
        let client = InProcClient::new(&params, DeviceType::Source)?;
        let handle = client.handle();
        let device = AudioDevice::new(DeviceType::Source, params, Box::new(client))?;
        let port = Self::make_default_port(&device, port_id, PortDirection::Output)?;
        self.registry.add_source_port(port)?;
        self.registry.add_device(device)?;
        Ok(handle)
    }

    /// Create an in-process sink device together with its default input
    /// port. Returns the application-side client handle.
    pub fn create_sink_device(
        &self,
        params: DeviceParams,
        port_id: i32,
    ) -> XbarResult<ClientHandle> {
        let client = InProcClient::new(&params, DeviceType::Sink)?;
        let handle = client.handle();
        let device = AudioDevice::new(DeviceType::Sink, params, Box::new(client))?;
        Self::make_default_port(&device, port_id, PortDirection::Input)?;
        self.registry.add_device(device)?;
        Ok(handle)
    }

    /// Register a device with a custom backend (e.g. an ALSA handler from
    /// the platform crate) plus its default port.
    pub fn add_device_with_backend(
        &self,
        device_type: DeviceType,
        params: DeviceParams,
        backend: Box<dyn DeviceBackend>,
        port_id: i32,
    ) -> XbarResult<Arc<AudioDevice>> {
        let device = AudioDevice::new(device_type, params, backend)?;
        let direction = match device_type {
            DeviceType::Source => PortDirection::Output,
            DeviceType::Sink => PortDirection::Input,
        };
        let port = Self::make_default_port(&device, port_id, direction)?;
        if device_type == DeviceType::Source {
            self.registry.add_source_port(port)?;
        }
        self.registry.add_device(Arc::clone(&device))?;
        Ok(device)
    }

    pub fn create_routing_zone(&self, name: &str) -> XbarResult<Arc<RoutingZone>> {
        let zone = RoutingZone::new(name, Arc::clone(&self.events));
        self.registry.add_zone(Arc::clone(&zone))?;
        Ok(zone)
    }

    pub fn link_zone_to_sink(&self, zone_name: &str, device_name: &str) -> XbarResult<()> {
        let zone = self.registry.zone(zone_name)?;
        let device = self.registry.device(device_name)?;
        zone.link_sink_device(device)
    }

    /// Create a zone input port with its conversion buffer. The port id is
    /// the sink id used by `connect`.
    pub fn create_zone_input_port(
        &self,
        zone_name: &str,
        port_id: i32,
        num_channels: u32,
        format: Option<SampleFormat>,
    ) -> XbarResult<Arc<AudioPort>> {
        let zone = self.registry.zone(zone_name)?;
        let port = AudioPort::new(PortParams {
            name: format!("{}_in{}", zone_name, port_id),
            id: port_id,
            direction: PortDirection::Input,
            num_channels,
            index: 0,
        });
        zone.create_conversion_buffer(&port, format)?;
        port.set_owner(OwnerRef::Zone(Arc::downgrade(zone.worker())));
        self.registry.add_sink_port(Arc::clone(&port))?;
        Ok(port)
    }

    /// Bind a zone input port to the default input port of the zone's sink
    /// device.
    pub fn link_zone_port_to_device(
        &self,
        zone_name: &str,
        zone_port_id: i32,
        device_name: &str,
    ) -> XbarResult<()> {
        let zone = self.registry.zone(zone_name)?;
        let zone_port = self.registry.sink_port(zone_port_id)?;
        let device = self.registry.device(device_name)?;
        let device_port = device
            .ports()
            .first()
            .cloned()
            .ok_or_else(|| XbarError::invalid_param(format!("device {} has no ports", device_name)))?;
        zone.link_audio_ports(&zone_port, &device_port)
    }

    pub fn add_derived_zone(&self, base_name: &str, derived_name: &str) -> XbarResult<()> {
        let base = self.registry.zone(base_name)?;
        let derived = self.registry.zone(derived_name)?;
        base.add_derived_zone(&derived)
    }

    /// Establish a connection between a source id and a sink id.
    pub fn connect(&self, source_id: i32, sink_id: i32) -> XbarResult<()> {
        let src = self.registry.source_port(source_id)?;
        let sink = self.registry.sink_port(sink_id)?;
        self.routing.connect(&src, &sink)
    }

    pub fn disconnect(&self, source_id: i32, sink_id: i32) -> XbarResult<()> {
        let src = self.registry.source_port(source_id)?;
        let sink = self.registry.sink_port(sink_id)?;
        self.routing.disconnect(&src, &sink)
    }

    /// Remove every connection of a source.
    pub fn disconnect_all(&self, source_id: i32) -> XbarResult<()> {
        let src = self.registry.source_port(source_id)?;
        let sinks: Vec<_> = self
            .routing
            .active_connections()
            .iter()
            .filter(|(s, _)| *s == source_id)
            .filter_map(|(_, k)| self.registry.sink_port(*k).ok())
            .collect();
        self.routing.disconnect_all(&src, &sinks)
    }

    /// Keep a source drained through a zone's matrix without routing it.
    pub fn connect_grouped(&self, source_id: i32, zone_name: &str) -> XbarResult<()> {
        let src = self.registry.source_port(source_id)?;
        let zone = self.registry.zone(zone_name)?;
        let matrix = zone
            .switch_matrix()
            .ok_or_else(|| XbarError::NotInitialized("zone has no switch matrix"))?;
        self.routing.connect_grouped(&src, &matrix)
    }

    pub fn release_grouped(&self, source_id: i32) -> XbarResult<()> {
        let src = self.registry.source_port(source_id)?;
        self.routing.release_grouped(&src)
    }

    pub fn active_connections(&self) -> Vec<(i32, i32)> {
        self.routing.active_connections()
    }

    /// Capture the registered topology and the active connections.
    pub fn topology_snapshot(&self) -> TopologySnapshot {
        let mut zones: Vec<ZoneSnapshot> = self
            .registry
            .zones()
            .iter()
            .map(|zone| ZoneSnapshot {
                name: zone.name().to_string(),
                is_derived: zone.is_derived_zone(),
                sink_device: zone.sink_device().map(|d| d.name().to_string()),
            })
            .collect();
        zones.sort_by(|a, b| a.name.cmp(&b.name));

        TopologySnapshot {
            devices: self
                .registry
                .devices()
                .iter()
                .map(|d| d.params().clone())
                .collect(),
            source_ports: self
                .registry
                .source_ports()
                .iter()
                .map(|p| p.params().clone())
                .collect(),
            sink_ports: self
                .registry
                .sink_ports()
                .iter()
                .map(|p| p.params().clone())
                .collect(),
            zones,
            connections: self.routing.active_connections(),
        }
    }

    /// Capture the topology as JSON, e.g. to attach a setup to a bug
    /// report or replay it from tooling.
    pub fn dump_topology(&self) -> XbarResult<String> {
        serde_json::to_string_pretty(&self.topology_snapshot())
            .map_err(|e| XbarError::failed(format!("cannot serialize topology: {}", e)))
    }

    /// Arm a WAV probe at the sink of a zone.
    pub fn start_zone_probing(&self, zone_name: &str, params: ProbeParams) -> XbarResult<()> {
        self.registry.zone(zone_name)?.worker().start_probing(params)
    }

    pub fn stop_zone_probing(&self, zone_name: &str) -> XbarResult<()> {
        self.registry.zone(zone_name)?.worker().stop_probing();
        Ok(())
    }

    /// Arm a WAV probe on a source's transport (its buffer task).
    pub fn start_source_probing(&self, source_id: i32, params: ProbeParams) -> XbarResult<()> {
        let port = self.registry.source_port(source_id)?;
        let matrix = port
            .switch_matrix()
            .ok_or_else(|| XbarError::failed("source is not connected"))?;
        matrix.start_probing(&port, params)
    }

    pub fn stop_source_probing(&self, source_id: i32) -> XbarResult<()> {
        let port = self.registry.source_port(source_id)?;
        if let Some(matrix) = port.switch_matrix() {
            matrix.stop_probing(&port);
        }
        Ok(())
    }

    /// Arm a WAV probe on the job delivering into a zone input port.
    pub fn start_sink_probing(&self, sink_id: i32, params: ProbeParams) -> XbarResult<()> {
        let port = self.registry.sink_port(sink_id)?;
        let matrix = port
            .switch_matrix()
            .ok_or_else(|| XbarError::failed("sink is not connected"))?;
        matrix.start_probing(&port, params)
    }

    pub fn stop_sink_probing(&self, sink_id: i32) -> XbarResult<()> {
        let port = self.registry.sink_port(sink_id)?;
        if let Some(matrix) = port.switch_matrix() {
            matrix.stop_probing(&port);
        }
        Ok(())
    }

    /// Start all routing zones (derived zones first, so their prefill is in
    /// place when the base zones begin ticking) and freeze the topology.
    pub fn start(&self) -> XbarResult<()> {
        let zones = self.registry.zones();
        for zone in zones.iter().filter(|z| z.is_derived_zone()) {
            zone.start()?;
        }
        for zone in zones.iter().filter(|z| !z.is_derived_zone()) {
            zone.start()?;
        }
        self.registry.freeze();
        info!("engine started with {} zones", zones.len());
        Ok(())
    }

    /// Stop all zones and thaw the topology for reconfiguration.
    pub fn stop(&self) {
        for zone in self.registry.zones() {
            if !zone.is_derived_zone() {
                zone.stop();
            }
        }
        for zone in self.registry.zones() {
            zone.stop();
        }
        self.registry.unfreeze();
        info!("engine stopped");
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
