//! Routing Zone Workers
//!
//! The worker is the sink-side scheduler of a routing zone. A *base* zone
//! owns a thread clocked by its sink device; per period it unlocks the
//! switch-matrix jobs, triggers the matrix, moves one period from every
//! conversion buffer towards the sink (through the streaming state
//! machine), feeds the pipeline, and schedules the derived zones. A
//! *derived* zone has no thread of its own; its `transfer_period` runs in
//! the base zone's thread or in a shared runner thread per period-size
//! multiple.
//!
//! # Streaming state machine
//!
//! Each conversion buffer carries one of four streaming states deciding
//! how its content is bridged to the sink:
//!
//! ```text
//!  prev \ input        | avail == 0 | avail >= wanted | otherwise
//!  --------------------+------------+-----------------+---------------------
//!  BufferEmpty         | Empty      | Full            | PartlyFromEmpty
//!  BufferPartlyFromEmpty| Empty     | Full            | PartlyFromEmpty
//!  BufferFull          | Empty      | Full            | PartlyFromFull
//!  BufferPartlyFromFull| Empty      | Full            | PartlyFromFull
//! ```
//!
//! In `Empty`/`PartlyFromEmpty` nothing is read and the sink channels are
//! zero-filled: streaming starts only once a full period has accumulated.
//! In `Full`/`PartlyFromFull` the available frames are copied, so the
//! residue of a disconnected source drains cleanly before silence begins.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::device::{AudioDevice, ClockType, DeviceEvent};
use crate::error::{XbarError, XbarResult};
use crate::events::{EngineEvent, EventProvider};
use crate::format::{copy_area_buffers, zero_area_buffers, SampleFormat};
use crate::matrix::SwitchMatrix;
use crate::pipeline::Pipeline;
use crate::port::AudioPort;
use crate::probe::{apply_probe_action, DataProbe, ProbeAction, ProbeParams};
use crate::ringbuf::{AccessDirection, BufferTimestamp, RingBuffer};

/// Bounded history of per-period sink write records.
const DIAGNOSTICS_DEPTH: usize = 1024;

/// Parameters of a routing zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneParams {
    pub name: String,
}

/// Scheduling state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Inactive,
    /// Waiting for synchronized activation by the base zone.
    ActivePending,
    Active,
}

/// Requested state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Prepare,
    Activate,
    Inactivate,
}

/// Streaming state of one conversion buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    BufferEmpty,
    BufferPartlyFromEmpty,
    BufferFull,
    BufferPartlyFromFull,
}

/// Apply the streaming transition table for one chunk.
pub fn next_streaming_state(
    previous: StreamingState,
    available: u32,
    frames_to_transfer: u32,
) -> StreamingState {
    if available == 0 {
        StreamingState::BufferEmpty
    } else if available >= frames_to_transfer {
        StreamingState::BufferFull
    } else {
        match previous {
            StreamingState::BufferEmpty | StreamingState::BufferPartlyFromEmpty => {
                StreamingState::BufferPartlyFromEmpty
            }
            StreamingState::BufferFull | StreamingState::BufferPartlyFromFull => {
                StreamingState::BufferPartlyFromFull
            }
        }
    }
}

/// One conversion buffer serviced by the zone.
pub struct ConversionBufferEntry {
    pub ring: Arc<RingBuffer>,
    pub streaming_state: StreamingState,
    /// Input port of the sink device receiving this buffer's channels, if
    /// directly linked.
    pub sink_device_port: Option<Arc<AudioPort>>,
}

/// Scheduling parameters of one derived zone.
#[derive(Debug, Clone, Copy)]
pub struct DerivedZoneParams {
    pub period_size: u32,
    /// Factor between the derived and the base period size.
    pub period_size_multiple: u32,
    pub count_periods: u32,
    pub runner_enabled: bool,
}

struct SinkBinding {
    device: Arc<AudioDevice>,
    ring: Arc<RingBuffer>,
    format: SampleFormat,
    num_channels: u32,
    /// Scratch bitmap: which sink channels received PCM this period.
    serviced: Vec<bool>,
}

/// Worker object of one routing zone.
pub struct ZoneWorker {
    params: ZoneParams,
    events: Arc<EventProvider>,
    sink_device: Mutex<Option<Arc<AudioDevice>>>,
    binding: Mutex<Option<SinkBinding>>,
    period_size: AtomicU32,
    sample_rate: AtomicU32,
    period_time_ms: AtomicU32,
    log_interval: AtomicU32,
    conv_buffers: Mutex<Vec<(Arc<AudioPort>, ConversionBufferEntry)>>,
    derived_zones: Mutex<Vec<(Arc<ZoneWorker>, DerivedZoneParams)>>,
    runners: Mutex<Vec<Arc<RunnerThread>>>,
    matrix: Mutex<Option<Arc<SwitchMatrix>>>,
    pipeline: Mutex<Option<Box<dyn Pipeline>>>,
    state: Mutex<WorkerState>,
    /// Held for the duration of one transfer; `Inactivate` takes it with a
    /// timeout to let an in-flight transfer finish.
    transfer_lock: Mutex<()>,
    probe_tx: Sender<ProbeAction>,
    probe_rx: Receiver<ProbeAction>,
    probe: Mutex<Option<DataProbe>>,
    probing_active: AtomicBool,
    is_derived: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    log_cnt: AtomicU32,
    log_ok_cnt: AtomicU32,
    timeout_cnt: AtomicU32,
    diagnostics: Mutex<VecDeque<BufferTimestamp>>,
}

impl ZoneWorker {
    pub fn new(params: ZoneParams, events: Arc<EventProvider>) -> Arc<Self> {
        let (probe_tx, probe_rx) = unbounded();
        Arc::new(Self {
            params,
            events,
            sink_device: Mutex::new(None),
            binding: Mutex::new(None),
            period_size: AtomicU32::new(0),
            sample_rate: AtomicU32::new(0),
            period_time_ms: AtomicU32::new(0),
            log_interval: AtomicU32::new(0),
            conv_buffers: Mutex::new(Vec::new()),
            derived_zones: Mutex::new(Vec::new()),
            runners: Mutex::new(Vec::new()),
            matrix: Mutex::new(None),
            pipeline: Mutex::new(None),
            state: Mutex::new(WorkerState::Inactive),
            transfer_lock: Mutex::new(()),
            probe_tx,
            probe_rx,
            probe: Mutex::new(None),
            probing_active: AtomicBool::new(false),
            is_derived: AtomicBool::new(false),
            thread: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            log_cnt: AtomicU32::new(0),
            log_ok_cnt: AtomicU32::new(0),
            timeout_cnt: AtomicU32::new(0),
            diagnostics: Mutex::new(VecDeque::with_capacity(DIAGNOSTICS_DEPTH)),
        })
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn period_size(&self) -> u32 {
        self.period_size.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        *self.state.lock() == WorkerState::Active
    }

    pub fn is_active_pending(&self) -> bool {
        *self.state.lock() == WorkerState::ActivePending
    }

    pub fn set_derived(&self, derived: bool) {
        self.is_derived.store(derived, Ordering::Relaxed);
    }

    pub fn is_derived(&self) -> bool {
        self.is_derived.load(Ordering::Relaxed)
    }

    pub fn set_switch_matrix(&self, matrix: Arc<SwitchMatrix>) {
        *self.matrix.lock() = Some(matrix);
    }

    pub fn clear_switch_matrix(&self) {
        *self.matrix.lock() = None;
    }

    pub fn switch_matrix(&self) -> Option<Arc<SwitchMatrix>> {
        self.matrix.lock().clone()
    }

    /// Bind the sink device that clocks this zone.
    pub fn link_sink_device(&self, device: Arc<AudioDevice>) -> XbarResult<()> {
        if device.period_size() == 0 {
            error!("zone {}: period size of sink device must not be 0", self.params.name);
            return Err(XbarError::failed("sink period size is 0"));
        }
        if let Some(pipeline) = self.pipeline.lock().as_ref() {
            let p = pipeline.params();
            if p.period_size != device.period_size() || p.sample_rate != device.sample_rate() {
                error!(
                    "zone {}: pipeline {}x{} does not match sink device {}x{}",
                    self.params.name,
                    p.period_size,
                    p.sample_rate,
                    device.period_size(),
                    device.sample_rate()
                );
                return Err(XbarError::failed("pipeline does not match sink device"));
            }
        }
        self.period_size.store(device.period_size(), Ordering::Relaxed);
        self.sample_rate.store(device.sample_rate(), Ordering::Relaxed);
        let period_time = (device.period_size() * 1000 / device.sample_rate()).max(1);
        self.period_time_ms.store(period_time, Ordering::Relaxed);
        self.log_interval.store(1000 / period_time, Ordering::Relaxed);
        device.enable_event_queue(true);
        *self.sink_device.lock() = Some(device);
        Ok(())
    }

    pub fn unlink_sink_device(&self) {
        if let Some(device) = self.sink_device.lock().take() {
            device.enable_event_queue(false);
        }
        *self.binding.lock() = None;
    }

    pub fn sink_device(&self) -> Option<Arc<AudioDevice>> {
        self.sink_device.lock().clone()
    }

    /// Register a conversion buffer for a zone input port.
    pub fn add_conversion_buffer(
        &self,
        port: &Arc<AudioPort>,
        ring: Arc<RingBuffer>,
    ) -> XbarResult<()> {
        let mut buffers = self.conv_buffers.lock();
        for (existing_port, entry) in buffers.iter() {
            if Arc::ptr_eq(&entry.ring, &ring) {
                error!(
                    "zone {}: conversion buffer has already been added",
                    self.params.name
                );
                return Err(XbarError::failed("conversion buffer already added"));
            }
            if Arc::ptr_eq(existing_port, port) {
                error!("zone {}: audio port has already been added", self.params.name);
                return Err(XbarError::failed("audio port already added"));
            }
        }
        buffers.push((
            Arc::clone(port),
            ConversionBufferEntry {
                ring,
                streaming_state: StreamingState::BufferEmpty,
                sink_device_port: None,
            },
        ));
        Ok(())
    }

    pub fn delete_conversion_buffer(&self, port: &Arc<AudioPort>) {
        self.conv_buffers
            .lock()
            .retain(|(p, _)| !Arc::ptr_eq(p, port));
    }

    pub fn conversion_buffer(&self, port: &Arc<AudioPort>) -> Option<Arc<RingBuffer>> {
        self.conv_buffers
            .lock()
            .iter()
            .find(|(p, _)| Arc::ptr_eq(p, port))
            .map(|(_, entry)| Arc::clone(&entry.ring))
    }

    /// Link a zone input port to a sink device input port; the link decides
    /// which sink channels receive the conversion buffer's PCM.
    pub fn link_ports(
        &self,
        zone_port: &Arc<AudioPort>,
        sink_device_port: &Arc<AudioPort>,
    ) -> XbarResult<()> {
        let sink = self.sink_device.lock().clone().ok_or_else(|| {
            error!("zone {}: no sink device linked", self.params.name);
            XbarError::NotInitialized("zone has no sink device")
        })?;
        if !sink.has_port(sink_device_port) {
            error!(
                "zone {}: port {} does not belong to the linked sink device",
                self.params.name,
                sink_device_port.name()
            );
            return Err(XbarError::failed(
                "sink port does not belong to the linked sink device",
            ));
        }
        let mut buffers = self.conv_buffers.lock();
        if buffers.iter().any(|(_, e)| {
            e.sink_device_port
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, sink_device_port))
        }) {
            error!(
                "zone {}: sink device port {} is already linked",
                self.params.name,
                sink_device_port.name()
            );
            return Err(XbarError::failed("sink device port already linked"));
        }
        let entry = buffers
            .iter_mut()
            .find(|(p, _)| Arc::ptr_eq(p, zone_port))
            .map(|(_, e)| e)
            .ok_or_else(|| {
                error!(
                    "zone {}: zone input port {} has not been added",
                    self.params.name,
                    zone_port.name()
                );
                XbarError::failed("zone input port not added")
            })?;
        entry.sink_device_port = Some(Arc::clone(sink_device_port));
        Ok(())
    }

    pub fn unlink_ports(&self, zone_port: &Arc<AudioPort>) {
        if let Some((_, entry)) = self
            .conv_buffers
            .lock()
            .iter_mut()
            .find(|(p, _)| Arc::ptr_eq(p, zone_port))
        {
            entry.sink_device_port = None;
        }
    }

    pub fn linked_sink_port(&self, zone_port: &Arc<AudioPort>) -> Option<Arc<AudioPort>> {
        self.conv_buffers
            .lock()
            .iter()
            .find(|(p, _)| Arc::ptr_eq(p, zone_port))
            .and_then(|(_, e)| e.sink_device_port.clone())
    }

    /// Attach the zone's pipeline. Only one pipeline per zone.
    pub fn add_pipeline(&self, pipeline: Box<dyn Pipeline>) -> XbarResult<()> {
        let mut slot = self.pipeline.lock();
        if slot.is_some() {
            error!("zone {}: already owns a pipeline", self.params.name);
            return Err(XbarError::failed("zone already owns a pipeline"));
        }
        if let Some(device) = self.sink_device.lock().as_ref() {
            let p = pipeline.params();
            if p.period_size != device.period_size() || p.sample_rate != device.sample_rate() {
                error!(
                    "zone {}: pipeline {}x{} does not match sink device {}x{}",
                    self.params.name,
                    p.period_size,
                    p.sample_rate,
                    device.period_size(),
                    device.sample_rate()
                );
                return Err(XbarError::failed("pipeline does not match sink device"));
            }
        }
        *slot = Some(pipeline);
        Ok(())
    }

    pub fn delete_pipeline(&self) {
        *self.pipeline.lock() = None;
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline.lock().is_some()
    }

    /// Register a derived zone with this (base) zone.
    pub fn add_derived_zone_worker(
        &self,
        derived: Arc<ZoneWorker>,
        use_runner: bool,
    ) -> XbarResult<()> {
        let derived_sink = derived.sink_device().ok_or_else(|| {
            error!("zone {}: derived zone has no sink device", self.params.name);
            XbarError::failed("derived zone has no sink device")
        })?;
        let base_period = u64::from(self.period_size());
        if base_period == 0 {
            error!(
                "zone {}: period size of base zone must not be 0 (missing sink link?)",
                self.params.name
            );
            return Err(XbarError::failed("base zone has no period size"));
        }
        let base_rate = u64::from(self.sample_rate());
        let derived_period = u64::from(derived_sink.period_size());
        let derived_rate = u64::from(derived_sink.sample_rate());

        let multiple = (derived_period * base_rate) / (derived_rate * base_period);
        if derived_period * base_rate != derived_rate * base_period * multiple || multiple == 0 {
            error!(
                "zone {}: derived zone period time is not a multiple of the base period time",
                self.params.name
            );
            return Err(XbarError::failed(
                "derived period time is not an integer multiple of the base period time",
            ));
        }
        info!(
            "zone {} becomes a derived zone of {} with period size multiple {}",
            derived.name(),
            self.params.name,
            multiple
        );

        let params = DerivedZoneParams {
            period_size: derived_period as u32,
            period_size_multiple: multiple as u32,
            count_periods: 0,
            runner_enabled: use_runner && multiple != 1,
        };

        if params.runner_enabled {
            let mut runners = self.runners.lock();
            let runner = runners
                .iter()
                .find(|r| r.period_size_multiple() == params.period_size_multiple)
                .cloned();
            match runner {
                Some(runner) => runner.add_zone(Arc::clone(&derived), params),
                None => {
                    let runner =
                        RunnerThread::new(params.period_size_multiple, self.params.name.clone());
                    runner.add_zone(Arc::clone(&derived), params);
                    runners.push(runner);
                }
            }
        }
        self.derived_zones.lock().push((Arc::clone(&derived), params));

        // The derived sink must not block the base zone's clock.
        derived_sink.backend().set_non_block_mode(true)?;
        Ok(())
    }

    pub fn delete_derived_zone_worker(&self, derived: &Arc<ZoneWorker>) {
        {
            let mut runners = self.runners.lock();
            for runner in runners.iter() {
                runner.delete_zone(derived);
            }
            runners.retain(|r| !r.is_empty());
        }
        self.derived_zones
            .lock()
            .retain(|(worker, _)| !Arc::ptr_eq(worker, derived));
    }

    /// Establish the sink binding and verify the conversion buffer setup.
    /// Must be called before `start`.
    pub fn prepare_states(&self) -> XbarResult<()> {
        let device = self.sink_device.lock().clone().ok_or_else(|| {
            error!("zone {}: missing link to sink device", self.params.name);
            XbarError::failed("zone has no sink device")
        })?;
        device.start()?;
        let ring = device.ring_buffer()?;
        let num_channels = ring.num_channels();
        if num_channels == 0 {
            error!("zone {}: sink ring buffer has 0 channels", self.params.name);
            return Err(XbarError::failed("sink ring buffer has 0 channels"));
        }

        let buffers = self.conv_buffers.lock();
        if buffers.is_empty() {
            error!(
                "zone {}: routing zone does not include any conversion buffers",
                self.params.name
            );
            return Err(XbarError::failed("zone has no conversion buffers"));
        }
        for (port, entry) in buffers.iter() {
            match &entry.sink_device_port {
                Some(sink_port) => {
                    if entry.ring.num_channels() != sink_port.num_channels() {
                        error!(
                            "zone {}: channel mismatch, zone port {} has {}, sink port {} has {}",
                            self.params.name,
                            port.name(),
                            entry.ring.num_channels(),
                            sink_port.name(),
                            sink_port.num_channels()
                        );
                    }
                }
                None => {
                    warn!(
                        "zone {}: input port {} is not linked to any sink device port",
                        self.params.name,
                        port.name()
                    );
                }
            }
        }
        drop(buffers);

        let binding = SinkBinding {
            format: ring.format(),
            num_channels,
            serviced: vec![false; num_channels as usize],
            device,
            ring,
        };
        info!(
            "zone {}: sink binding established, {} channels, {}",
            self.params.name, binding.num_channels, binding.format
        );
        *self.binding.lock() = Some(binding);
        Ok(())
    }

    /// Apply a state change. `take_lock` guards the active-to-inactive
    /// transition with the in-progress-transfer lock; pass `false` from
    /// inside `transfer_period` to avoid self-deadlock.
    pub fn change_state(&self, action: StateAction, take_lock: bool) {
        let mut state = self.state.lock();
        match (*state, action) {
            (WorkerState::Inactive, StateAction::Prepare) => {
                info!("zone {}: inactive -> active pending", self.params.name);
                if self.is_derived() {
                    self.prefill_sink_buffer();
                }
                *state = WorkerState::ActivePending;
            }
            (WorkerState::ActivePending, StateAction::Activate) => {
                info!("zone {}: active pending -> active", self.params.name);
                *state = WorkerState::Active;
            }
            (WorkerState::ActivePending, StateAction::Inactivate) => {
                info!("zone {}: active pending -> inactive", self.params.name);
                *state = WorkerState::Inactive;
            }
            (WorkerState::Active, StateAction::Inactivate) => {
                if take_lock {
                    // Let a transfer that is under way complete, but never
                    // wait unbounded.
                    let acquired = self.transfer_lock.try_lock_for(Duration::from_millis(100));
                    info!(
                        "zone {}: active -> inactive, transfer lock acquired: {}",
                        self.params.name,
                        acquired.is_some()
                    );
                } else {
                    info!("zone {}: active -> inactive", self.params.name);
                }
                *state = WorkerState::Inactive;
            }
            _ => {}
        }
    }

    /// Zero-prefill the sink ring buffer of a derived zone so the device
    /// starts draining before the zone becomes active. ALSA sinks get
    /// `buffer - period` frames (the spare period absorbs scheduling
    /// jitter), client sinks a single period so a fast reader cannot race
    /// ahead.
    fn prefill_sink_buffer(&self) {
        let mut binding = self.binding.lock();
        let Some(binding) = binding.as_mut() else {
            error!("zone {}: sink device ring buffer not initialized yet", self.params.name);
            return;
        };
        let period = self.period_size();
        let buffer_size = binding.device.num_periods() * period;
        let frames_to_fill = if binding.device.backend().is_hardware() {
            buffer_size - period
        } else {
            period
        };

        let mut remaining = frames_to_fill;
        while remaining > 0 {
            let (offset, frames) = match binding.ring.begin_access(AccessDirection::Write, remaining)
            {
                Ok((o, f)) if f > 0 => (o, f),
                _ => break,
            };
            {
                let mut region = binding.ring.region_mut(offset, frames);
                let channels = region.areas.len();
                let _ = zero_area_buffers(&mut region, 0, 0, channels, frames as usize);
            }
            if binding
                .ring
                .end_access(AccessDirection::Write, offset, frames)
                .is_err()
            {
                error!("zone {}: error while prefilling sink ring buffer", self.params.name);
                break;
            }
            remaining -= frames;
        }
        if remaining > 0 {
            error!(
                "zone {}: only {} of {} zero frames prefilled",
                self.params.name,
                frames_to_fill - remaining,
                frames_to_fill
            );
        } else {
            info!(
                "zone {}: prefilled sink ring buffer with {} zeros",
                self.params.name, frames_to_fill
            );
        }
        if let Some(mirror) = binding.ring.as_mirror() {
            if let Err(e) = mirror.start_device() {
                warn!("zone {}: could not start sink device: {}", self.params.name, e);
            }
        }
    }

    /// Whether the sink device has started draining its prefill.
    pub fn is_sink_serviced(&self) -> bool {
        let binding = self.binding.lock();
        let Some(binding) = binding.as_ref() else {
            return false;
        };
        let avail = match binding.ring.update_available(AccessDirection::Write) {
            Ok(n) => n,
            Err(_) => return false,
        };
        let period = self.period_size();
        let buffer_size = binding.device.num_periods() * period;
        let target = if binding.device.backend().is_hardware() {
            if binding.device.clock_type() == ClockType::ReceivedAsync {
                // The ASRC buffer must be fed right away.
                0
            } else {
                // Prefill left one period of space; once the device consumed
                // a period there are two.
                2 * period
            }
        } else {
            // Prefill was one period; serviced as soon as any of it is gone.
            buffer_size - period + 1
        };
        if avail >= target {
            info!(
                "zone {}: sink device {} was serviced now, avail = {}",
                self.params.name,
                binding.device.name(),
                avail
            );
            true
        } else {
            false
        }
    }

    /// Reset all conversion buffers to their initial state.
    fn clear_conversion_buffers(&self) {
        for (port, entry) in self.conv_buffers.lock().iter_mut() {
            entry.ring.reset_from_reader();
            entry.streaming_state = StreamingState::BufferEmpty;
            info!(
                "zone {}: cleared conversion buffer of port {}",
                self.params.name,
                port.name()
            );
        }
    }

    /// Synchronized activation of pending derived zones: fired by the base
    /// zone whenever no derived zone ran in the previous tick.
    pub(crate) fn activate_pending_workers(&self) {
        for (worker, params) in self.derived_zones.lock().iter_mut() {
            if worker.is_active_pending() {
                // Let the derived zone run on its very first eligible tick.
                params.count_periods = params.period_size_multiple;
                if worker.is_sink_serviced() {
                    worker.change_state(StateAction::Activate, true);
                }
            }
        }
    }

    pub fn start_probing(&self, params: ProbeParams) -> XbarResult<()> {
        if self.probing_active.load(Ordering::Relaxed) {
            error!("zone {}: probing already active", self.params.name);
            return Err(XbarError::failed("probing already active"));
        }
        let _ = self.probe_tx.send(ProbeAction::Start(params));
        Ok(())
    }

    pub fn stop_probing(&self) {
        let _ = self.probe_tx.send(ProbeAction::Stop);
    }

    /// Per-period sink write records (timestamp and running frame count).
    pub fn diagnostics(&self) -> Vec<BufferTimestamp> {
        self.diagnostics.lock().iter().copied().collect()
    }

    fn send_sink_error_event(&self, binding: &SinkBinding) {
        self.events.send(EngineEvent::UnrecoverableSinkDeviceError {
            device: binding.device.name().to_string(),
        });
    }

    /// Transfer one period from the conversion buffers to the sink device.
    ///
    /// This is the hot path; see the module documentation for the exact
    /// sequence. Returns `Ok` without doing anything when the zone is not
    /// active.
    pub fn transfer_period(&self) -> XbarResult<()> {
        let _transfer_guard = self.transfer_lock.lock();
        // Re-check under the transfer lock: a stop request may have raced
        // the check our caller did.
        if *self.state.lock() != WorkerState::Active {
            return Ok(());
        }

        let (device, sink_ring) = {
            let guard = self.binding.lock();
            let binding = guard
                .as_ref()
                .ok_or(XbarError::NotInitialized("zone has no sink binding"))?;
            (Arc::clone(&binding.device), Arc::clone(&binding.ring))
        };
        let period_size = self.period_size.load(Ordering::Relaxed);
        let log_interval = self.log_interval.load(Ordering::Relaxed);

        // Drain the sink device event queue. A stop event resynchronizes:
        // everything the sink has not consumed is stale after its restart.
        let mut stopped = false;
        loop {
            let event = device.next_event();
            if event == DeviceEvent::NoEvent {
                break;
            }
            info!(
                "zone {}: got event {:?} from sink {}",
                self.params.name,
                event,
                device.name()
            );
            stopped = event == DeviceEvent::Stop;
        }
        if stopped {
            self.change_state(StateAction::Inactivate, false);
            if let Some(matrix) = self.matrix.lock().as_ref() {
                for (port, _) in self.conv_buffers.lock().iter() {
                    matrix.lock_job(port);
                }
            }
            sink_ring.reset_from_reader();
            self.clear_conversion_buffers();
            // Re-arm for the next start of the sink's stream. The binding
            // lock is free here, so a derived zone's prefill can run.
            self.change_state(StateAction::Prepare, false);
            return Ok(());
        }

        let mut binding_guard = self.binding.lock();
        let binding = binding_guard
            .as_mut()
            .ok_or(XbarError::NotInitialized("zone has no sink binding"))?;

        {
            let mut probe = self.probe.lock();
            while let Ok(action) = self.probe_rx.try_recv() {
                apply_probe_action(action, &mut probe);
                self.probing_active.store(probe.is_some(), Ordering::Relaxed);
            }
        }

        binding.serviced.fill(false);

        let sink_avail = match binding.ring.update_available(AccessDirection::Write) {
            Ok(n) => {
                self.timeout_cnt.store(0, Ordering::Relaxed);
                n
            }
            Err(XbarError::Timeout) => {
                let cnt = self.timeout_cnt.fetch_add(1, Ordering::Relaxed);
                if cnt > log_interval || cnt == 0 {
                    error!(
                        "zone {}: timeout while waiting for sink space, trying to continue",
                        self.params.name
                    );
                    self.timeout_cnt.store(1, Ordering::Relaxed);
                }
                0
            }
            Err(e) => {
                error!("zone {}: error updating sink availability: {}", self.params.name, e);
                if e.is_device_error() {
                    self.send_sink_error_event(binding);
                }
                return Err(XbarError::failed("sink availability update failed"));
            }
        };

        // A base zone advances all sources first so the conversion buffers
        // are as full as they can be for this period.
        if !self.is_derived() {
            if let Some(matrix) = self.matrix.lock().as_ref() {
                if let Err(e) = matrix.trigger() {
                    error!("zone {}: switch matrix trigger failed: {}", self.params.name, e);
                }
            }
        }

        let write_to_sink = sink_avail >= period_size;
        if !write_to_sink {
            // The sink buffer is full (a derived zone's consumer stalled).
            // Zero the buffer so a late reader gets silence instead of
            // stale PCM, and discard this period's conversion data below.
            binding.ring.zero_out();
            let cnt = self.log_cnt.fetch_add(1, Ordering::Relaxed);
            if cnt > log_interval || cnt == 0 {
                info!(
                    "zone {}: only {} frames of free space, {} required; zeroed sink buffer",
                    self.params.name, sink_avail, period_size
                );
                self.log_cnt.store(1, Ordering::Relaxed);
            }
            self.log_ok_cnt.store(0, Ordering::Relaxed);
        } else {
            let ok = self.log_ok_cnt.fetch_add(1, Ordering::Relaxed);
            if ok > 10 {
                self.log_cnt.store(0, Ordering::Relaxed);
                self.log_ok_cnt.store(0, Ordering::Relaxed);
            }
        }

        let (sink_offset, sink_frames) = if write_to_sink {
            match binding.ring.begin_access(AccessDirection::Write, period_size) {
                Ok((offset, frames)) => {
                    // Writes are always whole periods, so the region can
                    // never be shorter than one period.
                    debug_assert!(frames >= period_size);
                    (offset, period_size)
                }
                Err(e) => {
                    error!("zone {}: error beginning sink access: {}", self.params.name, e);
                    if e.is_device_error() {
                        self.send_sink_error_event(binding);
                    }
                    return Err(XbarError::failed("sink access failed"));
                }
            }
        } else {
            (0, period_size)
        };

        // Move this period from every conversion buffer towards the sink.
        let mut pipeline = self.pipeline.lock();
        for (zone_port, entry) in self.conv_buffers.lock().iter_mut() {
            let sink_port_info = entry
                .sink_device_port
                .as_ref()
                .map(|p| (p.num_channels(), p.params().index));

            let mut frames_transferred = 0u32;
            while frames_transferred < sink_frames {
                let frames_to_transfer = sink_frames - frames_transferred;
                let available = entry.ring.update_available(AccessDirection::Read)?;

                let previous = entry.streaming_state;
                entry.streaming_state =
                    next_streaming_state(previous, available, frames_to_transfer);
                if entry.streaming_state != previous {
                    info!(
                        "zone {}: port {} changes to state {:?} (available={}, to transfer={})",
                        self.params.name,
                        zone_port.name(),
                        entry.streaming_state,
                        available,
                        frames_to_transfer
                    );
                }

                let (cb_offset, cb_frames) = entry
                    .ring
                    .begin_access(AccessDirection::Read, frames_to_transfer)?;

                let (frames_to_read, frames_to_write) = match entry.streaming_state {
                    StreamingState::BufferEmpty | StreamingState::BufferPartlyFromEmpty => {
                        // Warm-up: leave the buffer content untouched and
                        // write silence instead.
                        (0, frames_to_transfer)
                    }
                    StreamingState::BufferFull | StreamingState::BufferPartlyFromFull => {
                        (cb_frames, cb_frames)
                    }
                };

                if let Some(pipeline) = pipeline.as_mut() {
                    let input = entry.ring.region(cb_offset, frames_to_read);
                    let _ = pipeline.provide_input_data(
                        zone_port.id(),
                        input,
                        frames_to_read,
                        frames_to_write,
                    )?;
                }

                if write_to_sink {
                    if let Some((link_channels, link_index)) = sink_port_info {
                        let src = entry.ring.region(cb_offset, frames_to_read);
                        let mut dst = binding.ring.region_mut(sink_offset, sink_frames);
                        copy_area_buffers(
                            &mut dst,
                            frames_transferred as usize,
                            link_index as usize,
                            frames_to_write as usize,
                            &src,
                            0,
                            0,
                            frames_to_read as usize,
                            link_channels as usize,
                        )?;
                        for ch in 0..link_channels as usize {
                            binding.serviced[link_index as usize + ch] = true;
                        }
                    }
                }

                entry
                    .ring
                    .end_access(AccessDirection::Read, cb_offset, frames_to_read)?;
                frames_transferred += frames_to_write;
            }
        }

        if write_to_sink {
            {
                let mut dst = binding.ring.region_mut(sink_offset, sink_frames);
                for channel in 0..binding.num_channels as usize {
                    if !binding.serviced[channel] {
                        zero_area_buffers(&mut dst, 0, channel, 1, sink_frames as usize)?;
                    }
                }
                if let Some(pipeline) = pipeline.as_mut() {
                    pipeline.process();
                    pipeline.retrieve_output_data(&mut dst, sink_frames);
                }
                let mut probe = self.probe.lock();
                if let Some(active) = probe.as_mut() {
                    if !active.process(&mut dst, sink_frames) {
                        *probe = None;
                        self.probing_active.store(false, Ordering::Relaxed);
                    }
                }
            }
            drop(pipeline);

            if let Err(e) = binding
                .ring
                .end_access(AccessDirection::Write, sink_offset, sink_frames)
            {
                error!("zone {}: error ending sink access: {}", self.params.name, e);
                if e.is_device_error() {
                    self.send_sink_error_event(binding);
                }
                return Err(XbarError::failed("sink commit failed"));
            }

            let mut diagnostics = self.diagnostics.lock();
            if diagnostics.len() == DIAGNOSTICS_DEPTH {
                diagnostics.pop_front();
            }
            diagnostics.push_back(binding.ring.timestamp(AccessDirection::Write));
        }

        Ok(())
    }

    /// Start the worker thread of a base zone. Derived zones are driven by
    /// their base zone and never call this.
    pub fn start(self: &Arc<Self>) -> XbarResult<()> {
        if self.matrix.lock().is_none() {
            error!("zone {}: switch matrix has not been set", self.params.name);
            return Err(XbarError::failed("zone has no switch matrix"));
        }
        for (_, entry) in self.conv_buffers.lock().iter_mut() {
            entry.streaming_state = StreamingState::BufferEmpty;
        }
        self.running.store(true, Ordering::SeqCst);
        let worker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("xbar-zone-{}", self.params.name))
            .spawn(move || worker.run())
            .map_err(|e| XbarError::failed(format!("cannot spawn worker thread: {}", e)))?;
        *self.thread.lock() = Some(handle);

        for runner in self.runners.lock().iter() {
            runner.start()?;
        }
        Ok(())
    }

    /// Stop the worker thread and all runner threads, then inactivate.
    pub fn stop(&self) {
        for runner in self.runners.lock().iter() {
            runner.stop();
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.change_state(StateAction::Inactivate, true);
        if let Some(device) = self.sink_device.lock().as_ref() {
            device.stop();
        }
    }

    fn run(self: Arc<Self>) {
        info!("zone {}: worker thread started", self.params.name);
        let mut derived_zone_calls = 0u32;

        while self.running.load(Ordering::SeqCst) {
            if derived_zone_calls == 0 {
                if let Some(matrix) = self.matrix.lock().as_ref() {
                    matrix.unlock_jobs();
                }
                self.activate_pending_workers();
            }

            if let Err(e) = self.transfer_period() {
                error!(
                    "zone {}: error during transfer period of base zone: {}",
                    self.params.name, e
                );
                // Stay alive; the sink might recover or be torn down by the
                // control side. Back off for one period so a persistent
                // device error cannot spin the thread hot.
                std::thread::sleep(Duration::from_millis(
                    self.period_time_ms.load(Ordering::Relaxed) as u64,
                ));
            }

            // Client sinks have no blocking device wait; pace the loop by
            // the period time instead of spinning on the ring buffer.
            let hardware_sink = self
                .binding
                .lock()
                .as_ref()
                .map(|b| b.device.backend().is_hardware())
                .unwrap_or(true);
            if !hardware_sink {
                std::thread::sleep(Duration::from_millis(
                    self.period_time_ms.load(Ordering::Relaxed) as u64,
                ));
            }

            derived_zone_calls = 0;

            // Derived zones with runner threads.
            for runner in self.runners.lock().iter() {
                if runner.is_any_active() {
                    let count = runner.add_period(1);
                    if count >= runner.period_size_multiple() {
                        if runner.is_processing() {
                            error!(
                                "zone {}: runner for multiple {} still processing when new periods arrived",
                                self.params.name,
                                runner.period_size_multiple()
                            );
                        }
                        runner.wake();
                        derived_zone_calls += 1;
                    }
                }
            }

            // Derived zones without a runner run inline.
            for (worker, params) in self.derived_zones.lock().iter_mut() {
                if worker.is_active() && !params.runner_enabled {
                    params.count_periods += 1;
                    if params.count_periods >= params.period_size_multiple {
                        params.count_periods = 0;
                        if let Err(e) = worker.transfer_period() {
                            error!(
                                "zone {}: error during transfer period of derived zone {}: {}",
                                self.params.name,
                                worker.name(),
                                e
                            );
                        }
                        derived_zone_calls += 1;
                    }
                }
            }
        }
        info!("zone {}: worker thread ended", self.params.name);
    }
}

struct RunnerInner {
    zones: Vec<(Arc<ZoneWorker>, DerivedZoneParams)>,
    period_count: u32,
}

/// Helper thread running the `transfer_period` of all derived zones that
/// share one period-size multiple. Woken by the base zone whenever enough
/// base periods have elapsed.
pub struct RunnerThread {
    period_size_multiple: u32,
    parent_zone: String,
    inner: Mutex<RunnerInner>,
    condition: Condvar,
    running: AtomicBool,
    processing: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RunnerThread {
    pub fn new(period_size_multiple: u32, parent_zone: String) -> Arc<Self> {
        Arc::new(Self {
            period_size_multiple,
            parent_zone,
            inner: Mutex::new(RunnerInner {
                zones: Vec::new(),
                period_count: 0,
            }),
            condition: Condvar::new(),
            running: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn period_size_multiple(&self) -> u32 {
        self.period_size_multiple
    }

    pub fn add_zone(&self, worker: Arc<ZoneWorker>, params: DerivedZoneParams) {
        self.inner.lock().zones.push((worker, params));
    }

    pub fn delete_zone(&self, worker: &Arc<ZoneWorker>) {
        self.inner.lock().zones.retain(|(w, _)| !Arc::ptr_eq(w, worker));
    }

    pub fn has_zone(&self, worker: &Arc<ZoneWorker>) -> bool {
        self.inner.lock().zones.iter().any(|(w, _)| Arc::ptr_eq(w, worker))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().zones.is_empty()
    }

    /// Credit `periods` base periods to this runner and to every active
    /// zone it drives; returns the accumulated count.
    pub fn add_period(&self, periods: u32) -> u32 {
        let mut inner = self.inner.lock();
        inner.period_count += periods;
        for (worker, params) in inner.zones.iter_mut() {
            if worker.is_active() {
                params.count_periods += periods;
            }
        }
        inner.period_count
    }

    pub fn is_any_active(&self) -> bool {
        self.inner.lock().zones.iter().any(|(w, _)| w.is_active())
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        self.condition.notify_one();
    }

    pub fn start(self: &Arc<Self>) -> XbarResult<()> {
        if self.thread.lock().is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let runner = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!(
                "xbar-runner-{}-x{}",
                self.parent_zone, self.period_size_multiple
            ))
            .spawn(move || runner.run())
            .map_err(|e| XbarError::failed(format!("cannot spawn runner thread: {}", e)))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        debug!(
            "runner thread for {} (multiple {}) started",
            self.parent_zone, self.period_size_multiple
        );
        let mut inner = self.inner.lock();
        while self.running.load(Ordering::SeqCst) {
            while inner.period_count < self.period_size_multiple {
                // Spurious wakeups re-check the period count.
                self.condition.wait(&mut inner);
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
            }
            inner.period_count = 0;

            self.processing.store(true, Ordering::Release);
            for (worker, params) in inner.zones.iter_mut() {
                if worker.is_active() {
                    if params.count_periods >= params.period_size_multiple {
                        params.count_periods = 0;
                    }
                    if let Err(e) = worker.transfer_period() {
                        error!(
                            "runner thread: error during transfer period of derived zone {}: {}",
                            worker.name(),
                            e
                        );
                    }
                }
            }
            self.processing.store(false, Ordering::Release);
        }
        debug!(
            "runner thread for {} (multiple {}) ended",
            self.parent_zone, self.period_size_multiple
        );
    }
}
