//! Switch Matrix
//!
//! The per-clock-domain fan-out. One switch matrix exists per base routing
//! zone; it owns one buffer task per connected source and is triggered once
//! per base period from the zone's worker thread.
//!
//! All state-changing requests (connect, disconnect, dummy connect, probe)
//! enter through a buffer-task action queue and are applied by the
//! real-time thread at the start of the next trigger, so the live task list
//! only ever changes between periods.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{XbarError, XbarResult};
use crate::events::EventProvider;
use crate::port::{AudioPort, PortDirection};
use crate::probe::ProbeParams;
use crate::ringbuf::RingBuffer;
use crate::task::{BufferTask, TaskStatus};

/// How long `remove_connections` waits for the real-time thread to confirm
/// the retirement of a buffer task.
const RETIRE_WAIT: Duration = Duration::from_millis(150);

enum TaskAction {
    Add(Arc<BufferTask>),
    Delete(Arc<BufferTask>),
}

/// Per-clock-domain fan-out scheduler.
pub struct SwitchMatrix {
    name: String,
    /// Base period size: frames consumed from every source per trigger.
    copy_size: u32,
    sample_rate: u32,
    /// Setup-side map: source ring buffer (by address) -> buffer task.
    task_map: Mutex<HashMap<usize, Arc<BufferTask>>>,
    /// Live task list, touched only by the real-time thread.
    live_tasks: Mutex<Vec<Arc<BufferTask>>>,
    action_tx: Sender<TaskAction>,
    action_rx: Receiver<TaskAction>,
    retire_lock: Mutex<()>,
    retire_cv: Condvar,
    events: Arc<EventProvider>,
}

fn ring_key(ring: &Arc<RingBuffer>) -> usize {
    Arc::as_ptr(ring) as usize
}

impl SwitchMatrix {
    pub fn new(
        name: &str,
        copy_size: u32,
        sample_rate: u32,
        events: Arc<EventProvider>,
    ) -> XbarResult<Arc<Self>> {
        if copy_size == 0 {
            error!("switch matrix {}: copy size of 0 not supported", name);
            return Err(XbarError::invalid_param("copy size must not be 0"));
        }
        if sample_rate == 0 {
            error!("switch matrix {}: sample rate of 0 not supported", name);
            return Err(XbarError::invalid_param("sample rate must not be 0"));
        }
        let (action_tx, action_rx) = unbounded();
        Ok(Arc::new(Self {
            name: name.to_string(),
            copy_size,
            sample_rate,
            task_map: Mutex::new(HashMap::new()),
            live_tasks: Mutex::new(Vec::new()),
            action_tx,
            action_rx,
            retire_lock: Mutex::new(()),
            retire_cv: Condvar::new(),
            events,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn copy_size(&self) -> u32 {
        self.copy_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn find_task(&self, ring: &Arc<RingBuffer>) -> Option<Arc<BufferTask>> {
        self.task_map.lock().get(&ring_key(ring)).cloned()
    }

    /// Create or reuse the buffer task of `src` for a new connection.
    fn obtain_task(
        &self,
        src: &Arc<AudioPort>,
        sink: &Arc<AudioPort>,
    ) -> XbarResult<Arc<BufferTask>> {
        let src_ring = src.ring_buffer()?;
        if let Some(task) = self.find_task(&src_ring) {
            return Ok(task);
        }

        let sink_info = sink.copy_information()?;
        let source_info = src.copy_information()?;

        // Period size of this connection at the sink's rate. It must come
        // out integer, otherwise the sink belongs to an incompatible clock
        // domain.
        let period_size = u64::from(self.copy_size) * u64::from(sink_info.sample_rate)
            / u64::from(self.sample_rate);
        if period_size * u64::from(self.sample_rate)
            != u64::from(self.copy_size) * u64::from(sink_info.sample_rate)
        {
            error!(
                "{}: period size of derived connection is not integer, rates {} Hz (base) / {} Hz (sink)",
                self.name, self.sample_rate, sink_info.sample_rate
            );
            return Err(XbarError::failed(
                "connection period size is not an integer frame count",
            ));
        }

        let task = BufferTask::new(
            Arc::clone(src),
            source_info.period_size,
            self.copy_size,
            self.sample_rate,
            false,
            Arc::clone(&self.events),
        )?;
        debug!(
            "{}: new buffer task will copy {} frames from the source",
            self.name, self.copy_size
        );
        let _ = self.action_tx.send(TaskAction::Add(Arc::clone(&task)));
        Ok(task)
    }

    /// Connect a source output port to a sink input port.
    pub fn connect(&self, src: Arc<AudioPort>, sink: Arc<AudioPort>) -> XbarResult<()> {
        let src_ring = src.ring_buffer().map_err(|_| {
            error!("{}: could not get source ring buffer from port", self.name);
            XbarError::failed("source port has no ring buffer")
        })?;

        let task = self.obtain_task(&src, &sink)?;
        if task.is_dummy() {
            // A grouped source gets upgraded in place.
            task.make_real();
        }
        task.add_job(src, sink)?;
        self.task_map.lock().insert(ring_key(&src_ring), task);
        Ok(())
    }

    /// Remove the connection between `src` and `sink`.
    pub fn disconnect(&self, src: &Arc<AudioPort>, sink: &Arc<AudioPort>) -> XbarResult<()> {
        let src_ring = src.ring_buffer().map_err(|_| {
            info!("{}: could not get source ring buffer from port", self.name);
            XbarError::failed("source port has no ring buffer")
        })?;
        let task = self.find_task(&src_ring).ok_or_else(|| {
            info!("{}: no buffer task found, no connection present", self.name);
            XbarError::failed("no connection present")
        })?;

        task.trigger_delete_job(src, sink)?;
        if !task.is_active() {
            // No jobs left: retire the task.
            self.task_map.lock().remove(&ring_key(&src_ring));
            let _ = self.action_tx.send(TaskAction::Delete(task));
        }
        Ok(())
    }

    /// Remove every connection of `src` and wait (bounded) until the
    /// real-time thread has retired the task.
    pub fn remove_connections(&self, src: &Arc<AudioPort>) -> XbarResult<()> {
        if src.direction() != PortDirection::Output {
            info!("{}: no connections present on sink device", self.name);
            return Ok(());
        }
        let src_ring = src.ring_buffer().map_err(|_| {
            info!("{}: could not get source ring buffer from port", self.name);
            XbarError::failed("source port has no ring buffer")
        })?;
        let task = self.find_task(&src_ring).ok_or_else(|| {
            info!("{}: no buffer task found, no connection present", self.name);
            XbarError::failed("no connection present")
        })?;

        task.delete_all_jobs(src)?;
        if !task.is_active() {
            let mut guard = self.retire_lock.lock();
            self.task_map.lock().remove(&ring_key(&src_ring));
            let _ = self.action_tx.send(TaskAction::Delete(Arc::clone(&task)));
            let retired = |live: &Vec<Arc<BufferTask>>| {
                !live.iter().any(|t| Arc::ptr_eq(t, &task))
            };
            let deadline = std::time::Instant::now() + RETIRE_WAIT;
            while !retired(&self.live_tasks.lock()) {
                if self
                    .retire_cv
                    .wait_until(&mut guard, deadline)
                    .timed_out()
                {
                    warn!("{}: time out on wait for task deletion", self.name);
                    return Ok(());
                }
            }
            info!("{}: wait for task deletion completed", self.name);
        }
        Ok(())
    }

    /// Create a dummy connection that keeps `src` drained without
    /// delivering anywhere.
    pub fn dummy_connect(&self, src: &Arc<AudioPort>) -> XbarResult<()> {
        let src_ring = src.ring_buffer()?;
        if let Some(task) = self.find_task(&src_ring) {
            task.make_dummy();
            debug!("{}: changed existing task to dummy", self.name);
            return Ok(());
        }
        let source_info = src.copy_information()?;
        let task = BufferTask::new(
            Arc::clone(src),
            source_info.period_size,
            source_info.period_size,
            self.sample_rate,
            true,
            Arc::clone(&self.events),
        )?;
        let _ = self.action_tx.send(TaskAction::Add(Arc::clone(&task)));
        self.task_map.lock().insert(ring_key(&src_ring), task);
        info!("{}: dummy buffer task created", self.name);
        Ok(())
    }

    pub fn dummy_disconnect(&self, src: &Arc<AudioPort>) -> XbarResult<()> {
        let src_ring = src.ring_buffer()?;
        let task = self.find_task(&src_ring).ok_or_else(|| {
            info!("{}: no buffer task found, no connection present", self.name);
            XbarError::failed("no connection present")
        })?;
        if !task.is_active() {
            let _ = self.action_tx.send(TaskAction::Delete(task));
        }
        self.task_map.lock().remove(&ring_key(&src_ring));
        Ok(())
    }

    /// Advance all connected sources by one base period. Called from the
    /// base zone's worker thread.
    pub fn trigger(&self) -> XbarResult<()> {
        while let Ok(action) = self.action_rx.try_recv() {
            match action {
                TaskAction::Add(task) => {
                    debug!("{}: adding new buffer task", self.name);
                    self.live_tasks.lock().push(task);
                }
                TaskAction::Delete(task) => {
                    debug!("{}: delete buffer task", self.name);
                    // Trigger the task once more so pending disconnect
                    // events are emitted before the task disappears.
                    if !task.is_dummy() {
                        let _ = task.do_jobs();
                    }
                    {
                        let _guard = self.retire_lock.lock();
                        self.live_tasks.lock().retain(|t| !Arc::ptr_eq(t, &task));
                    }
                    self.retire_cv.notify_one();
                }
            }
        }

        for task in self.live_tasks.lock().iter() {
            if task.is_dummy() {
                task.do_dummy()?;
            } else if task.do_jobs()? == TaskStatus::NoJobs {
                // The task stays listed until its deletion action arrives.
                debug!("{}: task of {} has no jobs", self.name, task.origin().name());
            }
        }
        Ok(())
    }

    /// Unlock the jobs of every playing source (start-of-period
    /// synchronization with the routing zones).
    pub fn unlock_jobs(&self) {
        for task in self.live_tasks.lock().iter() {
            task.unlock_jobs();
        }
    }

    /// Lock the job that delivers into `sink_port` (sink resynchronization).
    pub fn lock_job(&self, sink_port: &Arc<AudioPort>) {
        for task in self.live_tasks.lock().iter() {
            task.lock_job(sink_port);
        }
    }

    /// Arm a probe on a port of this matrix. Input ports tap the job that
    /// feeds them, output ports tap the source's buffer task.
    pub fn start_probing(&self, port: &Arc<AudioPort>, params: ProbeParams) -> XbarResult<()> {
        match port.direction() {
            PortDirection::Input => {
                let tasks: Vec<_> = self.task_map.lock().values().cloned().collect();
                for task in tasks {
                    if let Some(job) = task.find_job(port) {
                        return job.start_probe(params);
                    }
                }
                error!("{}: no switch matrix job found, no probing started", self.name);
                Err(XbarError::failed("no job for port"))
            }
            PortDirection::Output => {
                let ring = port.ring_buffer()?;
                match self.find_task(&ring) {
                    Some(task) => task.start_probing(params),
                    None => {
                        error!("{}: no connection active, no probing started", self.name);
                        Err(XbarError::failed("no connection active"))
                    }
                }
            }
        }
    }

    pub fn stop_probing(&self, port: &Arc<AudioPort>) {
        match port.direction() {
            PortDirection::Input => {
                let tasks: Vec<_> = self.task_map.lock().values().cloned().collect();
                for task in tasks {
                    if let Some(job) = task.find_job(port) {
                        job.stop_probe();
                        return;
                    }
                }
            }
            PortDirection::Output => {
                if let Ok(ring) = port.ring_buffer() {
                    if let Some(task) = self.find_task(&ring) {
                        task.stop_probing();
                    }
                }
            }
        }
    }
}
