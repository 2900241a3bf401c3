//! Buffer Tasks
//!
//! One buffer task exists per source feeding a switch matrix. It owns the
//! set of jobs fanning that source out to the connected sinks, a job-action
//! queue through which connect/disconnect requests reach the real-time
//! thread, and the source's underrun/playing state machine.
//!
//! A *dummy* task has no jobs; it only advances the source's read pointer
//! so a grouped source cannot build backlog while nothing consumes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{XbarError, XbarResult};
use crate::events::{EngineEvent, EventProvider};
use crate::format::SampleFormat;
use crate::job::SwitchMatrixJob;
use crate::port::AudioPort;
use crate::probe::{apply_probe_action, DataProbe, ProbeAction, ProbeParams};
use crate::ringbuf::{AccessDirection, RingBuffer};

/// Source delivery state tracked by the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Underrun,
    Playing,
}

/// Result of one `do_jobs` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ok,
    /// The job set is empty; the switch matrix can retire the task.
    NoJobs,
}

enum JobAction {
    Add(Arc<SwitchMatrixJob>),
    Delete(Arc<SwitchMatrixJob>),
    DeleteAllSourceJobs,
}

/// Per-source container of switch-matrix jobs.
pub struct BufferTask {
    src_port: Arc<AudioPort>,
    origin: Arc<RingBuffer>,
    source_period_size: u32,
    /// Copy size of the switch matrix (base period size).
    dest_size: u32,
    sample_rate: u32,
    is_dummy: AtomicBool,
    /// Live job set, touched only by the real-time thread.
    jobs: Mutex<Vec<Arc<SwitchMatrixJob>>>,
    /// Setup-side connection map: sink port id -> job.
    connections: Mutex<HashMap<i32, Arc<SwitchMatrixJob>>>,
    action_tx: Sender<JobAction>,
    action_rx: Receiver<JobAction>,
    probe_tx: Sender<ProbeAction>,
    probe_rx: Receiver<ProbeAction>,
    probe: Mutex<Option<DataProbe>>,
    probing_active: AtomicBool,
    source_state: Mutex<SourceState>,
    events: Arc<EventProvider>,
}

impl BufferTask {
    pub fn new(
        src_port: Arc<AudioPort>,
        read_size: u32,
        dest_size: u32,
        sample_rate: u32,
        is_dummy: bool,
        events: Arc<EventProvider>,
    ) -> XbarResult<Arc<Self>> {
        if read_size == 0 {
            return Err(XbarError::invalid_param("buffer task: read size must not be 0"));
        }
        let origin = src_port.ring_buffer()?;

        // A re-connected hardware source may still carry PCM of a previous
        // connection in its adaptation buffers; drop it. Client devices keep
        // their buffer so an application can prefill before connecting.
        if let Ok(owner) = src_port.owner() {
            owner.reset_source_buffers();
        }

        let (action_tx, action_rx) = unbounded();
        let (probe_tx, probe_rx) = unbounded();
        Ok(Arc::new(Self {
            src_port,
            origin,
            source_period_size: read_size,
            dest_size,
            sample_rate,
            is_dummy: AtomicBool::new(is_dummy),
            jobs: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            action_tx,
            action_rx,
            probe_tx,
            probe_rx,
            probe: Mutex::new(None),
            probing_active: AtomicBool::new(false),
            source_state: Mutex::new(SourceState::Underrun),
            events,
        }))
    }

    pub fn source_port(&self) -> &Arc<AudioPort> {
        &self.src_port
    }

    pub fn origin(&self) -> &Arc<RingBuffer> {
        &self.origin
    }

    pub fn is_dummy(&self) -> bool {
        self.is_dummy.load(Ordering::Relaxed)
    }

    pub fn make_dummy(&self) {
        self.is_dummy.store(true, Ordering::Relaxed);
    }

    /// A dummy connection is upgraded in place when a real connection to
    /// the same source arrives.
    pub fn make_real(&self) {
        self.is_dummy.store(false, Ordering::Relaxed);
    }

    pub fn source_state(&self) -> SourceState {
        *self.source_state.lock()
    }

    /// True while any connection uses this task.
    pub fn is_active(&self) -> bool {
        !self.connections.lock().is_empty()
    }

    /// Create a job for a new connection and schedule its activation.
    pub fn add_job(&self, source: Arc<AudioPort>, sink: Arc<AudioPort>) -> XbarResult<()> {
        {
            let connections = self.connections.lock();
            if let Some(existing) = connections.get(&sink.id()) {
                if Arc::ptr_eq(existing.source_port(), &source) {
                    error!(
                        "adding job failed, connection already exists for {}",
                        self.origin.name()
                    );
                    return Err(XbarError::failed("connection already exists"));
                }
                error!("adding job failed, sink is in use for {}", self.origin.name());
                return Err(XbarError::failed("sink is in use"));
            }
        }

        let job = SwitchMatrixJob::new(source, Arc::clone(&sink), self.dest_size, self.sample_rate)?;
        self.connections.lock().insert(sink.id(), Arc::clone(&job));
        let _ = self.action_tx.send(JobAction::Add(job));
        Ok(())
    }

    /// Schedule the removal of one connection.
    pub fn trigger_delete_job(
        &self,
        source: &Arc<AudioPort>,
        sink: &Arc<AudioPort>,
    ) -> XbarResult<()> {
        let mut connections = self.connections.lock();
        let matches = connections
            .get(&sink.id())
            .is_some_and(|job| Arc::ptr_eq(job.source_port(), source));
        if !matches {
            error!("delete job failed, does not exist for {}", self.origin.name());
            return Err(XbarError::failed("connection does not exist"));
        }
        if let Some(job) = connections.remove(&sink.id()) {
            let _ = self.action_tx.send(JobAction::Delete(job));
        }
        Ok(())
    }

    /// Schedule the removal of every connection of `source`.
    pub fn delete_all_jobs(&self, source: &Arc<AudioPort>) -> XbarResult<()> {
        info!("delete all jobs for {}", self.origin.name());
        self.connections
            .lock()
            .retain(|_, job| !Arc::ptr_eq(job.source_port(), source));
        let _ = self.action_tx.send(JobAction::DeleteAllSourceJobs);
        Ok(())
    }

    /// Find the job using `port` on either side, if any.
    pub fn find_job(&self, port: &Arc<AudioPort>) -> Option<Arc<SwitchMatrixJob>> {
        self.connections
            .lock()
            .values()
            .find(|job| {
                Arc::ptr_eq(job.source_port(), port) || Arc::ptr_eq(job.sink_port(), port)
            })
            .cloned()
    }

    pub fn unlock_jobs(&self) {
        if *self.source_state.lock() != SourceState::Underrun {
            for job in self.jobs.lock().iter() {
                job.unlock();
            }
        }
    }

    pub fn lock_jobs(&self) {
        debug!("lock all jobs for {}", self.origin.name());
        for job in self.jobs.lock().iter() {
            job.lock();
        }
    }

    /// Lock the job delivering to `sink_port`, if this task owns it.
    pub fn lock_job(&self, sink_port: &Arc<AudioPort>) {
        if let Some(job) = self.connections.lock().get(&sink_port.id()) {
            job.lock();
            info!(
                "locked job between {} and {}",
                job.source_port().name(),
                sink_port.name()
            );
        }
    }

    pub fn start_probing(&self, params: ProbeParams) -> XbarResult<()> {
        if self.probing_active.load(Ordering::Relaxed) {
            error!("probing already active for {}", self.origin.name());
            return Err(XbarError::failed("probing already active"));
        }
        let _ = self.probe_tx.send(ProbeAction::Start(params));
        Ok(())
    }

    pub fn stop_probing(&self) {
        let _ = self.probe_tx.send(ProbeAction::Stop);
    }

    /// Consume the source without delivering anywhere (dummy connection).
    pub fn do_dummy(&self) -> XbarResult<()> {
        let available = self.origin.update_available(AccessDirection::Read)?;
        let (offset, frames) = self.origin.begin_access(AccessDirection::Read, available)?;
        self.origin.end_access(AccessDirection::Read, offset, frames)?;
        Ok(())
    }

    fn drain_action_queue(&self) {
        while let Ok(action) = self.action_rx.try_recv() {
            match action {
                JobAction::Add(job) => {
                    debug!("adding new job for {}", self.origin.name());
                    self.events.send(EngineEvent::ConnectionEstablished {
                        source_id: job.source_port_id(),
                        sink_id: job.sink_port_id(),
                    });
                    self.jobs.lock().push(job);
                }
                JobAction::Delete(job) => {
                    debug!("delete job for {}", self.origin.name());
                    self.events.send(EngineEvent::ConnectionRemoved {
                        source_id: job.source_port_id(),
                        sink_id: job.sink_port_id(),
                    });
                    self.jobs.lock().retain(|j| !Arc::ptr_eq(j, &job));
                }
                JobAction::DeleteAllSourceJobs => {
                    info!("delete all jobs for source {}", self.origin.name());
                    let mut jobs = self.jobs.lock();
                    for job in jobs.iter() {
                        if Arc::ptr_eq(job.source_port(), &self.src_port) {
                            self.events.send(EngineEvent::SourceDeleted {
                                source_id: job.source_port_id(),
                                sink_id: job.sink_port_id(),
                            });
                        }
                    }
                    jobs.retain(|job| !Arc::ptr_eq(job.source_port(), &self.src_port));
                }
            }
        }
    }

    /// Run all jobs of this task for one trigger.
    ///
    /// Pops pending job and probe actions first, then iterates the job set
    /// over the available source frames until no job reports a remainder.
    /// The underrun state machine locks all jobs when the source dries up
    /// (deferred until an in-flight remainder is finished) and returns to
    /// `Playing` once a full source period has accumulated again.
    pub fn do_jobs(&self) -> XbarResult<TaskStatus> {
        self.drain_action_queue();

        {
            let mut probe = self.probe.lock();
            while let Ok(action) = self.probe_rx.try_recv() {
                apply_probe_action(action, &mut probe);
                self.probing_active.store(probe.is_some(), Ordering::Relaxed);
            }
        }

        if self.jobs.lock().is_empty() {
            debug!("no more jobs to execute for {}", self.origin.name());
            return Ok(TaskStatus::NoJobs);
        }

        let mut frames_still_to_consume = 0u32;
        let mut lock_after_loop = false;

        loop {
            // The read pointer may only advance past frames every job has
            // seen, so the smallest per-job consumption wins.
            let mut min_frames_consumed: Option<u32> = None;
            let src_samples = match self.origin.update_available(AccessDirection::Read) {
                Ok(n) => n,
                Err(e) => {
                    warn!("cannot read availability of {}: {}", self.origin.name(), e);
                    0
                }
            };

            {
                let mut state = self.source_state.lock();
                if src_samples == 0 && *state == SourceState::Playing {
                    warn!(
                        "{} underrun, {} frames still to process",
                        self.origin.name(),
                        frames_still_to_consume
                    );
                    *state = SourceState::Underrun;
                    if frames_still_to_consume == 0 {
                        drop(state);
                        self.lock_jobs();
                    } else {
                        // Finish the in-flight remainder before locking.
                        lock_after_loop = true;
                    }
                } else if src_samples >= self.source_period_size
                    && *state == SourceState::Underrun
                {
                    info!("{} playing", self.origin.name());
                    *state = SourceState::Playing;
                }
            }

            let wanted = self.source_period_size.min(src_samples);
            let (offset, region_frames) =
                self.origin.begin_access(AccessDirection::Read, wanted)?;
            let mut frames_to_read = region_frames;
            if frames_still_to_consume != 0 && frames_to_read >= frames_still_to_consume {
                frames_to_read = frames_still_to_consume;
            }

            {
                let mut probe = self.probe.lock();
                if let Some(active) = probe.as_mut() {
                    let mut region = self.origin.region_mut(offset, frames_to_read);
                    if !active.process(&mut region, frames_to_read) {
                        *probe = None;
                        self.probing_active.store(false, Ordering::Relaxed);
                    }
                }
            }

            for job in self.jobs.lock().iter() {
                let region = self.origin.region(offset, frames_to_read);
                match job.execute(&region, frames_to_read) {
                    Ok(result) => {
                        min_frames_consumed = Some(match min_frames_consumed {
                            Some(n) => n.min(result.frames_consumed),
                            None => result.frames_consumed,
                        });
                        frames_still_to_consume = result.frames_still_to_consume;
                    }
                    Err(e) => {
                        error!(
                            "error executing job for {} with source {} and sink {}: {}",
                            self.origin.name(),
                            job.source_port_id(),
                            job.sink_port_id(),
                            e
                        );
                    }
                }
            }

            let frames_consumed = min_frames_consumed.unwrap_or(0);
            self.origin
                .end_access(AccessDirection::Read, offset, frames_consumed)?;

            if frames_still_to_consume == 0 {
                break;
            }
            if frames_consumed == 0 {
                // A remainder without progress (e.g. a full conversion
                // buffer) must not spin the real-time thread; the jobs pick
                // the remainder up on the next trigger.
                warn!(
                    "{}: {} frames still to consume without progress, deferring",
                    self.origin.name(),
                    frames_still_to_consume
                );
                break;
            }
        }

        if lock_after_loop {
            self.lock_jobs();
        }
        Ok(TaskStatus::Ok)
    }

    pub fn source_format(&self) -> SampleFormat {
        self.origin.format()
    }
}
