//! Switch-Matrix Jobs
//!
//! A job moves PCM of one connection: from a region of the source port's
//! ring buffer into the conversion buffer behind the sink port, either as a
//! plain copy (equal sample rates, any format pairing) or through the
//! sample-rate converter.
//!
//! A job starts out *locked*. It only unlocks once the routing zone that
//! consumes the sink port is active, which synchronizes the producer side
//! with its consumer: a locked job consumes nothing and reports zero
//! frames, so the source backlog stays with the source until the sink is
//! really draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{XbarError, XbarResult};
use crate::format::{copy_area_buffers, AreaView};
use crate::port::{AudioPort, PortCopyInfo};
use crate::probe::{apply_probe_action, DataProbe, ProbeAction, ProbeParams};
use crate::resample::RateConverter;
use crate::ringbuf::AccessDirection;

/// What a job does per trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTask {
    Copy,
    SampleRateConvert,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
    /// Source frames consumed by this job.
    pub frames_consumed: u32,
    /// Source frames the job still needs to complete the current output
    /// period; the buffer task re-enters with more input while non-zero.
    pub frames_still_to_consume: u32,
}

struct JobState {
    src_info: PortCopyInfo,
    sink_info: PortCopyInfo,
    /// Output frames per base period.
    dest_size: u32,
    /// Source frames per base period.
    source_size: u32,
    /// Output frames per input frame.
    ratio: f32,
    frames_still_to_process: u32,
    task: JobTask,
    resampler: Option<RateConverter>,
    probe: Option<DataProbe>,
    log_cnt: u32,
    log_interval: u32,
}

/// One copy or sample-rate-convert operation of the switch matrix.
pub struct SwitchMatrixJob {
    src: Arc<AudioPort>,
    sink: Arc<AudioPort>,
    locked: AtomicBool,
    probing_active: AtomicBool,
    probe_tx: Sender<ProbeAction>,
    probe_rx: Receiver<ProbeAction>,
    state: Mutex<JobState>,
}

impl SwitchMatrixJob {
    /// Create and initialize a job for one connection. `copy_size` is the
    /// base period size of the switch matrix, `base_sample_rate` its sample
    /// rate.
    pub fn new(
        src: Arc<AudioPort>,
        sink: Arc<AudioPort>,
        copy_size: u32,
        base_sample_rate: u32,
    ) -> XbarResult<Arc<Self>> {
        if copy_size == 0 {
            return Err(XbarError::invalid_param("job: copy size must not be 0"));
        }
        if base_sample_rate == 0 {
            return Err(XbarError::invalid_param("job: base sample rate must not be 0"));
        }
        let src_info = src.copy_information()?;
        let sink_info = sink.copy_information()?;
        if src_info.num_channels != sink_info.num_channels {
            error!(
                "job init failed, channel mismatch: {} has {}, {} has {}",
                src.name(),
                src_info.num_channels,
                sink.name(),
                sink_info.num_channels
            );
            return Err(XbarError::failed("job channel counts do not match"));
        }

        let base_period_time = f64::from(copy_size) / f64::from(base_sample_rate);
        let sink_period_time = f64::from(sink_info.period_size) / f64::from(sink_info.sample_rate);
        if sink_period_time < base_period_time {
            error!(
                "config mismatch, connection targets a sink with a smaller period time than the base zone"
            );
            return Err(XbarError::failed("sink period time below base period time"));
        }

        let base_period_ms = (base_period_time * 1000.0) as u32;
        let log_interval = if base_period_ms == 0 {
            1000
        } else {
            1000 / base_period_ms
        };

        let (task, source_size, resampler, ratio) =
            if src_info.sample_rate != sink_info.sample_rate {
                let source_size = (base_period_time * f64::from(src_info.sample_rate)) as u32;
                let resampler = RateConverter::new(
                    src_info.sample_rate,
                    sink_info.sample_rate,
                    src_info.num_channels,
                )?;
                let ratio = resampler.ratio();
                info!(
                    "job converts {} Hz -> {} Hz, {} source frames per base period",
                    src_info.sample_rate, sink_info.sample_rate, source_size
                );
                (JobTask::SampleRateConvert, source_size, Some(resampler), ratio)
            } else {
                (JobTask::Copy, src_info.period_size, None, 1.0)
            };

        let dest_size = (f64::from(sink_info.sample_rate) * base_period_time) as u32;
        debug!(
            "job {} -> {} created with destination copy size {}",
            src.name(),
            sink.name(),
            dest_size
        );

        let (probe_tx, probe_rx) = unbounded();
        Ok(Arc::new(Self {
            src,
            sink,
            locked: AtomicBool::new(true),
            probing_active: AtomicBool::new(false),
            probe_tx,
            probe_rx,
            state: Mutex::new(JobState {
                src_info,
                sink_info,
                dest_size,
                source_size,
                ratio,
                frames_still_to_process: dest_size,
                task,
                resampler,
                probe: None,
                log_cnt: 0,
                log_interval,
            }),
        }))
    }

    pub fn source_port(&self) -> &Arc<AudioPort> {
        &self.src
    }

    pub fn sink_port(&self) -> &Arc<AudioPort> {
        &self.sink
    }

    pub fn source_port_id(&self) -> i32 {
        self.src.id()
    }

    pub fn sink_port_id(&self) -> i32 {
        self.sink.id()
    }

    pub fn task(&self) -> JobTask {
        self.state.lock().task
    }

    pub fn destination_size(&self) -> u32 {
        self.state.lock().dest_size
    }

    pub fn source_size(&self) -> u32 {
        self.state.lock().source_size
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    /// Unlock the job if the sink's routing zone is currently active;
    /// otherwise the job stays locked until the zone comes up.
    pub fn unlock(&self) {
        if !self.is_locked() {
            return;
        }
        let owner = match self.sink.owner() {
            Ok(owner) => owner,
            Err(_) => {
                warn!("sink port {} has no owner, keeping job locked", self.sink.name());
                return;
            }
        };
        match owner.zone_is_active() {
            Some(true) => {
                self.locked.store(false, Ordering::Release);
                debug!(
                    "job between {} and {} unlocked",
                    self.src.name(),
                    self.sink.name()
                );
            }
            Some(false) => {
                debug!(
                    "job between {} and {} stays locked: routing zone not active yet",
                    self.src.name(),
                    self.sink.name()
                );
            }
            None => {
                // The sink port does not belong to a routing zone; nothing
                // gates the transfer.
                warn!(
                    "sink port {} does not belong to a routing zone",
                    self.sink.name()
                );
                self.locked.store(false, Ordering::Release);
            }
        }
    }

    pub fn start_probe(&self, params: ProbeParams) -> XbarResult<()> {
        if self.probing_active.load(Ordering::Relaxed) {
            error!("probing already active on job {} -> {}", self.src.name(), self.sink.name());
            return Err(XbarError::failed("probing already active"));
        }
        let _ = self.probe_tx.send(ProbeAction::Start(params));
        Ok(())
    }

    pub fn stop_probe(&self) {
        let _ = self.probe_tx.send(ProbeAction::Stop);
    }

    /// Execute the job over one source region.
    ///
    /// `src_region` is the readable region the buffer task currently holds;
    /// `frames_to_read` frames of it are valid.
    pub fn execute(
        &self,
        src_region: &AreaView<'_>,
        frames_to_read: u32,
    ) -> XbarResult<ExecuteResult> {
        let mut state = self.state.lock();

        if self.is_locked() {
            if state.log_cnt > state.log_interval || state.log_cnt == 0 {
                state.log_cnt = 0;
                info!(
                    "job between {} and {} is locked, unlock to execute",
                    self.src.name(),
                    self.sink.name()
                );
            }
            state.log_cnt += 1;
            return Ok(ExecuteResult {
                frames_consumed: 0,
                frames_still_to_consume: 0,
            });
        }
        state.log_cnt = 0;

        while let Ok(action) = self.probe_rx.try_recv() {
            apply_probe_action(action, &mut state.probe);
            self.probing_active
                .store(state.probe.is_some(), Ordering::Relaxed);
        }

        match state.task {
            JobTask::Copy => self.copy(&mut state, src_region, frames_to_read),
            JobTask::SampleRateConvert => {
                self.sample_rate_convert(&mut state, src_region, frames_to_read)
            }
        }
    }

    fn copy(
        &self,
        state: &mut JobState,
        src_region: &AreaView<'_>,
        frames_to_read: u32,
    ) -> XbarResult<ExecuteResult> {
        let sink_ring = self.sink.ring_buffer()?;
        let space = sink_ring.update_available(AccessDirection::Write)?;
        let (sink_offset, sink_frames) = sink_ring.begin_access(AccessDirection::Write, space)?;

        // Only copy as much as the sink has room for.
        let frames = state.dest_size.min(frames_to_read).min(sink_frames);
        {
            let mut dst = sink_ring.region_mut(sink_offset, frames);
            copy_area_buffers(
                &mut dst,
                0,
                state.sink_info.index as usize,
                frames as usize,
                src_region,
                0,
                state.src_info.index as usize,
                frames as usize,
                state.src_info.num_channels as usize,
            )?;
            if let Some(probe) = state.probe.as_mut() {
                if !probe.process(&mut dst, frames) {
                    state.probe = None;
                    self.probing_active.store(false, Ordering::Relaxed);
                }
            }
        }
        sink_ring.end_access(AccessDirection::Write, sink_offset, frames)?;

        Ok(ExecuteResult {
            frames_consumed: frames,
            frames_still_to_consume: 0,
        })
    }

    fn sample_rate_convert(
        &self,
        state: &mut JobState,
        src_region: &AreaView<'_>,
        frames_to_read: u32,
    ) -> XbarResult<ExecuteResult> {
        let sink_ring = self.sink.ring_buffer()?;

        if frames_to_read == 0 {
            // The source dried up while a period was outstanding: drop the
            // remainder and start the next period from a clean phase.
            if let Some(resampler) = state.resampler.as_mut() {
                resampler.reset();
            }
            state.frames_still_to_process = state.dest_size;
            info!("SRC reset, no input data");
            return Ok(ExecuteResult {
                frames_consumed: 0,
                frames_still_to_consume: 0,
            });
        }

        let space = sink_ring.update_available(AccessDirection::Write)?;
        let (sink_offset, sink_frames) = sink_ring.begin_access(AccessDirection::Write, space)?;
        let max_output = sink_frames.min(state.frames_still_to_process);

        let sink_index = state.sink_info.index;
        let src_index = state.src_info.index;
        let result = {
            let mut dst = sink_ring.region_mut(sink_offset, max_output);
            let resampler = state
                .resampler
                .as_mut()
                .ok_or(XbarError::NotInitialized("job has no resampler"))?;
            let result = resampler.process(
                &mut dst,
                sink_index,
                max_output,
                src_region,
                src_index,
                frames_to_read,
            )?;
            if let Some(probe) = state.probe.as_mut() {
                if !probe.process(&mut dst, result.frames_produced) {
                    state.probe = None;
                    self.probing_active.store(false, Ordering::Relaxed);
                }
            }
            result
        };
        sink_ring.end_access(AccessDirection::Write, sink_offset, result.frames_produced)?;

        state.frames_still_to_process -= result.frames_produced;
        let frames_still_to_consume = if state.frames_still_to_process == 0 {
            state.frames_still_to_process = state.dest_size;
            0
        } else {
            1 + (state.frames_still_to_process as f32 / state.ratio) as u32
        };

        Ok(ExecuteResult {
            frames_consumed: result.frames_consumed,
            frames_still_to_consume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InProcClient;
    use crate::device::{AudioDevice, ClockType, DeviceParams, DeviceType, OwnerRef};
    use crate::format::SampleFormat;
    use crate::port::{PortDirection, PortParams};
    use crate::ringbuf::{RingBuffer, RingBufferFactory};

    fn device(name: &str, sample_rate: u32, period: u32) -> Arc<AudioDevice> {
        let params = DeviceParams {
            name: name.into(),
            num_channels: 2,
            sample_rate,
            format: SampleFormat::Int16,
            clock_type: ClockType::Provided,
            period_size: period,
            num_periods: 4,
            num_periods_asrc_buffer: 0,
        };
        let backend = InProcClient::new(&params, DeviceType::Source).unwrap();
        AudioDevice::new(DeviceType::Source, params, Box::new(backend)).unwrap()
    }

    /// Source output port bound to its device's client buffer, plus a sink
    /// input port with a dedicated conversion buffer. The sink port is
    /// owned by a device here, so unlock() falls through to the
    /// no-routing-zone path (zone gating is covered by the worker tests).
    struct JobFixture {
        job: Arc<SwitchMatrixJob>,
        src_ring: Arc<RingBuffer>,
        conv: Arc<RingBuffer>,
        _devices: (Arc<AudioDevice>, Arc<AudioDevice>),
    }

    fn job_fixture(
        tag: &str,
        src_rate: u32,
        sink_rate: u32,
        src_period: u32,
        copy_size: u32,
    ) -> JobFixture {
        crate::init_test_logging();
        let src_dev = device(&format!("jb_src_{}", tag), src_rate, src_period);
        let sink_dev = device(&format!("jb_sinkdev_{}", tag), sink_rate, copy_size);

        let src_port = crate::port::AudioPort::new(PortParams {
            name: format!("jb_srcport_{}", tag),
            id: 1,
            direction: PortDirection::Output,
            num_channels: 2,
            index: 0,
        });
        src_port.set_ring_buffer(src_dev.ring_buffer().unwrap());
        src_port.set_owner(OwnerRef::Device(Arc::downgrade(&src_dev)));

        let conv = RingBufferFactory::instance()
            .create_real(
                &format!("jb_conv_{}", tag),
                (copy_size as f64 * sink_rate as f64 / 48_000.0) as u32,
                4,
                2,
                SampleFormat::Int16,
            )
            .unwrap();
        let sink_port = crate::port::AudioPort::new(PortParams {
            name: format!("jb_sinkport_{}", tag),
            id: 2,
            direction: PortDirection::Input,
            num_channels: 2,
            index: 0,
        });
        sink_port.set_ring_buffer(Arc::clone(&conv));
        sink_port.set_owner(OwnerRef::Device(Arc::downgrade(&sink_dev)));

        let src_ring = src_dev.ring_buffer().unwrap();
        let job = SwitchMatrixJob::new(src_port, sink_port, copy_size, 48_000).unwrap();
        JobFixture {
            job,
            src_ring,
            conv,
            _devices: (src_dev, sink_dev),
        }
    }

    fn write_frames(ring: &RingBuffer, frames: &[i16]) {
        let bytes: Vec<u8> = frames.iter().flat_map(|v| v.to_ne_bytes()).collect();
        ring.write_interleaved(&bytes).unwrap();
    }

    #[test]
    fn test_locked_job_consumes_nothing() {
        let JobFixture { job, src_ring, conv, .. } = job_fixture("locked", 48_000, 48_000, 64, 64);
        write_frames(&src_ring, &[1i16; 128]);

        assert!(job.is_locked());
        let (offset, frames) = src_ring.begin_access(AccessDirection::Read, 64).unwrap();
        let region = src_ring.region(offset, frames);
        let result = job.execute(&region, frames).unwrap();
        assert_eq!(result.frames_consumed, 0);
        assert_eq!(conv.update_available(AccessDirection::Read).unwrap(), 0);
    }

    #[test]
    fn test_copy_moves_min_of_sizes() {
        let JobFixture { job, src_ring, conv, .. } = job_fixture("copy", 48_000, 48_000, 64, 64);
        job.unlock(); // device-owned sink -> unlocks with a warning
        assert!(!job.is_locked());
        assert_eq!(job.task(), JobTask::Copy);

        let samples: Vec<i16> = (0..128).map(|i| i as i16).collect();
        write_frames(&src_ring, &samples);

        let (offset, frames) = src_ring.begin_access(AccessDirection::Read, 64).unwrap();
        let region = src_ring.region(offset, frames);
        let result = job.execute(&region, frames).unwrap();
        assert_eq!(result.frames_consumed, 64);
        assert_eq!(result.frames_still_to_consume, 0);
        src_ring
            .end_access(AccessDirection::Read, offset, result.frames_consumed)
            .unwrap();

        assert_eq!(conv.update_available(AccessDirection::Read).unwrap(), 64);
        let mut out = vec![0u8; 64 * 4];
        conv.read_interleaved(&mut out).unwrap();
        let got: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(&got[..], &samples[..128]);
    }

    #[test]
    fn test_copy_clips_to_sink_space() {
        let JobFixture { job, src_ring, conv, .. } = job_fixture("clip", 48_000, 48_000, 64, 64);
        job.unlock();

        // Leave only 16 frames of space in the conversion buffer.
        let filler = vec![0i16; (conv.period_size() * conv.num_periods() - 16) as usize * 2];
        write_frames(&conv, &filler);

        write_frames(&src_ring, &[5i16; 128]);
        let (offset, frames) = src_ring.begin_access(AccessDirection::Read, 64).unwrap();
        let region = src_ring.region(offset, frames);
        let result = job.execute(&region, frames).unwrap();
        assert!(result.frames_consumed <= 16);
    }

    #[test]
    fn test_src_job_parameters() {
        // 44.1 kHz source, 48 kHz sink, base period 960 at 48 kHz (20 ms):
        // the job must convert with destination size 960 and source size 882.
        let JobFixture { job, .. } = job_fixture("src", 44_100, 48_000, 882, 960);
        assert_eq!(job.task(), JobTask::SampleRateConvert);
        assert_eq!(job.destination_size(), 960);
        assert_eq!(job.source_size(), 882);
    }

    #[test]
    fn test_src_remainder_reentry() {
        let JobFixture { job, src_ring, conv, .. } = job_fixture("reent", 44_100, 48_000, 882, 960);
        job.unlock();

        write_frames(&src_ring, &vec![100i16; 882 * 2]);
        let (offset, frames) = src_ring.begin_access(AccessDirection::Read, 882).unwrap();
        let region = src_ring.region(offset, frames);
        let first = job.execute(&region, frames).unwrap();
        assert!(first.frames_consumed > 0);
        // One pass over one source period cannot complete the 960-frame
        // destination period: a remainder must be reported.
        assert!(first.frames_still_to_consume > 0);
        src_ring
            .end_access(AccessDirection::Read, offset, first.frames_consumed)
            .unwrap();

        let produced_so_far = conv.update_available(AccessDirection::Read).unwrap();
        assert!(produced_so_far < 960);

        // Feed more input; the job completes the period.
        write_frames(&src_ring, &vec![100i16; 32 * 2]);
        let (offset, frames) = src_ring
            .begin_access(AccessDirection::Read, first.frames_still_to_consume)
            .unwrap();
        let region = src_ring.region(offset, frames);
        let second = job.execute(&region, frames).unwrap();
        src_ring
            .end_access(AccessDirection::Read, offset, second.frames_consumed)
            .unwrap();
        assert_eq!(second.frames_still_to_consume, 0);
        assert_eq!(conv.update_available(AccessDirection::Read).unwrap(), 960);
    }

    #[test]
    fn test_src_resets_without_input() {
        let JobFixture { job, src_ring, .. } = job_fixture("reset", 44_100, 48_000, 882, 960);
        job.unlock();

        write_frames(&src_ring, &vec![1i16; 100 * 2]);
        let (offset, frames) = src_ring.begin_access(AccessDirection::Read, 100).unwrap();
        let region = src_ring.region(offset, frames);
        let partial = job.execute(&region, frames).unwrap();
        assert!(partial.frames_still_to_consume > 0);
        src_ring
            .end_access(AccessDirection::Read, offset, partial.frames_consumed)
            .unwrap();

        // No new input: the remainder is dropped and the period restarts.
        let empty = src_ring.region(0, 0);
        let result = job.execute(&empty, 0).unwrap();
        assert_eq!(result.frames_consumed, 0);
        assert_eq!(result.frames_still_to_consume, 0);
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let src_dev = device("jb_mismatch_src", 48_000, 64);
        let src_port = crate::port::AudioPort::new(PortParams {
            name: "jb_mismatch_srcport".into(),
            id: 1,
            direction: PortDirection::Output,
            num_channels: 2,
            index: 0,
        });
        src_port.set_ring_buffer(src_dev.ring_buffer().unwrap());
        src_port.set_owner(OwnerRef::Device(Arc::downgrade(&src_dev)));

        let conv = RingBufferFactory::instance()
            .create_real("jb_mismatch_conv", 64, 4, 4, SampleFormat::Int16)
            .unwrap();
        let sink_port = crate::port::AudioPort::new(PortParams {
            name: "jb_mismatch_sinkport".into(),
            id: 2,
            direction: PortDirection::Input,
            num_channels: 4,
            index: 0,
        });
        sink_port.set_ring_buffer(Arc::clone(&conv));
        sink_port.set_owner(OwnerRef::Device(Arc::downgrade(&src_dev)));

        assert!(SwitchMatrixJob::new(src_port, sink_port, 64, 48_000).is_err());
        RingBufferFactory::instance().destroy(&conv);
    }
}
