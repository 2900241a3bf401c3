//! ALSA Device Handler
//!
//! Wraps one ALSA PCM as an XBar device backend.
//!
//! The *synchronous* path exposes a mirror ring buffer directly on the PCM:
//! `update_available` waits on the device (up to ten period times) and the
//! staging region is committed with interleaved I/O. The *asynchronous*
//! path (`clock_type == ReceivedAsync`) additionally creates a real ring
//! buffer of `num_periods_asrc_buffer` periods and a feeder thread that
//! shuttles periods between that buffer and the device; external users only
//! ever see the buffer, so the foreign clock can never stall a routing
//! zone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use xbar_core::{
    AlsaErrorKind, DeviceBackend, DeviceEvent, DeviceParams, DeviceType, MirrorDevice, RingBuffer,
    RingBufferFactory, SampleFormat, XbarError, XbarResult,
};

fn alsa_format(format: SampleFormat) -> Format {
    #[cfg(target_endian = "big")]
    {
        match format {
            SampleFormat::Int16 => Format::S16BE,
            SampleFormat::Int32 => Format::S32BE,
            SampleFormat::Float32 => Format::FloatBE,
        }
    }
    #[cfg(target_endian = "little")]
    {
        match format {
            SampleFormat::Int16 => Format::S16LE,
            SampleFormat::Int32 => Format::S32LE,
            SampleFormat::Float32 => Format::FloatLE,
        }
    }
}

fn map_alsa_error(err: alsa::Error) -> XbarError {
    match err.errno() {
        libc::EPIPE => XbarError::Alsa(AlsaErrorKind::Xrun),
        libc::ESTRPIPE => XbarError::Alsa(AlsaErrorKind::Suspend),
        _ => XbarError::Alsa(AlsaErrorKind::Other),
    }
}

/// The PCM endpoint behind the mirror buffer.
struct AlsaEndpoint {
    name: String,
    pcm: Mutex<Option<PCM>>,
    frame_bytes: usize,
}

impl AlsaEndpoint {
    fn with_pcm<R>(&self, f: impl FnOnce(&PCM) -> XbarResult<R>) -> XbarResult<R> {
        let guard = self.pcm.lock();
        let pcm = guard
            .as_ref()
            .ok_or(XbarError::NotInitialized("ALSA device is not open"))?;
        f(pcm)
    }
}

impl MirrorDevice for AlsaEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn avail(&self, min_frames: u32, timeout: Option<Duration>) -> XbarResult<u32> {
        self.with_pcm(|pcm| {
            let mut avail = pcm.avail_update().map_err(map_alsa_error)? as i64;
            if avail < i64::from(min_frames) {
                if let Some(timeout) = timeout {
                    let ready = pcm
                        .wait(Some(timeout.as_millis() as u32))
                        .map_err(map_alsa_error)?;
                    if !ready {
                        return Err(XbarError::Timeout);
                    }
                    avail = pcm.avail_update().map_err(map_alsa_error)? as i64;
                }
            }
            Ok(avail.max(0) as u32)
        })
    }

    fn transfer_write(&self, data: &[u8], frames: u32) -> XbarResult<u32> {
        self.with_pcm(|pcm| {
            let bytes = &data[..frames as usize * self.frame_bytes];
            match pcm.io_bytes().writei(bytes) {
                Ok(written) => Ok(written as u32),
                Err(err) => {
                    // An underrun is recoverable in place; retry once after
                    // snd_pcm_recover.
                    if err.errno() == libc::EPIPE {
                        warn!("{}: xrun on write, recovering", self.name);
                        pcm.try_recover(err, true).map_err(map_alsa_error)?;
                        let written = pcm.io_bytes().writei(bytes).map_err(map_alsa_error)?;
                        return Ok(written as u32);
                    }
                    Err(map_alsa_error(err))
                }
            }
        })
    }

    fn transfer_read(&self, data: &mut [u8], frames: u32) -> XbarResult<u32> {
        self.with_pcm(|pcm| {
            let bytes = &mut data[..frames as usize * self.frame_bytes];
            match pcm.io_bytes().readi(bytes) {
                Ok(read) => Ok(read as u32),
                Err(err) => {
                    if err.errno() == libc::EPIPE {
                        warn!("{}: xrun on read, recovering", self.name);
                        pcm.try_recover(err, true).map_err(map_alsa_error)?;
                        let read = pcm.io_bytes().readi(bytes).map_err(map_alsa_error)?;
                        return Ok(read as u32);
                    }
                    Err(map_alsa_error(err))
                }
            }
        })
    }

    fn start(&self) -> XbarResult<()> {
        self.with_pcm(|pcm| {
            if pcm.state() != State::Running {
                pcm.start().map_err(map_alsa_error)?;
            }
            Ok(())
        })
    }

    fn reset(&self) -> XbarResult<()> {
        self.with_pcm(|pcm| {
            pcm.drop().map_err(map_alsa_error)?;
            pcm.prepare().map_err(map_alsa_error)?;
            Ok(())
        })
    }
}

/// ALSA PCM device backend.
pub struct AlsaHandler {
    params: DeviceParams,
    device_type: DeviceType,
    endpoint: Arc<AlsaEndpoint>,
    mirror: Arc<RingBuffer>,
    asrc: Option<Arc<RingBuffer>>,
    is_async: bool,
    feeder: Mutex<Option<JoinHandle<()>>>,
    feeder_running: Arc<AtomicBool>,
}

impl AlsaHandler {
    pub fn new(params: DeviceParams, device_type: DeviceType) -> XbarResult<Self> {
        params.validate()?;
        let is_async = params.clock_type == xbar_core::ClockType::ReceivedAsync;
        info!(
            "ALSA handler {}: {} Hz, {} channels, {}, period {} x {}{}",
            params.name,
            params.sample_rate,
            params.num_channels,
            params.format,
            params.period_size,
            params.num_periods,
            if is_async { ", asynchronous" } else { "" }
        );

        let factory = RingBufferFactory::instance();
        let mirror = factory.create_mirror(
            &format!("AlsaHandler_{}", params.name),
            params.num_periods,
            params.num_channels,
            params.format,
        )?;

        let asrc = if is_async {
            Some(factory.create_real(
                &format!("AlsaHandler_{}_asrc", params.name),
                params.period_size,
                params.num_periods_asrc_buffer,
                params.num_channels,
                params.format,
            )?)
        } else {
            None
        };

        let endpoint = Arc::new(AlsaEndpoint {
            name: params.name.clone(),
            pcm: Mutex::new(None),
            frame_bytes: params.format.bytes() * params.num_channels as usize,
        });

        Ok(Self {
            params,
            device_type,
            endpoint,
            mirror,
            asrc,
            is_async,
            feeder: Mutex::new(None),
            feeder_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    fn set_hw_params(&self, pcm: &PCM) -> XbarResult<(Frames, Frames)> {
        let hwp = HwParams::any(pcm).map_err(map_alsa_error)?;
        hwp.set_rate_resample(true).map_err(map_alsa_error)?;
        hwp.set_access(Access::RWInterleaved).map_err(|e| {
            error!("{}: device does not support interleaved access", self.params.name);
            map_alsa_error(e)
        })?;
        hwp.set_format(alsa_format(self.params.format))
            .map_err(|e| {
                error!(
                    "{}: device does not support format {}",
                    self.params.name, self.params.format
                );
                map_alsa_error(e)
            })?;
        hwp.set_channels(self.params.num_channels)
            .map_err(map_alsa_error)?;
        hwp.set_rate(self.params.sample_rate, ValueOr::Nearest)
            .map_err(map_alsa_error)?;
        let actual_rate = hwp.get_rate().map_err(map_alsa_error)?;
        if actual_rate != self.params.sample_rate {
            warn!(
                "{}: device does not support {} Hz, using {} Hz",
                self.params.name, self.params.sample_rate, actual_rate
            );
        }
        let period = hwp
            .set_period_size_near(self.params.period_size as Frames, ValueOr::Nearest)
            .map_err(map_alsa_error)?;
        let buffer = hwp
            .set_buffer_size_near((self.params.period_size * self.params.num_periods) as Frames)
            .map_err(map_alsa_error)?;
        pcm.hw_params(&hwp).map_err(map_alsa_error)?;
        Ok((buffer, period))
    }

    fn set_sw_params(&self, pcm: &PCM, buffer: Frames, period: Frames) -> XbarResult<()> {
        let swp = pcm.sw_params_current().map_err(map_alsa_error)?;
        // Start once the buffer is almost full, wake per period.
        swp.set_start_threshold((buffer / period) * period)
            .map_err(map_alsa_error)?;
        swp.set_avail_min(period).map_err(map_alsa_error)?;
        pcm.sw_params(&swp).map_err(map_alsa_error)?;
        Ok(())
    }

    fn spawn_feeder(&self) -> XbarResult<()> {
        let Some(asrc) = self.asrc.as_ref().map(Arc::clone) else {
            return Err(XbarError::NotInitialized("handler has no ASRC buffer"));
        };
        let endpoint = Arc::clone(&self.endpoint);
        let running = Arc::clone(&self.feeder_running);
        let device_type = self.device_type;
        let period = self.params.period_size;
        let frame_bytes = self.params.format.bytes() * self.params.num_channels as usize;
        let period_time_ms =
            (u64::from(period) * 1000 / u64::from(self.params.sample_rate)).max(1);
        let timeout = Duration::from_millis(10 * period_time_ms);
        let name = self.params.name.clone();

        running.store(true, Ordering::SeqCst);
        let handle = std::thread::Builder::new()
            .name(format!("xbar-alsa-{}", name))
            .spawn(move || {
                debug!("{}: feeder thread started", name);
                let mut buf = vec![0u8; period as usize * frame_bytes];
                while running.load(Ordering::SeqCst) {
                    match endpoint.avail(period, Some(timeout)) {
                        Ok(avail) if avail >= period => {
                            let result = match device_type {
                                DeviceType::Sink => {
                                    // Drain one period from the ASRC buffer
                                    // towards the device, silence when the
                                    // producer fell behind.
                                    let got = asrc.read_interleaved(&mut buf).unwrap_or(0);
                                    if got < period {
                                        buf[got as usize * frame_bytes..].fill(0);
                                    }
                                    endpoint.transfer_write(&buf, period).map(|_| ())
                                }
                                DeviceType::Source => {
                                    match endpoint.transfer_read(&mut buf, period) {
                                        Ok(got) => {
                                            // Overflow drops the oldest data
                                            // by simply not writing.
                                            let _ = asrc.write_interleaved(
                                                &buf[..got as usize * frame_bytes],
                                            );
                                            Ok(())
                                        }
                                        Err(e) => Err(e),
                                    }
                                }
                            };
                            match result {
                                Ok(()) => {}
                                Err(XbarError::Alsa(AlsaErrorKind::Xrun)) => {
                                    let _ = endpoint.reset();
                                }
                                Err(e) => {
                                    error!("{}: feeder transfer failed: {}", name, e);
                                    std::thread::sleep(Duration::from_millis(period_time_ms));
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(XbarError::Timeout) => {
                            debug!("{}: feeder wait timed out", name);
                        }
                        Err(e) => {
                            error!("{}: feeder wait failed: {}", name, e);
                            std::thread::sleep(Duration::from_millis(period_time_ms));
                        }
                    }
                }
                debug!("{}: feeder thread ended", name);
            })
            .map_err(|e| XbarError::failed(format!("cannot spawn feeder thread: {}", e)))?;
        *self.feeder.lock() = Some(handle);
        Ok(())
    }
}

impl Drop for AlsaHandler {
    fn drop(&mut self) {
        self.stop();
        RingBufferFactory::instance().destroy(&self.mirror);
        if let Some(asrc) = &self.asrc {
            RingBufferFactory::instance().destroy(asrc);
        }
    }
}

impl DeviceBackend for AlsaHandler {
    fn ring_buffer(&self) -> XbarResult<Arc<RingBuffer>> {
        // The switch matrix talks to the ASRC buffer when the handler is
        // asynchronous, otherwise to the mirror.
        Ok(match &self.asrc {
            Some(asrc) => Arc::clone(asrc),
            None => Arc::clone(&self.mirror),
        })
    }

    fn start(&self) -> XbarResult<()> {
        if self.endpoint.pcm.lock().is_some() {
            return Ok(());
        }
        let direction = match self.device_type {
            DeviceType::Source => Direction::Capture,
            DeviceType::Sink => Direction::Playback,
        };
        let pcm = PCM::new(&self.params.name, direction, false).map_err(|e| {
            error!("cannot open ALSA device {}: {}", self.params.name, e);
            XbarError::InvalidParam(format!("cannot open ALSA device {}", self.params.name))
        })?;

        let (buffer, period) = self.set_hw_params(&pcm)?;
        self.set_sw_params(&pcm, buffer, period)?;
        pcm.prepare().map_err(map_alsa_error)?;
        if self.device_type == DeviceType::Source {
            pcm.start().map_err(map_alsa_error)?;
        }

        let period_time_ms =
            (period as u64 * 1000 / u64::from(self.params.sample_rate)).max(1);
        // Generous timeout: ten period times, for systems with many
        // real-time threads competing.
        let timeout = Duration::from_millis(10 * period_time_ms);

        *self.endpoint.pcm.lock() = Some(pcm);
        if let Some(mirror) = self.mirror.as_mirror() {
            mirror.set_device(
                Arc::clone(&self.endpoint) as Arc<dyn MirrorDevice>,
                period as u32,
                timeout,
            )?;
        }

        if self.is_async {
            // Always begin with a clean adaptation buffer after a restart.
            if let Some(asrc) = &self.asrc {
                asrc.reset_from_reader();
            }
            self.spawn_feeder()?;
        }
        info!(
            "ALSA handler {} started (period {}, buffer {})",
            self.params.name, period, buffer
        );
        Ok(())
    }

    fn stop(&self) {
        self.feeder_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.feeder.lock().take() {
            let _ = handle.join();
        }
        if let Some(mirror) = self.mirror.as_mirror() {
            mirror.clear_device();
        }
        if self.endpoint.pcm.lock().take().is_some() {
            info!("ALSA handler {}: closed PCM device", self.params.name);
        }
    }

    fn set_non_block_mode(&self, non_blocking: bool) -> XbarResult<()> {
        // Asynchronous handlers keep the blocking behavior: the feeder
        // thread relies on the device wait for pacing.
        if !self.is_async {
            if let Some(mirror) = self.mirror.as_mirror() {
                mirror.set_non_block_mode(non_blocking);
            }
        }
        Ok(())
    }

    fn enable_event_queue(&self, _enable: bool) {
        // ALSA handlers report problems through transfer results, not
        // through an event queue.
    }

    fn next_event(&self) -> DeviceEvent {
        DeviceEvent::NoEvent
    }

    fn reset_source_buffers(&self) {
        if let Some(asrc) = &self.asrc {
            // Stale PCM of a previous connection must not leak into the new
            // one.
            asrc.zero_out();
            asrc.reset_from_writer();
        }
    }

    fn is_hardware(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xbar_core::ClockType;

    fn params(name: &str, clock: ClockType) -> DeviceParams {
        DeviceParams {
            name: name.into(),
            num_channels: 2,
            sample_rate: 48_000,
            format: SampleFormat::Int16,
            clock_type: clock,
            period_size: 192,
            num_periods: 4,
            num_periods_asrc_buffer: 4,
        }
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn test_format_mapping() {
        assert_eq!(alsa_format(SampleFormat::Int16), Format::S16LE);
        assert_eq!(alsa_format(SampleFormat::Int32), Format::S32LE);
        assert_eq!(alsa_format(SampleFormat::Float32), Format::FloatLE);
    }

    #[test]
    fn test_sync_handler_exposes_mirror() {
        let handler = AlsaHandler::new(params("xp_sync", ClockType::Received), DeviceType::Sink)
            .unwrap();
        let ring = handler.ring_buffer().unwrap();
        assert!(ring.is_mirror());
        assert!(handler.is_hardware());
    }

    #[test]
    fn test_async_handler_exposes_asrc_buffer() {
        let handler = AlsaHandler::new(
            params("xp_async", ClockType::ReceivedAsync),
            DeviceType::Source,
        )
        .unwrap();
        let ring = handler.ring_buffer().unwrap();
        assert!(!ring.is_mirror());
        assert_eq!(ring.period_size(), 192);
        assert_eq!(ring.num_periods(), 4);
    }

    #[test]
    fn test_unopened_device_errors() {
        let handler = AlsaHandler::new(params("xp_closed", ClockType::Received), DeviceType::Sink)
            .unwrap();
        let ring = handler.ring_buffer().unwrap();
        assert!(ring
            .update_available(xbar_core::AccessDirection::Write)
            .is_err());
    }

    // Hardware-dependent tests
    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_default_device() {
        let mut p = params("default", ClockType::Received);
        p.name = "default".into();
        let handler = AlsaHandler::new(p, DeviceType::Sink).unwrap();
        handler.start().unwrap();
        let ring = handler.ring_buffer().unwrap();
        let avail = ring
            .update_available(xbar_core::AccessDirection::Write)
            .unwrap();
        assert!(avail > 0);
        handler.stop();
    }
}
