//! Mirror Ring Buffers
//!
//! A mirror buffer carries a device handle instead of its own PCM memory.
//! It exposes the same access pattern as a real ring buffer, backed by a
//! period-sized staging region: a write access fills the staging region and
//! commits it to the device on `end_access`, a read access fetches from the
//! device into the staging region on `begin_access`.
//!
//! `update_available` blocks on the device for up to the configured timeout
//! (ten period times for ALSA handlers) unless non-blocking mode is set;
//! non-blocking mode is used for derived-zone sinks so a slow consumer can
//! never stall the base zone's clock.
//!
//! The device side is abstracted by [`MirrorDevice`]; the platform crate
//! implements it over an ALSA PCM.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{XbarError, XbarResult};
use crate::format::{interleaved_areas, AreaView, AreaViewMut, ChannelArea, SampleFormat};
use crate::ringbuf::{AccessDirection, BufferTimestamp};

/// Device transport behind a mirror buffer.
pub trait MirrorDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Number of transferable frames. With a timeout the call blocks until
    /// at least `min_frames` are transferable or the timeout expires
    /// (returning [`XbarError::Timeout`]); without a timeout it returns
    /// immediately.
    fn avail(&self, min_frames: u32, timeout: Option<Duration>) -> XbarResult<u32>;

    /// Write interleaved frames to the device (playback direction).
    fn transfer_write(&self, data: &[u8], frames: u32) -> XbarResult<u32>;

    /// Read interleaved frames from the device (capture direction).
    fn transfer_read(&self, data: &mut [u8], frames: u32) -> XbarResult<u32>;

    /// Explicitly start the device (after prefill).
    fn start(&self) -> XbarResult<()>;

    /// Return the device to a clean, prepared state.
    fn reset(&self) -> XbarResult<()>;
}

struct DeviceBinding {
    device: Option<Arc<dyn MirrorDevice>>,
    timeout: Duration,
}

/// Ring buffer variant wrapping a device handle.
pub struct MirrorRingBuffer {
    name: String,
    format: SampleFormat,
    num_channels: u32,
    num_periods: u32,
    frame_bytes: usize,
    areas: Vec<ChannelArea>,
    binding: Mutex<DeviceBinding>,
    period_size: AtomicU32,
    non_blocking: AtomicBool,
    staging: UnsafeCell<Vec<u8>>,
    /// Frames fetched from the device but not yet consumed by the reader,
    /// and their offset inside the staging region. A consumer that takes
    /// less than one fetch picks the remainder up on its next access.
    pending_frames: AtomicU32,
    pending_offset: AtomicU32,
    read_total: AtomicU64,
    write_total: AtomicU64,
    read_stamp_us: AtomicU64,
    write_stamp_us: AtomicU64,
    created: Instant,
}

// SAFETY: the staging region is only touched by the single real-time side
// that drives this buffer (the zone worker for sinks, the feeder thread for
// sources); the device binding is protected by its mutex.
unsafe impl Send for MirrorRingBuffer {}
unsafe impl Sync for MirrorRingBuffer {}

impl MirrorRingBuffer {
    pub(crate) fn new(
        name: &str,
        num_periods: u32,
        num_channels: u32,
        format: SampleFormat,
    ) -> Self {
        Self {
            name: name.to_string(),
            format,
            num_channels,
            num_periods,
            frame_bytes: format.bytes() * num_channels as usize,
            areas: interleaved_areas(num_channels, format),
            binding: Mutex::new(DeviceBinding {
                device: None,
                timeout: Duration::from_millis(0),
            }),
            period_size: AtomicU32::new(0),
            non_blocking: AtomicBool::new(false),
            staging: UnsafeCell::new(Vec::new()),
            pending_frames: AtomicU32::new(0),
            pending_offset: AtomicU32::new(0),
            read_total: AtomicU64::new(0),
            write_total: AtomicU64::new(0),
            read_stamp_us: AtomicU64::new(0),
            write_stamp_us: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_channels(&self) -> u32 {
        self.num_channels
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn period_size(&self) -> u32 {
        self.period_size.load(Ordering::Relaxed)
    }

    pub fn num_periods(&self) -> u32 {
        self.num_periods
    }

    /// Attach the device handle. Must happen before the buffer is driven;
    /// the staging region is sized to one period here.
    pub fn set_device(
        &self,
        device: Arc<dyn MirrorDevice>,
        period_size: u32,
        timeout: Duration,
    ) -> XbarResult<()> {
        if period_size == 0 {
            return Err(XbarError::invalid_param(format!(
                "mirror {}: period_size must not be 0",
                self.name
            )));
        }
        let mut binding = self.binding.lock();
        binding.device = Some(device);
        binding.timeout = timeout;
        self.period_size.store(period_size, Ordering::Relaxed);
        // SAFETY: attachment happens before any real-time side uses the
        // staging region.
        unsafe {
            (*self.staging.get()).resize(period_size as usize * self.frame_bytes, 0);
        }
        Ok(())
    }

    pub fn clear_device(&self) {
        self.binding.lock().device = None;
    }

    fn device(&self) -> XbarResult<(Arc<dyn MirrorDevice>, Duration)> {
        let binding = self.binding.lock();
        match &binding.device {
            Some(device) => Ok((Arc::clone(device), binding.timeout)),
            None => Err(XbarError::NotInitialized("mirror buffer has no device")),
        }
    }

    pub fn set_non_block_mode(&self, non_blocking: bool) {
        self.non_blocking.store(non_blocking, Ordering::Relaxed);
    }

    /// Start the underlying device (used after prefilling a sink).
    pub fn start_device(&self) -> XbarResult<()> {
        let (device, _) = self.device()?;
        device.start()
    }

    pub fn update_available(&self, direction: AccessDirection) -> XbarResult<u32> {
        let (device, timeout) = self.device()?;
        let period = self.period_size.load(Ordering::Relaxed);
        let timeout = if self.non_blocking.load(Ordering::Relaxed) {
            None
        } else {
            Some(timeout)
        };
        let device_avail = device.avail(period, timeout)?;
        let pending = match direction {
            AccessDirection::Read => self.pending_frames.load(Ordering::Relaxed),
            AccessDirection::Write => 0,
        };
        Ok(device_avail + pending)
    }

    pub fn begin_access(
        &self,
        direction: AccessDirection,
        requested: u32,
    ) -> XbarResult<(u32, u32)> {
        let period = self.period_size.load(Ordering::Relaxed);
        if period == 0 {
            return Err(XbarError::NotInitialized("mirror buffer has no device"));
        }
        let frames = requested.min(period);
        match direction {
            AccessDirection::Write => Ok((0, frames)),
            AccessDirection::Read => {
                // Serve the unconsumed remainder of the previous fetch
                // before touching the device again.
                let pending = self.pending_frames.load(Ordering::Relaxed);
                if pending > 0 {
                    let offset = self.pending_offset.load(Ordering::Relaxed);
                    return Ok((offset, pending.min(frames)));
                }
                if frames == 0 {
                    return Ok((0, 0));
                }
                let (device, _) = self.device()?;
                // SAFETY: single reader side.
                let staging = unsafe { &mut *self.staging.get() };
                let fetched = device
                    .transfer_read(&mut staging[..frames as usize * self.frame_bytes], frames)?;
                self.pending_frames.store(fetched, Ordering::Relaxed);
                self.pending_offset.store(0, Ordering::Relaxed);
                Ok((0, fetched))
            }
        }
    }

    pub fn end_access(
        &self,
        direction: AccessDirection,
        offset: u32,
        frames: u32,
    ) -> XbarResult<()> {
        let stamp = self.created.elapsed().as_micros() as u64;
        match direction {
            AccessDirection::Write => {
                if frames == 0 {
                    return Ok(());
                }
                let (device, _) = self.device()?;
                // SAFETY: single writer side.
                let staging = unsafe { &*self.staging.get() };
                device.transfer_write(&staging[..frames as usize * self.frame_bytes], frames)?;
                self.write_total.fetch_add(u64::from(frames), Ordering::Relaxed);
                self.write_stamp_us.store(stamp, Ordering::Relaxed);
            }
            AccessDirection::Read => {
                let pending = self.pending_frames.load(Ordering::Relaxed);
                let consumed = frames.min(pending);
                if consumed == pending {
                    self.pending_frames.store(0, Ordering::Relaxed);
                    self.pending_offset.store(0, Ordering::Relaxed);
                } else {
                    self.pending_frames.store(pending - consumed, Ordering::Relaxed);
                    self.pending_offset.store(offset + consumed, Ordering::Relaxed);
                }
                if frames > 0 {
                    self.read_total.fetch_add(u64::from(frames), Ordering::Relaxed);
                    self.read_stamp_us.store(stamp, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    pub fn region(&self, offset: u32, frames: u32) -> AreaView<'_> {
        let start = offset as usize * self.frame_bytes;
        let len = frames as usize * self.frame_bytes;
        // SAFETY: only the single driving side accesses the staging region.
        let data = unsafe { &(&*self.staging.get())[start..start + len] };
        AreaView {
            data,
            areas: &self.areas,
            format: self.format,
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn region_mut(&self, offset: u32, frames: u32) -> AreaViewMut<'_> {
        let start = offset as usize * self.frame_bytes;
        let len = frames as usize * self.frame_bytes;
        // SAFETY: see region().
        let data = unsafe { &mut (&mut *self.staging.get())[start..start + len] };
        AreaViewMut {
            data,
            areas: &self.areas,
            format: self.format,
        }
    }

    /// Return the device to a prepared state (used on resynchronization).
    /// Fetched-but-unconsumed frames are dropped.
    pub fn reset(&self) {
        self.pending_frames.store(0, Ordering::Relaxed);
        self.pending_offset.store(0, Ordering::Relaxed);
        if let Ok((device, _)) = self.device() {
            if let Err(err) = device.reset() {
                warn!("mirror {}: device reset failed: {}", self.name, err);
            }
        }
    }

    pub fn timestamp(&self, direction: AccessDirection) -> BufferTimestamp {
        match direction {
            AccessDirection::Read => BufferTimestamp {
                frames_transferred: self.read_total.load(Ordering::Relaxed),
                timestamp_us: self.read_stamp_us.load(Ordering::Relaxed),
            },
            AccessDirection::Write => BufferTimestamp {
                frames_transferred: self.write_total.load(Ordering::Relaxed),
                timestamp_us: self.write_stamp_us.load(Ordering::Relaxed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Loopback device: written frames become readable.
    struct LoopbackDevice {
        buffer: Mutex<Vec<u8>>,
        capacity_frames: u32,
        frame_bytes: usize,
        avail_calls: AtomicUsize,
    }

    impl LoopbackDevice {
        fn new(capacity_frames: u32, frame_bytes: usize) -> Self {
            Self {
                buffer: Mutex::new(Vec::new()),
                capacity_frames,
                frame_bytes,
                avail_calls: AtomicUsize::new(0),
            }
        }
    }

    impl MirrorDevice for LoopbackDevice {
        fn name(&self) -> &str {
            "loopback"
        }

        fn avail(&self, _min_frames: u32, _timeout: Option<Duration>) -> XbarResult<u32> {
            self.avail_calls.fetch_add(1, Ordering::Relaxed);
            let pending = (self.buffer.lock().len() / self.frame_bytes) as u32;
            Ok(self.capacity_frames - pending)
        }

        fn transfer_write(&self, data: &[u8], frames: u32) -> XbarResult<u32> {
            self.buffer.lock().extend_from_slice(data);
            Ok(frames)
        }

        fn transfer_read(&self, data: &mut [u8], frames: u32) -> XbarResult<u32> {
            let mut buffer = self.buffer.lock();
            let have = (buffer.len() / self.frame_bytes) as u32;
            let n = frames.min(have);
            let bytes = n as usize * self.frame_bytes;
            data[..bytes].copy_from_slice(&buffer[..bytes]);
            buffer.drain(..bytes);
            Ok(n)
        }

        fn start(&self) -> XbarResult<()> {
            Ok(())
        }

        fn reset(&self) -> XbarResult<()> {
            self.buffer.lock().clear();
            Ok(())
        }
    }

    fn mirror_with_device() -> (MirrorRingBuffer, Arc<LoopbackDevice>) {
        let mb = MirrorRingBuffer::new("mirror_test", 4, 2, SampleFormat::Int16);
        let device = Arc::new(LoopbackDevice::new(16, 4));
        mb.set_device(
            Arc::clone(&device) as Arc<dyn MirrorDevice>,
            4,
            Duration::from_millis(40),
        )
        .unwrap();
        (mb, device)
    }

    #[test]
    fn test_unattached_mirror_errors() {
        let mb = MirrorRingBuffer::new("mirror_unattached", 4, 2, SampleFormat::Int16);
        assert!(matches!(
            mb.update_available(AccessDirection::Write),
            Err(XbarError::NotInitialized(_))
        ));
        assert!(mb.begin_access(AccessDirection::Write, 4).is_err());
    }

    #[test]
    fn test_write_commits_on_end_access() {
        let (mb, device) = mirror_with_device();
        assert_eq!(mb.update_available(AccessDirection::Write).unwrap(), 16);

        let (offset, frames) = mb.begin_access(AccessDirection::Write, 4).unwrap();
        assert_eq!((offset, frames), (0, 4));
        {
            let region = mb.region_mut(offset, frames);
            region.data.fill(0x5A);
        }
        // Nothing reaches the device until end_access.
        assert_eq!(device.buffer.lock().len(), 0);
        mb.end_access(AccessDirection::Write, offset, frames).unwrap();
        assert_eq!(device.buffer.lock().len(), 4 * 4);
        assert_eq!(mb.timestamp(AccessDirection::Write).frames_transferred, 4);
    }

    #[test]
    fn test_read_fetches_on_begin_access() {
        let (mb, device) = mirror_with_device();
        device.transfer_write(&[7u8; 2 * 4], 2).unwrap();

        let (offset, frames) = mb.begin_access(AccessDirection::Read, 4).unwrap();
        assert_eq!(frames, 2, "only what the device provides");
        let region = mb.region(offset, frames);
        assert!(region.data.iter().all(|&b| b == 7));
        mb.end_access(AccessDirection::Read, offset, frames).unwrap();
        assert_eq!(mb.timestamp(AccessDirection::Read).frames_transferred, 2);
    }

    #[test]
    fn test_access_clipped_to_period() {
        let (mb, _device) = mirror_with_device();
        let (_, frames) = mb.begin_access(AccessDirection::Write, 100).unwrap();
        assert_eq!(frames, 4);
    }

    #[test]
    fn test_partial_read_keeps_remainder() {
        let (mb, device) = mirror_with_device();
        device.transfer_write(&[9u8; 4 * 4], 4).unwrap();

        // Fetch a full period but consume only one frame.
        let (offset, frames) = mb.begin_access(AccessDirection::Read, 4).unwrap();
        assert_eq!((offset, frames), (0, 4));
        mb.end_access(AccessDirection::Read, offset, 1).unwrap();

        // The remaining three frames are served without a device fetch.
        let (offset, frames) = mb.begin_access(AccessDirection::Read, 4).unwrap();
        assert_eq!((offset, frames), (1, 3));
        assert!(mb.region(offset, frames).data.iter().all(|&b| b == 9));
        mb.end_access(AccessDirection::Read, offset, 3).unwrap();
        assert_eq!(mb.timestamp(AccessDirection::Read).frames_transferred, 4);
    }

    #[test]
    fn test_reset_forwards_to_device() {
        let (mb, device) = mirror_with_device();
        device.transfer_write(&[1u8; 4], 1).unwrap();
        mb.reset();
        assert!(device.buffer.lock().is_empty());
    }
}
