//! PCM Ring Buffers
//!
//! Lock-free single-producer / single-consumer PCM transport. A buffer is
//! either *real* (owns interleaved memory of `period_size * num_periods`
//! frames) or a *mirror* (adapts a device handle, see [`crate::mirror`]).
//! Both variants expose the same access pattern:
//!
//! ```text
//! update_available(dir)            -> producible/consumable frames
//! begin_access(dir, wanted)        -> (offset, contiguous frames)
//! ... read or write the region ...
//! end_access(dir, offset, frames)  -> commit what was actually used
//! ```
//!
//! `begin_access` may return fewer frames than requested when the region
//! wraps the end of the buffer; callers loop until they have moved what
//! they need.
//!
//! # Concurrency
//!
//! One producer thread and one consumer thread may use a buffer without
//! locks. The read and write positions are wrapping frame counters with
//! acquire/release ordering; each side only ever writes its own counter.
//! `reset_from_reader` / `reset_from_writer` empty the buffer from the
//! calling side so a reset never races the opposite side.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{XbarError, XbarResult};
use crate::format::{interleaved_areas, AreaView, AreaViewMut, ChannelArea, SampleFormat};
use crate::mirror::MirrorRingBuffer;

/// Access side of a ring buffer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Read,
    Write,
}

/// Transfer statistics of one buffer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTimestamp {
    /// Total frames transferred over this side since creation.
    pub frames_transferred: u64,
    /// Microseconds since buffer creation at the last transfer.
    pub timestamp_us: u64,
}

/// Real ring buffer: owns interleaved PCM memory.
pub struct PcmRingBuffer {
    name: String,
    format: SampleFormat,
    num_channels: u32,
    period_size: u32,
    num_periods: u32,
    capacity: u64,
    frame_bytes: usize,
    areas: Vec<ChannelArea>,
    storage: UnsafeCell<Box<[u8]>>,
    /// Total frames ever read (wrapping counter, monotonically increasing).
    read_pos: AtomicU64,
    /// Total frames ever written.
    write_pos: AtomicU64,
    read_stamp_us: AtomicU64,
    write_stamp_us: AtomicU64,
    created: Instant,
}

// SAFETY: the buffer is designed for SPSC access. The producer only writes
// the region between write_pos and read_pos + capacity, the consumer only
// reads the region between read_pos and write_pos, and each side publishes
// its progress with release stores. The regions never overlap.
unsafe impl Send for PcmRingBuffer {}
unsafe impl Sync for PcmRingBuffer {}

impl PcmRingBuffer {
    fn new(
        name: &str,
        period_size: u32,
        num_periods: u32,
        num_channels: u32,
        format: SampleFormat,
    ) -> XbarResult<Self> {
        if period_size == 0 || num_periods == 0 || num_channels == 0 {
            return Err(XbarError::invalid_param(format!(
                "ring buffer {}: period_size, num_periods and num_channels must not be 0",
                name
            )));
        }
        let capacity = u64::from(period_size) * u64::from(num_periods);
        let frame_bytes = format.bytes() * num_channels as usize;
        let storage = vec![0u8; capacity as usize * frame_bytes].into_boxed_slice();
        Ok(Self {
            name: name.to_string(),
            format,
            num_channels,
            period_size,
            num_periods,
            capacity,
            frame_bytes,
            areas: interleaved_areas(num_channels, format),
            storage: UnsafeCell::new(storage),
            read_pos: AtomicU64::new(0),
            write_pos: AtomicU64::new(0),
            read_stamp_us: AtomicU64::new(0),
            write_stamp_us: AtomicU64::new(0),
            created: Instant::now(),
        })
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
        self.period_size
    }

    pub fn num_periods(&self) -> u32 {
        self.num_periods
    }

    pub fn areas(&self) -> &[ChannelArea] {
        &self.areas
    }

    fn fill_level(&self) -> u64 {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub fn update_available(&self, direction: AccessDirection) -> XbarResult<u32> {
        let level = self.fill_level();
        let avail = match direction {
            AccessDirection::Read => level,
            AccessDirection::Write => self.capacity - level,
        };
        Ok(avail as u32)
    }

    pub fn begin_access(
        &self,
        direction: AccessDirection,
        requested: u32,
    ) -> XbarResult<(u32, u32)> {
        let avail = u64::from(self.update_available(direction)?);
        let pos = match direction {
            AccessDirection::Read => self.read_pos.load(Ordering::Relaxed),
            AccessDirection::Write => self.write_pos.load(Ordering::Relaxed),
        };
        let offset = pos % self.capacity;
        let contiguous = self.capacity - offset;
        let frames = u64::from(requested).min(avail).min(contiguous);
        Ok((offset as u32, frames as u32))
    }

    pub fn end_access(
        &self,
        direction: AccessDirection,
        offset: u32,
        frames: u32,
    ) -> XbarResult<()> {
        let counter = match direction {
            AccessDirection::Read => &self.read_pos,
            AccessDirection::Write => &self.write_pos,
        };
        let pos = counter.load(Ordering::Relaxed);
        if pos % self.capacity != u64::from(offset) {
            return Err(XbarError::RingBuffer(format!(
                "{}: end_access offset {} does not match current position {}",
                self.name,
                offset,
                pos % self.capacity
            )));
        }
        let stamp = self.created.elapsed().as_micros() as u64;
        match direction {
            AccessDirection::Read => self.read_stamp_us.store(stamp, Ordering::Relaxed),
            AccessDirection::Write => self.write_stamp_us.store(stamp, Ordering::Relaxed),
        }
        counter.store(pos.wrapping_add(u64::from(frames)), Ordering::Release);
        Ok(())
    }

    /// Read-only view of a region previously obtained with `begin_access`.
    pub fn region(&self, offset: u32, frames: u32) -> AreaView<'_> {
        let start = offset as usize * self.frame_bytes;
        let len = frames as usize * self.frame_bytes;
        // SAFETY: under the SPSC discipline the caller holds the access
        // window [offset, offset + frames) exclusively until end_access.
        let data = unsafe { &(&*self.storage.get())[start..start + len] };
        AreaView {
            data,
            areas: &self.areas,
            format: self.format,
        }
    }

    /// Mutable view of a region previously obtained with `begin_access`.
    #[allow(clippy::mut_from_ref)]
    pub fn region_mut(&self, offset: u32, frames: u32) -> AreaViewMut<'_> {
        let start = offset as usize * self.frame_bytes;
        let len = frames as usize * self.frame_bytes;
        // SAFETY: see region(); the window belongs to exactly one side.
        let data = unsafe { &mut (&mut *self.storage.get())[start..start + len] };
        AreaViewMut {
            data,
            areas: &self.areas,
            format: self.format,
        }
    }

    /// Empty the buffer from the reader side (all pending data is consumed).
    pub fn reset_from_reader(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write, Ordering::Release);
    }

    /// Empty the buffer from the writer side (unread data is discarded).
    pub fn reset_from_writer(&self) {
        let read = self.read_pos.load(Ordering::Acquire);
        self.write_pos.store(read, Ordering::Release);
    }

    /// Overwrite the whole storage with zeros. The fill level is not
    /// changed; pending frames play out as silence.
    pub fn zero_out(&self) {
        // SAFETY: racing writes produce zeros or fresh samples per byte,
        // both of which are acceptable for the one call site (stale-sample
        // suppression on a full sink buffer).
        unsafe {
            (*self.storage.get()).fill(0);
        }
    }

    pub fn timestamp(&self, direction: AccessDirection) -> BufferTimestamp {
        match direction {
            AccessDirection::Read => BufferTimestamp {
                frames_transferred: self.read_pos.load(Ordering::Relaxed),
                timestamp_us: self.read_stamp_us.load(Ordering::Relaxed),
            },
            AccessDirection::Write => BufferTimestamp {
                frames_transferred: self.write_pos.load(Ordering::Relaxed),
                timestamp_us: self.write_stamp_us.load(Ordering::Relaxed),
            },
        }
    }
}

/// A PCM ring buffer, real or mirror.
pub enum RingBuffer {
    Real(PcmRingBuffer),
    Mirror(MirrorRingBuffer),
}

impl RingBuffer {
    pub fn name(&self) -> &str {
        match self {
            RingBuffer::Real(rb) => rb.name(),
            RingBuffer::Mirror(mb) => mb.name(),
        }
    }

    pub fn num_channels(&self) -> u32 {
        match self {
            RingBuffer::Real(rb) => rb.num_channels(),
            RingBuffer::Mirror(mb) => mb.num_channels(),
        }
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            RingBuffer::Real(rb) => rb.format(),
            RingBuffer::Mirror(mb) => mb.format(),
        }
    }

    pub fn period_size(&self) -> u32 {
        match self {
            RingBuffer::Real(rb) => rb.period_size(),
            RingBuffer::Mirror(mb) => mb.period_size(),
        }
    }

    pub fn num_periods(&self) -> u32 {
        match self {
            RingBuffer::Real(rb) => rb.num_periods(),
            RingBuffer::Mirror(mb) => mb.num_periods(),
        }
    }

    pub fn is_mirror(&self) -> bool {
        matches!(self, RingBuffer::Mirror(_))
    }

    pub fn as_mirror(&self) -> Option<&MirrorRingBuffer> {
        match self {
            RingBuffer::Mirror(mb) => Some(mb),
            RingBuffer::Real(_) => None,
        }
    }

    /// Producible/consumable frames. On a mirror buffer this blocks on the
    /// device up to the configured timeout unless non-blocking mode is set.
    pub fn update_available(&self, direction: AccessDirection) -> XbarResult<u32> {
        match self {
            RingBuffer::Real(rb) => rb.update_available(direction),
            RingBuffer::Mirror(mb) => mb.update_available(direction),
        }
    }

    pub fn begin_access(
        &self,
        direction: AccessDirection,
        requested: u32,
    ) -> XbarResult<(u32, u32)> {
        match self {
            RingBuffer::Real(rb) => rb.begin_access(direction, requested),
            RingBuffer::Mirror(mb) => mb.begin_access(direction, requested),
        }
    }

    pub fn end_access(
        &self,
        direction: AccessDirection,
        offset: u32,
        frames: u32,
    ) -> XbarResult<()> {
        match self {
            RingBuffer::Real(rb) => rb.end_access(direction, offset, frames),
            RingBuffer::Mirror(mb) => mb.end_access(direction, offset, frames),
        }
    }

    pub fn region(&self, offset: u32, frames: u32) -> AreaView<'_> {
        match self {
            RingBuffer::Real(rb) => rb.region(offset, frames),
            RingBuffer::Mirror(mb) => mb.region(offset, frames),
        }
    }

    pub fn region_mut(&self, offset: u32, frames: u32) -> AreaViewMut<'_> {
        match self {
            RingBuffer::Real(rb) => rb.region_mut(offset, frames),
            RingBuffer::Mirror(mb) => mb.region_mut(offset, frames),
        }
    }

    pub fn reset_from_reader(&self) {
        match self {
            RingBuffer::Real(rb) => rb.reset_from_reader(),
            RingBuffer::Mirror(mb) => mb.reset(),
        }
    }

    pub fn reset_from_writer(&self) {
        match self {
            RingBuffer::Real(rb) => rb.reset_from_writer(),
            RingBuffer::Mirror(mb) => mb.reset(),
        }
    }

    pub fn zero_out(&self) {
        match self {
            RingBuffer::Real(rb) => rb.zero_out(),
            RingBuffer::Mirror(_) => {
                // A mirror has no backlog of its own to scrub.
                debug!("zero_out on mirror buffer {} ignored", self.name());
            }
        }
    }

    pub fn timestamp(&self, direction: AccessDirection) -> BufferTimestamp {
        match self {
            RingBuffer::Real(rb) => rb.timestamp(direction),
            RingBuffer::Mirror(mb) => mb.timestamp(direction),
        }
    }

    /// Write interleaved frames (producer side convenience). The byte
    /// length must be a multiple of the frame size and the caller's data
    /// must match the buffer's format and channel count. Returns the number
    /// of frames written; stops early when the buffer is full.
    pub fn write_interleaved(&self, data: &[u8]) -> XbarResult<u32> {
        let frame_bytes = self.format().bytes() * self.num_channels() as usize;
        if data.len() % frame_bytes != 0 {
            return Err(XbarError::invalid_param(
                "data length is not a multiple of the frame size",
            ));
        }
        let mut frames_left = (data.len() / frame_bytes) as u32;
        let mut written = 0u32;
        while frames_left > 0 {
            let (offset, frames) = self.begin_access(AccessDirection::Write, frames_left)?;
            if frames == 0 {
                break;
            }
            {
                let region = self.region_mut(offset, frames);
                let start = written as usize * frame_bytes;
                let len = frames as usize * frame_bytes;
                region.data[..len].copy_from_slice(&data[start..start + len]);
            }
            self.end_access(AccessDirection::Write, offset, frames)?;
            written += frames;
            frames_left -= frames;
        }
        Ok(written)
    }

    /// Read interleaved frames (consumer side convenience). Returns the
    /// number of frames read; stops early when the buffer is empty.
    pub fn read_interleaved(&self, out: &mut [u8]) -> XbarResult<u32> {
        let frame_bytes = self.format().bytes() * self.num_channels() as usize;
        if out.len() % frame_bytes != 0 {
            return Err(XbarError::invalid_param(
                "output length is not a multiple of the frame size",
            ));
        }
        let mut frames_left = (out.len() / frame_bytes) as u32;
        let mut read = 0u32;
        while frames_left > 0 {
            let (offset, frames) = self.begin_access(AccessDirection::Read, frames_left)?;
            if frames == 0 {
                break;
            }
            {
                let region = self.region(offset, frames);
                let start = read as usize * frame_bytes;
                let len = frames as usize * frame_bytes;
                out[start..start + len].copy_from_slice(&region.data[..len]);
            }
            self.end_access(AccessDirection::Read, offset, frames)?;
            read += frames;
            frames_left -= frames;
        }
        Ok(read)
    }
}

/// Process-wide registry that creates and reclaims ring buffers by name.
///
/// Every buffer of the engine is handed out by this factory so that
/// teardown can reconcile lifetimes: destroying a buffer only drops the
/// registry's handle, the memory lives until the last user releases its
/// `Arc`.
pub struct RingBufferFactory {
    buffers: Mutex<HashMap<String, Arc<RingBuffer>>>,
}

static FACTORY: OnceLock<RingBufferFactory> = OnceLock::new();

impl RingBufferFactory {
    pub fn instance() -> &'static RingBufferFactory {
        FACTORY.get_or_init(|| RingBufferFactory {
            buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn create_real(
        &self,
        name: &str,
        period_size: u32,
        num_periods: u32,
        num_channels: u32,
        format: SampleFormat,
    ) -> XbarResult<Arc<RingBuffer>> {
        let mut buffers = self.buffers.lock();
        if buffers.contains_key(name) {
            return Err(XbarError::invalid_param(format!(
                "ring buffer {} already exists",
                name
            )));
        }
        let buffer = Arc::new(RingBuffer::Real(PcmRingBuffer::new(
            name,
            period_size,
            num_periods,
            num_channels,
            format,
        )?));
        buffers.insert(name.to_string(), Arc::clone(&buffer));
        Ok(buffer)
    }

    pub fn create_mirror(
        &self,
        name: &str,
        num_periods: u32,
        num_channels: u32,
        format: SampleFormat,
    ) -> XbarResult<Arc<RingBuffer>> {
        let mut buffers = self.buffers.lock();
        if buffers.contains_key(name) {
            return Err(XbarError::invalid_param(format!(
                "ring buffer {} already exists",
                name
            )));
        }
        if num_channels == 0 {
            return Err(XbarError::invalid_param(format!(
                "ring buffer {}: num_channels must not be 0",
                name
            )));
        }
        let buffer = Arc::new(RingBuffer::Mirror(MirrorRingBuffer::new(
            name,
            num_periods,
            num_channels,
            format,
        )));
        buffers.insert(name.to_string(), Arc::clone(&buffer));
        Ok(buffer)
    }

    pub fn find(&self, name: &str) -> Option<Arc<RingBuffer>> {
        self.buffers.lock().get(name).cloned()
    }

    /// Release the registry's handle of a buffer. Users still holding an
    /// `Arc` keep the memory alive.
    pub fn destroy(&self, buffer: &Arc<RingBuffer>) {
        if self.buffers.lock().remove(buffer.name()).is_none() {
            warn!("destroy: ring buffer {} not registered", buffer.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(name: &str, period: u32, periods: u32, channels: u32) -> Arc<RingBuffer> {
        RingBufferFactory::instance()
            .create_real(name, period, periods, channels, SampleFormat::Int16)
            .unwrap()
    }

    #[test]
    fn test_empty_and_full_levels() {
        let rb = real("rbt_levels", 4, 4, 2);
        assert_eq!(rb.update_available(AccessDirection::Read).unwrap(), 0);
        assert_eq!(rb.update_available(AccessDirection::Write).unwrap(), 16);
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_write_then_read() {
        let rb = real("rbt_rw", 4, 2, 1);
        let data: Vec<u8> = (0..6i16).flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(rb.write_interleaved(&data).unwrap(), 6);
        assert_eq!(rb.update_available(AccessDirection::Read).unwrap(), 6);
        assert_eq!(rb.update_available(AccessDirection::Write).unwrap(), 2);

        let mut out = vec![0u8; 12];
        assert_eq!(rb.read_interleaved(&mut out).unwrap(), 6);
        assert_eq!(out, data);
        assert_eq!(rb.update_available(AccessDirection::Read).unwrap(), 0);
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_wrap_returns_short_region() {
        let rb = real("rbt_wrap", 4, 2, 1);
        // Move the position to 6 of 8 so the next write wraps.
        let chunk = vec![0u8; 6 * 2];
        rb.write_interleaved(&chunk).unwrap();
        let mut sink = vec![0u8; 6 * 2];
        rb.read_interleaved(&mut sink).unwrap();

        let (offset, frames) = rb.begin_access(AccessDirection::Write, 8).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(frames, 2, "contiguous region ends at the buffer tail");
        rb.end_access(AccessDirection::Write, offset, 2).unwrap();

        let (offset, frames) = rb.begin_access(AccessDirection::Write, 8).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(frames, 6);
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_overfill_rejected_by_availability() {
        let rb = real("rbt_full", 2, 2, 1);
        let data = vec![0u8; 4 * 2];
        assert_eq!(rb.write_interleaved(&data).unwrap(), 4);
        // Full: no more frames accepted.
        assert_eq!(rb.write_interleaved(&data).unwrap(), 0);
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_reset_from_reader_and_writer() {
        let rb = real("rbt_reset", 4, 2, 1);
        rb.write_interleaved(&vec![1u8; 6 * 2]).unwrap();

        rb.reset_from_reader();
        assert_eq!(rb.update_available(AccessDirection::Read).unwrap(), 0);
        assert_eq!(rb.update_available(AccessDirection::Write).unwrap(), 8);

        rb.write_interleaved(&vec![1u8; 3 * 2]).unwrap();
        rb.reset_from_writer();
        assert_eq!(rb.update_available(AccessDirection::Read).unwrap(), 0);
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_end_access_offset_mismatch() {
        let rb = real("rbt_offset", 4, 2, 1);
        let (offset, _) = rb.begin_access(AccessDirection::Write, 4).unwrap();
        assert!(rb.end_access(AccessDirection::Write, offset + 1, 1).is_err());
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_zero_out_keeps_fill_level() {
        let rb = real("rbt_zero", 4, 2, 1);
        rb.write_interleaved(&vec![0xAB; 4 * 2]).unwrap();
        rb.zero_out();
        assert_eq!(rb.update_available(AccessDirection::Read).unwrap(), 4);
        let mut out = vec![0xFFu8; 4 * 2];
        rb.read_interleaved(&mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_timestamps_track_totals() {
        let rb = real("rbt_stamp", 4, 2, 1);
        rb.write_interleaved(&vec![0u8; 4 * 2]).unwrap();
        let ts = rb.timestamp(AccessDirection::Write);
        assert_eq!(ts.frames_transferred, 4);
        assert_eq!(rb.timestamp(AccessDirection::Read).frames_transferred, 0);
        RingBufferFactory::instance().destroy(&rb);
    }

    #[test]
    fn test_factory_rejects_duplicates_and_finds() {
        let rb = real("rbt_dup", 4, 2, 1);
        assert!(RingBufferFactory::instance()
            .create_real("rbt_dup", 4, 2, 1, SampleFormat::Int16)
            .is_err());
        assert!(RingBufferFactory::instance().find("rbt_dup").is_some());
        RingBufferFactory::instance().destroy(&rb);
        assert!(RingBufferFactory::instance().find("rbt_dup").is_none());
    }

    #[test]
    fn test_spsc_across_threads() {
        let rb = real("rbt_threads", 64, 4, 1);
        let writer = Arc::clone(&rb);
        let producer = std::thread::spawn(move || {
            let mut value = 0i16;
            let mut written = 0;
            while written < 1024 {
                let chunk: Vec<u8> = (0..16)
                    .map(|_| {
                        let v = value;
                        value = value.wrapping_add(1);
                        v
                    })
                    .flat_map(|v| v.to_ne_bytes())
                    .collect();
                let n = writer.write_interleaved(&chunk).unwrap();
                if n < 16 {
                    // Full: re-queue what was not written by rewinding value.
                    value = value.wrapping_sub(16 - n as i16);
                }
                written += n;
                std::thread::yield_now();
            }
        });

        let mut expected = 0i16;
        let mut total = 0;
        while total < 1024 {
            let mut out = vec![0u8; 16 * 2];
            let n = rb.read_interleaved(&mut out).unwrap();
            for frame in 0..n as usize {
                let v = i16::from_ne_bytes([out[frame * 2], out[frame * 2 + 1]]);
                assert_eq!(v, expected);
                expected = expected.wrapping_add(1);
            }
            total += n;
            std::thread::yield_now();
        }
        producer.join().unwrap();
        RingBufferFactory::instance().destroy(&rb);
    }
}
