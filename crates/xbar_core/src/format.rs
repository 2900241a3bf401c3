//! Sample Formats and Area-Based PCM Copying
//!
//! PCM memory is always addressed through *channel areas*: per-channel byte
//! offsets plus a per-frame stride. Copy and zero kernels work on areas so
//! that none of the transport code depends on a particular interleaving.
//! For the buffers owned by this crate the layout is interleaved, but the
//! kernels do not assume it.
//!
//! Format conversion covers the full 3x3 matrix over {int16, int32,
//! float32}. Conversion goes through a normalized f64 intermediate, which
//! keeps every same-format copy and every widening copy exact.

use serde::{Deserialize, Serialize};

use crate::error::{XbarError, XbarResult};

/// PCM sample format of a buffer or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Int16,
    Int32,
    Float32,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Int32 | SampleFormat::Float32 => 4,
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleFormat::Int16 => "Int16",
            SampleFormat::Int32 => "Int32",
            SampleFormat::Float32 => "Float32",
        };
        write!(f, "{}", name)
    }
}

/// Byte-level location of one channel inside a PCM region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelArea {
    /// Byte offset of this channel's first sample.
    pub first: usize,
    /// Byte distance between two consecutive frames of this channel.
    pub step: usize,
}

/// Channel areas of an interleaved layout.
pub fn interleaved_areas(num_channels: u32, format: SampleFormat) -> Vec<ChannelArea> {
    let sample = format.bytes();
    let step = sample * num_channels as usize;
    (0..num_channels as usize)
        .map(|ch| ChannelArea {
            first: ch * sample,
            step,
        })
        .collect()
}

/// Read-only view of a PCM region.
#[derive(Clone, Copy)]
pub struct AreaView<'a> {
    pub data: &'a [u8],
    pub areas: &'a [ChannelArea],
    pub format: SampleFormat,
}

/// Mutable view of a PCM region.
pub struct AreaViewMut<'a> {
    pub data: &'a mut [u8],
    pub areas: &'a [ChannelArea],
    pub format: SampleFormat,
}

impl<'a> AreaViewMut<'a> {
    /// Reborrow as a read-only view.
    pub fn as_view(&self) -> AreaView<'_> {
        AreaView {
            data: self.data,
            areas: self.areas,
            format: self.format,
        }
    }
}

/// One PCM sample type of the conversion matrix.
pub trait Sample: Copy + Default + PartialEq + std::fmt::Debug {
    const FORMAT: SampleFormat;

    fn read_from(buf: &[u8]) -> Self;
    fn write_to(self, buf: &mut [u8]);

    /// Normalized value in [-1.0, 1.0). Exact for every integer width.
    fn to_norm(self) -> f64;
    /// From normalized value, saturating at full scale.
    fn from_norm(v: f64) -> Self;
}

impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::Int16;

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        i16::from_ne_bytes([buf[0], buf[1]])
    }

    #[inline]
    fn write_to(self, buf: &mut [u8]) {
        buf[..2].copy_from_slice(&self.to_ne_bytes());
    }

    #[inline]
    fn to_norm(self) -> f64 {
        f64::from(self) / 32768.0
    }

    #[inline]
    fn from_norm(v: f64) -> Self {
        (v * 32768.0).round().clamp(-32768.0, 32767.0) as i16
    }
}

impl Sample for i32 {
    const FORMAT: SampleFormat = SampleFormat::Int32;

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    #[inline]
    fn write_to(self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_ne_bytes());
    }

    #[inline]
    fn to_norm(self) -> f64 {
        f64::from(self) / 2_147_483_648.0
    }

    #[inline]
    fn from_norm(v: f64) -> Self {
        (v * 2_147_483_648.0)
            .round()
            .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32
    }
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::Float32;

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        f32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    #[inline]
    fn write_to(self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_ne_bytes());
    }

    #[inline]
    fn to_norm(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    fn from_norm(v: f64) -> Self {
        v as f32
    }
}

#[inline]
fn sample_offset(area: &ChannelArea, frame: usize) -> usize {
    area.first + frame * area.step
}

fn copy_convert<S: Sample, D: Sample>(
    dst: &mut AreaViewMut<'_>,
    dst_offset: usize,
    dst_chan_index: usize,
    dst_frames: usize,
    src: &AreaView<'_>,
    src_offset: usize,
    src_chan_index: usize,
    src_frames: usize,
    num_channels: usize,
) {
    let copy_frames = dst_frames.min(src_frames);
    for ch in 0..num_channels {
        let dst_area = &dst.areas[dst_chan_index + ch];
        let src_area = &src.areas[src_chan_index + ch];
        for frame in 0..copy_frames {
            let s = S::read_from(&src.data[sample_offset(src_area, src_offset + frame)..]);
            let d = D::from_norm(s.to_norm());
            d.write_to(&mut dst.data[sample_offset(dst_area, dst_offset + frame)..]);
        }
        // The destination may request more frames than the source provides;
        // the tail is zero-filled (this is how warm-up periods are written).
        for frame in copy_frames..dst_frames {
            D::default().write_to(&mut dst.data[sample_offset(dst_area, dst_offset + frame)..]);
        }
    }
}

/// Copy `num_channels` channels from a source region to a destination
/// region, converting the sample format on the fly.
///
/// * `dst_frames` frames are written; if the source provides fewer
///   (`src_frames < dst_frames`), the remainder is zero-filled.
/// * `dst_chan_index` / `src_chan_index` select the first channel on each
///   side, so a narrow stream can land in any channel range of a wider
///   sink.
pub fn copy_area_buffers(
    dst: &mut AreaViewMut<'_>,
    dst_offset: usize,
    dst_chan_index: usize,
    dst_frames: usize,
    src: &AreaView<'_>,
    src_offset: usize,
    src_chan_index: usize,
    src_frames: usize,
    num_channels: usize,
) -> XbarResult<()> {
    if dst_chan_index + num_channels > dst.areas.len()
        || src_chan_index + num_channels > src.areas.len()
    {
        return Err(XbarError::invalid_param(format!(
            "channel range out of bounds: dst {}+{} of {}, src {}+{} of {}",
            dst_chan_index,
            num_channels,
            dst.areas.len(),
            src_chan_index,
            num_channels,
            src.areas.len()
        )));
    }

    match (src.format, dst.format) {
        (SampleFormat::Int16, SampleFormat::Int16) => copy_convert::<i16, i16>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Int16, SampleFormat::Int32) => copy_convert::<i16, i32>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Int16, SampleFormat::Float32) => copy_convert::<i16, f32>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Int32, SampleFormat::Int16) => copy_convert::<i32, i16>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Int32, SampleFormat::Int32) => copy_convert::<i32, i32>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Int32, SampleFormat::Float32) => copy_convert::<i32, f32>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Float32, SampleFormat::Int16) => copy_convert::<f32, i16>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Float32, SampleFormat::Int32) => copy_convert::<f32, i32>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
        (SampleFormat::Float32, SampleFormat::Float32) => copy_convert::<f32, f32>(
            dst, dst_offset, dst_chan_index, dst_frames, src, src_offset, src_chan_index,
            src_frames, num_channels,
        ),
    }
    Ok(())
}

/// Zero-fill `num_channels` channels of a destination region.
pub fn zero_area_buffers(
    dst: &mut AreaViewMut<'_>,
    dst_offset: usize,
    dst_chan_index: usize,
    num_channels: usize,
    frames: usize,
) -> XbarResult<()> {
    if dst_chan_index + num_channels > dst.areas.len() {
        return Err(XbarError::invalid_param(format!(
            "channel range out of bounds: {}+{} of {}",
            dst_chan_index,
            num_channels,
            dst.areas.len()
        )));
    }
    let sample = dst.format.bytes();
    for ch in 0..num_channels {
        let area = &dst.areas[dst_chan_index + ch];
        for frame in 0..frames {
            let at = sample_offset(area, dst_offset + frame);
            dst.data[at..at + sample].fill(0);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_i16(frames: usize, channels: u32) -> (Vec<u8>, Vec<ChannelArea>) {
        let areas = interleaved_areas(channels, SampleFormat::Int16);
        (vec![0u8; frames * channels as usize * 2], areas)
    }

    fn fill_i16(data: &mut [u8], areas: &[ChannelArea], channel: usize, samples: &[i16]) {
        for (frame, &s) in samples.iter().enumerate() {
            let at = areas[channel].first + frame * areas[channel].step;
            data[at..at + 2].copy_from_slice(&s.to_ne_bytes());
        }
    }

    fn read_i16(data: &[u8], areas: &[ChannelArea], channel: usize, frames: usize) -> Vec<i16> {
        (0..frames)
            .map(|frame| {
                let at = areas[channel].first + frame * areas[channel].step;
                i16::from_ne_bytes([data[at], data[at + 1]])
            })
            .collect()
    }

    #[test]
    fn test_interleaved_areas() {
        let areas = interleaved_areas(2, SampleFormat::Float32);
        assert_eq!(areas[0], ChannelArea { first: 0, step: 8 });
        assert_eq!(areas[1], ChannelArea { first: 4, step: 8 });
    }

    #[test]
    fn test_same_format_copy_is_bit_identical() {
        let (mut src_data, src_areas) = make_i16(4, 2);
        fill_i16(&mut src_data, &src_areas, 0, &[100, -200, 300, -400]);
        fill_i16(&mut src_data, &src_areas, 1, &[1, 2, 3, 4]);

        let (mut dst_data, dst_areas) = make_i16(4, 2);
        let src = AreaView {
            data: &src_data,
            areas: &src_areas,
            format: SampleFormat::Int16,
        };
        let mut dst = AreaViewMut {
            data: &mut dst_data,
            areas: &dst_areas,
            format: SampleFormat::Int16,
        };
        copy_area_buffers(&mut dst, 0, 0, 4, &src, 0, 0, 4, 2).unwrap();
        assert_eq!(dst_data, src_data);
    }

    #[test]
    fn test_widening_copy_i16_to_i32() {
        let (mut src_data, src_areas) = make_i16(2, 1);
        fill_i16(&mut src_data, &src_areas, 0, &[1000, -1000]);

        let dst_areas = interleaved_areas(1, SampleFormat::Int32);
        let mut dst_data = vec![0u8; 2 * 4];
        let src = AreaView {
            data: &src_data,
            areas: &src_areas,
            format: SampleFormat::Int16,
        };
        let mut dst = AreaViewMut {
            data: &mut dst_data,
            areas: &dst_areas,
            format: SampleFormat::Int32,
        };
        copy_area_buffers(&mut dst, 0, 0, 2, &src, 0, 0, 2, 1).unwrap();

        let v0 = i32::from_ne_bytes([dst_data[0], dst_data[1], dst_data[2], dst_data[3]]);
        assert_eq!(v0, 1000 << 16);
        let v1 = i32::from_ne_bytes([dst_data[4], dst_data[5], dst_data[6], dst_data[7]]);
        assert_eq!(v1, -1000 << 16);
    }

    #[test]
    fn test_float_to_i16_saturates() {
        let src_areas = interleaved_areas(1, SampleFormat::Float32);
        let mut src_data = vec![0u8; 8];
        src_data[0..4].copy_from_slice(&2.0_f32.to_ne_bytes());
        src_data[4..8].copy_from_slice(&(-2.0_f32).to_ne_bytes());

        let (mut dst_data, dst_areas) = make_i16(2, 1);
        let src = AreaView {
            data: &src_data,
            areas: &src_areas,
            format: SampleFormat::Float32,
        };
        let mut dst = AreaViewMut {
            data: &mut dst_data,
            areas: &dst_areas,
            format: SampleFormat::Int16,
        };
        copy_area_buffers(&mut dst, 0, 0, 2, &src, 0, 0, 2, 1).unwrap();
        assert_eq!(read_i16(&dst_data, &dst_areas, 0, 2), vec![32767, -32768]);
    }

    #[test]
    fn test_short_source_zero_fills_tail() {
        let (mut src_data, src_areas) = make_i16(2, 1);
        fill_i16(&mut src_data, &src_areas, 0, &[5, 6]);

        let (mut dst_data, dst_areas) = make_i16(4, 1);
        fill_i16(&mut dst_data, &dst_areas, 0, &[9, 9, 9, 9]);

        let src = AreaView {
            data: &src_data,
            areas: &src_areas,
            format: SampleFormat::Int16,
        };
        let mut dst = AreaViewMut {
            data: &mut dst_data,
            areas: &dst_areas,
            format: SampleFormat::Int16,
        };
        copy_area_buffers(&mut dst, 0, 0, 4, &src, 0, 0, 2, 1).unwrap();
        assert_eq!(read_i16(&dst_data, &dst_areas, 0, 4), vec![5, 6, 0, 0]);
    }

    #[test]
    fn test_channel_index_selects_sink_range() {
        // Mono source into channel 1 of a stereo destination.
        let (mut src_data, src_areas) = make_i16(2, 1);
        fill_i16(&mut src_data, &src_areas, 0, &[7, 8]);

        let (mut dst_data, dst_areas) = make_i16(2, 2);
        let src = AreaView {
            data: &src_data,
            areas: &src_areas,
            format: SampleFormat::Int16,
        };
        let mut dst = AreaViewMut {
            data: &mut dst_data,
            areas: &dst_areas,
            format: SampleFormat::Int16,
        };
        copy_area_buffers(&mut dst, 0, 1, 2, &src, 0, 0, 2, 1).unwrap();
        assert_eq!(read_i16(&dst_data, &dst_areas, 0, 2), vec![0, 0]);
        assert_eq!(read_i16(&dst_data, &dst_areas, 1, 2), vec![7, 8]);
    }

    #[test]
    fn test_channel_range_out_of_bounds() {
        let (src_data, src_areas) = make_i16(1, 1);
        let (mut dst_data, dst_areas) = make_i16(1, 1);
        let src = AreaView {
            data: &src_data,
            areas: &src_areas,
            format: SampleFormat::Int16,
        };
        let mut dst = AreaViewMut {
            data: &mut dst_data,
            areas: &dst_areas,
            format: SampleFormat::Int16,
        };
        assert!(copy_area_buffers(&mut dst, 0, 0, 1, &src, 0, 1, 1, 1).is_err());
        assert!(zero_area_buffers(&mut dst, 0, 2, 1, 1).is_err());
    }

    #[test]
    fn test_zero_area_buffers() {
        let (mut dst_data, dst_areas) = make_i16(3, 2);
        fill_i16(&mut dst_data, &dst_areas, 0, &[1, 2, 3]);
        fill_i16(&mut dst_data, &dst_areas, 1, &[4, 5, 6]);

        let mut dst = AreaViewMut {
            data: &mut dst_data,
            areas: &dst_areas,
            format: SampleFormat::Int16,
        };
        zero_area_buffers(&mut dst, 1, 1, 1, 2).unwrap();
        assert_eq!(read_i16(&dst_data, &dst_areas, 0, 3), vec![1, 2, 3]);
        assert_eq!(read_i16(&dst_data, &dst_areas, 1, 3), vec![4, 0, 0]);
    }

    #[test]
    fn test_norm_roundtrips_are_exact() {
        for v in [i16::MIN, -1, 0, 1, 12345, i16::MAX] {
            assert_eq!(i16::from_norm(v.to_norm()), v);
        }
        for v in [i32::MIN, -1, 0, 1, 123_456_789, i32::MAX] {
            assert_eq!(i32::from_norm(v.to_norm()), v);
        }
        for v in [-1.0_f32, 0.0, 0.5, 0.999] {
            assert_eq!(f32::from_norm(v.to_norm()), v);
        }
    }
}
