//! Synchronous Sample-Rate Conversion
//!
//! Streaming converter used by the switch-matrix jobs when source and sink
//! run at different rates. The converter is incremental: each call consumes
//! input frames until either the requested output count has been produced
//! or the input window is exhausted, and reports both counts so the caller
//! can re-enter with more input.
//!
//! The interpolator is linear with an f64 phase accumulator, so the
//! long-term output/input ratio is exact (E.g. 44.1 kHz to 48 kHz produces
//! 48 000 output frames per 44 100 consumed frames with no drift). The
//! format conversion is handled on the fly over the same 3x3 matrix as the
//! plain copy path.

use crate::error::{XbarError, XbarResult};
use crate::format::{AreaView, AreaViewMut, Sample, SampleFormat};

/// Result of one conversion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertResult {
    pub frames_produced: u32,
    pub frames_consumed: u32,
}

/// Streaming linear-interpolation sample-rate converter.
pub struct RateConverter {
    input_rate: u32,
    output_rate: u32,
    num_channels: u32,
    /// Input frames advanced per output frame.
    step: f64,
    /// Fractional position between `prev` and the next unconsumed input
    /// frame, in input frames.
    phase: f64,
    /// Last consumed input frame, one value per channel.
    prev: Vec<f64>,
    have_prev: bool,
}

impl RateConverter {
    pub fn new(input_rate: u32, output_rate: u32, num_channels: u32) -> XbarResult<Self> {
        if input_rate == 0 || output_rate == 0 || num_channels == 0 {
            return Err(XbarError::invalid_param(
                "rate converter needs non-zero rates and channels",
            ));
        }
        // The supported conversion range matches the device matrix the
        // crossbar is used with.
        let ratio = f64::from(output_rate) / f64::from(input_rate);
        if !(0.25..=4.0).contains(&ratio) {
            return Err(XbarError::invalid_param(format!(
                "conversion ratio {}:{} out of range",
                input_rate, output_rate
            )));
        }
        Ok(Self {
            input_rate,
            output_rate,
            num_channels,
            step: f64::from(input_rate) / f64::from(output_rate),
            phase: 0.0,
            prev: vec![0.0; num_channels as usize],
            have_prev: false,
        })
    }

    /// Output frames per input frame.
    pub fn ratio(&self) -> f32 {
        self.output_rate as f32 / self.input_rate as f32
    }

    /// Drop all carried state. The next call starts from a clean phase.
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.prev.fill(0.0);
        self.have_prev = false;
    }

    /// Convert up to `max_output` frames into `dst`, consuming at most
    /// `max_input` frames from `src`.
    pub fn process(
        &mut self,
        dst: &mut AreaViewMut<'_>,
        dst_chan_index: u32,
        max_output: u32,
        src: &AreaView<'_>,
        src_chan_index: u32,
        max_input: u32,
    ) -> XbarResult<ConvertResult> {
        match (src.format, dst.format) {
            (SampleFormat::Int16, SampleFormat::Int16) => {
                self.convert::<i16, i16>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Int16, SampleFormat::Int32) => {
                self.convert::<i16, i32>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Int16, SampleFormat::Float32) => {
                self.convert::<i16, f32>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Int32, SampleFormat::Int16) => {
                self.convert::<i32, i16>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Int32, SampleFormat::Int32) => {
                self.convert::<i32, i32>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Int32, SampleFormat::Float32) => {
                self.convert::<i32, f32>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Float32, SampleFormat::Int16) => {
                self.convert::<f32, i16>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Float32, SampleFormat::Int32) => {
                self.convert::<f32, i32>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
            (SampleFormat::Float32, SampleFormat::Float32) => {
                self.convert::<f32, f32>(dst, dst_chan_index, max_output, src, src_chan_index, max_input)
            }
        }
    }

    fn convert<S: Sample, D: Sample>(
        &mut self,
        dst: &mut AreaViewMut<'_>,
        dst_chan_index: u32,
        max_output: u32,
        src: &AreaView<'_>,
        src_chan_index: u32,
        max_input: u32,
    ) -> XbarResult<ConvertResult> {
        let channels = self.num_channels as usize;
        if dst_chan_index as usize + channels > dst.areas.len()
            || src_chan_index as usize + channels > src.areas.len()
        {
            return Err(XbarError::invalid_param(
                "rate converter channel range out of bounds",
            ));
        }

        let read_frame = |frame: usize, ch: usize| -> f64 {
            let area = &src.areas[src_chan_index as usize + ch];
            S::read_from(&src.data[area.first + frame * area.step..]).to_norm()
        };

        let mut produced = 0u32;
        let mut consumed = 0u32;

        // Prime the interpolator with the first input frame.
        if !self.have_prev {
            if max_input == 0 {
                return Ok(ConvertResult {
                    frames_produced: 0,
                    frames_consumed: 0,
                });
            }
            for ch in 0..channels {
                self.prev[ch] = read_frame(0, ch);
            }
            consumed = 1;
            self.have_prev = true;
            self.phase = 0.0;
        }

        while produced < max_output {
            // Advance until the output position falls between prev and the
            // next unconsumed input frame.
            while self.phase >= 1.0 {
                if consumed >= max_input {
                    return Ok(ConvertResult {
                        frames_produced: produced,
                        frames_consumed: consumed,
                    });
                }
                for ch in 0..channels {
                    self.prev[ch] = read_frame(consumed as usize, ch);
                }
                consumed += 1;
                self.phase -= 1.0;
            }
            // The interpolation target is the next input frame, peeked but
            // not yet consumed.
            if consumed >= max_input {
                break;
            }
            for ch in 0..channels {
                let next = read_frame(consumed as usize, ch);
                let value = self.prev[ch] + self.phase * (next - self.prev[ch]);
                let area = &dst.areas[dst_chan_index as usize + ch];
                let at = area.first + produced as usize * area.step;
                D::from_norm(value).write_to(&mut dst.data[at..]);
            }
            produced += 1;
            self.phase += self.step;
        }

        Ok(ConvertResult {
            frames_produced: produced,
            frames_consumed: consumed,
        })
    }
}
