//! Biquad Filter Engine
//!
//! A [`FilterBank`] runs an array of biquad filters over one four-channel
//! bundle, one filter per channel. Parameter changes are requested through
//! the [`FilterController`] on a non-real-time thread and travel to the bank
//! over a lock-free queue; the bank drains the queue at the start of every
//! [`FilterBank::calculate`] call, so updates take effect deterministically
//! between frames.
//!
//! Gain changes can be immediate or ramped. A ramped change multiplies the
//! current gain by a per-channel up/down factor on every frame (recomputing
//! the coefficients each time) until the target is reached within 0.1%,
//! then fires the announced completion callback. An immediate update that
//! preempts a running ramp also fires the callback, so the layer above
//! always learns how a ramp ended.
//!
//! Each channel owns two coefficient/state planes, f32 and f64. Whether the
//! bundle runs in single or double precision is decided per update from the
//! filter parameters (see [`crate::filter::needs_double_precision`]); the
//! scalar recursion is the authoritative formulation.

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::bundle::{ChannelBundle, CHANNELS_PER_BUNDLE};
use crate::error::{DspError, DspResult};
use crate::filter::{
    biquad_coeffs, check_params, needs_double_precision, pre_warped_frequency, FilterParams,
    BIQUAD_COEFFS, BIQUAD_STATES,
};

/// Default ramp gradient: 0.25 dB per frame.
const DEFAULT_FACTOR_RAMP_UP: f32 = 1.02920;
const DEFAULT_FACTOR_RAMP_DOWN: f32 = 1.0 / DEFAULT_FACTOR_RAMP_UP;

/// Completion notification of a gain ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampFinished {
    pub channel: u32,
    /// The gain the ramp ended at (the target, or the gain of the immediate
    /// update that preempted the ramp).
    pub gain: f32,
    pub user_data: u64,
}

/// Callback invoked by the bank when a ramp completes or is preempted.
pub type RampCallback = Box<dyn FnMut(RampFinished) + Send>;

/// One queued parameter update.
enum FilterUpdate {
    Immediate {
        channel: usize,
        gain_new: f32,
        coeffs32: [f32; BIQUAD_COEFFS],
        coeffs64: [f64; BIQUAD_COEFFS],
        use_double: bool,
        clear_states: bool,
    },
    Ramped {
        channel: usize,
        gain_target: f32,
        pre_warped_freq: f32,
        quality: f32,
        params: FilterParams,
        factor_up: f32,
        factor_down: f32,
        user_data: u64,
    },
}

/// Per-channel command-side bookkeeping.
#[derive(Debug, Clone, Copy)]
struct ChannelSetup {
    params: FilterParams,
    pre_warped_freq: f32,
    factor_up: f32,
    factor_down: f32,
    use_double: bool,
}

/// Per-channel state owned by the processing side.
#[derive(Debug, Clone, Copy)]
struct ChannelProcessing {
    gain_current: f32,
    gain_target: f32,
    pre_warped_freq: f32,
    quality: f32,
    params: FilterParams,
    factor_up: f32,
    factor_down: f32,
    user_data: u64,
    use_double: bool,
    is_ramping: bool,
}

/// Create a connected controller/bank pair for one bundle.
///
/// The controller stays with the command thread; the bank moves to the
/// processing thread.
pub fn create_filter(sample_rate: u32, frame_length: u32) -> (FilterController, FilterBank) {
    let (tx, rx) = unbounded();

    let default_setup = ChannelSetup {
        params: FilterParams::default(),
        pre_warped_freq: pre_warped_frequency(1000.0, sample_rate as f32),
        factor_up: DEFAULT_FACTOR_RAMP_UP,
        factor_down: DEFAULT_FACTOR_RAMP_DOWN,
        use_double: false,
    };

    let controller = FilterController {
        sample_rate,
        channels: [default_setup; CHANNELS_PER_BUNDLE],
        tx,
    };

    let default_proc = ChannelProcessing {
        gain_current: 1.0,
        gain_target: 1.0,
        pre_warped_freq: default_setup.pre_warped_freq,
        quality: 1.0,
        params: FilterParams::default(),
        factor_up: DEFAULT_FACTOR_RAMP_UP,
        factor_down: DEFAULT_FACTOR_RAMP_DOWN,
        user_data: 0,
        use_double: false,
        is_ramping: false,
    };

    let mut bank = FilterBank {
        frame_length: frame_length as usize,
        rx,
        coeffs32: [[0.0; CHANNELS_PER_BUNDLE]; BIQUAD_COEFFS],
        coeffs64: [[0.0; CHANNELS_PER_BUNDLE]; BIQUAD_COEFFS],
        state32: [[0.0; CHANNELS_PER_BUNDLE]; BIQUAD_STATES],
        state64: [[0.0; CHANNELS_PER_BUNDLE]; BIQUAD_STATES],
        channels: [default_proc; CHANNELS_PER_BUNDLE],
        callback: None,
    };
    // Start out flat: b0 = 1 on every channel.
    for ch in 0..CHANNELS_PER_BUNDLE {
        bank.coeffs32[0][ch] = 1.0;
        bank.coeffs64[0][ch] = 1.0;
    }

    (controller, bank)
}

/// Command-side handle of the filter engine.
pub struct FilterController {
    sample_rate: u32,
    channels: [ChannelSetup; CHANNELS_PER_BUNDLE],
    tx: Sender<FilterUpdate>,
}

impl FilterController {
    fn check_channel(&self, channel: u32) -> DspResult<usize> {
        if channel as usize >= CHANNELS_PER_BUNDLE {
            return Err(DspError::InvalidChannel(channel));
        }
        Ok(channel as usize)
    }

    fn push(&self, update: FilterUpdate) {
        if let Err(TrySendError::Disconnected(_)) = self.tx.try_send(update) {
            warn!("filter bank dropped, update discarded");
        }
    }

    /// Set the filter parameters of one channel.
    ///
    /// The parameters take effect immediately (not ramped) and the channel's
    /// state variables are cleared so the updated filter starts stable. A
    /// ramp that is still running on this channel is terminated; the
    /// announced callback reports the termination.
    pub fn set_channel_filter(&mut self, channel: u32, params: &FilterParams) -> DspResult<()> {
        let ch = self.check_channel(channel)?;
        check_params(params, self.sample_rate)?;

        let pre_warped =
            pre_warped_frequency(params.freq as f32, self.sample_rate as f32);
        let use_double = needs_double_precision(params);

        let setup = &mut self.channels[ch];
        setup.params = *params;
        setup.pre_warped_freq = pre_warped;
        setup.use_double = use_double;

        let coeffs32 = biquad_coeffs(
            pre_warped,
            params.gain,
            params.quality,
            params.kind,
            params.order,
            params.section,
        )?;
        self.push(FilterUpdate::Immediate {
            channel: ch,
            gain_new: params.gain,
            coeffs32,
            coeffs64: coeffs32.map(f64::from),
            use_double,
            clear_states: true,
        });
        Ok(())
    }

    /// Update the gain of one channel without ramping.
    ///
    /// Only meaningful for peak and shelving filters. The filter states are
    /// not cleared. A running ramp on this channel is terminated and
    /// reported through the callback.
    pub fn update_gain(&mut self, channel: u32, gain: f32) -> DspResult<()> {
        let ch = self.check_channel(channel)?;

        let mut new_params = self.channels[ch].params;
        new_params.gain = gain;
        check_params(&new_params, self.sample_rate)?;
        self.channels[ch].params.gain = gain;

        let setup = &self.channels[ch];
        let coeffs32 = biquad_coeffs(
            setup.pre_warped_freq,
            gain,
            setup.params.quality,
            setup.params.kind,
            setup.params.order,
            setup.params.section,
        )?;
        self.push(FilterUpdate::Immediate {
            channel: ch,
            gain_new: gain,
            coeffs32,
            coeffs64: coeffs32.map(f64::from),
            use_double: setup.use_double,
            clear_states: false,
        });
        Ok(())
    }

    /// Ramp the gain of one channel continuously towards `gain`.
    ///
    /// The filter states are kept so the transition is smooth. When the ramp
    /// generator reaches the target, the announced callback fires with
    /// `user_data` so the caller can identify which ramp finished.
    pub fn ramp_gain(&mut self, channel: u32, gain: f32, user_data: u64) -> DspResult<()> {
        let ch = self.check_channel(channel)?;

        let mut new_params = self.channels[ch].params;
        new_params.gain = gain;
        check_params(&new_params, self.sample_rate)?;
        self.channels[ch].params.gain = gain;

        let setup = &self.channels[ch];
        self.push(FilterUpdate::Ramped {
            channel: ch,
            gain_target: gain,
            pre_warped_freq: setup.pre_warped_freq,
            quality: setup.params.quality,
            params: setup.params,
            factor_up: setup.factor_up,
            factor_down: setup.factor_down,
            user_data,
        });
        Ok(())
    }

    /// Set the gradient used for ramping the gain of one channel, in dB per
    /// frame. Valid range is 0.01 to 6.0 dB. Affects ramps started after
    /// this call.
    pub fn set_ramp_gradient(&mut self, channel: u32, gradient: f32) -> DspResult<()> {
        let ch = self.check_channel(channel)?;
        if !(0.01..=6.0).contains(&gradient) {
            return Err(DspError::InvalidRampGradient(gradient));
        }
        let factor_up = 10.0_f32.powf(gradient * 0.05);
        self.channels[ch].factor_up = factor_up;
        self.channels[ch].factor_down = 1.0 / factor_up;
        Ok(())
    }

    /// Currently configured parameters of one channel.
    pub fn channel_params(&self, channel: u32) -> DspResult<FilterParams> {
        let ch = self.check_channel(channel)?;
        Ok(self.channels[ch].params)
    }
}

/// Processing-side biquad array for one four-channel bundle.
pub struct FilterBank {
    frame_length: usize,
    rx: Receiver<FilterUpdate>,
    // Coefficient and state planes, [coefficient][channel] so one plane row
    // holds the same coefficient of all four channels.
    coeffs32: [[f32; CHANNELS_PER_BUNDLE]; BIQUAD_COEFFS],
    coeffs64: [[f64; CHANNELS_PER_BUNDLE]; BIQUAD_COEFFS],
    state32: [[f32; CHANNELS_PER_BUNDLE]; BIQUAD_STATES],
    state64: [[f64; CHANNELS_PER_BUNDLE]; BIQUAD_STATES],
    channels: [ChannelProcessing; CHANNELS_PER_BUNDLE],
    callback: Option<RampCallback>,
}

impl FilterBank {
    /// Announce the callback executed when a gain ramp finishes. Pass `None`
    /// to deactivate the mechanism.
    pub fn announce_callback(&mut self, callback: Option<RampCallback>) {
        self.callback = callback;
    }

    /// Clear all filter state variables. The coefficients are not touched.
    pub fn reset(&mut self) {
        self.state32 = [[0.0; CHANNELS_PER_BUNDLE]; BIQUAD_STATES];
        self.state64 = [[0.0; CHANNELS_PER_BUNDLE]; BIQUAD_STATES];
    }

    fn fire_callback(callback: &mut Option<RampCallback>, event: RampFinished) {
        if let Some(cb) = callback.as_mut() {
            cb(event);
        }
    }

    fn write_coeffs(&mut self, ch: usize, c32: &[f32; BIQUAD_COEFFS]) {
        for i in 0..BIQUAD_COEFFS {
            self.coeffs32[i][ch] = c32[i];
            self.coeffs64[i][ch] = f64::from(c32[i]);
        }
    }

    fn drain_updates(&mut self) {
        while let Ok(update) = self.rx.try_recv() {
            match update {
                FilterUpdate::Immediate {
                    channel,
                    gain_new,
                    coeffs32,
                    coeffs64,
                    use_double,
                    clear_states,
                } => {
                    for i in 0..BIQUAD_COEFFS {
                        self.coeffs32[i][channel] = coeffs32[i];
                        self.coeffs64[i][channel] = coeffs64[i];
                    }
                    if clear_states {
                        for i in 0..BIQUAD_STATES {
                            self.state32[i][channel] = 0.0;
                            self.state64[i][channel] = 0.0;
                        }
                    }
                    // A ramp that was still running is terminated by this
                    // update; report it so the layer above is not left
                    // waiting for a completion that never comes.
                    if self.channels[channel].is_ramping {
                        let user_data = self.channels[channel].user_data;
                        Self::fire_callback(
                            &mut self.callback,
                            RampFinished {
                                channel: channel as u32,
                                gain: gain_new,
                                user_data,
                            },
                        );
                    }
                    self.channels[channel].gain_current = gain_new;
                    self.channels[channel].use_double = use_double;
                    self.channels[channel].is_ramping = false;
                }
                FilterUpdate::Ramped {
                    channel,
                    gain_target,
                    pre_warped_freq,
                    quality,
                    params,
                    factor_up,
                    factor_down,
                    user_data,
                } => {
                    let proc = &mut self.channels[channel];
                    proc.gain_target = gain_target;
                    proc.pre_warped_freq = pre_warped_freq;
                    proc.quality = quality;
                    proc.params = params;
                    proc.factor_up = factor_up;
                    proc.factor_down = factor_down;
                    proc.user_data = user_data;
                    proc.is_ramping = true;
                }
            }
        }
    }

    fn advance_ramps(&mut self) {
        for ch in 0..CHANNELS_PER_BUNDLE {
            if !self.channels[ch].is_ramping {
                continue;
            }
            let target = self.channels[ch].gain_target;
            let proc = self.channels[ch];
            let mut gain = proc.gain_current;

            if gain <= target {
                gain *= proc.factor_up;
                if gain >= target * 0.999 {
                    gain = target;
                    self.channels[ch].is_ramping = false;
                    Self::fire_callback(
                        &mut self.callback,
                        RampFinished {
                            channel: ch as u32,
                            gain: target,
                            user_data: proc.user_data,
                        },
                    );
                }
            } else {
                gain *= proc.factor_down;
                if gain <= target * 1.001 {
                    gain = target;
                    self.channels[ch].is_ramping = false;
                    Self::fire_callback(
                        &mut self.callback,
                        RampFinished {
                            channel: ch as u32,
                            gain: target,
                            user_data: proc.user_data,
                        },
                    );
                }
            }
            self.channels[ch].gain_current = gain;

            if let Ok(c32) = biquad_coeffs(
                proc.pre_warped_freq,
                gain,
                proc.quality,
                proc.params.kind,
                proc.params.order,
                proc.params.section,
            ) {
                self.write_coeffs(ch, &c32);
            }
        }
    }

    /// Execute the filter array for one frame.
    ///
    /// Drains the update queue, advances any active gain ramps, then runs
    /// the recursion over all four channels of the bundle in place.
    ///
    /// # Real-time Safety
    /// No allocations, no locks, no syscalls.
    pub fn calculate(&mut self, bundle: &mut ChannelBundle) {
        debug_assert_eq!(bundle.frame_length(), self.frame_length);

        self.drain_updates();
        self.advance_ramps();

        let use_double = self.channels.iter().any(|c| c.use_double);
        let data = bundle.samples_mut();

        if !use_double {
            for ch in 0..CHANNELS_PER_BUNDLE {
                let b0 = self.coeffs32[0][ch];
                let b1 = self.coeffs32[1][ch];
                let b2 = self.coeffs32[2][ch];
                let a1 = self.coeffs32[3][ch];
                let a2 = self.coeffs32[4][ch];

                let mut x1 = self.state32[0][ch];
                let mut x2 = self.state32[1][ch];
                let mut y1 = self.state32[2][ch];
                let mut y2 = self.state32[3][ch];

                let mut idx = ch;
                for _ in 0..self.frame_length {
                    let x0 = data[idx];
                    let y0 = x0 * b0 + x1 * b1 + x2 * b2 - (y1 * a1 + y2 * a2);
                    x2 = x1;
                    x1 = x0;
                    y2 = y1;
                    y1 = y0;
                    data[idx] = y0;
                    idx += CHANNELS_PER_BUNDLE;
                }

                self.state32[0][ch] = x1;
                self.state32[1][ch] = x2;
                self.state32[2][ch] = y1;
                self.state32[3][ch] = y2;
            }
        } else {
            // Double-precision plane; samples enter and leave as f32.
            for ch in 0..CHANNELS_PER_BUNDLE {
                let b0 = self.coeffs64[0][ch];
                let b1 = self.coeffs64[1][ch];
                let b2 = self.coeffs64[2][ch];
                let a1 = self.coeffs64[3][ch];
                let a2 = self.coeffs64[4][ch];

                let mut x1 = self.state64[0][ch];
                let mut x2 = self.state64[1][ch];
                let mut y1 = self.state64[2][ch];
                let mut y2 = self.state64[3][ch];

                let mut idx = ch;
                for _ in 0..self.frame_length {
                    let x0 = f64::from(data[idx]);
                    let y0 = x0 * b0 + x1 * b1 + x2 * b2 - (y1 * a1 + y2 * a2);
                    x2 = x1;
                    x1 = x0;
                    y2 = y1;
                    y1 = y0;
                    data[idx] = y0 as f32;
                    idx += CHANNELS_PER_BUNDLE;
                }

                self.state64[0][ch] = x1;
                self.state64[1][ch] = x2;
                self.state64[2][ch] = y1;
                self.state64[3][ch] = y2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterType;
    use std::sync::mpsc;

    const FS: u32 = 48_000;
    const FRAME: u32 = 64;

    fn peak_params(freq: u32, gain: f32, quality: f32) -> FilterParams {
        FilterParams {
            freq,
            gain,
            quality,
            kind: FilterType::Peak,
            order: 2,
            section: 1,
        }
    }

    #[test]
    fn test_flat_default_passthrough() {
        let (_ctrl, mut bank) = create_filter(FS, FRAME);
        let mut bundle = ChannelBundle::new(FRAME as usize);
        let input: Vec<f32> = (0..FRAME).map(|i| (i as f32 * 0.01).sin()).collect();
        bundle.write_channel(0, &input);

        bank.calculate(&mut bundle);
        assert_eq!(bundle.read_channel(0), input);
    }

    #[test]
    fn test_set_channel_filter_applies_coefficients() {
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        let params = peak_params(1000, 2.0, 1.0);
        ctrl.set_channel_filter(0, &params).unwrap();

        let mut bundle = ChannelBundle::new(FRAME as usize);
        bank.calculate(&mut bundle);

        let k = pre_warped_frequency(1000.0, FS as f32);
        let expected = biquad_coeffs(k, 2.0, 1.0, FilterType::Peak, 2, 1).unwrap();
        for i in 0..BIQUAD_COEFFS {
            assert!((bank.coeffs32[i][0] - expected[i]).abs() < 1e-7);
            assert!((bank.coeffs64[i][0] - f64::from(expected[i])).abs() < 1e-7);
        }
        // Other channels stay flat.
        assert_eq!(bank.coeffs32[0][1], 1.0);
    }

    #[test]
    fn test_reset_clears_states_keeps_coefficients() {
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        ctrl.set_channel_filter(0, &peak_params(1000, 2.0, 1.0)).unwrap();

        let mut bundle = ChannelBundle::new(FRAME as usize);
        let input: Vec<f32> = (0..FRAME).map(|i| (i as f32 * 0.3).sin()).collect();
        bundle.write_channel(0, &input);
        bank.calculate(&mut bundle);
        assert!(bank.state32.iter().any(|row| row[0] != 0.0));

        let coeffs_before = bank.coeffs32;
        bank.reset();
        assert!(bank.state32.iter().all(|row| row[0] == 0.0));
        assert!(bank.state64.iter().all(|row| row[0] == 0.0));
        assert_eq!(bank.coeffs32, coeffs_before);
    }

    #[test]
    fn test_ramp_completes_after_expected_frames() {
        // Peak filter on channel 0, ramp from 1.0 to 3.9811 (12 dB) with a
        // gradient of 0.25 dB per frame: ceil(12.0 / 0.25) = 48 frames.
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        ctrl.set_channel_filter(0, &peak_params(1000, 1.0, 1.0)).unwrap();
        ctrl.set_ramp_gradient(0, 0.25).unwrap();

        let (tx, rx) = mpsc::channel();
        bank.announce_callback(Some(Box::new(move |event| {
            tx.send(event).unwrap();
        })));

        ctrl.ramp_gain(0, 3.9811, 42).unwrap();

        let mut bundle = ChannelBundle::new(FRAME as usize);
        for frame in 0..47 {
            bank.calculate(&mut bundle);
            assert!(
                rx.try_recv().is_err(),
                "callback fired early at frame {}",
                frame
            );
        }
        bank.calculate(&mut bundle);
        let event = rx.try_recv().expect("callback after 48 frames");
        assert_eq!(event.channel, 0);
        assert!((event.gain - 3.9811).abs() < 1e-6);
        assert_eq!(event.user_data, 42);
        // Exactly once.
        bank.calculate(&mut bundle);
        assert!(rx.try_recv().is_err());
        assert!(!bank.channels[0].is_ramping);
        assert!((bank.channels[0].gain_current - 3.9811).abs() < 1e-6);
    }

    #[test]
    fn test_immediate_update_preempts_ramp() {
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        ctrl.set_channel_filter(0, &peak_params(1000, 1.0, 1.0)).unwrap();
        ctrl.set_ramp_gradient(0, 0.25).unwrap();

        let (tx, rx) = mpsc::channel();
        bank.announce_callback(Some(Box::new(move |event| {
            tx.send(event).unwrap();
        })));

        ctrl.ramp_gain(0, 3.9811, 7).unwrap();
        let mut bundle = ChannelBundle::new(FRAME as usize);
        for _ in 0..5 {
            bank.calculate(&mut bundle);
        }
        assert!(bank.channels[0].is_ramping);

        ctrl.update_gain(0, 1.0).unwrap();
        bank.calculate(&mut bundle);

        let event = rx.try_recv().expect("preemption reported");
        assert_eq!(event.gain, 1.0);
        assert_eq!(event.user_data, 7);
        assert!(!bank.channels[0].is_ramping);
    }

    #[test]
    fn test_ramp_down() {
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        ctrl.set_channel_filter(0, &peak_params(1000, 4.0, 1.0)).unwrap();
        ctrl.set_ramp_gradient(0, 0.5).unwrap();

        let (tx, rx) = mpsc::channel();
        bank.announce_callback(Some(Box::new(move |event| {
            tx.send(event).unwrap();
        })));

        ctrl.ramp_gain(0, 1.0, 0).unwrap();
        let mut bundle = ChannelBundle::new(FRAME as usize);
        // 20*log10(4) / 0.5 = 24.08 -> complete within ~25 frames.
        for _ in 0..26 {
            bank.calculate(&mut bundle);
        }
        let event = rx.try_recv().expect("down-ramp completes");
        assert_eq!(event.gain, 1.0);
    }

    #[test]
    fn test_boost_increases_amplitude() {
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        ctrl.set_channel_filter(0, &peak_params(1000, 4.0, 1.0)).unwrap();

        let mut max_in = 0.0_f32;
        let mut max_out = 0.0_f32;
        let mut bundle = ChannelBundle::new(FRAME as usize);
        for block in 0..20 {
            let samples: Vec<f32> = (0..FRAME)
                .map(|i| {
                    let n = block * FRAME + i;
                    (2.0 * std::f32::consts::PI * 1000.0 * n as f32 / FS as f32).sin() * 0.25
                })
                .collect();
            max_in = max_in.max(samples.iter().fold(0.0_f32, |m, s| m.max(s.abs())));
            bundle.write_channel(0, &samples);
            bank.calculate(&mut bundle);
            let out = bundle.read_channel(0);
            max_out = max_out.max(out.iter().fold(0.0_f32, |m, s| m.max(s.abs())));
        }
        assert!(max_out > max_in, "boost should raise the 1 kHz amplitude");
    }

    #[test]
    fn test_double_precision_path() {
        // Peak below 300 Hz selects the f64 plane for the whole bundle.
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        ctrl.set_channel_filter(0, &peak_params(100, 2.0, 1.0)).unwrap();

        let mut bundle = ChannelBundle::new(FRAME as usize);
        bank.calculate(&mut bundle);
        assert!(bank.channels[0].use_double);

        let samples: Vec<f32> = (0..FRAME).map(|i| (i as f32 * 0.05).sin()).collect();
        bundle.write_channel(0, &samples);
        bundle.write_channel(1, &samples);
        bank.calculate(&mut bundle);
        for s in bundle.samples() {
            assert!(s.is_finite());
        }
        // Channel 1 is still flat, so the f64 plane must pass it through.
        let out = bundle.read_channel(1);
        for (o, i) in out.iter().zip(samples.iter()) {
            assert!((o - i).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let (mut ctrl, _bank) = create_filter(FS, FRAME);
        assert_eq!(
            ctrl.set_channel_filter(4, &FilterParams::default()),
            Err(DspError::InvalidChannel(4))
        );
        assert!(ctrl.ramp_gain(5, 1.0, 0).is_err());
        assert!(ctrl.update_gain(4, 1.0).is_err());
    }

    #[test]
    fn test_invalid_gradient_rejected() {
        let (mut ctrl, _bank) = create_filter(FS, FRAME);
        assert!(ctrl.set_ramp_gradient(0, 0.005).is_err());
        assert!(ctrl.set_ramp_gradient(0, 6.5).is_err());
        assert!(ctrl.set_ramp_gradient(0, 0.25).is_ok());
    }

    #[test]
    fn test_lowpass_attenuates_high_frequency() {
        let (mut ctrl, mut bank) = create_filter(FS, FRAME);
        ctrl.set_channel_filter(
            0,
            &FilterParams {
                freq: 500,
                kind: FilterType::Lowpass,
                order: 2,
                section: 1,
                ..Default::default()
            },
        )
        .unwrap();

        let mut bundle = ChannelBundle::new(FRAME as usize);
        let mut max_out = 0.0_f32;
        for block in 0..50 {
            let samples: Vec<f32> = (0..FRAME)
                .map(|i| {
                    let n = block * FRAME + i;
                    (2.0 * std::f32::consts::PI * 10_000.0 * n as f32 / FS as f32).sin()
                })
                .collect();
            bundle.write_channel(0, &samples);
            bank.calculate(&mut bundle);
            let out = bundle.read_channel(0);
            max_out = max_out.max(out.iter().fold(0.0_f32, |m, s| m.max(s.abs())));
        }
        assert!(max_out < 0.05, "10 kHz through 500 Hz low-pass: {}", max_out);
    }
}
