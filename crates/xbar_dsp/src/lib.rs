//! XBar DSP - Biquad Filter Engine
//!
//! This crate provides the real-time filter engine used by the per-sink
//! processing stages of the XBar audio engine:
//! - Four-channel bundle processing ([`ChannelBundle`])
//! - Biquad filter design with dual-precision coefficient sets ([`filter`])
//! - The filter engine with ramped gain updates and a lock-free command
//!   queue ([`FilterBank`] / [`FilterController`])
//! - The volume/loudness module command surface ([`VolumeModule`])
//!
//! # Architecture
//!
//! ```text
//! Command thread                        Processing thread
//! FilterController ──crossbeam queue──▶ FilterBank::calculate()
//!   set_channel_filter                    drain updates
//!   update_gain / ramp_gain              advance ramps (callback on finish)
//!   set_ramp_gradient                    run biquads over the bundle
//! ```

mod bundle;
mod engine;
mod error;
pub mod filter;
mod volume;

pub use bundle::{ChannelBundle, CHANNELS_PER_BUNDLE};
pub use engine::{create_filter, FilterBank, FilterController, RampCallback, RampFinished};
pub use error::{DspError, DspResult};
pub use filter::{FilterParams, FilterType, BIQUAD_COEFFS, BIQUAD_STATES};
pub use volume::{
    db_to_linear, linear_to_db, LoudnessTable, Properties, PropertyValue, RampShape, SdvTable,
    VolumeCmd, VolumeModule, LOUDNESS_BANDS, MAX_RAMP_TIME_MS, MIN_RAMP_TIME_MS, MIN_VOLUME_DB,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _bundle = ChannelBundle::new(64);
        let (_ctrl, _bank) = create_filter(48_000, 64);
    }
}
