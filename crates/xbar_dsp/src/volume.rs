//! Volume / Loudness Command Surface
//!
//! Module commands arrive as a property bag with an integer `cmd` selector
//! and named typed entries. This module validates and applies them to the
//! volume state: per-pin volume, mute and loudness flags, the
//! speed-dependent-volume table, the loudness tables and the loudness
//! filter parameters per band. The actual gain application happens inside
//! the processing pipeline; [`VolumeModule::gain_for`] exposes the
//! effective linear gain per pin for it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DspError, DspResult};
use crate::filter::{check_params, FilterParams, FilterType};

/// Number of loudness filter bands.
pub const LOUDNESS_BANDS: usize = 3;

/// Smallest representable volume; everything below is treated as mute.
pub const MIN_VOLUME_DB: f32 = -144.0;

/// Ramp times accepted by the volume commands, in milliseconds.
pub const MIN_RAMP_TIME_MS: i32 = 1;
pub const MAX_RAMP_TIME_MS: i32 = 10_000;

/// Convert a dB value to linear gain.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert a linear gain to dB. Gains of zero or below map to
/// [`MIN_VOLUME_DB`].
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        MIN_VOLUME_DB
    } else {
        20.0 * linear.log10()
    }
}

/// Ramp shapes supported by the volume commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RampShape {
    Linear,
    Exponential,
}

impl RampShape {
    fn from_i32(value: i32) -> DspResult<Self> {
        match value {
            0 => Ok(RampShape::Linear),
            1 => Ok(RampShape::Exponential),
            other => Err(DspError::InvalidRampShape(other)),
        }
    }
}

/// One typed entry of a command property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    IntVec(Vec<i32>),
    FloatVec(Vec<f32>),
}

/// Property bag used for module commands and their responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties(HashMap<String, PropertyValue>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: PropertyValue) -> &mut Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn get_i32(&self, key: &'static str) -> DspResult<i32> {
        match self.0.get(key) {
            Some(PropertyValue::Int(v)) => Ok(*v),
            Some(_) => Err(DspError::WrongPropertyType(key)),
            None => Err(DspError::MissingProperty(key)),
        }
    }

    pub fn get_f32(&self, key: &'static str) -> DspResult<f32> {
        match self.0.get(key) {
            Some(PropertyValue::Float(v)) => Ok(*v),
            Some(_) => Err(DspError::WrongPropertyType(key)),
            None => Err(DspError::MissingProperty(key)),
        }
    }

    pub fn get_bool(&self, key: &'static str) -> DspResult<bool> {
        match self.0.get(key) {
            Some(PropertyValue::Bool(v)) => Ok(*v),
            Some(_) => Err(DspError::WrongPropertyType(key)),
            None => Err(DspError::MissingProperty(key)),
        }
    }

    pub fn get_str(&self, key: &'static str) -> DspResult<&str> {
        match self.0.get(key) {
            Some(PropertyValue::Str(v)) => Ok(v),
            Some(_) => Err(DspError::WrongPropertyType(key)),
            None => Err(DspError::MissingProperty(key)),
        }
    }

    pub fn get_int_vec(&self, key: &'static str) -> DspResult<&[i32]> {
        match self.0.get(key) {
            Some(PropertyValue::IntVec(v)) => Ok(v),
            Some(_) => Err(DspError::WrongPropertyType(key)),
            None => Err(DspError::MissingProperty(key)),
        }
    }

    pub fn get_float_vec(&self, key: &'static str) -> DspResult<&[f32]> {
        match self.0.get(key) {
            Some(PropertyValue::FloatVec(v)) => Ok(v),
            Some(_) => Err(DspError::WrongPropertyType(key)),
            None => Err(DspError::MissingProperty(key)),
        }
    }
}

/// Command selectors of the volume module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCmd {
    SetVolume = 0,
    SetMuteState = 1,
    SetLoudness = 2,
    SetSdvTable = 3,
    GetSdvTable = 4,
    SetSpeed = 5,
    SetSpeedControlledVolume = 6,
    SetLoudnessTable = 7,
    GetLoudnessTable = 8,
    SetLoudnessFilter = 9,
    GetLoudnessFilter = 10,
    SetModuleState = 11,
}

impl VolumeCmd {
    fn from_i32(value: i32) -> DspResult<Self> {
        use VolumeCmd::*;
        Ok(match value {
            0 => SetVolume,
            1 => SetMuteState,
            2 => SetLoudness,
            3 => SetSdvTable,
            4 => GetSdvTable,
            5 => SetSpeed,
            6 => SetSpeedControlledVolume,
            7 => SetLoudnessTable,
            8 => GetLoudnessTable,
            9 => SetLoudnessFilter,
            10 => GetLoudnessFilter,
            11 => SetModuleState,
            other => return Err(DspError::UnknownCommand(other)),
        })
    }
}

/// Per-pin volume state.
#[derive(Debug, Clone, Copy)]
struct PinState {
    volume_db: f32,
    muted: bool,
    loudness: bool,
    sdv_active: bool,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            volume_db: 0.0,
            muted: false,
            loudness: true,
            sdv_active: false,
        }
    }
}

/// Loudness gain-over-volume table of one band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoudnessTable {
    pub gains_db: Vec<f32>,
    pub volumes_db: Vec<f32>,
}

impl LoudnessTable {
    /// Default table: increasing boost towards low listening volumes.
    fn default_table() -> Self {
        Self {
            gains_db: vec![0.0, 3.0, 6.0, 9.0],
            volumes_db: vec![0.0, -20.0, -40.0, -60.0],
        }
    }
}

/// Speed-dependent-volume table: gain over vehicle speed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SdvTable {
    pub speeds: Vec<i32>,
    pub gains_db: Vec<f32>,
}

/// The volume/loudness module command processor.
pub struct VolumeModule {
    sample_rate: u32,
    pins: Vec<String>,
    states: Vec<PinState>,
    sdv_table: SdvTable,
    speed: i32,
    loudness_tables: [LoudnessTable; LOUDNESS_BANDS],
    loudness_filters: [FilterParams; LOUDNESS_BANDS],
    active: bool,
}

impl VolumeModule {
    pub fn new(pins: Vec<String>, sample_rate: u32) -> Self {
        let states = vec![PinState::default(); pins.len()];
        let default_filters = [
            FilterParams {
                freq: 80,
                gain: 1.0,
                quality: 2.0,
                kind: FilterType::Peak,
                order: 2,
                section: 1,
            },
            FilterParams {
                freq: 2000,
                gain: 1.0,
                quality: 2.0,
                kind: FilterType::Peak,
                order: 2,
                section: 1,
            },
            FilterParams {
                freq: 8000,
                gain: 1.0,
                quality: 2.0,
                kind: FilterType::Peak,
                order: 2,
                section: 1,
            },
        ];
        Self {
            sample_rate,
            pins,
            states,
            sdv_table: SdvTable::default(),
            speed: 0,
            loudness_tables: [
                LoudnessTable::default_table(),
                LoudnessTable::default_table(),
                LoudnessTable::default_table(),
            ],
            loudness_filters: default_filters,
            active: true,
        }
    }

    fn pin_index(&self, cmd: &Properties) -> DspResult<usize> {
        let pin = cmd.get_str("pin")?;
        self.pins
            .iter()
            .position(|p| p == pin)
            .ok_or_else(|| DspError::UnknownPin(pin.to_string()))
    }

    fn check_ramp(cmd: &Properties) -> DspResult<(i32, RampShape)> {
        let ramp_time = cmd.get_i32("ramp_time")?;
        if !(MIN_RAMP_TIME_MS..=MAX_RAMP_TIME_MS).contains(&ramp_time) {
            return Err(DspError::InvalidRampTime(ramp_time));
        }
        let shape = RampShape::from_i32(cmd.get_i32("ramp_shape")?)?;
        Ok((ramp_time, shape))
    }

    fn check_band(cmd: &Properties) -> DspResult<usize> {
        let band = cmd.get_i32("band")?;
        if band < 0 || band as usize >= LOUDNESS_BANDS {
            return Err(DspError::OutOfRange(format!("band {}", band)));
        }
        Ok(band as usize)
    }

    /// Process one command property bag; returns the response bag.
    pub fn process_cmd(&mut self, cmd: &Properties) -> DspResult<Properties> {
        let selector = VolumeCmd::from_i32(cmd.get_i32("cmd")?)?;
        let mut response = Properties::new();

        match selector {
            VolumeCmd::SetVolume => {
                let pin = self.pin_index(cmd)?;
                let volume = cmd.get_f32("volume")?;
                if !(MIN_VOLUME_DB..=0.0).contains(&volume) {
                    return Err(DspError::OutOfRange(format!("volume {} dB", volume)));
                }
                let (ramp_time, shape) = Self::check_ramp(cmd)?;
                debug!(
                    pin = self.pins[pin].as_str(),
                    volume, ramp_time, ?shape, "set volume"
                );
                self.states[pin].volume_db = volume;
            }
            VolumeCmd::SetMuteState => {
                let pin = self.pin_index(cmd)?;
                let mute = cmd.get_bool("mute_state")?;
                let (_ramp_time, _shape) = Self::check_ramp(cmd)?;
                self.states[pin].muted = mute;
            }
            VolumeCmd::SetLoudness => {
                let pin = self.pin_index(cmd)?;
                self.states[pin].loudness = cmd.get_bool("loudness")?;
            }
            VolumeCmd::SetSdvTable => {
                let speeds = cmd.get_int_vec("speed")?;
                let gains = cmd.get_float_vec("gain")?;
                if speeds.is_empty() || speeds.len() != gains.len() {
                    return Err(DspError::OutOfRange(
                        "sdv table vectors must be non-empty and of equal length".into(),
                    ));
                }
                if !speeds.windows(2).all(|w| w[0] < w[1]) {
                    return Err(DspError::OutOfRange(
                        "sdv table speeds must be strictly increasing".into(),
                    ));
                }
                self.sdv_table = SdvTable {
                    speeds: speeds.to_vec(),
                    gains_db: gains.to_vec(),
                };
            }
            VolumeCmd::GetSdvTable => {
                response.set("speed", PropertyValue::IntVec(self.sdv_table.speeds.clone()));
                response.set(
                    "gain",
                    PropertyValue::FloatVec(self.sdv_table.gains_db.clone()),
                );
            }
            VolumeCmd::SetSpeed => {
                let speed = cmd.get_i32("speed")?;
                if speed < 0 {
                    return Err(DspError::OutOfRange(format!("speed {}", speed)));
                }
                self.speed = speed;
            }
            VolumeCmd::SetSpeedControlledVolume => {
                let pin = self.pin_index(cmd)?;
                self.states[pin].sdv_active = cmd.get_bool("active")?;
            }
            VolumeCmd::SetLoudnessTable => {
                let band = Self::check_band(cmd)?;
                let gains = cmd.get_float_vec("gain")?;
                let volumes = cmd.get_float_vec("volume")?;
                if gains.is_empty() || gains.len() != volumes.len() {
                    return Err(DspError::OutOfRange(
                        "loudness table vectors must be non-empty and of equal length".into(),
                    ));
                }
                self.loudness_tables[band] = LoudnessTable {
                    gains_db: gains.to_vec(),
                    volumes_db: volumes.to_vec(),
                };
            }
            VolumeCmd::GetLoudnessTable => {
                let band = Self::check_band(cmd)?;
                response.set(
                    "gain",
                    PropertyValue::FloatVec(self.loudness_tables[band].gains_db.clone()),
                );
                response.set(
                    "volume",
                    PropertyValue::FloatVec(self.loudness_tables[band].volumes_db.clone()),
                );
            }
            VolumeCmd::SetLoudnessFilter => {
                let band = Self::check_band(cmd)?;
                let params = FilterParams {
                    freq: cmd.get_i32("freq")? as u32,
                    gain: 1.0,
                    quality: cmd.get_f32("quality")?,
                    kind: FilterType::Peak,
                    order: cmd.get_i32("order")? as u32,
                    section: 1,
                };
                check_params(&params, self.sample_rate)
                    .map_err(|e| DspError::InvalidFilterParams(e.to_string()))?;
                self.loudness_filters[band] = params;
            }
            VolumeCmd::GetLoudnessFilter => {
                let band = Self::check_band(cmd)?;
                let params = self.loudness_filters[band];
                response.set("freq", PropertyValue::Int(params.freq as i32));
                response.set("quality", PropertyValue::Float(params.quality));
                response.set("order", PropertyValue::Int(params.order as i32));
            }
            VolumeCmd::SetModuleState => {
                self.active = cmd.get_bool("module_state")?;
            }
        }

        Ok(response)
    }

    /// Effective linear gain of a pin after volume, mute, module state and
    /// the speed-dependent offset.
    pub fn gain_for(&self, pin: &str) -> DspResult<f32> {
        let index = self
            .pins
            .iter()
            .position(|p| p == pin)
            .ok_or_else(|| DspError::UnknownPin(pin.to_string()))?;
        let state = &self.states[index];
        if !self.active {
            return Ok(1.0);
        }
        if state.muted {
            return Ok(0.0);
        }
        let mut db = state.volume_db;
        if state.sdv_active {
            db += self.sdv_gain_db();
        }
        Ok(db_to_linear(db))
    }

    /// Current speed-dependent gain offset, linearly interpolated from the
    /// SDV table. Zero without a table.
    fn sdv_gain_db(&self) -> f32 {
        let table = &self.sdv_table;
        let (Some(&last_speed), Some(&last_gain)) =
            (table.speeds.last(), table.gains_db.last())
        else {
            return 0.0;
        };
        if self.speed <= table.speeds[0] {
            return table.gains_db[0];
        }
        if self.speed >= last_speed {
            return last_gain;
        }
        for w in 0..table.speeds.len() - 1 {
            let (s0, s1) = (table.speeds[w], table.speeds[w + 1]);
            if self.speed >= s0 && self.speed <= s1 {
                let t = (self.speed - s0) as f32 / (s1 - s0) as f32;
                return table.gains_db[w] + t * (table.gains_db[w + 1] - table.gains_db[w]);
            }
        }
        0.0
    }

    /// Loudness filter parameters per band, for wiring into a filter bank.
    pub fn loudness_filter(&self, band: usize) -> Option<&FilterParams> {
        self.loudness_filters.get(band)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> VolumeModule {
        VolumeModule::new(vec!["speakers".into(), "headphones".into()], 48_000)
    }

    fn volume_cmd(pin: &str, volume: f32, ramp_time: i32, ramp_shape: i32) -> Properties {
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetVolume as i32))
            .set("pin", PropertyValue::Str(pin.into()))
            .set("volume", PropertyValue::Float(volume))
            .set("ramp_time", PropertyValue::Int(ramp_time))
            .set("ramp_shape", PropertyValue::Int(ramp_shape));
        cmd
    }

    #[test]
    fn test_db_linear_helpers() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.5012).abs() < 1e-3);
        assert!((linear_to_db(2.0) - 6.0206).abs() < 1e-3);
        assert_eq!(linear_to_db(0.0), MIN_VOLUME_DB);
    }

    #[test]
    fn test_set_volume() {
        let mut m = module();
        m.process_cmd(&volume_cmd("speakers", -20.0, 100, 0)).unwrap();
        let gain = m.gain_for("speakers").unwrap();
        assert!((gain - 0.1).abs() < 1e-4);
        // Other pin untouched.
        assert!((m.gain_for("headphones").unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_pin_rejected() {
        let mut m = module();
        let err = m.process_cmd(&volume_cmd("bogus", -10.0, 100, 0)).unwrap_err();
        assert!(matches!(err, DspError::UnknownPin(_)));
    }

    #[test]
    fn test_ramp_time_bounds() {
        let mut m = module();
        assert!(matches!(
            m.process_cmd(&volume_cmd("speakers", -10.0, 0, 0)),
            Err(DspError::InvalidRampTime(0))
        ));
        assert!(matches!(
            m.process_cmd(&volume_cmd("speakers", -10.0, 10_001, 0)),
            Err(DspError::InvalidRampTime(10_001))
        ));
        assert!(m.process_cmd(&volume_cmd("speakers", -10.0, 1, 0)).is_ok());
        assert!(m
            .process_cmd(&volume_cmd("speakers", -10.0, 10_000, 0))
            .is_ok());
    }

    #[test]
    fn test_ramp_shape_rejected() {
        let mut m = module();
        assert!(matches!(
            m.process_cmd(&volume_cmd("speakers", -10.0, 100, 2)),
            Err(DspError::InvalidRampShape(2))
        ));
    }

    #[test]
    fn test_mute() {
        let mut m = module();
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetMuteState as i32))
            .set("pin", PropertyValue::Str("speakers".into()))
            .set("mute_state", PropertyValue::Bool(true))
            .set("ramp_time", PropertyValue::Int(50))
            .set("ramp_shape", PropertyValue::Int(0));
        m.process_cmd(&cmd).unwrap();
        assert_eq!(m.gain_for("speakers").unwrap(), 0.0);
    }

    #[test]
    fn test_sdv_table_roundtrip() {
        let mut m = module();
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetSdvTable as i32))
            .set("speed", PropertyValue::IntVec(vec![0, 50, 100]))
            .set("gain", PropertyValue::FloatVec(vec![0.0, 3.0, 6.0]));
        m.process_cmd(&cmd).unwrap();

        let mut get = Properties::new();
        get.set("cmd", PropertyValue::Int(VolumeCmd::GetSdvTable as i32));
        let response = m.process_cmd(&get).unwrap();
        assert_eq!(response.get_int_vec("speed").unwrap(), &[0, 50, 100]);
        assert_eq!(response.get_float_vec("gain").unwrap(), &[0.0, 3.0, 6.0]);
    }

    #[test]
    fn test_sdv_table_validation() {
        let mut m = module();
        // Length mismatch.
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetSdvTable as i32))
            .set("speed", PropertyValue::IntVec(vec![0, 50]))
            .set("gain", PropertyValue::FloatVec(vec![0.0]));
        assert!(m.process_cmd(&cmd).is_err());
        // Non-monotonic speeds.
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetSdvTable as i32))
            .set("speed", PropertyValue::IntVec(vec![50, 10]))
            .set("gain", PropertyValue::FloatVec(vec![0.0, 1.0]));
        assert!(m.process_cmd(&cmd).is_err());
    }

    #[test]
    fn test_speed_controlled_volume() {
        let mut m = module();
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetSdvTable as i32))
            .set("speed", PropertyValue::IntVec(vec![0, 100]))
            .set("gain", PropertyValue::FloatVec(vec![0.0, 6.0]));
        m.process_cmd(&cmd).unwrap();

        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetSpeed as i32))
            .set("speed", PropertyValue::Int(50));
        m.process_cmd(&cmd).unwrap();

        let mut cmd = Properties::new();
        cmd.set(
            "cmd",
            PropertyValue::Int(VolumeCmd::SetSpeedControlledVolume as i32),
        )
        .set("pin", PropertyValue::Str("speakers".into()))
        .set("active", PropertyValue::Bool(true));
        m.process_cmd(&cmd).unwrap();

        // Interpolated +3 dB at half speed.
        let gain = m.gain_for("speakers").unwrap();
        assert!((gain - db_to_linear(3.0)).abs() < 1e-4);
    }

    #[test]
    fn test_loudness_filter_validation() {
        let mut m = module();
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetLoudnessFilter as i32))
            .set("band", PropertyValue::Int(0))
            .set("freq", PropertyValue::Int(120))
            .set("quality", PropertyValue::Float(1.5))
            .set("order", PropertyValue::Int(2));
        m.process_cmd(&cmd).unwrap();
        assert_eq!(m.loudness_filter(0).unwrap().freq, 120);

        // Order != 2 is invalid for a peak filter.
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetLoudnessFilter as i32))
            .set("band", PropertyValue::Int(0))
            .set("freq", PropertyValue::Int(120))
            .set("quality", PropertyValue::Float(1.5))
            .set("order", PropertyValue::Int(4));
        assert!(m.process_cmd(&cmd).is_err());

        // Invalid band.
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::GetLoudnessFilter as i32))
            .set("band", PropertyValue::Int(3));
        assert!(m.process_cmd(&cmd).is_err());
    }

    #[test]
    fn test_module_state() {
        let mut m = module();
        m.process_cmd(&volume_cmd("speakers", -20.0, 100, 0)).unwrap();

        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(VolumeCmd::SetModuleState as i32))
            .set("module_state", PropertyValue::Bool(false));
        m.process_cmd(&cmd).unwrap();
        assert!(!m.is_active());
        // Inactive module is transparent.
        assert_eq!(m.gain_for("speakers").unwrap(), 1.0);
    }

    #[test]
    fn test_unknown_command() {
        let mut m = module();
        let mut cmd = Properties::new();
        cmd.set("cmd", PropertyValue::Int(99));
        assert!(matches!(
            m.process_cmd(&cmd),
            Err(DspError::UnknownCommand(99))
        ));
    }
}
