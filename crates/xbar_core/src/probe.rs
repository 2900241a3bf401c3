//! Data Probes
//!
//! A probe taps the PCM transport at a well-defined point: it either
//! records the passing frames into a WAV file, or injects the content of a
//! WAV file into the stream. Probes are armed through an action queue and
//! consumed by the real-time thread between periods; the real-time side
//! never touches the filesystem. Recorded samples travel through an SPSC
//! ring to a writer thread that owns the WAV file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::error::{XbarError, XbarResult};
use crate::format::{AreaViewMut, Sample, SampleFormat};

/// Parameters of one probing request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeParams {
    /// File name prefix; the probe reads/writes `<name>.wav`.
    pub name: String,
    pub duration_seconds: u32,
    /// Inject the WAV file into the stream instead of recording.
    pub is_inject: bool,
    pub num_channels: u32,
    /// First channel of the probed range.
    pub start_index: u32,
    pub sample_rate: u32,
    pub format: SampleFormat,
}

/// Entry of a probe action queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeAction {
    Start(ProbeParams),
    Stop,
}

enum ProbeMode {
    Record {
        producer: rtrb::Producer<f64>,
        writer: Option<JoinHandle<()>>,
        done: Arc<AtomicBool>,
        overruns: u64,
    },
    Inject {
        samples: Vec<f64>,
        position: usize,
    },
}

/// An armed probe. Created by the real-time thread from a queue entry;
/// dropped when the duration elapses or a stop action arrives.
pub struct DataProbe {
    params: ProbeParams,
    frames_left: u64,
    mode: ProbeMode,
}

fn wav_spec(params: &ProbeParams) -> hound::WavSpec {
    let (bits, sample_format) = match params.format {
        SampleFormat::Int16 => (16, hound::SampleFormat::Int),
        SampleFormat::Int32 => (32, hound::SampleFormat::Int),
        SampleFormat::Float32 => (32, hound::SampleFormat::Float),
    };
    hound::WavSpec {
        channels: params.num_channels as u16,
        sample_rate: params.sample_rate,
        bits_per_sample: bits,
        sample_format,
    }
}

impl DataProbe {
    pub fn new(params: ProbeParams) -> XbarResult<Self> {
        if params.num_channels == 0 || params.sample_rate == 0 || params.duration_seconds == 0 {
            return Err(XbarError::invalid_param(
                "probe needs channels, sample rate and duration",
            ));
        }
        let path = PathBuf::from(format!("{}.wav", params.name));
        let frames_left = u64::from(params.duration_seconds) * u64::from(params.sample_rate);

        let mode = if params.is_inject {
            let reader = hound::WavReader::open(&path)
                .map_err(|e| XbarError::failed(format!("probe open {:?}: {}", path, e)))?;
            let spec = reader.spec();
            if spec.channels as u32 != params.num_channels {
                return Err(XbarError::invalid_param(format!(
                    "probe file has {} channels, expected {}",
                    spec.channels, params.num_channels
                )));
            }
            let samples: Vec<f64> = match spec.sample_format {
                hound::SampleFormat::Float => reader
                    .into_samples::<f32>()
                    .filter_map(Result::ok)
                    .map(f64::from)
                    .collect(),
                hound::SampleFormat::Int => {
                    let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f64;
                    reader
                        .into_samples::<i32>()
                        .filter_map(Result::ok)
                        .map(|s| f64::from(s) * scale)
                        .collect()
                }
            };
            info!(
                "probe injects {:?} ({} frames)",
                path,
                samples.len() / params.num_channels as usize
            );
            ProbeMode::Inject {
                samples,
                position: 0,
            }
        } else {
            let spec = wav_spec(&params);
            let mut wav = hound::WavWriter::create(&path, spec)
                .map_err(|e| XbarError::failed(format!("probe create {:?}: {}", path, e)))?;
            // One second of headroom between the real-time side and the
            // writer thread.
            let capacity = params.sample_rate as usize * params.num_channels as usize;
            let (producer, mut consumer) = rtrb::RingBuffer::<f64>::new(capacity);
            let done = Arc::new(AtomicBool::new(false));
            let done_writer = Arc::clone(&done);
            let format = params.format;
            let writer = std::thread::Builder::new()
                .name("xbar-probe-writer".into())
                .spawn(move || {
                    loop {
                        let mut wrote = false;
                        while let Ok(sample) = consumer.pop() {
                            wrote = true;
                            let result = match format {
                                SampleFormat::Int16 => wav.write_sample(i16::from_norm(sample)),
                                SampleFormat::Int32 => wav.write_sample(i32::from_norm(sample)),
                                SampleFormat::Float32 => wav.write_sample(sample as f32),
                            };
                            if let Err(e) = result {
                                error!("probe writer: {}", e);
                                return;
                            }
                        }
                        if done_writer.load(Ordering::Acquire) && !wrote {
                            break;
                        }
                        std::thread::sleep(std::time::Duration::from_millis(2));
                    }
                    if let Err(e) = wav.finalize() {
                        error!("probe finalize: {}", e);
                    }
                })
                .map_err(|e| XbarError::failed(format!("probe writer thread: {}", e)))?;
            info!("probe records {:?}", path);
            ProbeMode::Record {
                producer,
                writer: Some(writer),
                done,
                overruns: 0,
            }
        };

        Ok(Self {
            params,
            frames_left,
            mode,
        })
    }

    pub fn params(&self) -> &ProbeParams {
        &self.params
    }

    /// Run the tap over one region. Returns `false` when the probe is
    /// finished and should be dropped.
    ///
    /// # Real-time Safety
    /// Record mode only pushes into the SPSC ring; inject mode only copies
    /// from the preloaded sample vector.
    pub fn process(&mut self, region: &mut AreaViewMut<'_>, frames: u32) -> bool {
        let frames = u64::from(frames).min(self.frames_left) as usize;
        let start = self.params.start_index as usize;
        let channels = self.params.num_channels as usize;
        if start + channels > region.areas.len() {
            warn!("probe channel range exceeds the tapped region");
            return false;
        }

        match &mut self.mode {
            ProbeMode::Record {
                producer, overruns, ..
            } => {
                for frame in 0..frames {
                    for ch in 0..channels {
                        let area = &region.areas[start + ch];
                        let at = area.first + frame * area.step;
                        let value = match region.format {
                            SampleFormat::Int16 => {
                                i16::read_from(&region.data[at..]).to_norm()
                            }
                            SampleFormat::Int32 => {
                                i32::read_from(&region.data[at..]).to_norm()
                            }
                            SampleFormat::Float32 => {
                                f32::read_from(&region.data[at..]).to_norm()
                            }
                        };
                        if producer.push(value).is_err() {
                            *overruns += 1;
                        }
                    }
                }
            }
            ProbeMode::Inject { samples, position } => {
                for frame in 0..frames {
                    if *position + channels > samples.len() {
                        self.frames_left = 0;
                        return false;
                    }
                    for ch in 0..channels {
                        let area = &region.areas[start + ch];
                        let at = area.first + frame * area.step;
                        let value = samples[*position + ch];
                        match region.format {
                            SampleFormat::Int16 => {
                                i16::from_norm(value).write_to(&mut region.data[at..])
                            }
                            SampleFormat::Int32 => {
                                i32::from_norm(value).write_to(&mut region.data[at..])
                            }
                            SampleFormat::Float32 => {
                                f32::from_norm(value).write_to(&mut region.data[at..])
                            }
                        }
                    }
                    *position += channels;
                }
            }
        }

        self.frames_left -= frames as u64;
        self.frames_left > 0
    }
}

impl Drop for DataProbe {
    fn drop(&mut self) {
        if let ProbeMode::Record {
            writer,
            done,
            overruns,
            ..
        } = &mut self.mode
        {
            if *overruns > 0 {
                warn!("probe {} dropped {} samples", self.params.name, overruns);
            }
            done.store(true, Ordering::Release);
            if let Some(handle) = writer.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Apply one queued probe action to a probe slot. Used by every real-time
/// consumer of a probe action queue.
pub fn apply_probe_action(action: ProbeAction, slot: &mut Option<DataProbe>) {
    match action {
        ProbeAction::Start(params) => {
            if slot.is_some() {
                warn!("probing already active, start ignored");
                return;
            }
            match DataProbe::new(params) {
                Ok(probe) => *slot = Some(probe),
                Err(e) => error!("cannot start probing: {}", e),
            }
        }
        ProbeAction::Stop => {
            debug!("probing stopped");
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::interleaved_areas;

    fn temp_prefix(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("xbar_probe_{}_{}", tag, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_record_writes_wav() {
        let prefix = temp_prefix("rec");
        let params = ProbeParams {
            name: prefix.clone(),
            duration_seconds: 1,
            is_inject: false,
            num_channels: 2,
            start_index: 0,
            sample_rate: 100,
            format: SampleFormat::Int16,
        };
        let mut probe = DataProbe::new(params).unwrap();

        let areas = interleaved_areas(2, SampleFormat::Int16);
        let mut data = vec![0u8; 50 * 4];
        for frame in 0..50u16 {
            let v = frame as i16;
            data[frame as usize * 4..frame as usize * 4 + 2].copy_from_slice(&v.to_ne_bytes());
            data[frame as usize * 4 + 2..frame as usize * 4 + 4]
                .copy_from_slice(&(-v).to_ne_bytes());
        }
        let mut region = AreaViewMut {
            data: &mut data,
            areas: &areas,
            format: SampleFormat::Int16,
        };

        // Two regions of 50 frames complete the 100-frame duration.
        assert!(probe.process(&mut region, 50));
        assert!(!probe.process(&mut region, 50));
        drop(probe);

        let reader = hound::WavReader::open(format!("{}.wav", prefix)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 100);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples.len(), 200);
        assert_eq!(samples[0], 0);
        assert_eq!(samples[2], 1);
        assert_eq!(samples[3], -1);
        let _ = std::fs::remove_file(format!("{}.wav", prefix));
    }

    #[test]
    fn test_inject_fills_region() {
        let prefix = temp_prefix("inj");
        // Author a WAV to inject.
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut wav = hound::WavWriter::create(format!("{}.wav", prefix), spec).unwrap();
        for v in [100i16, 200, 300, 400] {
            wav.write_sample(v).unwrap();
        }
        wav.finalize().unwrap();

        let params = ProbeParams {
            name: prefix.clone(),
            duration_seconds: 1,
            is_inject: true,
            num_channels: 1,
            start_index: 0,
            sample_rate: 100,
            format: SampleFormat::Int16,
        };
        let mut probe = DataProbe::new(params).unwrap();

        let areas = interleaved_areas(1, SampleFormat::Int16);
        let mut data = vec![0u8; 4 * 2];
        let mut region = AreaViewMut {
            data: &mut data,
            areas: &areas,
            format: SampleFormat::Int16,
        };
        probe.process(&mut region, 4);

        let injected: Vec<i16> = (0..4)
            .map(|i| i16::from_ne_bytes([data[i * 2], data[i * 2 + 1]]))
            .collect();
        assert_eq!(injected, vec![100, 200, 300, 400]);
        let _ = std::fs::remove_file(format!("{}.wav", prefix));
    }

    #[test]
    fn test_apply_probe_action() {
        let mut slot = None;
        let prefix = temp_prefix("act");
        apply_probe_action(
            ProbeAction::Start(ProbeParams {
                name: prefix.clone(),
                duration_seconds: 1,
                is_inject: false,
                num_channels: 1,
                start_index: 0,
                sample_rate: 100,
                format: SampleFormat::Float32,
            }),
            &mut slot,
        );
        assert!(slot.is_some());

        // A second start is ignored, the armed probe stays.
        apply_probe_action(
            ProbeAction::Start(ProbeParams {
                name: format!("{}_second", prefix),
                duration_seconds: 1,
                is_inject: false,
                num_channels: 1,
                start_index: 0,
                sample_rate: 100,
                format: SampleFormat::Float32,
            }),
            &mut slot,
        );
        assert_eq!(slot.as_ref().unwrap().params().name, prefix);

        apply_probe_action(ProbeAction::Stop, &mut slot);
        assert!(slot.is_none());
        let _ = std::fs::remove_file(format!("{}.wav", prefix));
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(DataProbe::new(ProbeParams {
            name: temp_prefix("bad"),
            duration_seconds: 0,
            is_inject: false,
            num_channels: 1,
            start_index: 0,
            sample_rate: 100,
            format: SampleFormat::Int16,
        })
        .is_err());
    }
}
