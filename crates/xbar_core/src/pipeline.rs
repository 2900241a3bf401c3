//! Pipeline Collaborator Interface
//!
//! A routing zone may own one DSP pipeline. The pipeline is an external
//! collaborator; the core only defines the calls the zone worker makes per
//! period and their ordering:
//!
//! 1. `provide_input_data` once per conversion buffer, with a view of the
//!    frames the worker is about to consume,
//! 2. `process` once per period,
//! 3. `retrieve_output_data` once per period, with the writable sink
//!    region.
//!
//! The pipeline decides internally which ports and channels it cares
//! about.

use crate::error::XbarResult;
use crate::format::{AreaView, AreaViewMut};

/// Static parameters of a pipeline. The zone refuses a pipeline whose
/// period size or sample rate do not match its sink device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineParams {
    pub name: String,
    pub period_size: u32,
    pub sample_rate: u32,
}

/// Per-sink DSP pipeline run by the routing zone worker.
pub trait Pipeline: Send {
    fn params(&self) -> &PipelineParams;

    /// Offer the PCM frames of one zone input port for this period.
    ///
    /// `frames_to_read` frames are valid in `input`; `frames_to_write`
    /// is the count the worker will place into the sink for this chunk
    /// (zero-filled beyond `frames_to_read` during warm-up). Returns the
    /// number of frames the pipeline still expects for this period.
    fn provide_input_data(
        &mut self,
        port_id: i32,
        input: AreaView<'_>,
        frames_to_read: u32,
        frames_to_write: u32,
    ) -> XbarResult<u32>;

    /// Run the DSP graph for one period.
    fn process(&mut self);

    /// Write the processed PCM frames into the sink region.
    fn retrieve_output_data(&mut self, sink: &mut AreaViewMut<'_>, frames: u32);
}
