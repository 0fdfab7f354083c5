//! Sample production.
//!
//! [`frames`] declares the interface to the external frame source,
//! [`sequencer`] hands out per-session sequence numbers, and
//! [`pipeline`] turns frames into recorded (and, when connected,
//! streamed) samples.

pub mod frames;
pub mod pipeline;
pub mod sequencer;

pub use frames::{CaptureFrame, FrameProvider, MeshAnchor};
pub use pipeline::{CapturePipeline, PipelineConfig};
pub use sequencer::SampleSequencer;
