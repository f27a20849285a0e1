//! TCSPC FIFO event pipeline for Becker & Hickl SPC photon counting modules.
//!
//! This crate turns the raw, high-rate event stream of an SPC module into
//! per-pixel fluorescence-lifetime histograms and live intensity frames, and
//! persists the cumulative histogram as a binary measurement file. The
//! pipeline is: pooled buffering of raw words, a stateful binary decoder
//! with macro-time overflow correction, a line-clock pixellator driven by
//! externally supplied markers, histogram accumulation fanned out to
//! independent sinks, and a lifecycle controller that starts, stops, and
//! joins the stages deterministically.
//!
//! # Example
//!
//! ```no_run
//! use spcflim_core::{
//!     AcquisitionConfig, AcquisitionController, DeviceError, DeviceInfo, DeviceSource,
//!     EventBuffer, FifoFormat, FifoStatus,
//! };
//!
//! struct MySource;
//!
//! impl DeviceSource for MySource {
//!     fn info(&self) -> DeviceInfo {
//!         DeviceInfo {
//!             fifo_format: FifoFormat::Standard,
//!             macro_time_units_tenth_ns: 250,
//!         }
//!     }
//!
//!     fn read_words(&mut self, buffer: &mut EventBuffer) -> Result<FifoStatus, DeviceError> {
//!         // Pull up to `buffer.remaining()` words from the hardware here.
//!         Ok(FifoStatus {
//!             armed: true,
//!             fifo_empty: true,
//!             fifo_overflow: false,
//!             time_over: false,
//!         })
//!     }
//! }
//!
//! let mut controller = AcquisitionController::new();
//! controller
//!     .start(
//!         &AcquisitionConfig::default(),
//!         Box::new(MySource),
//!         Box::new(|frame| println!("frame with {} photons", frame.total_count())),
//!     )
//!     .unwrap();
//! controller.wait().unwrap();
//! ```
//!
//! # Features
//!
//! - Full SPC standard-FIFO record support, including markers, gaps, and
//!   single/multiple macro-time overflow correction
//! - Line-clock pixellation with configurable marker roles, line delay, and
//!   line-start/line-end marker anchoring
//! - Per-frame and cumulative histograms at configurable micro-time depth
//! - Bounded, backpressuring buffer pool between the device reader and the
//!   single-threaded processing graph
//! - Self-contained binary measurement file plus replayable raw stream tap

pub mod acquisition;
pub mod buffer;
pub mod decoder;
pub mod histogram;
pub mod output;
pub mod parser;
pub mod pixellator;
pub mod types;

// Re-export commonly used types
pub use acquisition::{
    AcquisitionCompletion, AcquisitionConfig, AcquisitionController, AcquisitionError,
    CompletionHandle, ConfigError, DeviceError, DeviceInfo, DeviceSource, FifoFormat, FifoStatus,
    MarkerPolarity, PixelMappingMode, RegionOfInterest, StopSignal,
};
pub use buffer::{EventBuffer, EventBufferPool, EventStream, EventStreamSender};
pub use decoder::{DecodeError, SpcEventDecoder};
pub use histogram::{Histogram, HistogramSink, Histogrammer};
pub use output::{SdtFileWriter, SdtMetadata};
pub use pixellator::{LineClockPixellator, PixellatorConfig};
pub use types::{DecodedEvent, DecodedEventSink, DeviceEventSink, PixelPhotonEvent, PixelPhotonSink, SinkError};
