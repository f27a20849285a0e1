//! Acquisition lifecycle: configuration, wiring, start/stop/wait.
//!
//! The controller owns the whole pipeline for one acquisition: it validates
//! the configuration, builds the sink graph downstream-first, and launches
//! two concurrent tasks: a producer that drains the device source into
//! pooled buffers, and a consumer pump that drives each buffer synchronously
//! through decoder, pixellator, histogram engine and sinks on a single
//! thread. Stopping is cooperative through a write-once [`StopSignal`];
//! "finished" is the aggregate of producer and pump completion.

use crate::buffer::{
    event_stream, EventBuffer, EventBufferPool, EventStream, EventStreamSender,
    DEFAULT_BUFFER_CAPACITY_WORDS, DEFAULT_POOL_BUFFERS,
};
use crate::decoder::SpcEventDecoder;
use crate::histogram::{BroadcastPixelPhotonSink, FrameCallbackSink, Histogram, Histogrammer};
use crate::output::{FileHistogramSink, RawStreamWriter, SdtFileWriter, SdtMetadata};
use crate::parser::{MICROTIME_BITS, NUM_MARKER_BITS};
use crate::pixellator::{LineClockPixellator, PixellatorConfig};
use crate::types::{DeviceEventSink, PixelPhotonSink};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Cooperative stop request shared by every party that may end an
/// acquisition.
///
/// Write-once-wins: of possibly-concurrent `request` calls exactly one
/// returns `true`; the others observe success silently. Duplicate stops are
/// never an error.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    /// Creates an unasserted signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asserts the signal. Returns `true` only for the call that actually
    /// set it.
    pub fn request(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!("acquisition stop requested");
        }
        first
    }

    /// True once any party has requested stop.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CompletionState {
    pending: Vec<String>,
    errors: Vec<String>,
}

/// Tracks a named set of independent downstream processes.
///
/// Each registered process reports completion or error exactly once through
/// its [`CompletionHandle`]; the acquisition is fully drained only when all
/// of them have reported.
#[derive(Default)]
pub struct AcquisitionCompletion {
    state: Mutex<CompletionState>,
    drained: Condvar,
}

impl AcquisitionCompletion {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn report(&self, name: &str, error: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(pos) = state.pending.iter().position(|n| n == name) {
            state.pending.remove(pos);
            if let Some(message) = error {
                state.errors.push(format!("{name}: {message}"));
            }
            if state.pending.is_empty() {
                self.drained.notify_all();
            }
        }
    }

    /// True once every registered process has reported.
    pub fn is_drained(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Blocks until every registered process has reported.
    pub fn wait_drained(&self) {
        let mut state = self.state.lock();
        while !state.pending.is_empty() {
            self.drained.wait(&mut state);
        }
    }

    /// Errors reported so far, in report order.
    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }
}

/// One-shot reporting handle for a registered process.
///
/// Dropping the handle without reporting counts as completion, so a detached
/// sink can never wedge the drain; the drop is logged.
pub struct CompletionHandle {
    completion: Arc<AcquisitionCompletion>,
    name: String,
    reported: bool,
}

impl CompletionHandle {
    /// Registers a named process with `completion` and returns its one-shot
    /// reporting handle.
    pub fn new(completion: Arc<AcquisitionCompletion>, name: &str) -> Self {
        completion.state.lock().pending.push(name.to_string());
        Self {
            completion,
            name: name.to_string(),
            reported: false,
        }
    }

    /// Reports successful completion.
    pub fn complete(mut self) {
        self.reported = true;
        self.completion.report(&self.name, None);
    }

    /// Reports failure.
    pub fn error(mut self, message: &str) {
        self.reported = true;
        self.completion.report(&self.name, Some(message));
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if !self.reported {
            tracing::warn!(process = %self.name, "completion handle dropped without report");
            self.completion.report(&self.name, None);
        }
    }
}

/// Device FIFO state flags returned with every read.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoStatus {
    /// The measurement is still armed.
    pub armed: bool,
    /// The FIFO held no more data for this read.
    pub fifo_empty: bool,
    /// The FIFO overflowed; events were lost.
    pub fifo_overflow: bool,
    /// The configured collection time has elapsed.
    pub time_over: bool,
}

/// Raw data formats a device may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoFormat {
    /// SPC-130/140/150-family standard FIFO records; the only format this
    /// pipeline decodes.
    Standard,
    /// FIFO-imaging mode records.
    Imaging,
    /// SPC-600/630 FIFO records.
    Spc600,
}

/// Static device parameters needed to set up processing.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Format of the raw words this source produces.
    pub fifo_format: FifoFormat,
    /// Duration of one macro-time unit, in tenths of nanoseconds.
    pub macro_time_units_tenth_ns: u32,
}

/// Error reported by a device source.
#[derive(Error, Debug)]
#[error("device error: {0}")]
pub struct DeviceError(pub String);

/// External collaborator supplying raw event words.
///
/// The core performs no hardware configuration; it only reads words up to
/// the buffer's remaining budget and observes the resulting state flags.
pub trait DeviceSource: Send {
    /// Static parameters of the source.
    fn info(&self) -> DeviceInfo;

    /// Fills `buffer` with up to [`EventBuffer::remaining`] words and
    /// returns the FIFO state after the read.
    fn read_words(&mut self, buffer: &mut EventBuffer) -> Result<FifoStatus, DeviceError>;
}

/// Active edge selection per marker input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerPolarity {
    #[default]
    Disabled,
    RisingEdge,
    FallingEdge,
}

/// How markers relate to scan geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelMappingMode {
    /// Line markers fire at line starts.
    LineStartMarkers,
    /// Line markers fire at line ends; the line delay is shifted back by one
    /// line span before the pixellator runs.
    LineEndMarkers,
    /// Pixel-clock addressing; reserved, not yet supported.
    PixelClockMarkers,
}

/// Scan region delivered by the host application.
#[derive(Debug, Clone, Copy)]
pub struct RegionOfInterest {
    /// Horizontal offset applied by the scan hardware.
    pub x_offset: u32,
    /// Vertical offset applied by the scan hardware.
    pub y_offset: u32,
    /// Pixels per line.
    pub width: u32,
    /// Lines per frame.
    pub height: u32,
}

/// Everything `start` needs to know about one acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Measurement title recorded in the output file.
    pub title: String,
    /// Frames to acquire before the pipeline finishes.
    pub max_frames: u32,
    /// Pixel clock rate of the scanner, in hertz.
    pub pixel_rate_hz: f64,
    /// Scan region.
    pub roi: RegionOfInterest,
    /// Active edge per marker input; also consumed by the device
    /// collaborator via [`AcquisitionConfig::enabled_marker_mask`].
    pub marker_polarities: [MarkerPolarity; NUM_MARKER_BITS as usize],
    /// Marker bit carrying the pixel clock, if wired. Reserved.
    pub pixel_marker_bit: Option<u32>,
    /// Marker bit carrying the line clock. Mandatory.
    pub line_marker_bit: Option<u32>,
    /// Marker bit carrying the frame clock, if wired.
    pub frame_marker_bit: Option<u32>,
    /// Offset from line marker to first pixel, in pixel units.
    pub line_delay_px: f64,
    /// Whether line markers anchor line starts or ends.
    pub pixel_mapping_mode: PixelMappingMode,
    /// Micro-time resolution of the stored histogram, `2^histo_bits` bins.
    pub histo_bits: u32,
    /// Measurement file to write, if any.
    pub sdt_path: Option<PathBuf>,
    /// Raw `.spc` stream tap to write, if any.
    pub raw_path: Option<PathBuf>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let mut marker_polarities = [MarkerPolarity::Disabled; NUM_MARKER_BITS as usize];
        marker_polarities[1] = MarkerPolarity::RisingEdge;
        Self {
            title: "spcflim".to_string(),
            max_frames: 1,
            pixel_rate_hz: 100_000.0,
            roi: RegionOfInterest {
                x_offset: 0,
                y_offset: 0,
                width: 256,
                height: 256,
            },
            marker_polarities,
            pixel_marker_bit: None,
            line_marker_bit: Some(1),
            frame_marker_bit: None,
            line_delay_px: 0.0,
            pixel_mapping_mode: PixelMappingMode::LineStartMarkers,
            histo_bits: 8,
            sdt_path: None,
            raw_path: None,
        }
    }
}

/// Configuration errors, detected at `start` before any data flows.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("marker bit {bit} assigned to more than one role")]
    DuplicateMarkerRole { bit: u32 },

    #[error("a line marker must be assigned to an enabled marker bit")]
    LineMarkerRequired,

    #[error("marker bit {bit} out of range for this device")]
    MarkerBitOutOfRange { bit: u32 },

    #[error("pixel mapping mode not supported")]
    UnsupportedPixelMapping,

    #[error("device data format not supported")]
    UnsupportedFifoFormat,

    #[error("scan region must have nonzero width and height")]
    EmptyRegion,

    #[error("histogram resolution of {bits} bits exceeds the device micro-time depth")]
    HistoBitsTooLarge { bits: u32 },

    #[error("pixel rate must resolve to at least one macro-time unit per pixel")]
    InvalidPixelRate,
}

impl AcquisitionConfig {
    /// Validates marker roles and geometry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let line_bit = self.line_marker_bit.ok_or(ConfigError::LineMarkerRequired)?;

        let mut used: u16 = 0;
        for bit in [Some(line_bit), self.pixel_marker_bit, self.frame_marker_bit]
            .into_iter()
            .flatten()
        {
            if bit >= NUM_MARKER_BITS {
                return Err(ConfigError::MarkerBitOutOfRange { bit });
            }
            let mask = 1 << bit;
            if used & mask != 0 {
                return Err(ConfigError::DuplicateMarkerRole { bit });
            }
            used |= mask;
        }

        if self.marker_polarities[line_bit as usize] == MarkerPolarity::Disabled {
            return Err(ConfigError::LineMarkerRequired);
        }
        if self.pixel_mapping_mode == PixelMappingMode::PixelClockMarkers {
            return Err(ConfigError::UnsupportedPixelMapping);
        }
        if self.roi.width == 0 || self.roi.height == 0 {
            return Err(ConfigError::EmptyRegion);
        }
        if self.histo_bits > MICROTIME_BITS {
            return Err(ConfigError::HistoBitsTooLarge {
                bits: self.histo_bits,
            });
        }
        if !(self.pixel_rate_hz > 0.0) {
            return Err(ConfigError::InvalidPixelRate);
        }
        Ok(())
    }

    /// Mask of marker inputs with an active edge configured; for the device
    /// collaborator.
    pub fn enabled_marker_mask(&self) -> u16 {
        self.marker_polarities
            .iter()
            .enumerate()
            .filter(|(_, p)| **p != MarkerPolarity::Disabled)
            .fold(0, |mask, (bit, _)| mask | (1 << bit))
    }

    /// Mask of marker inputs triggering on the rising edge; for the device
    /// collaborator.
    pub fn rising_edge_mask(&self) -> u16 {
        self.marker_polarities
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == MarkerPolarity::RisingEdge)
            .fold(0, |mask, (bit, _)| mask | (1 << bit))
    }
}

/// Converts a length in pixels to macro-time units.
pub fn pixels_to_macro_time(pixels: f64, pixel_rate_hz: f64, units_tenth_ns: u32) -> i64 {
    (1e10 * pixels / pixel_rate_hz / units_tenth_ns as f64).round() as i64
}

/// Errors surfaced by the lifecycle controller.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("acquisition already in progress")]
    AcquisitionInProgress,

    #[error("resource acquisition failed: {0}")]
    Resource(#[from] std::io::Error),

    #[error("acquisition finished with errors: {}", .0.join("; "))]
    Processing(Vec<String>),
}

struct ActiveAcquisition {
    stop: StopSignal,
    producer: JoinHandle<()>,
    pump: JoinHandle<()>,
    completion: Arc<AcquisitionCompletion>,
}

impl ActiveAcquisition {
    fn is_finished(&self) -> bool {
        self.producer.is_finished() && self.pump.is_finished()
    }
}

/// Owns one acquisition at a time: wiring, threads, and teardown.
#[derive(Default)]
pub struct AcquisitionController {
    active: Option<ActiveAcquisition>,
}

impl AcquisitionController {
    /// Creates an idle controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration, builds the pipeline, and launches the
    /// producer and consumer-pump threads. Returns immediately.
    ///
    /// `frame_callback` receives one intensity frame per completed frame,
    /// synchronously, before the next frame begins accumulating.
    ///
    /// Fails with [`AcquisitionError::AcquisitionInProgress`] while a prior
    /// acquisition is still running; a finished but unjoined acquisition is
    /// torn down first.
    pub fn start(
        &mut self,
        config: &AcquisitionConfig,
        source: Box<dyn DeviceSource>,
        frame_callback: Box<dyn FnMut(&Histogram) + Send>,
    ) -> Result<(), AcquisitionError> {
        if let Some(active) = &self.active {
            if !active.is_finished() {
                return Err(AcquisitionError::AcquisitionInProgress);
            }
        }
        if self.active.is_some() {
            // Prior run finished but was never waited on.
            let _ = self.wait();
        }

        config.validate()?;
        let info = source.info();
        if info.fifo_format != FifoFormat::Standard {
            return Err(ConfigError::UnsupportedFifoFormat.into());
        }

        let width = config.roi.width;
        let height = config.roi.height;
        let units = info.macro_time_units_tenth_ns;
        let pixel_time = pixels_to_macro_time(1.0, config.pixel_rate_hz, units);
        if pixel_time < 1 {
            return Err(ConfigError::InvalidPixelRate.into());
        }
        let mut line_delay = pixels_to_macro_time(config.line_delay_px, config.pixel_rate_hz, units);
        if config.pixel_mapping_mode == PixelMappingMode::LineEndMarkers {
            line_delay -= width as i64 * pixel_time;
        }
        let line_marker_bit = config.line_marker_bit.ok_or(ConfigError::LineMarkerRequired)?;

        let completion = Arc::new(AcquisitionCompletion::new());
        let stop = StopSignal::new();

        // The BH ADC ramps down; store histograms with the time axis
        // reversed so that bin order matches physical arrival time.
        let reverse_time = true;

        // Build the processing graph starting at its downstream end.
        let intensity_sink = FrameCallbackSink::new(
            frame_callback,
            Some(CompletionHandle::new(
                Arc::clone(&completion),
                "IntensityImage",
            )),
        );
        let intensity_branch = Histogrammer::with_sink(
            Histogram::for_device(0, reverse_time, width, height),
            Box::new(intensity_sink),
        );
        let mut branches: Vec<Box<dyn PixelPhotonSink>> = vec![Box::new(intensity_branch)];

        if let Some(path) = &config.sdt_path {
            let now = chrono::Local::now();
            let metadata = SdtMetadata {
                title: config.title.clone(),
                date: now.format("%m:%d:%Y").to_string(),
                time: now.format("%H:%M:%S").to_string(),
                serial_number: String::new(),
                module_type: "SPC-150".to_string(),
                module_type_code: 150,
                pixel_time_s: pixel_time as f64 * units as f64 * 1e-10,
                collect_time_s: 0.0,
            };
            let writer = SdtFileWriter::create(path, metadata)?;
            let file_sink = FileHistogramSink::new(
                writer,
                Some(CompletionHandle::new(
                    Arc::clone(&completion),
                    "HistogramFile",
                )),
            );
            branches.push(Box::new(Histogrammer::with_sink(
                Histogram::for_device(config.histo_bits, reverse_time, width, height),
                Box::new(file_sink),
            )));
        }

        let pixellator = LineClockPixellator::new(
            PixellatorConfig {
                width,
                height,
                max_frames: config.max_frames,
                line_delay,
                pixel_time: pixel_time as u64,
                line_marker_bit,
                frame_marker_bit: config.frame_marker_bit,
            },
            Box::new(BroadcastPixelPhotonSink::new(branches)),
            Some(stop.clone()),
        );
        let decoder = SpcEventDecoder::new(Box::new(pixellator));

        let mut processors: Vec<Box<dyn DeviceEventSink>> = vec![Box::new(decoder)];
        if let Some(path) = &config.raw_path {
            processors.push(Box::new(RawStreamWriter::create(
                path,
                Some(CompletionHandle::new(Arc::clone(&completion), "RawStream")),
            )?));
        }

        let pool = EventBufferPool::new(DEFAULT_POOL_BUFFERS, DEFAULT_BUFFER_CAPACITY_WORDS);
        let (stream_tx, stream_rx) = event_stream(DEFAULT_POOL_BUFFERS);

        tracing::info!(
            width,
            height,
            max_frames = config.max_frames,
            pixel_time,
            line_delay,
            "starting acquisition"
        );

        let producer = thread::Builder::new().name("spc-producer".into()).spawn({
            let stop = stop.clone();
            move || run_producer(source, pool, stream_tx, stop)
        })?;
        let pump = thread::Builder::new().name("spc-pump".into()).spawn({
            let stop = stop.clone();
            move || run_pump(stream_rx, processors, stop)
        })?;

        self.active = Some(ActiveAcquisition {
            stop,
            producer,
            pump,
            completion,
        });
        Ok(())
    }

    /// Requests cooperative stop. Idempotent; a no-op on an idle or
    /// torn-down controller.
    pub fn stop(&self) {
        if let Some(active) = &self.active {
            active.stop.request();
        }
    }

    /// True until both the producer and the consumer pump have completed.
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.is_finished())
    }

    /// Blocks until the acquisition has fully finished, then tears it down.
    ///
    /// Returns the errors any sink reported. A no-op after teardown. Must
    /// not be called from within a sink callback.
    pub fn wait(&mut self) -> Result<(), AcquisitionError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        if active.producer.join().is_err() {
            tracing::error!("producer thread panicked");
        }
        if active.pump.join().is_err() {
            tracing::error!("consumer pump thread panicked");
        }
        active.completion.wait_drained();
        let errors = active.completion.errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AcquisitionError::Processing(errors))
        }
    }
}

/// Producer: drains the device source into pooled buffers and sends them
/// downstream, observing the stop signal between reads.
fn run_producer(
    mut source: Box<dyn DeviceSource>,
    pool: EventBufferPool,
    mut stream: EventStreamSender,
    stop: StopSignal,
) {
    loop {
        if stop.is_requested() {
            tracing::debug!("producer observed stop request");
            break;
        }
        let mut buffer = pool.acquire();
        let status = match source.read_words(&mut buffer) {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(error = %err, "device read failed");
                break;
            }
        };
        if status.fifo_overflow {
            tracing::warn!("device FIFO overflow, events were lost");
        }
        if !buffer.is_empty() && stream.send(buffer).is_err() {
            tracing::debug!("consumer gone, producer stopping");
            break;
        }
        if status.time_over {
            tracing::debug!("collection time over");
            break;
        }
        if !status.armed && status.fifo_empty {
            break;
        }
        if status.fifo_empty {
            thread::sleep(Duration::from_millis(1));
        }
    }
    stream.close();
    tracing::debug!("producer finished");
}

/// Consumer pump: drives buffers through every attached processor in raw
/// word order on a single thread.
fn run_pump(mut stream: EventStream, mut processors: Vec<Box<dyn DeviceEventSink>>, stop: StopSignal) {
    loop {
        match stream.receive_blocking() {
            Some(buffer) => {
                let mut failure = None;
                for processor in processors.iter_mut() {
                    if let Err(err) = processor.handle_words(buffer.words()) {
                        failure = Some(err.to_string());
                        break;
                    }
                }
                if let Some(message) = failure {
                    for processor in processors.iter_mut() {
                        processor.handle_error(&message);
                    }
                    stop.request();
                    break;
                }
            }
            None => {
                for processor in processors.iter_mut() {
                    processor.handle_finish();
                }
                break;
            }
        }
    }
    tracing::debug!("consumer pump finished");
}
