//! Raw SPC stream replay tool.
//!
//! Replays a recorded `.spc` raw word stream through the full acquisition
//! pipeline and writes the resulting FLIM measurement file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use spcflim_core::{
    AcquisitionConfig, AcquisitionController, DeviceError, DeviceInfo, DeviceSource, EventBuffer,
    FifoFormat, FifoStatus, MarkerPolarity, PixelMappingMode, RegionOfInterest,
};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Raw SPC photon stream replayer.
///
/// Feeds a recorded raw FIFO word stream (as written by the acquisition's
/// raw tap) through decoding, pixellation, and histogramming, and writes a
/// self-contained .sdt measurement file.
#[derive(Parser, Debug)]
#[command(name = "spcflim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input raw .spc word stream
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output .sdt measurement file
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Pixels per line
    #[arg(long, default_value_t = 256)]
    width: u32,

    /// Lines per frame
    #[arg(long, default_value_t = 256)]
    height: u32,

    /// Frames to accumulate before finishing
    #[arg(short, long, default_value_t = 1)]
    frames: u32,

    /// Scanner pixel clock rate in Hz
    #[arg(long, default_value_t = 100_000.0)]
    pixel_rate: f64,

    /// Macro-time unit of the recording, in tenths of nanoseconds
    #[arg(long, default_value_t = 250)]
    macrotime_units: u32,

    /// Marker bit carrying the line clock
    #[arg(long, default_value_t = 1)]
    line_marker_bit: u32,

    /// Marker bit carrying the frame clock, if the recording has one
    #[arg(long)]
    frame_marker_bit: Option<u32>,

    /// Offset from line marker to first pixel, in pixels
    #[arg(long, default_value_t = 0.0)]
    line_delay: f64,

    /// Line markers were recorded at line ends rather than line starts
    #[arg(long)]
    line_end_markers: bool,

    /// Micro-time resolution of the stored histogram (2^bits bins)
    #[arg(long, default_value_t = 8)]
    histo_bits: u32,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

/// Device source reading raw words from a recorded file.
struct FileSource {
    reader: BufReader<File>,
    macrotime_units: u32,
    exhausted: bool,
}

impl FileSource {
    fn open(path: &PathBuf, macrotime_units: u32) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
            macrotime_units,
            exhausted: false,
        })
    }
}

impl DeviceSource for FileSource {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            fifo_format: FifoFormat::Standard,
            macro_time_units_tenth_ns: self.macrotime_units,
        }
    }

    fn read_words(&mut self, buffer: &mut EventBuffer) -> Result<FifoStatus, DeviceError> {
        let mut word = [0u8; 4];
        let mut budget = buffer.remaining();
        while budget > 0 && !self.exhausted {
            match self.reader.read(&mut word) {
                Ok(0) => self.exhausted = true,
                Ok(4) => {
                    buffer.push(u32::from_le_bytes(word));
                    budget -= 1;
                }
                Ok(n) => {
                    // Trailing partial word: fill it out or fail.
                    self.reader
                        .read_exact(&mut word[n..])
                        .map_err(|_| DeviceError("truncated record at end of file".into()))?;
                    buffer.push(u32::from_le_bytes(word));
                    budget -= 1;
                }
                Err(err) => return Err(DeviceError(err.to_string())),
            }
        }
        Ok(FifoStatus {
            armed: !self.exhausted,
            fifo_empty: self.exhausted,
            fifo_overflow: false,
            time_over: false,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let input_bytes = std::fs::metadata(&args.input)
        .with_context(|| format!("cannot read {}", args.input.display()))?
        .len();
    if input_bytes % 4 != 0 {
        bail!(
            "{} is not a raw SPC stream: length {} is not a whole number of records",
            args.input.display(),
            input_bytes
        );
    }
    let total_words = input_bytes / 4;

    let mut marker_polarities = [MarkerPolarity::Disabled; 4];
    *marker_polarities
        .get_mut(args.line_marker_bit as usize)
        .context("line marker bit out of range")? = MarkerPolarity::RisingEdge;
    if let Some(bit) = args.frame_marker_bit {
        *marker_polarities
            .get_mut(bit as usize)
            .context("frame marker bit out of range")? = MarkerPolarity::RisingEdge;
    }

    let title = args
        .output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("spcflim")
        .to_string();

    let config = AcquisitionConfig {
        title,
        max_frames: args.frames,
        pixel_rate_hz: args.pixel_rate,
        roi: RegionOfInterest {
            x_offset: 0,
            y_offset: 0,
            width: args.width,
            height: args.height,
        },
        marker_polarities,
        pixel_marker_bit: None,
        line_marker_bit: Some(args.line_marker_bit),
        frame_marker_bit: args.frame_marker_bit,
        line_delay_px: args.line_delay,
        pixel_mapping_mode: if args.line_end_markers {
            PixelMappingMode::LineEndMarkers
        } else {
            PixelMappingMode::LineStartMarkers
        },
        histo_bits: args.histo_bits,
        sdt_path: Some(args.output.clone()),
        raw_path: None,
    };

    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.set_message("Replaying...");
        pb
    };

    let frames_done = Arc::new(AtomicU64::new(0));
    let photons_seen = Arc::new(AtomicU64::new(0));
    let frame_callback = {
        let progress = progress.clone();
        let frames_done = Arc::clone(&frames_done);
        let photons_seen = Arc::clone(&photons_seen);
        move |frame: &spcflim_core::Histogram| {
            let frames = frames_done.fetch_add(1, Ordering::Relaxed) + 1;
            let photons = photons_seen.fetch_add(frame.total_count(), Ordering::Relaxed)
                + frame.total_count();
            progress.set_message(format!("Frame {frames}: {photons} photons total"));
        }
    };

    let source = FileSource::open(&args.input, args.macrotime_units)?;

    let start_time = Instant::now();
    let mut controller = AcquisitionController::new();
    controller
        .start(&config, Box::new(source), Box::new(frame_callback))
        .context("failed to start replay")?;
    controller.wait().context("replay failed")?;
    let duration = start_time.elapsed();

    let frames = frames_done.load(Ordering::Relaxed);
    let photons = photons_seen.load(Ordering::Relaxed);

    progress.finish_with_message(format!(
        "Done! {frames} frames, {photons} photons in {:.2}s",
        duration.as_secs_f64()
    ));

    if !args.quiet {
        let words_per_sec = total_words as f64 / duration.as_secs_f64();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Records:      {total_words}");
        eprintln!("  Frames:       {frames}");
        eprintln!("  Photons:      {photons}");
        eprintln!("  Geometry:     {}x{}", args.width, args.height);
        eprintln!("  Duration:     {:.3}s", duration.as_secs_f64());
        eprintln!("  Throughput:   {words_per_sec:.0} records/s");
    }

    Ok(())
}
