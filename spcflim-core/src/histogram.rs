//! Per-frame and cumulative FLIM histogram accumulation.
//!
//! A [`Histogrammer`] bins pixel photons into a frame histogram; on each
//! frame boundary the frame is handed to a [`HistogramAccumulator`], which
//! adds it element-wise into the cumulative histogram and forwards the frame
//! to its [`HistogramSink`] for live display. On stream finish the
//! accumulator delivers the cumulative histogram downstream exactly once.
//!
//! [`BroadcastPixelPhotonSink`] fans one pixel-photon stream out to several
//! independent branches (typically a zero-bin intensity branch and a full
//! micro-time-resolution file branch); a failing branch is detached without
//! stopping the others.

use crate::acquisition::CompletionHandle;
use crate::parser::MICROTIME_BITS;
use crate::types::{PixelPhotonEvent, PixelPhotonSink, SinkError};

/// Dense photon-count histogram indexed by `[line][pixel][microtime bin]`.
///
/// Counts saturate rather than wrap. The number of bins per pixel is
/// `2^histo_bits`; `histo_bits = 0` yields a plain intensity image. The time
/// axis may be reversed, matching TCSPC electronics whose ADC ramps down.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    histo_bits: u32,
    input_bits: u32,
    reverse_time: bool,
    width: u32,
    height: u32,
    counts: Vec<u16>,
}

impl Histogram {
    /// Creates an all-zero histogram.
    ///
    /// # Panics
    ///
    /// Panics if `histo_bits` exceeds `input_bits`.
    pub fn new(histo_bits: u32, input_bits: u32, reverse_time: bool, width: u32, height: u32) -> Self {
        assert!(
            histo_bits <= input_bits,
            "histo_bits ({histo_bits}) exceeds input_bits ({input_bits})"
        );
        let bins = 1usize << histo_bits;
        Self {
            histo_bits,
            input_bits,
            reverse_time,
            width,
            height,
            counts: vec![0; width as usize * height as usize * bins],
        }
    }

    /// Creates a histogram over the full 12-bit device micro-time range.
    pub fn for_device(histo_bits: u32, reverse_time: bool, width: u32, height: u32) -> Self {
        Self::new(histo_bits, MICROTIME_BITS, reverse_time, width, height)
    }

    /// Pixels per line.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Lines per frame.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Micro-time bins per pixel.
    pub fn bins_per_pixel(&self) -> usize {
        1 << self.histo_bits
    }

    /// The raw counts, `[line][pixel][bin]` row-major.
    pub fn counts(&self) -> &[u16] {
        &self.counts
    }

    /// Sum of all counts.
    pub fn total_count(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Sum of one pixel's bins.
    pub fn pixel_count(&self, line: u32, pixel: u32) -> u64 {
        let bins = self.bins_per_pixel();
        let base = (line as usize * self.width as usize + pixel as usize) * bins;
        self.counts[base..base + bins].iter().map(|&c| c as u64).sum()
    }

    /// Maps a raw micro-time to its bin index.
    #[inline]
    fn bin_of(&self, microtime: u16) -> usize {
        let bin = (microtime >> (self.input_bits - self.histo_bits)) as usize;
        if self.reverse_time {
            self.bins_per_pixel() - 1 - bin
        } else {
            bin
        }
    }

    /// Adds one photon.
    #[inline]
    pub fn increment(&mut self, line: u32, pixel: u32, microtime: u16) {
        debug_assert!(line < self.height && pixel < self.width);
        let bins = self.bins_per_pixel();
        let index =
            (line as usize * self.width as usize + pixel as usize) * bins + self.bin_of(microtime);
        self.counts[index] = self.counts[index].saturating_add(1);
    }

    /// Resets all counts to zero.
    pub fn clear(&mut self) {
        self.counts.fill(0);
    }

    /// Adds another histogram of identical shape, element-wise, saturating.
    pub fn add(&mut self, other: &Histogram) {
        debug_assert_eq!(self.counts.len(), other.counts.len());
        for (dst, &src) in self.counts.iter_mut().zip(other.counts.iter()) {
            *dst = dst.saturating_add(src);
        }
    }
}

/// Terminal consumer of completed frame histograms and the final cumulative
/// histogram of one pipeline branch.
pub trait HistogramSink: Send {
    /// One completed frame, delivered synchronously before the next frame
    /// begins accumulating.
    fn handle_frame(&mut self, frame: &Histogram) -> Result<(), SinkError>;

    /// The cumulative histogram of the whole acquisition; delivered exactly
    /// once. `frame_complete` is false when the stream ended mid-frame.
    fn handle_finish(&mut self, cumulative: Histogram, frame_complete: bool)
        -> Result<(), SinkError>;

    /// The pipeline failed; no further calls follow.
    fn handle_error(&mut self, message: &str);
}

/// Accumulates frame histograms into a cumulative histogram and forwards
/// each frame downstream.
pub struct HistogramAccumulator {
    cumulative: Histogram,
    downstream: Option<Box<dyn HistogramSink>>,
}

impl HistogramAccumulator {
    /// Creates an accumulator over an all-zero cumulative histogram.
    pub fn new(cumulative: Histogram, downstream: Box<dyn HistogramSink>) -> Self {
        Self {
            cumulative,
            downstream: Some(downstream),
        }
    }

    fn handle_frame(&mut self, frame: &Histogram) -> Result<(), SinkError> {
        match &mut self.downstream {
            Some(downstream) => {
                self.cumulative.add(frame);
                downstream.handle_frame(frame)
            }
            None => Ok(()),
        }
    }

    fn handle_finish(&mut self, frame_complete: bool) -> Result<(), SinkError> {
        match self.downstream.take() {
            Some(mut downstream) => {
                let cumulative = std::mem::take(&mut self.cumulative);
                downstream.handle_finish(cumulative, frame_complete)
            }
            None => Ok(()),
        }
    }

    fn handle_error(&mut self, message: &str) {
        if let Some(mut downstream) = self.downstream.take() {
            downstream.handle_error(message);
        }
    }
}

/// Bins pixel photons into a per-frame histogram and hands each completed
/// frame to its accumulator.
pub struct Histogrammer {
    frame: Histogram,
    accumulator: HistogramAccumulator,
    frame_in_progress: bool,
    finished: bool,
}

impl Histogrammer {
    /// Creates a histogrammer; `frame` supplies the shape of every frame
    /// histogram of this branch.
    pub fn new(frame: Histogram, accumulator: HistogramAccumulator) -> Self {
        Self {
            frame,
            accumulator,
            frame_in_progress: false,
            finished: false,
        }
    }

    /// Builds the standard branch: frame histogram -> accumulator -> sink,
    /// with frame and cumulative histograms of identical shape.
    pub fn with_sink(shape: Histogram, sink: Box<dyn HistogramSink>) -> Self {
        let cumulative = shape.clone();
        Self::new(shape, HistogramAccumulator::new(cumulative, sink))
    }
}

impl PixelPhotonSink for Histogrammer {
    fn begin_frame(&mut self) -> Result<(), SinkError> {
        self.frame.clear();
        self.frame_in_progress = true;
        Ok(())
    }

    fn handle_photon(&mut self, photon: PixelPhotonEvent) -> Result<(), SinkError> {
        self.frame.increment(photon.line, photon.pixel, photon.microtime);
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), SinkError> {
        self.frame_in_progress = false;
        self.accumulator.handle_frame(&self.frame)
    }

    fn handle_error(&mut self, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.accumulator.handle_error(message);
    }

    fn handle_finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(err) = self.accumulator.handle_finish(!self.frame_in_progress) {
            tracing::warn!(error = %err, "histogram delivery failed at finish");
        }
    }
}

/// Fans one pixel-photon stream out to independent branches.
///
/// A branch whose call fails is notified of the error and detached; the
/// remaining branches keep receiving events.
pub struct BroadcastPixelPhotonSink {
    branches: Vec<Box<dyn PixelPhotonSink>>,
}

impl BroadcastPixelPhotonSink {
    /// Creates a broadcast stage over the given branches.
    pub fn new(branches: Vec<Box<dyn PixelPhotonSink>>) -> Self {
        Self { branches }
    }

    /// Number of branches still attached.
    pub fn attached(&self) -> usize {
        self.branches.len()
    }

    fn dispatch(
        &mut self,
        mut call: impl FnMut(&mut dyn PixelPhotonSink) -> Result<(), SinkError>,
    ) {
        let mut index = 0;
        while index < self.branches.len() {
            match call(self.branches[index].as_mut()) {
                Ok(()) => index += 1,
                Err(err) => {
                    let message = err.to_string();
                    tracing::warn!(error = %message, "detaching failed histogram branch");
                    let mut branch = self.branches.remove(index);
                    branch.handle_error(&message);
                }
            }
        }
    }
}

impl PixelPhotonSink for BroadcastPixelPhotonSink {
    fn begin_frame(&mut self) -> Result<(), SinkError> {
        self.dispatch(|branch| branch.begin_frame());
        Ok(())
    }

    fn handle_photon(&mut self, photon: PixelPhotonEvent) -> Result<(), SinkError> {
        self.dispatch(|branch| branch.handle_photon(photon));
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), SinkError> {
        self.dispatch(|branch| branch.end_frame());
        Ok(())
    }

    fn handle_error(&mut self, message: &str) {
        for branch in &mut self.branches {
            branch.handle_error(message);
        }
        self.branches.clear();
    }

    fn handle_finish(&mut self) {
        for branch in &mut self.branches {
            branch.handle_finish();
        }
        self.branches.clear();
    }
}

/// Live-display terminal sink: invokes a callback with each completed frame.
///
/// The intensity branch of an acquisition uses this with a zero-bin
/// histogram shape; at finish it only reports completion (the display has
/// already seen every frame).
pub struct FrameCallbackSink {
    callback: Box<dyn FnMut(&Histogram) + Send>,
    completion: Option<CompletionHandle>,
}

impl FrameCallbackSink {
    /// Creates a sink invoking `callback` once per completed frame.
    pub fn new(
        callback: Box<dyn FnMut(&Histogram) + Send>,
        completion: Option<CompletionHandle>,
    ) -> Self {
        Self {
            callback,
            completion,
        }
    }
}

impl HistogramSink for FrameCallbackSink {
    fn handle_frame(&mut self, frame: &Histogram) -> Result<(), SinkError> {
        (self.callback)(frame);
        Ok(())
    }

    fn handle_finish(
        &mut self,
        _cumulative: Histogram,
        _frame_complete: bool,
    ) -> Result<(), SinkError> {
        if let Some(handle) = self.completion.take() {
            handle.complete();
        }
        Ok(())
    }

    fn handle_error(&mut self, message: &str) {
        if let Some(handle) = self.completion.take() {
            handle.error(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_bin_mapping() {
        let mut h = Histogram::new(8, 12, false, 2, 1);
        h.increment(0, 0, 0x010); // bin 1
        h.increment(0, 0, 0x01F); // bin 1
        h.increment(0, 1, 0xFFF); // bin 255
        assert_eq!(h.counts()[1], 2);
        assert_eq!(h.counts()[256 + 255], 1);
        assert_eq!(h.total_count(), 3);
        assert_eq!(h.pixel_count(0, 0), 2);
        assert_eq!(h.pixel_count(0, 1), 1);
    }

    #[test]
    fn test_reversed_time_axis() {
        let mut h = Histogram::new(8, 12, true, 1, 1);
        h.increment(0, 0, 0x000);
        assert_eq!(h.counts()[255], 1);
        h.increment(0, 0, 0xFFF);
        assert_eq!(h.counts()[0], 1);
    }

    #[test]
    fn test_intensity_histogram_has_one_bin() {
        let mut h = Histogram::new(0, 12, true, 2, 2);
        assert_eq!(h.bins_per_pixel(), 1);
        h.increment(1, 1, 0xABC);
        assert_eq!(h.pixel_count(1, 1), 1);
        assert_eq!(h.total_count(), 1);
    }

    #[test]
    fn test_add_saturates() {
        let mut a = Histogram::new(0, 12, false, 1, 1);
        let mut b = Histogram::new(0, 12, false, 1, 1);
        a.counts[0] = u16::MAX - 1;
        b.counts[0] = 5;
        a.add(&b);
        assert_eq!(a.counts()[0], u16::MAX);
    }

    /// Sink recording frame totals and the final cumulative histogram.
    struct RecordingSink {
        frames: Arc<Mutex<Vec<u64>>>,
        finish: Arc<Mutex<Option<(u64, bool)>>>,
        fail_frames: bool,
    }

    impl HistogramSink for RecordingSink {
        fn handle_frame(&mut self, frame: &Histogram) -> Result<(), SinkError> {
            if self.fail_frames {
                return Err(SinkError::Failed("sink rejected frame".into()));
            }
            self.frames.lock().unwrap().push(frame.total_count());
            Ok(())
        }
        fn handle_finish(
            &mut self,
            cumulative: Histogram,
            frame_complete: bool,
        ) -> Result<(), SinkError> {
            *self.finish.lock().unwrap() = Some((cumulative.total_count(), frame_complete));
            Ok(())
        }
        fn handle_error(&mut self, _message: &str) {}
    }

    fn photon(line: u32, pixel: u32) -> PixelPhotonEvent {
        PixelPhotonEvent {
            frame: 0,
            line,
            pixel,
            microtime: 0,
            route: 0,
        }
    }

    #[test]
    fn test_cumulative_equals_sum_of_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let finish = Arc::new(Mutex::new(None));
        let sink = RecordingSink {
            frames: Arc::clone(&frames),
            finish: Arc::clone(&finish),
            fail_frames: false,
        };
        let mut histogrammer =
            Histogrammer::with_sink(Histogram::new(4, 12, false, 2, 2), Box::new(sink));

        for frame in 0..3 {
            histogrammer.begin_frame().unwrap();
            for _ in 0..=frame {
                histogrammer.handle_photon(photon(0, 0)).unwrap();
            }
            histogrammer.end_frame().unwrap();
        }
        histogrammer.handle_finish();

        assert_eq!(*frames.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*finish.lock().unwrap(), Some((6, true)));
    }

    #[test]
    fn test_incomplete_final_frame_is_flagged() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let finish = Arc::new(Mutex::new(None));
        let sink = RecordingSink {
            frames: Arc::clone(&frames),
            finish: Arc::clone(&finish),
            fail_frames: false,
        };
        let mut histogrammer =
            Histogrammer::with_sink(Histogram::new(0, 12, false, 2, 2), Box::new(sink));

        histogrammer.begin_frame().unwrap();
        histogrammer.handle_photon(photon(1, 1)).unwrap();
        histogrammer.handle_finish();

        // The open frame was never accumulated.
        assert_eq!(*finish.lock().unwrap(), Some((0, false)));
    }

    #[test]
    fn test_broadcast_isolates_failing_branch() {
        let good_frames = Arc::new(Mutex::new(Vec::new()));
        let good_finish = Arc::new(Mutex::new(None));
        let good = RecordingSink {
            frames: Arc::clone(&good_frames),
            finish: Arc::clone(&good_finish),
            fail_frames: false,
        };
        let bad = RecordingSink {
            frames: Arc::new(Mutex::new(Vec::new())),
            finish: Arc::new(Mutex::new(None)),
            fail_frames: true,
        };

        let shape = Histogram::new(0, 12, false, 1, 1);
        let mut broadcast = BroadcastPixelPhotonSink::new(vec![
            Box::new(Histogrammer::with_sink(shape.clone(), Box::new(bad))),
            Box::new(Histogrammer::with_sink(shape, Box::new(good))),
        ]);
        assert_eq!(broadcast.attached(), 2);

        broadcast.begin_frame().unwrap();
        broadcast.handle_photon(photon(0, 0)).unwrap();
        broadcast.end_frame().unwrap(); // failing branch detaches here
        assert_eq!(broadcast.attached(), 1);

        broadcast.begin_frame().unwrap();
        broadcast.handle_photon(photon(0, 0)).unwrap();
        broadcast.end_frame().unwrap();
        broadcast.handle_finish();

        assert_eq!(*good_frames.lock().unwrap(), vec![1, 1]);
        assert_eq!(*good_finish.lock().unwrap(), Some((2, true)));
    }
}
