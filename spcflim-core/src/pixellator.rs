//! Line-clock pixellator: maps decoded events onto scan geometry.
//!
//! A timing state machine that consumes the monotonic decoded event sequence
//! and the configured marker roles, and emits pixel-addressed photons plus
//! frame boundaries. A line marker establishes the start-of-line macro-time;
//! pixel `k` of that line spans
//! `[line_start + line_delay + k * pixel_time, … + (k+1) * pixel_time)`.
//!
//! `line_delay` may be negative (markers issued at line ends rather than line
//! starts; the lifecycle controller subtracts the line span beforehand), so a
//! line's window can open *before* its marker is seen. Photons and markers
//! are therefore queued and resolved against the latest observed macro-time:
//! a photon is emitted only once its line assignment is certain, and a line
//! closes only once time has provably passed its window.

use crate::acquisition::StopSignal;
use crate::types::{DecodedEvent, DecodedEventSink, PixelPhotonEvent, PixelPhotonSink, SinkError};
use std::collections::VecDeque;

/// Geometry and marker-role parameters for one acquisition, in macro-time
/// units. Validated by the lifecycle controller before any data flows.
#[derive(Debug, Clone)]
pub struct PixellatorConfig {
    /// Pixels per line.
    pub width: u32,
    /// Lines per frame.
    pub height: u32,
    /// Frames after which the pipeline reports finish.
    pub max_frames: u32,
    /// Offset from a line marker to the first pixel boundary; negative when
    /// markers anchor line ends.
    pub line_delay: i64,
    /// Dwell time per pixel.
    pub pixel_time: u64,
    /// Marker bit index carrying the line clock.
    pub line_marker_bit: u32,
    /// Marker bit index carrying the frame clock, if any; with no frame
    /// marker, frames close after `height` lines.
    pub frame_marker_bit: Option<u32>,
}

impl PixellatorConfig {
    fn line_span(&self) -> u64 {
        self.width as u64 * self.pixel_time
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingPhoton {
    macrotime: u64,
    microtime: u16,
    route: u16,
}

#[derive(Debug, Clone, Copy)]
enum PendingMarker {
    LineStart(u64),
    FrameEnd,
}

/// Pixel window of the line currently accumulating, in signed macro-time
/// (negative starts arise from negative line delays near time zero).
#[derive(Debug, Clone, Copy)]
struct LineWindow {
    start: i128,
    end: i128,
}

/// Timing state machine turning decoded events into pixel photons and frame
/// boundaries.
pub struct LineClockPixellator {
    config: PixellatorConfig,
    line_marker_mask: u16,
    frame_marker_mask: u16,

    latest_timestamp: u64,
    pending_photons: VecDeque<PendingPhoton>,
    pending_markers: VecDeque<PendingMarker>,
    current_line: Option<LineWindow>,

    /// Lines already closed in the current frame.
    line_index: u32,
    /// Frames already closed.
    frame_index: u32,
    frame_open: bool,
    finished: bool,

    downstream: Box<dyn PixelPhotonSink>,
    stop: Option<StopSignal>,
}

impl LineClockPixellator {
    /// Creates a pixellator feeding the given downstream sink.
    ///
    /// When `stop` is provided, reaching the frame limit requests acquisition
    /// stop (pipeline-initiated, absorbed if someone else stopped first).
    pub fn new(
        config: PixellatorConfig,
        downstream: Box<dyn PixelPhotonSink>,
        stop: Option<StopSignal>,
    ) -> Self {
        let line_marker_mask = 1 << config.line_marker_bit;
        let frame_marker_mask = config.frame_marker_bit.map_or(0, |bit| 1 << bit);
        Self {
            config,
            line_marker_mask,
            frame_marker_mask,
            latest_timestamp: 0,
            pending_photons: VecDeque::new(),
            pending_markers: VecDeque::new(),
            current_line: None,
            line_index: 0,
            frame_index: 0,
            frame_open: false,
            finished: false,
            downstream,
            stop,
        }
    }

    /// Frames completed so far.
    pub fn frames_completed(&self) -> u32 {
        self.frame_index
    }

    fn window_of(&self, marker_time: u64) -> LineWindow {
        let start = marker_time as i128 + self.config.line_delay as i128;
        LineWindow {
            start,
            end: start + self.config.line_span() as i128,
        }
    }

    /// Resolves queued photons and markers as far as the latest observed
    /// macro-time allows.
    fn process(&mut self) -> Result<(), SinkError> {
        loop {
            if self.finished {
                self.pending_photons.clear();
                self.pending_markers.clear();
                return Ok(());
            }

            match self.current_line {
                Some(window) => {
                    self.assign_photons(window)?;
                    // The line can only close once time has provably passed
                    // its window; otherwise wait for more events.
                    if self.latest_timestamp as i128 >= window.end {
                        self.close_line()?;
                        continue;
                    }
                    return Ok(());
                }
                None => match self.pending_markers.pop_front() {
                    Some(PendingMarker::LineStart(marker_time)) => {
                        if !self.frame_open {
                            self.downstream.begin_frame()?;
                            self.frame_open = true;
                        }
                        self.current_line = Some(self.window_of(marker_time));
                    }
                    Some(PendingMarker::FrameEnd) => {
                        self.close_frame()?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Emits or discards queued photons decidable within the open window.
    fn assign_photons(&mut self, window: LineWindow) -> Result<(), SinkError> {
        while let Some(&photon) = self.pending_photons.front() {
            let t = photon.macrotime as i128;
            if t < window.start {
                // Between windows; discarded without error.
                self.pending_photons.pop_front();
            } else if t < window.end {
                self.pending_photons.pop_front();
                // Lines beyond the configured height keep consuming time but
                // contribute no pixels.
                if self.line_index < self.config.height {
                    let pixel = ((t - window.start) / self.config.pixel_time as i128) as u32;
                    self.downstream.handle_photon(PixelPhotonEvent {
                        frame: self.frame_index,
                        line: self.line_index,
                        pixel,
                        microtime: photon.microtime,
                        route: photon.route,
                    })?;
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn close_line(&mut self) -> Result<(), SinkError> {
        self.current_line = None;
        self.line_index += 1;
        if self.frame_marker_mask == 0 && self.line_index >= self.config.height {
            self.close_frame()?;
        }
        Ok(())
    }

    fn close_frame(&mut self) -> Result<(), SinkError> {
        if !self.frame_open {
            return Ok(());
        }
        self.downstream.end_frame()?;
        self.frame_open = false;
        self.line_index = 0;
        self.frame_index += 1;
        if self.frame_index >= self.config.max_frames {
            self.finish_pipeline();
        }
        Ok(())
    }

    /// Reports finish downstream exactly once and requests acquisition stop.
    fn finish_pipeline(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.pending_photons.clear();
        self.pending_markers.clear();
        self.downstream.handle_finish();
        if let Some(stop) = &self.stop {
            stop.request();
        }
    }
}

impl DecodedEventSink for LineClockPixellator {
    fn handle_event(&mut self, event: DecodedEvent) -> Result<(), SinkError> {
        if self.finished {
            // Past the frame limit; remaining events are ignored.
            return Ok(());
        }

        self.latest_timestamp = self.latest_timestamp.max(event.macrotime());

        match event {
            DecodedEvent::ValidPhoton {
                macrotime,
                microtime,
                route,
            } => {
                self.pending_photons.push_back(PendingPhoton {
                    macrotime,
                    microtime,
                    route,
                });
            }
            DecodedEvent::Marker { macrotime, bits } => {
                // A coincident frame+line marker closes the current frame
                // first, then opens the first line of the next.
                if self.frame_marker_mask != 0 && bits & self.frame_marker_mask != 0 {
                    self.pending_markers.push_back(PendingMarker::FrameEnd);
                }
                if bits & self.line_marker_mask != 0 {
                    self.pending_markers
                        .push_back(PendingMarker::LineStart(macrotime));
                }
                // Other marker bits pass through without effect (reserved
                // for pixel-clock addressing).
            }
            DecodedEvent::DataLost { macrotime } => {
                tracing::warn!(macrotime, "device reported data loss");
            }
            DecodedEvent::Timestamp { .. } | DecodedEvent::InvalidPhoton { .. } => {}
        }

        self.process()
    }

    fn handle_error(&mut self, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.pending_photons.clear();
        self.pending_markers.clear();
        self.downstream.handle_error(message);
    }

    fn handle_finish(&mut self) {
        if self.finished {
            return;
        }
        // Flush: with the stream over, no later event can extend any line.
        self.latest_timestamp = u64::MAX;
        if let Err(err) = self.process() {
            let message = err.to_string();
            self.finished = true;
            self.downstream.handle_error(&message);
            return;
        }
        self.finish_pipeline();
    }
}
