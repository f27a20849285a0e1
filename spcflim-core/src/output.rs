//! Output writers for acquisition results.
//!
//! [`SdtFileWriter`] serializes the cumulative histogram into a
//! self-contained binary measurement file: a fixed header carrying block
//! offsets and a checksum, a free-form identification text, a setup text, a
//! fixed-size measurement descriptor, and one data block of little-endian
//! 16-bit counts. [`RawStreamWriter`] is an optional tap that appends every
//! raw device word to a `.spc` file, making an acquisition replayable.

use crate::acquisition::CompletionHandle;
use crate::histogram::{Histogram, HistogramSink};
use crate::types::{DeviceEventSink, SinkError};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Header magic marking a valid measurement file.
const HEADER_VALID: u16 = 0x5555;
/// All 16-bit words of the header, checksum included, sum to this value.
const HEADER_CHECKSUM_TARGET: u16 = 0x55AA;
/// Fixed length of the file header in bytes.
const HEADER_LENGTH: usize = 42;
/// Fixed length of the measurement descriptor block in bytes.
const MEAS_DESC_LENGTH: usize = 84;
/// Length of the data-block header in bytes.
const BLOCK_HEADER_LENGTH: usize = 22;

/// Data-block type: measurement data, page organization.
const MEAS_DATA_FROM_FILE: u16 = 0x0003;
const PAGE_BLOCK: u16 = 0x0010;

/// Module identification field for the SPC-150 family.
const REVISION_SPC150: i16 = (0x28 << 4) + 14;

/// Acquisition metadata recorded in the measurement file.
#[derive(Debug, Clone)]
pub struct SdtMetadata {
    /// Measurement title for the identification block.
    pub title: String,
    /// Acquisition date, `MM:DD:YYYY`.
    pub date: String,
    /// Acquisition time, `HH:MM:SS`.
    pub time: String,
    /// Module serial number, if known.
    pub serial_number: String,
    /// Module type name, e.g. `SPC-150`.
    pub module_type: String,
    /// Module type code, e.g. `150`.
    pub module_type_code: i16,
    /// Pixel dwell time in seconds.
    pub pixel_time_s: f64,
    /// Total collection time in seconds, if known.
    pub collect_time_s: f64,
}

/// Writes one acquisition's cumulative histogram as a measurement file.
pub struct SdtFileWriter {
    writer: BufWriter<File>,
    metadata: SdtMetadata,
}

impl SdtFileWriter {
    /// Creates the output file; fails up front so that resource errors
    /// surface at acquisition start, not at finish.
    pub fn create<P: AsRef<Path>>(path: P, metadata: SdtMetadata) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
            metadata,
        })
    }

    /// Serializes the complete file around the given histogram.
    pub fn write_histogram(mut self, histogram: &Histogram) -> io::Result<()> {
        let histo_bits = histogram.bins_per_pixel().trailing_zeros();
        let info = format!(
            "*IDENTIFICATION\r\nID : SPC Setup & Data File\r\nTitle : {}\r\nVersion : 1  781 M\r\nRevision : {} bits ADC\r\nDate : {}\r\nTime : {}\r\n*END\r\n\r\n",
            self.metadata.title, histo_bits, self.metadata.date, self.metadata.time
        );
        let setup = "*SETUP\r\n*END\r\n\r\n";
        let meas_desc = self.encode_measurement_descriptor(histogram);
        debug_assert_eq!(meas_desc.len(), MEAS_DESC_LENGTH);

        let data_block_length = histogram.counts().len() * 2;
        let info_offs = HEADER_LENGTH as i32;
        let setup_offs = info_offs + info.len() as i32;
        let meas_desc_offs = setup_offs + setup.len() as i32;
        let data_block_offs = meas_desc_offs + MEAS_DESC_LENGTH as i32;

        let header = encode_header(
            info_offs,
            info.len() as i16,
            setup_offs,
            setup.len() as i16,
            data_block_offs,
            data_block_length as i32,
            meas_desc_offs,
        );
        self.writer.write_all(&header)?;
        self.writer.write_all(info.as_bytes())?;
        self.writer.write_all(setup.as_bytes())?;
        self.writer.write_all(&meas_desc)?;

        // Data block header.
        let data_offs = data_block_offs + BLOCK_HEADER_LENGTH as i32;
        self.writer.write_i16::<LittleEndian>(1)?; // block_no
        self.writer.write_i32::<LittleEndian>(data_offs)?;
        self.writer
            .write_i32::<LittleEndian>(data_offs + data_block_length as i32)?;
        self.writer
            .write_u16::<LittleEndian>(MEAS_DATA_FROM_FILE | PAGE_BLOCK)?;
        self.writer.write_i16::<LittleEndian>(0)?; // meas_desc_block_no
        self.writer.write_u32::<LittleEndian>(1)?; // lblock_no: module 0, block 1
        self.writer.write_u32::<LittleEndian>(data_block_length as u32)?;

        for &count in histogram.counts() {
            self.writer.write_u16::<LittleEndian>(count)?;
        }
        self.writer.flush()
    }

    fn encode_measurement_descriptor(&self, histogram: &Histogram) -> Vec<u8> {
        let mut desc = Vec::with_capacity(MEAS_DESC_LENGTH);
        push_fixed_str(&mut desc, &self.metadata.time, 9);
        push_fixed_str(&mut desc, &self.metadata.date, 11);
        push_fixed_str(&mut desc, &self.metadata.serial_number, 16);
        // Scan-sync-in measurement mode, matching the files the vendor tools
        // expect for scanned FIFO acquisitions.
        let _ = desc.write_i16::<LittleEndian>(9);
        let _ = desc.write_i16::<LittleEndian>(histogram.bins_per_pixel() as i16);
        let _ = desc.write_i32::<LittleEndian>(histogram.width() as i32);
        let _ = desc.write_i32::<LittleEndian>(histogram.height() as i32);
        let _ = desc.write_i32::<LittleEndian>(1); // scan_rx
        let _ = desc.write_i32::<LittleEndian>(1); // scan_ry
        let _ = desc.write_f32::<LittleEndian>(self.metadata.pixel_time_s as f32);
        let _ = desc.write_f32::<LittleEndian>(self.metadata.collect_time_s as f32);
        push_fixed_str(&mut desc, &self.metadata.module_type, 16);
        let _ = desc.write_i16::<LittleEndian>(self.metadata.module_type_code);
        let _ = desc.write_i16::<LittleEndian>(0); // fifo_typ
        desc
    }
}

/// Writes `s` truncated or NUL-padded to exactly `len` bytes.
fn push_fixed_str(out: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(len.saturating_sub(1));
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + (len - take), 0);
}

#[allow(clippy::too_many_arguments)]
fn encode_header(
    info_offs: i32,
    info_length: i16,
    setup_offs: i32,
    setup_length: i16,
    data_block_offs: i32,
    data_block_length: i32,
    meas_desc_offs: i32,
) -> [u8; HEADER_LENGTH] {
    let mut header = Vec::with_capacity(HEADER_LENGTH);
    let _ = header.write_i16::<LittleEndian>(REVISION_SPC150);
    let _ = header.write_i32::<LittleEndian>(info_offs);
    let _ = header.write_i16::<LittleEndian>(info_length);
    let _ = header.write_i32::<LittleEndian>(setup_offs);
    let _ = header.write_i16::<LittleEndian>(setup_length);
    let _ = header.write_i32::<LittleEndian>(data_block_offs);
    let _ = header.write_i16::<LittleEndian>(1); // no_of_data_blocks
    let _ = header.write_i32::<LittleEndian>(data_block_length);
    let _ = header.write_i32::<LittleEndian>(meas_desc_offs);
    let _ = header.write_i16::<LittleEndian>(1); // no_of_meas_desc_blocks
    let _ = header.write_i16::<LittleEndian>(MEAS_DESC_LENGTH as i16);
    let _ = header.write_u16::<LittleEndian>(HEADER_VALID);
    let _ = header.write_u32::<LittleEndian>(1); // reserved1 = no_of_data_blocks
    let _ = header.write_u16::<LittleEndian>(0); // reserved2

    // Checksum makes all header words sum to the target value.
    let sum = header
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .fold(0u16, |acc, w| acc.wrapping_add(w));
    let _ = header.write_u16::<LittleEndian>(HEADER_CHECKSUM_TARGET.wrapping_sub(sum));

    let mut out = [0u8; HEADER_LENGTH];
    out.copy_from_slice(&header);
    out
}

/// Terminal sink delivering the cumulative histogram to the measurement
/// file, exactly once.
pub struct FileHistogramSink {
    writer: Option<SdtFileWriter>,
    completion: Option<CompletionHandle>,
}

impl FileHistogramSink {
    /// Wraps an open writer; `completion` is reported when the file is
    /// written or the branch fails.
    pub fn new(writer: SdtFileWriter, completion: Option<CompletionHandle>) -> Self {
        Self {
            writer: Some(writer),
            completion,
        }
    }
}

impl HistogramSink for FileHistogramSink {
    fn handle_frame(&mut self, _frame: &Histogram) -> Result<(), SinkError> {
        // Nothing to do until the acquisition finishes.
        Ok(())
    }

    fn handle_finish(
        &mut self,
        cumulative: Histogram,
        _frame_complete: bool,
    ) -> Result<(), SinkError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        match writer.write_histogram(&cumulative) {
            Ok(()) => {
                if let Some(handle) = self.completion.take() {
                    handle.complete();
                }
                Ok(())
            }
            Err(err) => {
                let message = format!("cannot write measurement file: {err}");
                if let Some(handle) = self.completion.take() {
                    handle.error(&message);
                }
                Err(SinkError::Io(err))
            }
        }
    }

    fn handle_error(&mut self, message: &str) {
        self.writer = None;
        if let Some(handle) = self.completion.take() {
            handle.error(message);
        }
    }
}

/// Optional raw-word tap: appends every device word to a `.spc` file.
///
/// Failures detach only the tap; the rest of the pipeline keeps running.
pub struct RawStreamWriter {
    writer: Option<BufWriter<File>>,
    completion: Option<CompletionHandle>,
    words_written: u64,
}

impl RawStreamWriter {
    /// Creates the raw output file.
    pub fn create<P: AsRef<Path>>(
        path: P,
        completion: Option<CompletionHandle>,
    ) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            completion,
            words_written: 0,
        })
    }

    fn write_words(&mut self, words: &[u32]) -> io::Result<()> {
        if let Some(writer) = &mut self.writer {
            for &word in words {
                writer.write_u32::<LittleEndian>(word)?;
            }
            self.words_written += words.len() as u64;
        }
        Ok(())
    }
}

impl DeviceEventSink for RawStreamWriter {
    fn handle_words(&mut self, words: &[u32]) -> Result<(), SinkError> {
        if let Err(err) = self.write_words(words) {
            let message = format!("cannot write raw stream: {err}");
            tracing::warn!(error = %message, "detaching raw stream tap");
            self.writer = None;
            if let Some(handle) = self.completion.take() {
                handle.error(&message);
            }
        }
        Ok(())
    }

    fn handle_error(&mut self, message: &str) {
        self.writer = None;
        if let Some(handle) = self.completion.take() {
            handle.error(message);
        }
    }

    fn handle_finish(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            match writer.flush() {
                Ok(()) => {
                    tracing::debug!(words = self.words_written, "raw stream closed");
                    if let Some(handle) = self.completion.take() {
                        handle.complete();
                    }
                }
                Err(err) => {
                    if let Some(handle) = self.completion.take() {
                        handle.error(&format!("cannot flush raw stream: {err}"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SdtMetadata {
        SdtMetadata {
            title: "test".into(),
            date: "01:15:2026".into(),
            time: "12:34:56".into(),
            serial_number: String::new(),
            module_type: "SPC-150".into(),
            module_type_code: 150,
            pixel_time_s: 1e-5,
            collect_time_s: 0.0,
        }
    }

    fn read_u16(data: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    fn read_i32(data: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])
    }

    #[test]
    fn test_measurement_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sdt");

        let mut histogram = Histogram::new(4, 12, false, 2, 2);
        histogram.increment(0, 0, 0);
        histogram.increment(1, 1, 0xFFF);
        histogram.increment(1, 1, 0xFFF);

        let writer = SdtFileWriter::create(&path, metadata()).unwrap();
        writer.write_histogram(&histogram).unwrap();

        let data = std::fs::read(&path).unwrap();

        // Header words, checksum included, sum to the target.
        let sum = data[..HEADER_LENGTH]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .fold(0u16, |acc, w| acc.wrapping_add(w));
        assert_eq!(sum, HEADER_CHECKSUM_TARGET);

        // header_valid magic sits after the block table.
        assert_eq!(read_u16(&data, 32), HEADER_VALID);

        // The identification block follows the header directly.
        let info_offs = read_i32(&data, 2) as usize;
        assert_eq!(info_offs, HEADER_LENGTH);
        assert!(data[info_offs..].starts_with(b"*IDENTIFICATION"));

        // Data block: 2x2 pixels, 16 bins, 2 bytes each.
        let data_block_offs = read_i32(&data, 14) as usize;
        let data_block_length = read_i32(&data, 20) as usize;
        assert_eq!(data_block_length, 2 * 2 * 16 * 2);
        assert_eq!(data.len(), data_block_offs + BLOCK_HEADER_LENGTH + data_block_length);

        // Counts round-trip.
        let counts_offs = data_block_offs + BLOCK_HEADER_LENGTH;
        assert_eq!(read_u16(&data, counts_offs), 1); // (0,0) bin 0
        let last_pixel_offs = counts_offs + (3 * 16 + 15) * 2;
        assert_eq!(read_u16(&data, last_pixel_offs), 2); // (1,1) bin 15
    }

    #[test]
    fn test_raw_stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.spc");

        let mut tap = RawStreamWriter::create(&path, None).unwrap();
        tap.handle_words(&[0xDEAD_BEEF, 0x0000_0001]).unwrap();
        tap.handle_finish();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(
            u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            0xDEAD_BEEF
        );
        assert_eq!(
            u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            1
        );
    }
}
