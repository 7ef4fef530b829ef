//! Streaming city-list ingestion.
//!
//! Reads CSV records one at a time, takes the first field of each as a
//! city name, normalizes it, and hands out names in fixed-size batches.
//! Only one record and one batch are held at a time; records longer than
//! the byte ceiling are rejected.

use std::io::{Read, Seek};

use csv::{ByteRecord, ReaderBuilder};

use crate::error::IngestError;

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_NAME_LENGTH: usize = 100;

/// Records longer than this are counted as invalid.
pub const MAX_LINE_BYTES: usize = 4096;

const HEADER_TOKENS: &[&str] = &["city", "name", "city_name", "cityname", "city name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub max_name_length: usize,
    pub max_line_bytes: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_name_length: DEFAULT_MAX_NAME_LENGTH,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

/// Running totals for one pass over the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Non-blank records read, header included.
    pub lines: u64,
    pub valid: u64,
    pub invalid: u64,
    pub header_skipped: bool,
}

/// Normalizes a city name, or `None` if it is not acceptable.
///
/// Strips a BOM, lowercases, and collapses whitespace. The result must be
/// non-empty, at most `max_length` characters, and contain at least one
/// letter. CSV quoting is undone by the reader before this runs.
pub fn normalize_city_name(raw: &str, max_length: usize) -> Option<String> {
    let normalized = raw
        .trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if normalized.is_empty()
        || normalized.chars().count() > max_length
        || !normalized.chars().any(char::is_alphabetic)
    {
        return None;
    }
    Some(normalized)
}

fn is_header(name: &str) -> bool {
    HEADER_TOKENS.contains(&name)
}

pub struct CsvIngester<R> {
    reader: csv::Reader<R>,
    record: ByteRecord,
    options: IngestOptions,
    stats: IngestStats,
    done: bool,
    // A read error is reported after the rows read before it.
    pending_error: Option<IngestError>,
}

impl<R: Read> CsvIngester<R> {
    pub fn new(reader: R, options: IngestOptions) -> Self {
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        Self {
            reader,
            record: ByteRecord::new(),
            options: IngestOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            stats: IngestStats::default(),
            done: false,
            pending_error: None,
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Returns the next batch of normalized names, or `None` at end of input.
    pub fn next_batch(&mut self) -> Result<Option<Vec<String>>, IngestError> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        if self.done {
            return Ok(None);
        }

        let mut batch = Vec::with_capacity(self.options.batch_size);
        while batch.len() < self.options.batch_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.done = true;
                    let error = IngestError::Unreadable {
                        line: self.stats.lines + 1,
                        source: std::io::Error::from(e),
                    };
                    if batch.is_empty() {
                        return Err(error);
                    }
                    self.pending_error = Some(error);
                    break;
                }
            }
            self.stats.lines += 1;

            match self.current_name() {
                Some(name) if self.stats.lines == 1 && is_header(&name) => {
                    self.stats.header_skipped = true;
                }
                Some(name) => {
                    self.stats.valid += 1;
                    batch.push(name);
                }
                None => self.stats.invalid += 1,
            }
        }

        if batch.is_empty() && self.done {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    /// Fails with [`IngestError::NoValidRows`] if the input held no city.
    pub fn finish(&self) -> Result<IngestStats, IngestError> {
        if self.stats.valid == 0 {
            return Err(IngestError::NoValidRows {
                invalid: self.stats.invalid,
            });
        }
        Ok(self.stats)
    }

    /// The city name in the current record's first field.
    fn current_name(&self) -> Option<String> {
        if self.record.as_slice().len() > self.options.max_line_bytes {
            return None;
        }
        let field = self.record.get(0)?;
        let field = std::str::from_utf8(field).ok()?;
        normalize_city_name(field, self.options.max_name_length)
    }
}

impl<R: Read + Seek> CsvIngester<R> {
    /// Restarts from the beginning of the input.
    pub fn rewind(&mut self) -> std::io::Result<()> {
        self.reader
            .seek(csv::Position::new())
            .map_err(std::io::Error::from)?;
        self.stats = IngestStats::default();
        self.done = false;
        self.pending_error = None;
        Ok(())
    }
}

impl<R: Read> Iterator for CsvIngester<R> {
    type Item = Result<Vec<String>, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}
