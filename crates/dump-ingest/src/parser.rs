//! Streaming record parser for comma-delimited dump files
//!
//! [`RecordStream`] pulls one line at a time from disk, so memory stays bounded
//! by the reader's buffer no matter how large the file is. The first line is
//! the header: it is checked against the dataset schema and never yielded.
//!
//! Each item is a `Result`:
//! - `Ok(Record)` for a well-formed line
//! - `Err(IngestError::Parse(..))` for a malformed line; the stream keeps going
//! - any other error (I/O failure, cancellation) ends the stream
//!
//! A record that fails its field count and spans several physical lines (an
//! unterminated quote swallows everything after it) is reported against its
//! first line only. Reading resumes on the next physical line.
//!
//! A stream is single-pass. Opening the same file again starts a fresh pass
//! from the first line. [`RecordStream::into_channel`] moves the reads onto
//! the blocking pool for async consumers.

use crate::config::HeaderCheck;
use crate::dataset::{DatasetSpec, Record};
use crate::error::{IngestError, ParseError, ParseErrorReason, Result};
use csv::{ByteRecord, Position};
use futures::Stream;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DELIMITER: u8 = b',';

/// Lazy, single-pass sequence of records from one file
pub struct RecordStream {
    spec: Arc<DatasetSpec>,
    path: PathBuf,
    reader: csv::Reader<File>,
    /// Second handle for re-reading the original bytes of rejected records
    source: File,
    record: ByteRecord,
    cancel: Option<CancellationToken>,
    finished: bool,
}

impl RecordStream {
    /// Open a record file and consume its header line
    ///
    /// Fails with a configuration error when the file is missing, empty, or
    /// (with [`HeaderCheck::Enforce`]) its header does not match the schema.
    pub fn open(
        path: impl AsRef<Path>,
        spec: Arc<DatasetSpec>,
        header_check: HeaderCheck,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            IngestError::config(format!(
                "cannot open {} file {}: {}",
                spec.name,
                path.display(),
                e
            ))
        })?;
        let source = File::open(&path)?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(DELIMITER)
            .from_reader(file);

        let mut header = ByteRecord::new();
        let has_header = reader
            .read_byte_record(&mut header)
            .map_err(|e| read_error(&path, e))?;
        if !has_header {
            return Err(IngestError::config(format!(
                "{} file {} is empty (no header line)",
                spec.name,
                path.display()
            )));
        }

        check_header(&spec, &header, header_check)?;
        debug!(dataset = %spec.name, path = %path.display(), "Opened record file");

        Ok(Self {
            spec,
            path,
            reader,
            source,
            record: ByteRecord::new(),
            cancel: None,
            finished: false,
        })
    }

    /// Stop yielding records once the token is cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn spec(&self) -> &Arc<DatasetSpec> {
        &self.spec
    }

    /// Hand records to an async consumer through a bounded channel
    ///
    /// The file is read on the blocking pool, at most `capacity` items ahead
    /// of the consumer. Dropping the returned stream stops the reader at its
    /// next send.
    pub fn into_channel(self, capacity: usize) -> impl Stream<Item = Result<Record>> + Send + Unpin {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let dataset = self.spec.name.clone();

        tokio::task::spawn_blocking(move || {
            for item in self {
                if tx.blocking_send(item).is_err() {
                    debug!(dataset = %dataset, "Record consumer gone, stopping reader");
                    break;
                }
            }
        });

        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }

    fn build_record(&mut self) -> Result<Record> {
        let (start, line, index) = self
            .record
            .position()
            .map(|p| (p.byte(), p.line(), p.record()))
            .unwrap_or_default();
        let expected = self.spec.arity();

        if self.record.len() != expected {
            let reason = ParseErrorReason::FieldCount {
                expected,
                found: self.record.len(),
            };
            let span = self.read_span(start, self.reader.position().byte())?;

            if let Some(first_line) = span.first_line_len() {
                let mut resume = Position::new();
                resume
                    .set_byte(span.offset + first_line as u64 + 1)
                    .set_line(line + 1)
                    .set_record(index + 1);
                self.reader
                    .seek(resume)
                    .map_err(|e| read_error(&self.path, e))?;
                return Err(self.parse_error(line, &span.bytes[..first_line], reason));
            }
            return Err(self.parse_error(line, &span.bytes, reason));
        }

        let mut values = Vec::with_capacity(expected);
        for field in 0..expected {
            match std::str::from_utf8(&self.record[field]) {
                Ok(text) => values.push((!text.is_empty()).then(|| text.to_string())),
                Err(_) => {
                    let span = self.read_span(start, self.reader.position().byte())?;
                    return Err(self.parse_error(
                        line,
                        &span.bytes,
                        ParseErrorReason::InvalidUtf8 { field },
                    ));
                },
            }
        }

        Ok(Record::new(Arc::clone(&self.spec), line, values))
    }

    /// Original bytes between two reader offsets, without line terminators
    fn read_span(&mut self, start: u64, end: u64) -> Result<Span> {
        self.source.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::new();
        (&self.source)
            .take(end.saturating_sub(start))
            .read_to_end(&mut bytes)?;

        let is_terminator = |b: &&u8| matches!(**b, b'\r' | b'\n');
        let lead = bytes.iter().take_while(is_terminator).count();
        let trail = bytes[lead..].iter().rev().take_while(is_terminator).count();
        bytes.truncate(bytes.len() - trail);
        bytes.drain(..lead);

        Ok(Span {
            offset: start + lead as u64,
            bytes,
        })
    }

    fn parse_error(&self, line: u64, raw: &[u8], reason: ParseErrorReason) -> IngestError {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

        IngestError::Parse(ParseError {
            dataset: self.spec.name.clone(),
            line,
            raw: String::from_utf8_lossy(raw).into_owned(),
            reason,
        })
    }
}

/// The bytes of one record as they appear in the file
struct Span {
    /// File offset of `bytes[0]`
    offset: u64,
    bytes: Vec<u8>,
}

impl Span {
    /// Length of the first physical line, if the record covers more than one
    fn first_line_len(&self) -> Option<usize> {
        self.bytes.iter().position(|b| *b == b'\n')
    }
}

impl Iterator for RecordStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                self.finished = true;
                return Some(Err(IngestError::cancelled("parse")));
            }

            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) if is_blank(&self.record) => continue,
                Ok(true) => {
                    let item = self.build_record();
                    if matches!(&item, Err(e) if !matches!(e, IngestError::Parse(_))) {
                        self.finished = true;
                    }
                    return Some(item);
                },
                Ok(false) => {
                    self.finished = true;
                    return None;
                },
                Err(e) => {
                    self.finished = true;
                    return Some(Err(read_error(&self.path, e)));
                },
            }
        }
    }
}

fn is_blank(record: &ByteRecord) -> bool {
    record.is_empty() || (record.len() == 1 && record[0].is_empty())
}

fn read_error(path: &Path, err: csv::Error) -> IngestError {
    match err.into_kind() {
        csv::ErrorKind::Io(e) => IngestError::Io(e),
        other => IngestError::config(format!("unreadable record file {}: {:?}", path.display(), other)),
    }
}

fn check_header(spec: &DatasetSpec, header: &ByteRecord, header_check: HeaderCheck) -> Result<()> {
    let labels: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, bytes)| {
            let label = String::from_utf8_lossy(bytes);
            let label: &str = label.as_ref();
            let label = if i == 0 {
                label.trim_start_matches('\u{feff}')
            } else {
                label
            };
            label.trim().to_string()
        })
        .collect();

    if labels.iter().map(String::as_str).eq(spec.field_names()) {
        return Ok(());
    }

    let expected: Vec<&str> = spec.field_names().collect();
    match header_check {
        HeaderCheck::Enforce => Err(IngestError::config(format!(
            "{} header does not match schema: expected {:?}, found {:?}",
            spec.name, expected, labels
        ))),
        HeaderCheck::Ignore => {
            warn!(
                dataset = %spec.name,
                expected = ?expected,
                found = ?labels,
                "Header does not match schema, trusting column positions"
            );
            Ok(())
        },
    }
}
