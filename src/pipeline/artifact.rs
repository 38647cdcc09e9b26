//! File formats at the edges of the transformer: raw gzip CSV dumps in,
//! flattened CSV artifacts out (and back in, for the loader).

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use flate2::read::MultiGzDecoder;

use crate::domain::{DatasetKind, Row, Scalar};
use crate::error::{EtlError, Result};
use crate::schema::{ColumnDef, ColumnType};

/// Streaming reader over a raw dump (`.csv.gz` or plain `.csv`).
pub struct RawReader {
    reader: csv::Reader<Box<dyn Read + Send>>,
    header: Vec<String>,
    record: ByteRecord,
}

impl RawReader {
    pub fn open(dataset: DatasetKind, path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                EtlError::MissingArtifact { dataset, path: path.display().to_string() }
            }
            _ => EtlError::Io(e),
        })?;
        let buffered = BufReader::new(file);
        let input: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "gz") {
            Box::new(MultiGzDecoder::new(buffered))
        } else {
            Box::new(buffered)
        };

        let mut reader = ReaderBuilder::new().has_headers(true).flexible(true).from_reader(input);
        let header = reader
            .byte_headers()?
            .iter()
            .map(|h| lossy(h).trim_start_matches('\u{feff}').trim().to_string())
            .collect();
        Ok(Self { reader, header, record: ByteRecord::new() })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Read the next record into `fields`, decoding invalid UTF-8 lossily.
    /// Returns false at end of input.
    pub fn next_record(&mut self, fields: &mut Vec<String>) -> Result<bool> {
        if !self.reader.read_byte_record(&mut self.record)? {
            return Ok(false);
        }
        fields.clear();
        fields.extend(self.record.iter().map(lossy));
        Ok(true)
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Writes a CSV artifact to a temporary sibling and renames it into place on
/// [`commit`](ArtifactWriter::commit). Dropping an uncommitted writer removes
/// the temporary file, leaving any previous artifact untouched.
pub struct ArtifactWriter {
    writer: Option<csv::Writer<BufWriter<File>>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    rows: u64,
    record: Vec<String>,
}

impl ArtifactWriter {
    pub fn create(final_path: &Path) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EtlError::Config(format!("artifact path '{}' has no file name", final_path.display())))?;
        let tmp_path = final_path.with_file_name(format!(".{file_name}.tmp"));
        let file = File::create(&tmp_path)?;
        let writer = WriterBuilder::new().from_writer(BufWriter::new(file));
        Ok(Self { writer: Some(writer), tmp_path, final_path: final_path.to_path_buf(), rows: 0, record: Vec::new() })
    }

    fn inner(&mut self) -> Result<&mut csv::Writer<BufWriter<File>>> {
        self.writer
            .as_mut()
            .ok_or_else(|| EtlError::Io(std::io::Error::other("artifact writer already committed")))
    }

    pub fn write_header(&mut self, header: &[String]) -> Result<()> {
        self.inner()?.write_record(header)?;
        Ok(())
    }

    pub fn write_row(&mut self, row: &[Scalar]) -> Result<()> {
        let mut record = std::mem::take(&mut self.record);
        record.clear();
        record.extend(row.iter().map(Scalar::render));
        let result = self.inner()?.write_record(&record);
        self.record = record;
        result?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush, sync and atomically replace the final artifact.
    pub fn commit(self) -> Result<PathBuf> {
        self.prepare()?.publish()
    }

    /// Flush and sync the temporary file without publishing it yet.
    pub fn prepare(mut self) -> Result<PreparedArtifact> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| EtlError::Io(std::io::Error::other("artifact writer already committed")))?;
        // from here on the prepared artifact owns the temporary file
        let prepared = PreparedArtifact {
            tmp_path: self.tmp_path.clone(),
            final_path: self.final_path.clone(),
            published: false,
        };
        let mut buffered = writer.into_inner().map_err(|e| EtlError::Io(std::io::Error::other(e.to_string())))?;
        buffered.flush()?;
        let file = buffered.into_inner().map_err(|e| EtlError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(prepared)
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// A fully written and synced artifact waiting for its rename. Dropping it
/// unpublished removes the temporary file.
pub struct PreparedArtifact {
    tmp_path: PathBuf,
    final_path: PathBuf,
    published: bool,
}

impl PreparedArtifact {
    pub fn publish(mut self) -> Result<PathBuf> {
        fs::rename(&self.tmp_path, &self.final_path)?;
        self.published = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for PreparedArtifact {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Typed streaming reader over a flattened artifact.
pub struct ArtifactReader {
    dataset: DatasetKind,
    reader: csv::Reader<BufReader<File>>,
    columns: Vec<ColumnDef>,
    record: ByteRecord,
    line: u64,
}

impl ArtifactReader {
    /// Open `path` and check its header against `columns`, name for name.
    pub fn open(dataset: DatasetKind, path: &Path, columns: Vec<ColumnDef>) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                EtlError::MissingArtifact { dataset, path: path.display().to_string() }
            }
            _ => EtlError::Io(e),
        })?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(BufReader::new(file));
        let header: Vec<String> = reader.byte_headers()?.iter().map(lossy).collect();
        let expected: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        if header.iter().map(String::as_str).ne(expected.iter().copied()) {
            let missing: Vec<&str> = expected.iter().copied().filter(|e| !header.iter().any(|h| h == e)).collect();
            return Err(EtlError::schema(
                dataset,
                format!(
                    "artifact '{}' header does not match the table columns (missing: [{}])",
                    path.display(),
                    missing.join(", ")
                ),
            ));
        }
        Ok(Self { dataset, reader, columns, record: ByteRecord::new(), line: 1 })
    }

    /// Next record, with decode failures returned per row. `Err` only for
    /// I/O failures on the artifact itself.
    pub fn next_decoded(&mut self) -> Result<Option<std::result::Result<Row, String>>> {
        match self.reader.read_byte_record(&mut self.record) {
            Ok(false) => return Ok(None),
            Ok(true) => {}
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                self.line += 1;
                return Ok(Some(Err(format!("line {}: {}", self.line, e))));
            }
        }
        self.line += 1;
        let mut row = Vec::with_capacity(self.columns.len());
        for (field, column) in self.record.iter().zip(&self.columns) {
            let text = String::from_utf8_lossy(field);
            match parse_scalar(&text, column.ty) {
                Some(value) => row.push(value),
                None => {
                    return Ok(Some(Err(format!(
                        "line {}: '{}' is not a valid {:?} for column '{}'",
                        self.line, text, column.ty, column.name
                    ))))
                }
            }
        }
        Ok(Some(Ok(row)))
    }

    /// Next row; an undecodable row is a schema error for the dataset.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        match self.next_decoded()? {
            None => Ok(None),
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(message)) => Err(EtlError::schema(self.dataset, message)),
        }
    }

    /// Advance past `n` records without decoding them. Returns how many were skipped.
    pub fn skip(&mut self, n: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < n {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(_) => {}
            }
            self.line += 1;
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Up to `max` records. Undecodable ones are set aside in
    /// [`DecodedBatch::undecodable`]; the batch is empty at end of input.
    pub fn read_batch(&mut self, max: usize) -> Result<DecodedBatch> {
        let mut batch = DecodedBatch::default();
        let mut position = 0;
        while position < max {
            match self.next_decoded()? {
                Some(Ok(row)) => {
                    batch.rows.push(row);
                    batch.positions.push(position);
                }
                Some(Err(reason)) => batch.undecodable.push((position, reason)),
                None => break,
            }
            position += 1;
        }
        Ok(batch)
    }
}

/// One batch worth of artifact records.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub rows: Vec<Row>,
    /// Position of each decoded row among the batch's records.
    pub positions: Vec<usize>,
    /// Records that could not be decoded, by position.
    pub undecodable: Vec<(usize, String)>,
}

impl DecodedBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.undecodable.is_empty()
    }

    pub fn records(&self) -> usize {
        self.rows.len() + self.undecodable.len()
    }

    /// Map an offset into `rows` back to the record position.
    pub fn position_of(&self, offset: usize) -> usize {
        self.positions.get(offset).copied().unwrap_or(offset)
    }
}

/// Inverse of [`Scalar::render`] for a declared column type.
fn parse_scalar(raw: &str, ty: ColumnType) -> Option<Scalar> {
    if raw.is_empty() {
        return Some(Scalar::Null);
    }
    match ty {
        ColumnType::Text | ColumnType::Date => Some(Scalar::Text(raw.to_string())),
        ColumnType::Integer => raw.parse().ok().map(Scalar::Int),
        ColumnType::Real | ColumnType::Currency | ColumnType::Percent => raw.parse().ok().map(Scalar::Float),
        ColumnType::Boolean => match raw {
            "true" => Some(Scalar::Bool(true)),
            "false" => Some(Scalar::Bool(false)),
            _ => None,
        },
    }
}
