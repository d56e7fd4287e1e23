//! Source readers: the sponsor-register CSV and job-search JSON pages, both yielding raw records.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use visapath_core::{RawRecord, RecordKind};

pub const CRATE_NAME: &str = "visapath-adapters";

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("parsing JSON {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: {message}")]
    Shape { path: PathBuf, message: String },
}

/// A file of records of one kind.
pub trait RecordSource {
    fn kind(&self) -> RecordKind;
    fn path(&self) -> &Path;
    fn read(&self) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Sponsor register as written by the upstream cleaner: header row, every cell a string.
#[derive(Debug, Clone)]
pub struct RegistryCsvSource {
    path: PathBuf,
}

impl RegistryCsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for RegistryCsvSource {
    fn kind(&self) -> RecordKind {
        RecordKind::Registry
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<RawRecord>, AdapterError> {
        let text = read_text(&self.path)?;
        parse_registry_csv(&text).map_err(|source| AdapterError::Csv {
            path: self.path.clone(),
            source,
        })
    }
}

/// Job-search results saved as JSON: either a bare array or an API page with `results`.
#[derive(Debug, Clone)]
pub struct JobSearchJsonSource {
    path: PathBuf,
}

impl JobSearchJsonSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for JobSearchJsonSource {
    fn kind(&self) -> RecordKind {
        RecordKind::JobAd
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<RawRecord>, AdapterError> {
        let text = read_text(&self.path)?;
        let value: JsonValue = serde_json::from_str(&text).map_err(|source| AdapterError::Json {
            path: self.path.clone(),
            source,
        })?;
        job_records_from_json(value).map_err(|message| AdapterError::Shape {
            path: self.path.clone(),
            message,
        })
    }
}

/// Read every job-search file in order and concatenate their records.
pub fn load_job_ads(paths: &[PathBuf]) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    for path in paths {
        records.extend(read_source(&JobSearchJsonSource::new(path))?);
    }
    Ok(records)
}

pub fn load_registry(path: &Path) -> Result<Vec<RawRecord>> {
    read_source(&RegistryCsvSource::new(path))
}

fn read_source(source: &dyn RecordSource) -> Result<Vec<RawRecord>> {
    let what = match source.kind() {
        RecordKind::Registry => "sponsor register",
        RecordKind::JobAd => "job ads",
    };
    let records = source
        .read()
        .with_context(|| format!("loading {what} from {}", source.path().display()))?;
    debug!(path = %source.path().display(), kind = ?source.kind(), records = records.len(), "read source file");
    Ok(records)
}

fn read_text(path: &Path) -> Result<String, AdapterError> {
    fs::read_to_string(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_registry_csv(text: &str) -> Result<Vec<RawRecord>, csv::Error> {
    let body = text.strip_prefix(UTF8_BOM).unwrap_or(text);
    let body = skip_separator_hint(body);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(body.as_bytes());
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let mut record = RawRecord::new();
        for (idx, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let cell = row.get(idx).unwrap_or_default();
            record.insert(header.to_string(), JsonValue::String(cell.to_string()));
        }
        records.push(record);
    }
    Ok(records)
}

// Spreadsheet exports may start with `sep=,` so Excel picks the right delimiter.
fn skip_separator_hint(body: &str) -> &str {
    let first_line_end = body.find('\n').map(|idx| idx + 1).unwrap_or(body.len());
    let first_line = body[..first_line_end].trim();
    if first_line.to_ascii_lowercase().starts_with("sep=") {
        &body[first_line_end..]
    } else {
        body
    }
}

fn job_records_from_json(value: JsonValue) -> Result<Vec<RawRecord>, String> {
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut page) => match page.remove("results") {
            Some(JsonValue::Array(items)) => items,
            Some(_) => return Err("`results` is not an array".to_string()),
            None => return Err("expected an array or an object with `results`".to_string()),
        },
        _ => return Err("expected an array or an object with `results`".to_string()),
    };

    let mut records = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        match item {
            JsonValue::Object(map) => records.push(map),
            other => return Err(format!("entry {idx} is not an object: {other}")),
        }
    }
    Ok(records)
}
