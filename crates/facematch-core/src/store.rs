//! Loads and validates a labeled reference embedding set.
//!
//! Two on-disk layouts are accepted, told apart by the file header:
//! a JSON array of `{actor, image_path, embedding}` records, or a SQLite
//! database with a `reference_faces` table whose `embedding` column holds
//! little-endian `f32` blobs.

use crate::outcome::ErrorCode;
use crate::types::{Embedding, ReferenceEntry, EMBEDDING_DIM};
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const REFERENCE_TABLE: &str = "reference_faces";
/// Fields every record must carry, in the order they are reported.
const REQUIRED_FIELDS: [&str; 3] = ["embedding", "actor", "image_path"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Embeddings file not found: {path}")]
    NotFound {
        path: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("Missing columns in embeddings: {0:?}")]
    MissingFields(Vec<&'static str>),
    #[error("Invalid embedding dimensions (expected {expected}, record {index} has {actual})")]
    InvalidDimension {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("reference dataset contains no records")]
    Empty,
    #[error("record {0} has an empty actor label")]
    EmptyActor(usize),
    #[error("malformed embeddings file: {0}")]
    Malformed(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub(crate) fn not_found(path: &Path, source: Option<std::io::Error>) -> Self {
        Self::NotFound {
            path: path.display().to_string(),
            source,
        }
    }

    /// Wire code for this failure. Only an unreachable file is reported as
    /// missing; everything else is an invalid dataset.
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound { .. } => ErrorCode::EmbeddingsNotFound,
            _ => ErrorCode::InvalidEmbeddings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatasetFormat {
    Json,
    Sqlite,
}

/// One record as read from storage, before validation.
#[derive(Debug, Default, Deserialize)]
struct RawRecord {
    actor: Option<String>,
    image_path: Option<String>,
    embedding: Option<Vec<f32>>,
}

/// Ordered, non-empty, immutable collection of reference entries.
///
/// Every entry carries an embedding of exactly [`EMBEDDING_DIM`] values.
#[derive(Debug, Clone)]
pub struct ReferenceDataset {
    entries: Vec<ReferenceEntry>,
}

impl ReferenceDataset {
    /// Validate and wrap a list of entries.
    pub fn from_entries(entries: Vec<ReferenceEntry>) -> Result<Self, StoreError> {
        if entries.is_empty() {
            return Err(StoreError::Empty);
        }

        for (index, entry) in entries.iter().enumerate() {
            if entry.actor.trim().is_empty() {
                return Err(StoreError::EmptyActor(index));
            }
            if entry.embedding.len() != EMBEDDING_DIM {
                return Err(StoreError::InvalidDimension {
                    index,
                    expected: EMBEDDING_DIM,
                    actual: entry.embedding.len(),
                });
            }
        }

        Ok(Self { entries })
    }

    fn from_records(records: Vec<RawRecord>) -> Result<Self, StoreError> {
        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| {
                records.iter().any(|r| match *field {
                    "embedding" => r.embedding.is_none(),
                    "actor" => r.actor.is_none(),
                    _ => r.image_path.is_none(),
                })
            })
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingFields(missing));
        }

        let entries = records
            .into_iter()
            .filter_map(|r| {
                Some(ReferenceEntry {
                    actor: r.actor?,
                    image_path: r.image_path?,
                    embedding: Embedding::new(r.embedding?),
                })
            })
            .collect();

        Self::from_entries(entries)
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ReferenceEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimension shared by every entry.
    pub fn dimension(&self) -> usize {
        self.entries
            .first()
            .map(|e| e.embedding.len())
            .unwrap_or(EMBEDDING_DIM)
    }
}

/// Load and validate the reference dataset stored at `path`.
pub fn load(path: &Path) -> Result<ReferenceDataset, StoreError> {
    let format = sniff_format(path)?;
    tracing::info!(path = %path.display(), ?format, "loading reference embeddings");

    let records = match format {
        DatasetFormat::Json => read_json(path)?,
        DatasetFormat::Sqlite => read_sqlite(path)?,
    };

    let dataset = ReferenceDataset::from_records(records)?;
    tracing::info!(
        entries = dataset.len(),
        dimension = dataset.dimension(),
        "reference embeddings loaded"
    );
    Ok(dataset)
}

fn open(path: &Path) -> Result<File, StoreError> {
    File::open(path).map_err(|e| StoreError::not_found(path, Some(e)))
}

fn sniff_format(path: &Path) -> Result<DatasetFormat, StoreError> {
    let mut header = Vec::with_capacity(SQLITE_MAGIC.len());
    open(path)?
        .take(SQLITE_MAGIC.len() as u64)
        .read_to_end(&mut header)
        .map_err(|e| StoreError::not_found(path, Some(e)))?;

    if header.as_slice() == SQLITE_MAGIC {
        Ok(DatasetFormat::Sqlite)
    } else {
        Ok(DatasetFormat::Json)
    }
}

fn read_json(path: &Path) -> Result<Vec<RawRecord>, StoreError> {
    let reader = BufReader::new(open(path)?);
    serde_json::from_reader(reader).map_err(|e| StoreError::Malformed(e.to_string()))
}

fn read_sqlite(path: &Path) -> Result<Vec<RawRecord>, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let columns: Vec<String> = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({REFERENCE_TABLE})"))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        names.collect::<Result<_, _>>()?
    };

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| !columns.iter().any(|c| c == field))
        .collect();
    if !missing.is_empty() {
        return Err(StoreError::MissingFields(missing));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT actor, image_path, embedding FROM {REFERENCE_TABLE} ORDER BY rowid"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<Vec<u8>>>(2)?,
        ))
    })?;

    let mut records = Vec::new();
    for (index, row) in rows.enumerate() {
        let (actor, image_path, blob) = row?;
        let embedding = blob
            .map(|bytes| decode_blob(index, &bytes))
            .transpose()?;
        records.push(RawRecord {
            actor,
            image_path,
            embedding,
        });
    }

    Ok(records)
}

/// Decode a little-endian `f32` blob.
fn decode_blob(index: usize, bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Malformed(format!(
            "record {index}: embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
