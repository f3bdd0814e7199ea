//! Binary storage for listing embeddings.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - id_len: u32 (little-endian), then the listing id as UTF-8
//! - meta_len: u32 (little-endian), then the metadata as JSON
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{EmbeddingRecord, ItemMetadata, VectorEntry, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Upper bound on a single length-prefixed field, to fail fast on garbage.
const MAX_FIELD_LEN: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Storage manager for the vector file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the vector index from storage.
    ///
    /// # Arguments
    /// * `expected_model_id` - SHA256 hash of the expected model name
    /// * `expected_dimensions` - Expected embedding dimensions
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        validate_header(&header, expected_model_id, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);

        for _ in 0..header.entry_count {
            let record = read_entry(&mut reader, dimensions)?;
            let id = record.id.clone();
            if let Err(err) = index.insert(record) {
                log::warn!("Skipping stored vector {id}: {err}");
            }
        }

        Ok(index)
    }

    /// Save the vector index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");

        let result = write_to_file(&temp_path, index, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}

fn write_to_file(path: &Path, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
    let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
        VectorStorageError::InvalidFormat(format!("{} dimensions do not fit the header", index.dimensions()))
    })?;

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let header = Header {
        version: FORMAT_VERSION,
        model_id: *model_id,
        dimensions,
        entry_count: index.len() as u64,
    };
    write_header(&mut writer, &header)?;

    // sorted so identical indexes produce identical files
    let mut entries: Vec<(&str, &VectorEntry)> = index.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (id, entry) in entries {
        write_entry(&mut writer, id, entry)?;
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([
        header_bytes[43],
        header_bytes[44],
        header_bytes[45],
        header_bytes[46],
    ]);
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[35..43]);
    let entry_count = u64::from_le_bytes(count_bytes);

    Ok(Header {
        version,
        model_id,
        dimensions,
        entry_count,
    })
}

fn validate_header(
    header: &Header,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<(), VectorStorageError> {
    if header.model_id != *expected_model_id {
        return Err(VectorStorageError::ModelMismatch);
    }

    if header.dimensions as usize != expected_dimensions {
        return Err(VectorStorageError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    Ok(())
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_field(reader: &mut impl Read, what: &str) -> Result<Vec<u8>, VectorStorageError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);

    if len > MAX_FIELD_LEN {
        return Err(VectorStorageError::InvalidFormat(format!(
            "{what} length {len} exceeds limit"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_field(writer: &mut impl Write, bytes: &[u8]) -> Result<(), VectorStorageError> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FIELD_LEN)
        .ok_or_else(|| VectorStorageError::InvalidFormat(format!("field of {} bytes is too large", bytes.len())))?;

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_entry(reader: &mut impl Read, dimensions: usize) -> Result<EmbeddingRecord, VectorStorageError> {
    let id = String::from_utf8(read_field(reader, "id")?)
        .map_err(|_| VectorStorageError::InvalidFormat("id is not valid UTF-8".to_string()))?;

    let metadata: ItemMetadata = serde_json::from_slice(&read_field(reader, "metadata")?)?;

    let mut embedding = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        embedding.push(f32::from_le_bytes(float_bytes));
    }

    Ok(EmbeddingRecord {
        id,
        embedding,
        metadata,
    })
}

fn write_entry(writer: &mut impl Write, id: &str, entry: &VectorEntry) -> Result<(), VectorStorageError> {
    write_field(writer, id.as_bytes())?;
    write_field(writer, &serde_json::to_vec(&entry.metadata)?)?;

    for &value in &entry.embedding {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}
