//! Retrieval - Reads an Archived File Back
//!
//! The inverse of preparation: fetch the artifact from the archive,
//! unwrap the per-file key with the master key, then stream the body
//! through decryption and decompression while tallying the integrity
//! totals the header promises. A mismatch in size or checksum means the
//! artifact was corrupted somewhere between preparation and now, and the
//! caller gets an error instead of silently truncated data.

use crate::archive::{ArchiveError, ArchiveStore};
use crate::cipher::{CipherError, CipherReader, MasterKey};
use crate::logfile::LogFile;
use crate::prepare::{ArtifactHeader, PrepareError, ARTIFACT_HEADER_SIZE};
use std::io::{Error as IoError, Read, Write};
use std::sync::Arc;
use tracing::info;

/// Error type for retrieval
#[derive(Debug)]
pub enum RetrieveError {
    /// Remote store fault or missing object
    Archive(ArchiveError),
    /// The persisted key could not be unwrapped
    Cipher(CipherError),
    /// The artifact failed header or integrity validation
    Corrupt(String),
    /// Local fault while writing the recovered bytes out
    Io(IoError),
    /// Record is missing a field the UPLOADED state guarantees
    MissingField { field: &'static str, id: String },
}

impl std::fmt::Display for RetrieveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrieveError::Archive(e) => write!(f, "Retrieve archive error: {}", e),
            RetrieveError::Cipher(e) => write!(f, "Retrieve cipher error: {}", e),
            RetrieveError::Corrupt(msg) => write!(f, "Corrupt archived artifact: {}", msg),
            RetrieveError::Io(e) => write!(f, "Retrieve I/O error: {}", e),
            RetrieveError::MissingField { field, id } => {
                write!(f, "LogFile {} is missing {}", id, field)
            }
        }
    }
}

impl std::error::Error for RetrieveError {}

impl From<ArchiveError> for RetrieveError {
    fn from(e: ArchiveError) -> Self {
        RetrieveError::Archive(e)
    }
}

impl From<CipherError> for RetrieveError {
    fn from(e: CipherError) -> Self {
        RetrieveError::Cipher(e)
    }
}

impl From<IoError> for RetrieveError {
    fn from(e: IoError) -> Self {
        RetrieveError::Io(e)
    }
}

impl From<PrepareError> for RetrieveError {
    fn from(e: PrepareError) -> Self {
        match e {
            PrepareError::Corrupt(msg) => RetrieveError::Corrupt(msg),
            other => RetrieveError::Corrupt(other.to_string()),
        }
    }
}

/// Chunk size for the streaming copy
const COPY_CHUNK: usize = 64 * 1024;

/// Reads archived files back into their original raw bytes
pub struct Retriever {
    master: MasterKey,
    store: Arc<dyn ArchiveStore>,
}

impl Retriever {
    pub fn new(master: MasterKey, store: Arc<dyn ArchiveStore>) -> Self {
        Retriever { master, store }
    }

    /// Fetch and recover the raw bytes of an uploaded file
    pub async fn retrieve(&self, file: &LogFile) -> Result<Vec<u8>, RetrieveError> {
        let mut out = Vec::new();
        self.retrieve_to(file, &mut out).await?;
        Ok(out)
    }

    /// Fetch an uploaded file and stream its recovered raw bytes into
    /// `out`, verifying size and checksum against the artifact header.
    pub async fn retrieve_to<W: Write>(
        &self,
        file: &LogFile,
        out: &mut W,
    ) -> Result<u64, RetrieveError> {
        let uri = file
            .archive_uri
            .as_deref()
            .ok_or_else(|| RetrieveError::MissingField {
                field: "archive_uri",
                id: file.id().to_string(),
            })?;
        let wrapped = file
            .archive_key
            .as_deref()
            .ok_or_else(|| RetrieveError::MissingField {
                field: "archive_key",
                id: file.id().to_string(),
            })?;

        // The object is consumed as a stream: header first, then the
        // body straight through decrypt + decompress, never whole.
        let mut body = self.store.get(uri).await?;
        let mut header_bytes = [0u8; ARTIFACT_HEADER_SIZE];
        body.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RetrieveError::Corrupt("artifact shorter than its header".to_string())
            } else {
                RetrieveError::Io(e)
            }
        })?;
        let header = ArtifactHeader::from_bytes(&header_bytes)?;
        let file_key = self.master.unwrap_key(wrapped)?;

        let decrypt = CipherReader::new(body, file_key.cipher());
        let mut decompress = zstd::stream::read::Decoder::new(decrypt)
            .map_err(|e| RetrieveError::Corrupt(format!("zstd init failed: {}", e)))?;

        let mut hasher = crc32fast::Hasher::new();
        let mut recovered: u64 = 0;
        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            let n = decompress
                .read(&mut chunk)
                .map_err(|e| RetrieveError::Corrupt(format!("decode failed: {}", e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            recovered += n as u64;
            out.write_all(&chunk[..n])?;
        }

        if recovered != header.raw_size {
            return Err(RetrieveError::Corrupt(format!(
                "size mismatch: header promises {} bytes, recovered {}",
                header.raw_size, recovered
            )));
        }
        let crc = hasher.finalize();
        if crc != header.raw_crc32 {
            return Err(RetrieveError::Corrupt(format!(
                "checksum mismatch: header {:08x}, recovered {:08x}",
                header.raw_crc32, crc
            )));
        }

        info!("Retrieved {} ({} bytes) from {}", file.id(), recovered, uri);
        Ok(recovered)
    }
}
