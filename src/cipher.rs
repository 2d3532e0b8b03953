//! Streaming Cipher and Key Wrapping
//!
//! Every prepared artifact is encrypted with its own random ChaCha20
//! key+nonce, applied as a pass-through stream so preparation and
//! retrieval run in bounded memory. The per-file key material is then
//! wrapped (encrypted) under a process-wide master key with
//! ChaCha20-Poly1305 and only the wrapped form is persisted: the master
//! key never touches file contents, and rotating it means re-wrapping
//! stored keys, not re-encrypting files.
//!
//! Wrapped blob layout (hex-encoded when persisted):
//!
//! ```text
//! ┌────────────────────┬───────────────────────────────────────┐
//! │ aead nonce (12)    │ seal(master, file_key ‖ file_nonce)   │
//! └────────────────────┴───────────────────────────────────────┘
//! ```

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use std::io::{Read, Result as IoResult, Write};

/// ChaCha20 key size in bytes
pub const FILE_KEY_SIZE: usize = 32;
/// ChaCha20 (IETF) nonce size in bytes
pub const FILE_NONCE_SIZE: usize = 12;
/// AEAD nonce size prepended to the wrapped blob
const WRAP_NONCE_SIZE: usize = 12;

/// Error type for cipher operations
#[derive(Debug)]
pub enum CipherError {
    /// AEAD rejected the wrapped blob: wrong master key or corrupt blob.
    /// Fatal to the file's attempt, surfaced like an I/O fault.
    Unwrap,
    /// Wrapping failed (AEAD internal failure)
    Wrap,
    /// Persisted key material has the wrong shape
    Malformed(String),
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::Unwrap => write!(f, "Key unwrap failed: bad master key or corrupt blob"),
            CipherError::Wrap => write!(f, "Key wrap failed"),
            CipherError::Malformed(msg) => write!(f, "Malformed key material: {}", msg),
        }
    }
}

impl std::error::Error for CipherError {}

/// Per-file symmetric key + nonce. Generated fresh for every artifact,
/// never persisted in the clear.
#[derive(Clone)]
pub struct FileCipherKey {
    key: [u8; FILE_KEY_SIZE],
    nonce: [u8; FILE_NONCE_SIZE],
}

impl FileCipherKey {
    /// Generate from the system CSPRNG
    pub fn generate() -> Self {
        Self::from_rng(&mut rand::thread_rng())
    }

    /// Generate from a caller-supplied RNG (deterministic tests)
    pub fn from_rng<R: RngCore>(rng: &mut R) -> Self {
        let mut key = [0u8; FILE_KEY_SIZE];
        let mut nonce = [0u8; FILE_NONCE_SIZE];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut nonce);
        FileCipherKey { key, nonce }
    }

    /// Fresh cipher positioned at the start of the keystream
    pub fn cipher(&self) -> ChaCha20 {
        ChaCha20::new(&self.key.into(), &self.nonce.into())
    }
}

impl std::fmt::Debug for FileCipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs
        f.write_str("FileCipherKey(..)")
    }
}

/// Process-wide master key used only to wrap per-file keys
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; FILE_KEY_SIZE],
}

impl MasterKey {
    pub fn new(key: [u8; FILE_KEY_SIZE]) -> Self {
        MasterKey { key }
    }

    /// Generate from the system CSPRNG
    pub fn generate() -> Self {
        let mut key = [0u8; FILE_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        MasterKey { key }
    }

    /// Wrap a per-file key for persistence. Returns the hex-encoded blob
    /// stored as the LogFile's `archive_key`.
    pub fn wrap(&self, file_key: &FileCipherKey) -> Result<String, CipherError> {
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut wrap_nonce = [0u8; WRAP_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut wrap_nonce);

        let mut plaintext = [0u8; FILE_KEY_SIZE + FILE_NONCE_SIZE];
        plaintext[..FILE_KEY_SIZE].copy_from_slice(&file_key.key);
        plaintext[FILE_KEY_SIZE..].copy_from_slice(&file_key.nonce);

        let sealed = aead
            .encrypt(Nonce::from_slice(&wrap_nonce), plaintext.as_slice())
            .map_err(|_| CipherError::Wrap)?;

        let mut blob = Vec::with_capacity(WRAP_NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&wrap_nonce);
        blob.extend_from_slice(&sealed);
        Ok(hex::encode(blob))
    }

    /// Unwrap a persisted `archive_key` back into the per-file key
    pub fn unwrap_key(&self, wrapped_hex: &str) -> Result<FileCipherKey, CipherError> {
        let blob = hex::decode(wrapped_hex)
            .map_err(|e| CipherError::Malformed(format!("not hex: {}", e)))?;
        if blob.len() <= WRAP_NONCE_SIZE {
            return Err(CipherError::Malformed(format!(
                "wrapped blob too short: {} bytes",
                blob.len()
            )));
        }

        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = aead
            .decrypt(Nonce::from_slice(&blob[..WRAP_NONCE_SIZE]), &blob[WRAP_NONCE_SIZE..])
            .map_err(|_| CipherError::Unwrap)?;

        if plaintext.len() != FILE_KEY_SIZE + FILE_NONCE_SIZE {
            return Err(CipherError::Malformed(format!(
                "unwrapped key material has {} bytes",
                plaintext.len()
            )));
        }

        let mut key = [0u8; FILE_KEY_SIZE];
        let mut nonce = [0u8; FILE_NONCE_SIZE];
        key.copy_from_slice(&plaintext[..FILE_KEY_SIZE]);
        nonce.copy_from_slice(&plaintext[FILE_KEY_SIZE..]);
        Ok(FileCipherKey { key, nonce })
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

// ============================================================================
// Stream adapters
// ============================================================================

/// Writer adapter that XORs the keystream into every byte on its way to
/// the inner writer. Encryption and decryption are the same operation.
pub struct CipherWriter<W: Write> {
    inner: W,
    cipher: ChaCha20,
    scratch: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, cipher: ChaCha20) -> Self {
        CipherWriter {
            inner,
            cipher,
            scratch: Vec::new(),
        }
    }

    /// Unwrap the inner writer (flushes nothing)
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply_keystream(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        self.inner.flush()
    }
}

/// Reader adapter that XORs the keystream into every byte read from the
/// inner reader
pub struct CipherReader<R: Read> {
    inner: R,
    cipher: ChaCha20,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, cipher: ChaCha20) -> Self {
        CipherReader { inner, cipher }
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}
