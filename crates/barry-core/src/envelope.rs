// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The at-rest encryption envelope.
//!
//! On-disk layout, byte for byte:
//!
//! | Offset | Field | Encoding |
//! |--------|-------|----------|
//! | 0 | Magic | ASCII `BARRY1` (6 bytes) |
//! | 6 | Comment | NUL-terminated ASCII, at most 128 bytes |
//! | … | Key name | NUL-terminated ASCII, at most 64 bytes |
//! | … | SHA-256 of plaintext | 32 bytes |
//! | … | IV | 16 bytes |
//! | … | Buffer size | little-endian u32, multiple of 16, in `[16, 100 MiB]` |
//! | … | Ciphertext | AES-256-CTR over the plaintext, streamed in buffer-size chunks |
//!
//! Decryption verifies the magic, resolves the key by name through a caller-provided lookup,
//! streams the plaintext out while accumulating its SHA-256, and fails if the digest does not
//! match the header.

use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Magic bytes identifying an envelope file.
pub const MAGIC: &[u8; 6] = b"BARRY1";
/// Maximum length of the comment field, terminator excluded.
pub const COMMENT_MAX_LEN: usize = 128;
/// Maximum length of the key-name field, terminator excluded.
pub const KEY_NAME_MAX_LEN: usize = 64;
/// Length of the AES-CTR initialization vector.
pub const IV_LEN: usize = 16;
/// Smallest accepted streaming buffer size.
pub const MIN_BUFFER_SIZE: u32 = 16;
/// Largest accepted streaming buffer size.
pub const MAX_BUFFER_SIZE: u32 = 100 * 1024 * 1024;
/// Buffer size written by this implementation.
pub const DEFAULT_BUFFER_SIZE: u32 = 64 * 1024;

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;
/// An AES-256 key.
pub type Key = [u8; KEY_LEN];

/// Error returned by envelope encoding or decoding.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Underlying I/O failure.
    #[error("envelope I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file does not start with the `BARRY1` magic.
    #[error("invalid signature")]
    InvalidSignature,
    /// A string field is not ASCII, not NUL-terminated, or too long.
    #[error("invalid {field} string field")]
    InvalidString {
        /// Name of the offending field.
        field: &'static str,
    },
    /// The key name in the header is not known to the caller.
    #[error("unknown encryption key '{0}'")]
    UnknownKey(String),
    /// The buffer size is outside `[MIN_BUFFER_SIZE, MAX_BUFFER_SIZE]`.
    #[error("invalid buffer size {0} (out of range)")]
    BufferSizeRange(u32),
    /// The buffer size is not a multiple of the AES block size.
    #[error("invalid buffer size {0} (must be a multiple of 16)")]
    BufferSizeAlignment(u32),
    /// The plaintext digest does not match the header.
    #[error("invalid checksum, is the key correct?")]
    ChecksumMismatch,
}

/// The decoded fixed header of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Free-form ASCII comment.
    pub comment: String,
    /// Name of the key the payload was encrypted with.
    pub key_name: String,
    /// SHA-256 digest of the plaintext.
    pub plaintext_sha256: [u8; 32],
    /// AES-CTR initialization vector.
    pub iv: [u8; IV_LEN],
    /// Chunk size the ciphertext was streamed with.
    pub buffer_size: u32,
}

impl EnvelopeHeader {
    /// Reads and validates a header from `input`.
    pub fn read_from(input: &mut impl Read) -> Result<Self, EnvelopeError> {
        let mut magic = [0u8; MAGIC.len()];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(EnvelopeError::InvalidSignature);
        }

        let comment = read_nul_terminated(input, COMMENT_MAX_LEN, "comment")?;
        let key_name = read_nul_terminated(input, KEY_NAME_MAX_LEN, "key name")?;

        let mut plaintext_sha256 = [0u8; 32];
        input.read_exact(&mut plaintext_sha256)?;

        let mut iv = [0u8; IV_LEN];
        input.read_exact(&mut iv)?;

        let mut size_bytes = [0u8; 4];
        input.read_exact(&mut size_bytes)?;
        let buffer_size = u32::from_le_bytes(size_bytes);
        validate_buffer_size(buffer_size)?;

        Ok(Self {
            comment,
            key_name,
            plaintext_sha256,
            iv,
            buffer_size,
        })
    }

    /// Writes the header to `output`.
    pub fn write_to(&self, output: &mut impl Write) -> Result<(), EnvelopeError> {
        validate_buffer_size(self.buffer_size)?;
        output.write_all(MAGIC)?;
        write_nul_terminated(output, &self.comment, COMMENT_MAX_LEN, "comment")?;
        write_nul_terminated(output, &self.key_name, KEY_NAME_MAX_LEN, "key name")?;
        output.write_all(&self.plaintext_sha256)?;
        output.write_all(&self.iv)?;
        output.write_all(&self.buffer_size.to_le_bytes())?;
        Ok(())
    }
}

fn validate_buffer_size(buffer_size: u32) -> Result<(), EnvelopeError> {
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&buffer_size) {
        return Err(EnvelopeError::BufferSizeRange(buffer_size));
    }
    if buffer_size % 16 != 0 {
        return Err(EnvelopeError::BufferSizeAlignment(buffer_size));
    }
    Ok(())
}

fn read_nul_terminated(
    input: &mut impl Read,
    max_len: usize,
    field: &'static str,
) -> Result<String, EnvelopeError> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        input.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        if !byte[0].is_ascii() || bytes.len() == max_len {
            return Err(EnvelopeError::InvalidString { field });
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|_| EnvelopeError::InvalidString { field })
}

fn write_nul_terminated(
    output: &mut impl Write,
    value: &str,
    max_len: usize,
    field: &'static str,
) -> Result<(), EnvelopeError> {
    if value.len() > max_len || !value.is_ascii() || value.bytes().any(|byte| byte == 0) {
        return Err(EnvelopeError::InvalidString { field });
    }
    output.write_all(value.as_bytes())?;
    output.write_all(&[0])?;
    Ok(())
}

/// Encrypts `source` into `output` as a complete envelope.
///
/// The source is read twice: a first pass computes the plaintext digest for the header, then the
/// source is rewound and streamed through AES-256-CTR.
pub fn encrypt(
    source: &mut (impl Read + Seek),
    output: &mut impl Write,
    key_name: &str,
    key: &Key,
    comment: &str,
) -> Result<(), EnvelopeError> {
    let buffer_size = DEFAULT_BUFFER_SIZE;
    let mut buf = vec![0u8; buffer_size as usize];

    let mut hasher = Sha256::new();
    loop {
        let read = source.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    source.seek(SeekFrom::Start(0))?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let header = EnvelopeHeader {
        comment: comment.to_string(),
        key_name: key_name.to_string(),
        plaintext_sha256: hasher.finalize().into(),
        iv,
        buffer_size,
    };
    header.write_to(output)?;

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    loop {
        let read = source.read(&mut buf)?;
        if read == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..read]);
        output.write_all(&buf[..read])?;
    }
    output.flush()?;
    Ok(())
}

/// Decrypts an envelope from `input` into `output`.
///
/// `key_lookup` resolves the key name found in the header; returning `None` aborts with
/// [`EnvelopeError::UnknownKey`]. The plaintext digest is verified against the header before
/// this function returns successfully. Note that plaintext is written to `output` before the
/// digest can be checked; callers decrypting to a file must discard it on error.
pub fn decrypt(
    input: &mut impl Read,
    output: &mut impl Write,
    key_lookup: impl FnOnce(&str) -> Option<Key>,
) -> Result<EnvelopeHeader, EnvelopeError> {
    let header = EnvelopeHeader::read_from(input)?;
    let key = key_lookup(&header.key_name)
        .ok_or_else(|| EnvelopeError::UnknownKey(header.key_name.clone()))?;

    let mut cipher = Aes256Ctr::new((&key).into(), (&header.iv).into());
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; header.buffer_size as usize];
    loop {
        let read = input.read(&mut buf)?;
        if read == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..read]);
        hasher.update(&buf[..read]);
        output.write_all(&buf[..read])?;
    }
    output.flush()?;

    if <[u8; 32]>::from(hasher.finalize()) != header.plaintext_sha256 {
        return Err(EnvelopeError::ChecksumMismatch);
    }
    Ok(header)
}

/// Encrypts the file at `path` in place.
///
/// The envelope is written to a sibling temporary file which then replaces the original; the
/// original permissions and `(atime, mtime)` are restored on the result.
pub fn encrypt_file_in_place(
    path: &Path,
    key_name: &str,
    key: &Key,
    comment: &str,
) -> Result<(), EnvelopeError> {
    transform_file_in_place(path, |source, output| {
        encrypt(source, output, key_name, key, comment)
    })
}

/// Decrypts the envelope at `path` in place; the inverse of [`encrypt_file_in_place`].
pub fn decrypt_file_in_place(
    path: &Path,
    key_lookup: impl FnOnce(&str) -> Option<Key>,
) -> Result<(), EnvelopeError> {
    transform_file_in_place(path, |source, output| {
        decrypt(source, output, key_lookup).map(|_| ())
    })
}

fn transform_file_in_place(
    path: &Path,
    transform: impl FnOnce(&mut fs::File, &mut fs::File) -> Result<(), EnvelopeError>,
) -> Result<(), EnvelopeError> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("'{}' has no parent directory", path.display()),
        )
    })?;

    let metadata = fs::metadata(path)?;
    let times = fs::FileTimes::new()
        .set_accessed(metadata.accessed()?)
        .set_modified(metadata.modified()?);

    let mut source = fs::File::open(path)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".barry-codec-")
        .tempfile_in(parent)?;

    transform(&mut source, tmp.as_file_mut())?;

    tmp.as_file().set_permissions(metadata.permissions())?;
    tmp.as_file().set_times(times)?;
    tmp.persist(path).map_err(|error| error.error)?;
    Ok(())
}
