//! Fixed-size metrics exchange disk
//!
//! The exchange disk is a preallocated file that guests read as a block
//! device. Layout (all integers big-endian):
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0  | 4 | signature `mvbd` |
//! | 4  | 4 | flag: 0 = valid, 1 = write in progress |
//! | 8  | 4 | checksum: wrapping i32 sum of payload bytes |
//! | 12 | 4 | payload length |
//! | 16 | length | XML payload ending in one `\n` |
//!
//! There is no OS-level locking. Writers publish through a
//! lock / payload / unlock sequence and readers must ignore the payload
//! while the flag is set.

mod header;

pub use header::{checksum, ExchangeHeader, HEADER_SIZE, SIGNATURE};

use crate::models::MetricsDocument;
use crate::xml::{self, XmlError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Total size of an exchange disk in bytes
pub const DISK_SIZE: usize = 262_144;

/// Largest payload a single write may publish
pub const MAX_PAYLOAD: usize = DISK_SIZE - 24;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange disk I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("bad signature {0:?}")]
    BadSignature([u8; 4]),

    #[error("write in progress (flag={0})")]
    WriteInProgress(i32),

    #[error("invalid payload length {0}")]
    InvalidLength(i32),

    #[error("checksum mismatch: header={expected}, payload={actual}")]
    ChecksumMismatch { expected: i32, actual: i32 },
}

impl ExchangeError {
    /// Errors a reader may see while a writer is active; retry on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::WriteInProgress(_) | ExchangeError::ChecksumMismatch { .. }
        )
    }
}

/// Writer and reader for one exchange disk file
///
/// A path is expected to have a single writer.
#[derive(Debug, Clone)]
pub struct MetricsExchangeDisk {
    path: PathBuf,
}

impl MetricsExchangeDisk {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Preallocate the file and publish an empty document
    pub fn create(&self) -> Result<(), ExchangeError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        file.seek(SeekFrom::Start(DISK_SIZE as u64 - 1))?;
        file.write_all(&[0])?;
        file.sync_all()?;
        drop(file);

        debug!(path = %self.path.display(), size = DISK_SIZE, "Created exchange disk");
        self.write(&MetricsDocument::new())
    }

    /// Publish a document using the lock / payload / unlock sequence
    pub fn write(&self, doc: &MetricsDocument) -> Result<(), ExchangeError> {
        let mut payload = xml::encode_document(doc)?;
        payload.push(b'\n');

        if payload.len() > MAX_PAYLOAD {
            return Err(ExchangeError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let header = ExchangeHeader::new(checksum(&payload), payload.len() as i32);

        let mut file = OpenOptions::new().write(true).open(&self.path)?;

        // Lock: readers seeing flag=1 must treat the payload as incomplete.
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.locked().to_bytes())?;
        file.sync_all()?;

        file.write_all(&payload)?;

        // Unlock last.
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        debug!(
            path = %self.path.display(),
            bytes = payload.len(),
            metrics = doc.len(),
            "Published metrics to exchange disk"
        );
        Ok(())
    }

    /// Read only the header
    pub fn read_header(&self) -> Result<ExchangeHeader, ExchangeError> {
        let mut file = File::open(&self.path)?;
        Self::read_header_from(&mut file)
    }

    fn read_header_from(file: &mut File) -> Result<ExchangeHeader, ExchangeError> {
        let mut raw = [0u8; HEADER_SIZE];
        file.read_exact(&mut raw)?;
        ExchangeHeader::from_bytes(&raw)
    }

    /// Read the raw payload after validating the header and checksum
    pub fn read_payload(&self) -> Result<Vec<u8>, ExchangeError> {
        let mut file = File::open(&self.path)?;
        let header = Self::read_header_from(&mut file)?;

        if header.is_locked() {
            return Err(ExchangeError::WriteInProgress(header.flag));
        }
        if header.length < 0 || header.length as usize > MAX_PAYLOAD {
            return Err(ExchangeError::InvalidLength(header.length));
        }

        let mut payload = vec![0u8; header.length as usize];
        file.read_exact(&mut payload)?;

        let actual = checksum(&payload);
        if actual != header.checksum {
            return Err(ExchangeError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        Ok(payload)
    }

    /// Read and decode the currently published document
    pub fn read(&self) -> Result<MetricsDocument, ExchangeError> {
        let payload = self.read_payload()?;
        Ok(xml::decode_document(&payload)?)
    }
}
