//! QCOW virtual file
//!
//! [`QcowFile`] is the public façade: an offset-tracked, seekable, readable
//! view of the guest content of a QCOW image. It implements [`Read`] and
//! [`Seek`] so it can be handed to anything expecting a `File` on the
//! original media.
//!
//! ```no_run
//! # use exhume_qcow::{QcowFile, Whence};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut image = QcowFile::new();
//! image.set_password("secret")?;
//! image.open("/evidence/disk.qcow2")?;
//! image.seek(0x200, Whence::Start)?;
//! let sector = image.read(512)?;
//! image.close();
//! # Ok(())
//! # }
//! ```

use std::{
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use log::{debug, info};
use serde::Serialize;

use crate::cluster::ClusterReader;
use crate::encryption::{
    key_from_bytes, key_from_password, key_from_utf16_password, SectorCipher, KEY_SIZE,
};
use crate::error::{QcowError, Result};
use crate::header::{EncryptionMethod, QcowHeader};
use crate::source::{ByteSource, FileSource, StreamSource};

/// Origin of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the media (`SEEK_SET`).
    Start,
    /// From the current offset (`SEEK_CUR`).
    Current,
    /// From the end of the media (`SEEK_END`).
    End,
}

impl TryFrom<i32> for Whence {
    type Error = QcowError;

    /// Maps the conventional `SEEK_SET` / `SEEK_CUR` / `SEEK_END` values.
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(QcowError::InvalidArgument(format!(
                "unsupported whence: {}",
                other
            ))),
        }
    }
}

/// Summary of an open image, as printed by `--info`.
#[derive(Debug, Clone, Serialize)]
pub struct QcowInfo {
    pub source: String,
    pub format_version: u32,
    pub media_size: u64,
    pub cluster_size: u64,
    pub encryption_method: EncryptionMethod,
    pub backing_filename: Option<String>,
    pub number_of_snapshots: u32,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
}

/// State that only exists between `open` and `close`.
struct OpenImage<'a> {
    reader: ClusterReader<'a>,
    media_size: u64,
    /// Never negative, may exceed `media_size`.
    offset: i64,
}

impl OpenImage<'_> {
    /// Number of bytes a read of `size` at `offset` produces.
    fn available(&self, offset: i64, size: usize) -> usize {
        let offset = offset as u64;
        if offset >= self.media_size {
            return 0;
        }
        (self.media_size - offset).min(size as u64) as usize
    }

    fn read_vec(&mut self, offset: i64, size: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.available(offset, size)];
        if !data.is_empty() {
            let read = self.reader.read_at(offset as u64, &mut data)?;
            data.truncate(read);
        }
        Ok(data)
    }
}

enum State<'a> {
    Closed,
    Open(OpenImage<'a>),
}

/// Read-only virtual file over a QCOW image.
///
/// The lifetime ties the handle to a caller-supplied stream when one is used
/// (see [`QcowFile::open_stream`]); path-backed handles can be `'static`.
pub struct QcowFile<'a> {
    state: State<'a>,
    credential: Option<[u8; KEY_SIZE]>,
}

impl Default for QcowFile<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> QcowFile<'a> {
    /// Creates a closed handle.
    pub fn new() -> Self {
        QcowFile {
            state: State::Closed,
            credential: None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    /// Sets the password used to decrypt the next image opened.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the file is open, `InvalidArgument` if the password
    /// is not US-ASCII.
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        if self.is_open() {
            return Err(QcowError::open("set a password"));
        }
        self.credential = Some(key_from_password(password)?);
        Ok(())
    }

    /// [`QcowFile::set_password`] for a UTF-16 encoded password.
    pub fn set_password_utf16(&mut self, password: &[u16]) -> Result<()> {
        if self.is_open() {
            return Err(QcowError::open("set a password"));
        }
        self.credential = Some(key_from_utf16_password(password)?);
        Ok(())
    }

    /// Sets a raw 16-byte AES key for the next image opened.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the file is open, `InvalidArgument` on a key of the
    /// wrong size.
    pub fn set_keys(&mut self, key: &[u8]) -> Result<()> {
        if self.is_open() {
            return Err(QcowError::open("set keys"));
        }
        self.credential = Some(key_from_bytes(key)?);
        Ok(())
    }

    /// Opens the image at `path` read-only.
    ///
    /// # Errors
    ///
    /// `AlreadyOpen`, `Access` if the path cannot be opened, `Credential` if
    /// the image is encrypted and no credential was set, `Format` for corrupt
    /// or unsupported images.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.ensure_closed()?;
        debug!("Opening QCOW image: {}", path.as_ref().display());
        let source = FileSource::open(path).map_err(QcowError::Access)?;
        self.open_boxed(Box::new(source))
    }

    /// Opens an image read through a caller-supplied stream.
    ///
    /// The stream is only used for the duration of the session; passing a
    /// `&mut File` hands it back to the caller on close.
    pub fn open_stream<R: Read + Seek + 'a>(&mut self, stream: R) -> Result<()> {
        self.ensure_closed()?;
        self.open_boxed(Box::new(StreamSource::new(stream)))
    }

    /// Opens an image read through any [`ByteSource`].
    pub fn open_source<S: ByteSource + 'a>(&mut self, source: S) -> Result<()> {
        self.ensure_closed()?;
        self.open_boxed(Box::new(source))
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.is_open() {
            return Err(QcowError::AlreadyOpen);
        }
        Ok(())
    }

    /// Decodes the image behind `source`. On error `source` is dropped here
    /// and the handle stays closed.
    fn open_boxed(&mut self, mut source: Box<dyn ByteSource + 'a>) -> Result<()> {
        let source_size = source.size().map_err(QcowError::Access)?;
        let header = QcowHeader::read(source.as_mut())?;

        let cipher = match header.encryption_method {
            EncryptionMethod::None => None,
            EncryptionMethod::AesCbc => {
                let key = self.credential.as_ref().ok_or_else(|| {
                    QcowError::Credential(
                        "image is encrypted but no password or key was set".into(),
                    )
                })?;
                Some(SectorCipher::new(key))
            }
            EncryptionMethod::Luks => {
                return Err(QcowError::Format(
                    "LUKS encryption is not supported".into(),
                ))
            }
        };

        let media_size = header.media_size;
        let reader = ClusterReader::new(source, source_size, header, cipher)?;
        debug!(
            "Opened {} (media size: {} bytes)",
            reader.describe_source(),
            media_size
        );

        // The credential belongs to this session only.
        self.credential = None;
        self.state = State::Open(OpenImage {
            reader,
            media_size,
            offset: 0,
        });
        Ok(())
    }

    /// Releases the byte source. Does nothing on a closed file.
    pub fn close(&mut self) {
        if let State::Open(image) = std::mem::replace(&mut self.state, State::Closed) {
            debug!("Closing {}", image.reader.describe_source());
        }
    }

    fn image(&self, operation: &'static str) -> Result<&OpenImage<'a>> {
        match &self.state {
            State::Open(image) => Ok(image),
            State::Closed => Err(QcowError::closed(operation)),
        }
    }

    fn image_mut(&mut self, operation: &'static str) -> Result<&mut OpenImage<'a>> {
        match &mut self.state {
            State::Open(image) => Ok(image),
            State::Closed => Err(QcowError::closed(operation)),
        }
    }

    /// Size of the decoded media in bytes.
    pub fn media_size(&self) -> Result<u64> {
        Ok(self.image("get the media size")?.media_size)
    }

    /// Current offset.
    pub fn tell(&self) -> Result<i64> {
        Ok(self.image("get the offset")?.offset)
    }

    /// Moves the cursor and returns the new offset.
    ///
    /// Offsets past the end of the media are accepted, negative results are
    /// not. A failed seek leaves the cursor where it was.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a closed file, `InvalidOffset` if the resulting
    /// offset would be negative or overflow.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let image = self.image_mut("seek")?;
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => image.offset,
            Whence::End => image.media_size as i64,
        };
        let candidate = base
            .checked_add(offset)
            .ok_or(QcowError::InvalidOffset(offset))?;
        if candidate < 0 {
            return Err(QcowError::InvalidOffset(candidate));
        }
        image.offset = candidate;
        Ok(candidate)
    }

    /// [`QcowFile::seek`] with a raw `SEEK_*` value.
    ///
    /// # Errors
    ///
    /// Additionally `InvalidArgument` for an unrecognized `whence`.
    pub fn seek_whence(&mut self, offset: i64, whence: i32) -> Result<i64> {
        self.image("seek")?;
        let whence = Whence::try_from(whence)?;
        self.seek(offset, whence)
    }

    /// Reads up to `size` bytes at the current offset and advances it.
    ///
    /// Returns an empty vector at or past the end of the media.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a closed file, `InvalidArgument` if `size` exceeds
    /// `isize::MAX`, `Io`/`Format` if the image cannot be decoded. The cursor
    /// does not move on error.
    pub fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let image = self.image_mut("read")?;
        check_size(size)?;
        let offset = image.offset;
        let data = image.read_vec(offset, size)?;
        image.offset = offset + data.len() as i64;
        Ok(data)
    }

    /// Reads into `buf` at the current offset and advances it. Returns the
    /// number of bytes read, 0 at or past the end of the media.
    pub fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        let image = self.image_mut("read")?;
        let offset = image.offset;
        let len = image.available(offset, buf.len());
        if len == 0 {
            return Ok(0);
        }
        let read = image.reader.read_at(offset as u64, &mut buf[..len])?;
        image.offset = offset + read as i64;
        Ok(read)
    }

    /// Reads up to `size` bytes at `offset`, leaving the cursor right after
    /// the returned data, exactly like `seek(offset, Whence::Start)` followed
    /// by `read(size)`.
    ///
    /// # Errors
    ///
    /// `InvalidOffset` if `offset` is negative, otherwise as [`QcowFile::read`].
    pub fn read_at(&mut self, size: usize, offset: i64) -> Result<Vec<u8>> {
        let image = self.image_mut("read")?;
        if offset < 0 {
            return Err(QcowError::InvalidOffset(offset));
        }
        check_size(size)?;
        let data = image.read_vec(offset, size)?;
        image.offset = offset + data.len() as i64;
        Ok(data)
    }

    /// Header summary of the open image.
    pub fn info(&self) -> Result<QcowInfo> {
        let image = self.image("get information")?;
        let header = image.reader.header();
        Ok(QcowInfo {
            source: image.reader.describe_source(),
            format_version: header.version,
            media_size: header.media_size,
            cluster_size: header.geometry.cluster_size,
            encryption_method: header.encryption_method,
            backing_filename: header.backing_filename.clone(),
            number_of_snapshots: header.number_of_snapshots,
            incompatible_features: header.incompatible_features,
            compatible_features: header.compatible_features,
            autoclear_features: header.autoclear_features,
        })
    }

    /// Outputs a human-readable summary to the current `log` subscriber.
    pub fn print_info(&self) -> Result<()> {
        let info = self.info()?;
        info!("QCOW File Information:");
        info!("  Source: {}", info.source);
        info!("  Format Version: {}", info.format_version);
        info!("  Media Size: {} bytes", info.media_size);
        info!("  Cluster Size: {} bytes", info.cluster_size);
        info!("  Encryption Method: {:?}", info.encryption_method);
        if let Some(backing_filename) = &info.backing_filename {
            info!("  Backing Filename: {}", backing_filename);
        }
        info!("  Number of Snapshots: {}", info.number_of_snapshots);
        if info.format_version >= 3 {
            debug!(
                "  Features (incompatible / compatible / autoclear): 0x{:x} / 0x{:x} / 0x{:x}",
                info.incompatible_features, info.compatible_features, info.autoclear_features
            );
        }
        Ok(())
    }
}

fn check_size(size: usize) -> Result<()> {
    if size > isize::MAX as usize {
        return Err(QcowError::InvalidArgument(format!(
            "read size {} out of bounds",
            size
        )));
    }
    Ok(())
}

impl Read for QcowFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_buffer(buf)?)
    }
}

impl Seek for QcowFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(o) => (
                i64::try_from(o).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Seek offset out of bounds")
                })?,
                Whence::Start,
            ),
            SeekFrom::Current(o) => (o, Whence::Current),
            SeekFrom::End(o) => (o, Whence::End),
        };
        let new_offset = QcowFile::seek(self, offset, whence)?;
        Ok(new_offset as u64)
    }
}
