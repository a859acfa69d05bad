//! Byte sources
//!
//! A [`ByteSource`] supplies the raw bytes of a QCOW image. The reader only
//! ever issues positioned reads, so a source never has to keep a cursor of its
//! own in sync with the virtual file.
//!
//! Two implementations are provided:
//! * [`FileSource`] opens a path and owns the resulting [`File`].
//! * [`StreamSource`] wraps anything that is [`Read`] + [`Seek`], including a
//!   `&mut File` borrowed from the caller for the duration of a session.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

/// Supplier of raw image bytes addressed by absolute offset.
pub trait ByteSource {
    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns fewer bytes than requested only when the end of the source is
    /// reached.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total size of the source in bytes.
    fn size(&mut self) -> io::Result<u64>;

    /// Short description used in log messages.
    fn describe(&self) -> String {
        String::from("byte stream")
    }
}

/// A path-backed source owning its file handle.
pub struct FileSource {
    path: PathBuf,
    file: File,
}

impl FileSource {
    /// Opens the file at `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns any [`io::Error`] produced by [`File::open`].
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(FileSource { path, file })
    }
}

impl ByteSource for FileSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        read_until_full(&mut self.file, buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Adapter turning any seekable reader into a [`ByteSource`].
///
/// The stream position is moved on every read; callers sharing the stream
/// should not rely on it between calls.
pub struct StreamSource<R> {
    inner: R,
}

impl<R: Read + Seek> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        StreamSource { inner }
    }
}

impl<R: Read + Seek> ByteSource for StreamSource<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.seek(SeekFrom::Start(offset))?;
        read_until_full(&mut self.inner, buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        self.inner.seek(SeekFrom::End(0))
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        (**self).size()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Keeps calling `read` until `buf` is full or the reader reports EOF.
fn read_until_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
