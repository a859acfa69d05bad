//! Random-access reader for QEMU Copy-On-Write (QCOW) disk images.
//!
//! [`QcowFile`] exposes the guest content of a version 1, 2 or 3 image as a
//! flat, seekable byte sequence. Sparse and zero clusters read as zeros,
//! compressed clusters are inflated and legacy AES-CBC encryption is undone
//! when a password or key is supplied.

mod cluster;
mod encryption;
pub mod error;
pub mod file;
pub mod header;
pub mod source;

#[cfg(test)]
mod test_image;

pub use error::{QcowError, Result};
pub use file::{QcowFile, QcowInfo, Whence};
pub use header::{EncryptionMethod, QcowHeader};
pub use source::{ByteSource, FileSource, StreamSource};
