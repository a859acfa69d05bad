//! QCOW file header
//!
//! Parsing of the big-endian header found at offset 0 of every QCOW image
//! (versions 1, 2 and 3) and the cluster geometry derived from it.
//!
//! See also: https://github.com/libyal/libqcow/blob/main/documentation/QEMU%20Copy-On-Write%20file%20format.asciidoc

use log::{debug, warn};
use serde::Serialize;

use crate::error::{QcowError, Result};
use crate::source::ByteSource;

/// `QFI\xfb`
pub const QCOW_SIGNATURE: [u8; 4] = [0x51, 0x46, 0x49, 0xfb];

/// Amount of data read to decode a header. Larger than any known header.
const HEADER_READ_SIZE: usize = 512;
const V1_HEADER_SIZE: usize = 48;
const V2_HEADER_SIZE: usize = 72;
const V3_HEADER_SIZE: usize = 104;

const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 21;
const MIN_LEVEL2_BITS: u32 = MIN_CLUSTER_BITS - 3;
const MAX_LEVEL2_BITS: u32 = MAX_CLUSTER_BITS - 3;
const MAX_BACKING_FILENAME_SIZE: u32 = 1023;

// Incompatible feature bits (version 3).
const INCOMPAT_DIRTY: u64 = 1 << 0;
const INCOMPAT_CORRUPT: u64 = 1 << 1;
const INCOMPAT_EXTERNAL_DATA: u64 = 1 << 2;
const INCOMPAT_COMPRESSION_TYPE: u64 = 1 << 3;
const INCOMPAT_KNOWN: u64 =
    INCOMPAT_DIRTY | INCOMPAT_CORRUPT | INCOMPAT_EXTERNAL_DATA | INCOMPAT_COMPRESSION_TYPE;

/// Encryption applied to cluster data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMethod {
    None,
    /// 128-bit AES in CBC mode, one IV per 512-byte sector.
    AesCbc,
    /// LUKS container, recognized but not supported.
    Luks,
}

impl TryFrom<u32> for EncryptionMethod {
    type Error = QcowError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(EncryptionMethod::None),
            1 => Ok(EncryptionMethod::AesCbc),
            2 => Ok(EncryptionMethod::Luks),
            other => Err(QcowError::Format(format!(
                "unknown encryption method: {}",
                other
            ))),
        }
    }
}

/// Decoded header fields plus the geometry derived from them.
#[derive(Debug, Clone)]
pub struct QcowHeader {
    /// Format version: 1, 2 or 3.
    pub version: u32,
    pub backing_filename_offset: u64,
    pub backing_filename_size: u32,
    /// Filled in by [`QcowHeader::read`] when the image references a parent.
    pub backing_filename: Option<String>,
    /// Only present in version 1 headers.
    pub modification_time: Option<u32>,
    pub media_size: u64,
    pub cluster_bits: u32,
    pub level2_bits: u32,
    pub encryption_method: EncryptionMethod,
    /// Number of 64-bit entries in the level 1 table.
    pub level1_entries: u64,
    pub level1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub number_of_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub header_length: u32,
    pub geometry: Geometry,
}

/// Bit masks and shifts used to walk the cluster tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cluster_size: u64,
    pub cluster_bits: u32,
    pub level2_entries: u64,
    pub level1_index_shift: u32,
    pub level2_index_mask: u64,
    pub cluster_offset_mask: u64,
    /// Mask applied to a table entry before it is interpreted.
    pub offset_mask: u64,
    pub compressed_flag: u64,
    pub compressed_size_shift: u32,
    pub compressed_offset_mask: u64,
    /// Version 1 stores compressed sizes in bytes, later versions in sectors.
    pub compressed_size_in_sectors: bool,
    /// Version 3 "reads as zero" flag on standard level 2 entries.
    pub zero_flag: Option<u64>,
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl QcowHeader {
    /// Reads and validates the header of the image behind `source`, including
    /// the backing filename if one is declared.
    ///
    /// # Errors
    ///
    /// `Format` if the data is not a supported QCOW header, `Io` if the source
    /// cannot be read.
    pub fn read(source: &mut dyn ByteSource) -> Result<Self> {
        let mut data = vec![0u8; HEADER_READ_SIZE];
        let read = source.read_at(0, &mut data)?;
        data.truncate(read);

        let mut header = Self::parse(&data)?;

        if header.backing_filename_offset > 0 && header.backing_filename_size > 0 {
            if header.backing_filename_size > MAX_BACKING_FILENAME_SIZE {
                return Err(QcowError::Format(format!(
                    "backing filename size {} exceeds {} bytes",
                    header.backing_filename_size, MAX_BACKING_FILENAME_SIZE
                )));
            }
            debug!(
                "Reading backing filename at offset 0x{:x} ({} bytes)",
                header.backing_filename_offset, header.backing_filename_size
            );
            let mut name = vec![0u8; header.backing_filename_size as usize];
            let read = source.read_at(header.backing_filename_offset, &mut name)?;
            if read != name.len() {
                return Err(QcowError::Format(format!(
                    "backing filename truncated: expected {} bytes, found {}",
                    name.len(),
                    read
                )));
            }
            header.backing_filename = Some(String::from_utf8_lossy(&name).into_owned());
        }
        Ok(header)
    }

    /// Parses a header from the first bytes of an image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(QcowError::Format("file too small to hold a header".into()));
        }
        if data[0..4] != QCOW_SIGNATURE {
            return Err(QcowError::Format(format!(
                "Invalid signature. Expected 514649fb, found {:x?}",
                &data[0..4]
            )));
        }

        let version = be_u32(data, 4);
        let required = match version {
            1 => V1_HEADER_SIZE,
            2 => V2_HEADER_SIZE,
            3 => V3_HEADER_SIZE,
            other => {
                return Err(QcowError::Format(format!(
                    "unsupported format version: {}",
                    other
                )))
            }
        };
        if data.len() < required {
            return Err(QcowError::Format(format!(
                "header truncated: version {} needs {} bytes, found {}",
                version,
                required,
                data.len()
            )));
        }

        let backing_filename_offset = be_u64(data, 8);
        let backing_filename_size = be_u32(data, 16);
        let media_size = be_u64(data, 24);

        let mut header = if version == 1 {
            let cluster_bits = data[32] as u32;
            let level2_bits = data[33] as u32;
            QcowHeader {
                version,
                backing_filename_offset,
                backing_filename_size,
                backing_filename: None,
                modification_time: Some(be_u32(data, 20)),
                media_size,
                cluster_bits,
                level2_bits,
                encryption_method: EncryptionMethod::try_from(be_u32(data, 36))?,
                level1_entries: 0,
                level1_table_offset: be_u64(data, 40),
                refcount_table_offset: 0,
                refcount_table_clusters: 0,
                number_of_snapshots: 0,
                snapshots_offset: 0,
                incompatible_features: 0,
                compatible_features: 0,
                autoclear_features: 0,
                header_length: V1_HEADER_SIZE as u32,
                geometry: Geometry::default(),
            }
        } else {
            let cluster_bits = be_u32(data, 20);
            let (incompatible_features, compatible_features, autoclear_features, header_length) =
                if version == 3 {
                    (
                        be_u64(data, 72),
                        be_u64(data, 80),
                        be_u64(data, 88),
                        be_u32(data, 100),
                    )
                } else {
                    (0, 0, 0, V2_HEADER_SIZE as u32)
                };
            QcowHeader {
                version,
                backing_filename_offset,
                backing_filename_size,
                backing_filename: None,
                modification_time: None,
                media_size,
                cluster_bits,
                level2_bits: cluster_bits.saturating_sub(3),
                encryption_method: EncryptionMethod::try_from(be_u32(data, 32))?,
                level1_entries: be_u32(data, 36) as u64,
                level1_table_offset: be_u64(data, 40),
                refcount_table_offset: be_u64(data, 48),
                refcount_table_clusters: be_u32(data, 56),
                number_of_snapshots: be_u32(data, 60),
                snapshots_offset: be_u64(data, 64),
                incompatible_features,
                compatible_features,
                autoclear_features,
                header_length,
                geometry: Geometry::default(),
            }
        };

        header.validate(data)?;
        header.geometry = Geometry::new(header.version, header.cluster_bits, header.level2_bits);
        if header.version == 1 {
            let bytes_per_level1_entry =
                header.geometry.cluster_size << header.level2_bits;
            header.level1_entries = header.media_size.div_ceil(bytes_per_level1_entry);
        }

        debug!("Parsed header: {:?}", header);
        Ok(header)
    }

    fn validate(&self, data: &[u8]) -> Result<()> {
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(QcowError::Format(format!(
                "unsupported number of cluster block bits: {}",
                self.cluster_bits
            )));
        }
        if !(MIN_LEVEL2_BITS..=MAX_LEVEL2_BITS).contains(&self.level2_bits) {
            return Err(QcowError::Format(format!(
                "unsupported number of level 2 table bits: {}",
                self.level2_bits
            )));
        }
        if self.media_size > i64::MAX as u64 {
            return Err(QcowError::Format(format!(
                "media size 0x{:x} out of bounds",
                self.media_size
            )));
        }

        if self.version == 3 {
            if self.incompatible_features & INCOMPAT_DIRTY != 0 {
                warn!("Image is marked dirty, refcounts may be inconsistent");
            }
            if self.incompatible_features & INCOMPAT_CORRUPT != 0 {
                warn!("Image is marked corrupt, data may be inconsistent");
            }
            if self.incompatible_features & INCOMPAT_EXTERNAL_DATA != 0 {
                return Err(QcowError::Format(
                    "external data files are not supported".into(),
                ));
            }
            if self.incompatible_features & INCOMPAT_COMPRESSION_TYPE != 0 {
                let compression_type = if self.header_length as usize > V3_HEADER_SIZE
                    && data.len() > V3_HEADER_SIZE
                {
                    data[V3_HEADER_SIZE]
                } else {
                    0
                };
                if compression_type != 0 {
                    return Err(QcowError::Format(format!(
                        "unsupported compression type: {}",
                        compression_type
                    )));
                }
            }
            let unknown = self.incompatible_features & !INCOMPAT_KNOWN;
            if unknown != 0 {
                return Err(QcowError::Format(format!(
                    "unsupported incompatible features: 0x{:x}",
                    unknown
                )));
            }
        }
        Ok(())
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry::new(2, MIN_CLUSTER_BITS, MIN_CLUSTER_BITS - 3)
    }
}

impl Geometry {
    /// Derives masks and shifts. `cluster_bits` and `level2_bits` must have
    /// been validated.
    pub fn new(version: u32, cluster_bits: u32, level2_bits: u32) -> Self {
        let (offset_mask, compressed_flag, compressed_size_shift) = if version == 1 {
            (0x7fff_ffff_ffff_ffff, 1u64 << 63, 63 - cluster_bits)
        } else {
            (0x3fff_ffff_ffff_ffff, 1u64 << 62, 62 - (cluster_bits - 8))
        };
        Geometry {
            cluster_size: 1u64 << cluster_bits,
            cluster_bits,
            level2_entries: 1u64 << level2_bits,
            level1_index_shift: cluster_bits + level2_bits,
            level2_index_mask: low_mask(level2_bits),
            cluster_offset_mask: low_mask(cluster_bits),
            offset_mask,
            compressed_flag,
            compressed_size_shift,
            compressed_offset_mask: low_mask(compressed_size_shift),
            compressed_size_in_sectors: version != 1,
            zero_flag: (version >= 3).then_some(1),
        }
    }

    /// Index into the level 1 table for a guest offset.
    #[inline]
    pub fn level1_index(&self, offset: u64) -> u64 {
        offset >> self.level1_index_shift
    }

    /// Index into a level 2 table for a guest offset.
    #[inline]
    pub fn level2_index(&self, offset: u64) -> u64 {
        (offset >> self.cluster_bits) & self.level2_index_mask
    }

    /// Position of a guest offset inside its cluster.
    #[inline]
    pub fn offset_in_cluster(&self, offset: u64) -> u64 {
        offset & self.cluster_offset_mask
    }
}
