//! Cluster resolution and retrieval.
//!
//! Guest offsets are translated through the level 1 and level 2 tables into
//! cluster blocks inside the image file. Cluster blocks can be sparse,
//! zero-flagged (version 3), deflate-compressed or AES encrypted.

use std::io::Read;

use flate2::read::DeflateDecoder;
use log::{debug, warn};

use crate::encryption::{SectorCipher, SECTOR_SIZE};
use crate::error::{QcowError, Result};
use crate::header::{Geometry, QcowHeader};
use crate::source::ByteSource;

/// Number of level 2 tables kept in memory.
const LEVEL2_CACHE_ENTRIES: usize = 8;
/// Number of decoded cluster blocks kept in memory.
const CLUSTER_CACHE_ENTRIES: usize = 16;

/// Where the data of one guest cluster lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClusterLocation {
    /// Not allocated, reads as zeros.
    Sparse,
    /// Allocated but flagged as reading zeros.
    Zero,
    Standard { file_offset: u64 },
    Compressed { file_offset: u64, size: u64 },
}

/// Direct-mapped cache keyed by file offset.
///
/// A slot is picked from the offset, so a new entry simply evicts whatever
/// occupied its slot.
struct SlotCache<T> {
    slots: Vec<Option<(u64, T)>>,
    unit_bits: u32,
}

impl<T> SlotCache<T> {
    fn new(capacity: usize, unit_bits: u32) -> Self {
        SlotCache {
            slots: (0..capacity).map(|_| None).collect(),
            unit_bits,
        }
    }

    fn slot(&self, key: u64) -> usize {
        ((key >> self.unit_bits) % self.slots.len() as u64) as usize
    }

    fn get(&self, key: u64) -> Option<&T> {
        match &self.slots[self.slot(key)] {
            Some((k, value)) if *k == key => Some(value),
            _ => None,
        }
    }

    fn insert(&mut self, key: u64, value: T) -> &T {
        let slot = self.slot(key);
        let entry = self.slots[slot].insert((key, value));
        &entry.1
    }
}

/// Decodes guest data out of an opened image.
///
/// Owns the byte source for the lifetime of the session.
pub struct ClusterReader<'a> {
    source: Box<dyn ByteSource + 'a>,
    source_size: u64,
    header: QcowHeader,
    level1_table: Vec<u64>,
    level2_cache: SlotCache<Vec<u64>>,
    cluster_cache: SlotCache<Vec<u8>>,
    cipher: Option<SectorCipher>,
}

impl<'a> ClusterReader<'a> {
    /// Loads the level 1 table and prepares the caches.
    ///
    /// # Errors
    ///
    /// `Format` if the level 1 table lies outside the source, `Io` on read
    /// failures.
    pub fn new(
        mut source: Box<dyn ByteSource + 'a>,
        source_size: u64,
        header: QcowHeader,
        cipher: Option<SectorCipher>,
    ) -> Result<Self> {
        let geometry = header.geometry;
        let level1_size = header
            .level1_entries
            .checked_mul(8)
            .filter(|size| {
                header
                    .level1_table_offset
                    .checked_add(*size)
                    .is_some_and(|end| end <= source_size)
            })
            .ok_or_else(|| {
                QcowError::Format(format!(
                    "level 1 table of {} entries at offset 0x{:x} exceeds the file size",
                    header.level1_entries, header.level1_table_offset
                ))
            })?;

        debug!(
            "Reading level 1 table at offset 0x{:x} ({} entries)",
            header.level1_table_offset, header.level1_entries
        );
        let level1_table = read_table(
            source.as_mut(),
            header.level1_table_offset,
            level1_size as usize,
        )?;

        Ok(ClusterReader {
            source,
            source_size,
            header,
            level1_table,
            level2_cache: SlotCache::new(LEVEL2_CACHE_ENTRIES, geometry.cluster_bits),
            cluster_cache: SlotCache::new(CLUSTER_CACHE_ENTRIES, geometry.cluster_bits),
            cipher,
        })
    }

    pub fn header(&self) -> &QcowHeader {
        &self.header
    }

    pub fn describe_source(&self) -> String {
        self.source.describe()
    }

    /// Copies guest data starting at `offset` into `buf`.
    ///
    /// Stops at the end of the media. Returns the number of bytes copied.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let media_size = self.header.media_size;
        let geometry = self.header.geometry;
        let mut position = offset;
        let mut copied = 0;

        while copied < buf.len() && position < media_size {
            let in_cluster = geometry.offset_in_cluster(position);
            let chunk = (geometry.cluster_size - in_cluster)
                .min(media_size - position)
                .min((buf.len() - copied) as u64) as usize;
            let target = &mut buf[copied..copied + chunk];

            match self.locate(position)? {
                ClusterLocation::Sparse | ClusterLocation::Zero => target.fill(0),
                location => {
                    let cluster_start = position - in_cluster;
                    let data = self.cluster_data(location, cluster_start)?;
                    let start = in_cluster as usize;
                    target.copy_from_slice(&data[start..start + chunk]);
                }
            }

            copied += chunk;
            position += chunk as u64;
        }
        Ok(copied)
    }

    /// Walks the tables for the cluster containing guest `offset`.
    fn locate(&mut self, offset: u64) -> Result<ClusterLocation> {
        let geometry = self.header.geometry;
        let level1_index = geometry.level1_index(offset);
        let level2_offset = *self
            .level1_table
            .get(level1_index as usize)
            .ok_or_else(|| {
                QcowError::Format(format!(
                    "level 1 index {} out of bounds ({} entries)",
                    level1_index,
                    self.level1_table.len()
                ))
            })?
            & geometry.offset_mask;

        if level2_offset == 0 {
            return Ok(ClusterLocation::Sparse);
        }

        let level2_index = geometry.level2_index(offset) as usize;
        let entry = self.level2_table(level2_offset)?[level2_index];
        Ok(decode_entry(&geometry, entry))
    }

    fn level2_table(&mut self, file_offset: u64) -> Result<&Vec<u64>> {
        if self.level2_cache.get(file_offset).is_none() {
            debug!("Reading level 2 table at offset 0x{:x}", file_offset);
            let size = self.header.geometry.level2_entries * 8;
            if !file_offset
                .checked_add(size)
                .is_some_and(|end| end <= self.source_size)
            {
                return Err(QcowError::Format(format!(
                    "level 2 table at offset 0x{:x} exceeds the file size",
                    file_offset
                )));
            }
            let table = read_table(self.source.as_mut(), file_offset, size as usize)?;
            self.level2_cache.insert(file_offset, table);
        }
        self.level2_cache
            .get(file_offset)
            .ok_or_else(|| QcowError::Format("level 2 table cache miss".into()))
    }

    /// Returns the decoded content of a whole cluster.
    fn cluster_data(&mut self, location: ClusterLocation, cluster_start: u64) -> Result<&Vec<u8>> {
        let file_offset = match location {
            ClusterLocation::Standard { file_offset } => file_offset,
            ClusterLocation::Compressed { file_offset, .. } => file_offset,
            ClusterLocation::Sparse | ClusterLocation::Zero => {
                return Err(QcowError::Format("cluster has no data".into()))
            }
        };
        if self.cluster_cache.get(file_offset).is_some() {
            return self
                .cluster_cache
                .get(file_offset)
                .ok_or_else(|| QcowError::Format("cluster cache miss".into()));
        }

        let data = match location {
            ClusterLocation::Compressed { file_offset, size } => {
                if self.cipher.is_some() {
                    return Err(QcowError::Format(
                        "simultaneous encryption and compression not supported".into(),
                    ));
                }
                self.read_compressed(file_offset, size)?
            }
            _ => self.read_standard(file_offset, cluster_start)?,
        };
        Ok(self.cluster_cache.insert(file_offset, data))
    }

    fn read_standard(&mut self, file_offset: u64, cluster_start: u64) -> Result<Vec<u8>> {
        let cluster_size = self.header.geometry.cluster_size as usize;
        debug!(
            "Reading cluster block at offset 0x{:x} (guest offset 0x{:x})",
            file_offset, cluster_start
        );
        let mut data = vec![0u8; cluster_size];
        let read = self.source.read_at(file_offset, &mut data)?;
        if read < cluster_size {
            // The last cluster of an image is not always fully written.
            debug!(
                "Cluster block at offset 0x{:x} truncated to {} bytes",
                file_offset, read
            );
            data[read..].fill(0);
        }
        if let Some(cipher) = &self.cipher {
            cipher.decrypt(&mut data, cluster_start / SECTOR_SIZE as u64)?;
        }
        Ok(data)
    }

    fn read_compressed(&mut self, file_offset: u64, size: u64) -> Result<Vec<u8>> {
        let cluster_size = self.header.geometry.cluster_size;
        let size = size.min(self.source_size.saturating_sub(file_offset));
        debug!(
            "Reading compressed cluster block at offset 0x{:x} ({} bytes)",
            file_offset, size
        );

        let mut compressed = vec![0u8; size as usize];
        let read = self.source.read_at(file_offset, &mut compressed)?;
        compressed.truncate(read);

        let mut data = Vec::with_capacity(cluster_size as usize);
        DeflateDecoder::new(&compressed[..])
            .take(cluster_size)
            .read_to_end(&mut data)
            .map_err(|e| {
                QcowError::Format(format!(
                    "unable to decompress cluster block at offset 0x{:x}: {}",
                    file_offset, e
                ))
            })?;
        if (data.len() as u64) < cluster_size {
            warn!(
                "Compressed cluster block at offset 0x{:x} inflated to {} bytes, expected {}",
                file_offset,
                data.len(),
                cluster_size
            );
            data.resize(cluster_size as usize, 0);
        }
        Ok(data)
    }
}

/// Interprets a level 2 table entry.
fn decode_entry(geometry: &Geometry, entry: u64) -> ClusterLocation {
    if entry & geometry.compressed_flag != 0 {
        let entry = entry & geometry.offset_mask;
        let raw_size = entry >> geometry.compressed_size_shift;
        let size = if geometry.compressed_size_in_sectors {
            (raw_size + 1) * SECTOR_SIZE as u64
        } else {
            raw_size
        };
        return ClusterLocation::Compressed {
            file_offset: entry & geometry.compressed_offset_mask,
            size,
        };
    }

    let entry = entry & geometry.offset_mask;
    if let Some(zero_flag) = geometry.zero_flag {
        if entry & zero_flag != 0 {
            return ClusterLocation::Zero;
        }
    }
    let file_offset = entry & !geometry.cluster_offset_mask;
    if file_offset == 0 {
        ClusterLocation::Sparse
    } else {
        ClusterLocation::Standard { file_offset }
    }
}

/// Reads a table of big-endian 64-bit references.
fn read_table(source: &mut dyn ByteSource, offset: u64, size: usize) -> Result<Vec<u64>> {
    let mut data = vec![0u8; size];
    let read = source.read_at(offset, &mut data)?;
    if read != size {
        return Err(QcowError::Format(format!(
            "cluster table at offset 0x{:x} truncated: expected {} bytes, found {}",
            offset, size, read
        )));
    }
    Ok(data
        .chunks_exact(8)
        .map(|c| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(c);
            u64::from_be_bytes(bytes)
        })
        .collect())
}
