//! Synthetic QCOW images for the unit tests.

use std::collections::BTreeMap;
use std::io::Write;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

#[derive(Clone)]
enum Cluster {
    Standard(Vec<u8>),
    Compressed(Vec<u8>),
    /// Version 3 zero cluster, backed by an allocated cluster full of junk.
    Zero,
}

pub(crate) struct ImageBuilder {
    version: u32,
    cluster_bits: u32,
    media_size: u64,
    clusters: BTreeMap<u64, Cluster>,
    key: Option<[u8; 16]>,
    backing_file: Option<String>,
}

impl ImageBuilder {
    pub(crate) fn new(version: u32, cluster_bits: u32, media_size: u64) -> Self {
        ImageBuilder {
            version,
            cluster_bits,
            media_size,
            clusters: BTreeMap::new(),
            key: None,
            backing_file: None,
        }
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    fn level2_bits(&self) -> u32 {
        self.cluster_bits - 3
    }

    fn cluster_count(&self) -> u64 {
        self.media_size.div_ceil(self.cluster_size())
    }

    /// Deterministic, non-repeating-per-cluster content.
    pub(crate) fn pattern(&self, index: u64) -> Vec<u8> {
        let start = index * self.cluster_size();
        (start..start + self.cluster_size())
            .map(|o| (o.wrapping_mul(7) ^ (o >> 8) ^ index) as u8)
            .collect()
    }

    /// Allocates every cluster covering the media with patterned data.
    pub(crate) fn with_pattern(mut self) -> Self {
        for index in 0..self.cluster_count() {
            let data = self.pattern(index);
            self.clusters.insert(index, Cluster::Standard(data));
        }
        self
    }

    pub(crate) fn standard(mut self, index: u64, data: Vec<u8>) -> Self {
        assert_eq!(data.len() as u64, self.cluster_size());
        self.clusters.insert(index, Cluster::Standard(data));
        self
    }

    pub(crate) fn compressed(mut self, index: u64, data: Vec<u8>) -> Self {
        assert_eq!(data.len() as u64, self.cluster_size());
        self.clusters.insert(index, Cluster::Compressed(data));
        self
    }

    pub(crate) fn zero(mut self, index: u64) -> Self {
        self.clusters.insert(index, Cluster::Zero);
        self
    }

    /// Leaves the cluster unallocated.
    pub(crate) fn sparse(mut self, index: u64) -> Self {
        self.clusters.remove(&index);
        self
    }

    pub(crate) fn encrypted(mut self, key: [u8; 16]) -> Self {
        self.key = Some(key);
        self
    }

    pub(crate) fn backing_file(mut self, name: &str) -> Self {
        self.backing_file = Some(name.to_string());
        self
    }

    /// Guest content the reader is expected to produce.
    pub(crate) fn expected(&self) -> Vec<u8> {
        let mut content = vec![0u8; self.cluster_count() as usize * self.cluster_size() as usize];
        for (index, cluster) in &self.clusters {
            let start = (*index * self.cluster_size()) as usize;
            let end = start + self.cluster_size() as usize;
            if end > content.len() {
                continue;
            }
            match cluster {
                Cluster::Standard(data) | Cluster::Compressed(data) => {
                    content[start..end].copy_from_slice(data)
                }
                Cluster::Zero => {}
            }
        }
        content.truncate(self.media_size as usize);
        content
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let cluster_size = self.cluster_size();
        let level2_entries = 1u64 << self.level2_bits();
        let bytes_per_level1 = cluster_size * level2_entries;
        let level1_entries = self.media_size.div_ceil(bytes_per_level1).max(1);
        let level1_clusters = (level1_entries * 8).div_ceil(cluster_size);

        let mut image = vec![0u8; cluster_size as usize];
        let level1_offset = image.len() as u64;
        image.resize((level1_offset + level1_clusters * cluster_size) as usize, 0);

        // One level 2 table per level 1 entry that maps at least one cluster.
        let mut level2_offsets = BTreeMap::new();
        for index in self.clusters.keys() {
            let level1_index = index / level2_entries;
            if !level2_offsets.contains_key(&level1_index) {
                let offset = image.len() as u64;
                image.resize((offset + cluster_size) as usize, 0);
                level2_offsets.insert(level1_index, offset);
            }
        }

        let copied_flag = if self.version == 1 { 0 } else { 1u64 << 63 };
        for (level1_index, level2_offset) in &level2_offsets {
            let position = (level1_offset + level1_index * 8) as usize;
            image[position..position + 8]
                .copy_from_slice(&(level2_offset | copied_flag).to_be_bytes());
        }

        for (index, cluster) in &self.clusters {
            let entry = match cluster {
                Cluster::Standard(data) => {
                    align(&mut image, cluster_size);
                    let offset = image.len() as u64;
                    let mut data = data.clone();
                    if let Some(key) = &self.key {
                        encrypt(key, &mut data, index * cluster_size / 512);
                    }
                    image.extend_from_slice(&data);
                    offset | copied_flag
                }
                Cluster::Zero => {
                    align(&mut image, cluster_size);
                    let offset = image.len() as u64;
                    image.extend(std::iter::repeat(0xa5).take(cluster_size as usize));
                    offset | 1
                }
                Cluster::Compressed(data) => {
                    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
                    encoder.write_all(data).unwrap();
                    let compressed = encoder.finish().unwrap();
                    // Unaligned on purpose.
                    image.extend_from_slice(&[0x11, 0x22, 0x33]);
                    let offset = image.len() as u64;
                    image.extend_from_slice(&compressed);
                    let size = compressed.len() as u64;
                    if self.version == 1 {
                        let shift = 63 - self.cluster_bits;
                        assert!(size < cluster_size);
                        (1u64 << 63) | (size << shift) | offset
                    } else {
                        let shift = 62 - (self.cluster_bits - 8);
                        let sectors = size.div_ceil(512) - 1;
                        assert!(sectors < 1 << (self.cluster_bits - 8));
                        (1u64 << 62) | (sectors << shift) | offset
                    }
                }
            };
            let level2_offset = level2_offsets[&(index / level2_entries)];
            let position = (level2_offset + (index % level2_entries) * 8) as usize;
            image[position..position + 8].copy_from_slice(&entry.to_be_bytes());
        }

        // Pad to a whole cluster like real images.
        align(&mut image, cluster_size);

        self.write_header(&mut image, level1_offset, level1_entries);
        image
    }

    fn write_header(&self, image: &mut [u8], level1_offset: u64, level1_entries: u64) {
        image[0..4].copy_from_slice(&[0x51, 0x46, 0x49, 0xfb]);
        image[4..8].copy_from_slice(&self.version.to_be_bytes());
        image[24..32].copy_from_slice(&self.media_size.to_be_bytes());
        let method: u32 = if self.key.is_some() { 1 } else { 0 };
        if self.version == 1 {
            image[20..24].copy_from_slice(&0x5f00_0000u32.to_be_bytes());
            image[32] = self.cluster_bits as u8;
            image[33] = self.level2_bits() as u8;
            image[36..40].copy_from_slice(&method.to_be_bytes());
            image[40..48].copy_from_slice(&level1_offset.to_be_bytes());
        } else {
            image[20..24].copy_from_slice(&self.cluster_bits.to_be_bytes());
            image[32..36].copy_from_slice(&method.to_be_bytes());
            image[36..40].copy_from_slice(&(level1_entries as u32).to_be_bytes());
            image[40..48].copy_from_slice(&level1_offset.to_be_bytes());
        }
        if self.version == 3 {
            image[96..100].copy_from_slice(&4u32.to_be_bytes());
            image[100..104].copy_from_slice(&104u32.to_be_bytes());
        }
        if let Some(name) = &self.backing_file {
            let offset = 0x100u64;
            image[8..16].copy_from_slice(&offset.to_be_bytes());
            image[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
            image[offset as usize..offset as usize + name.len()].copy_from_slice(name.as_bytes());
        }
    }

    pub(crate) fn build_file(&self) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&self.build()).unwrap();
        file.flush().unwrap();
        file
    }
}

fn align(image: &mut Vec<u8>, cluster_size: u64) {
    let padded = (image.len() as u64).div_ceil(cluster_size) * cluster_size;
    image.resize(padded as usize, 0);
}

/// AES-128-CBC per 512-byte sector, IV = little-endian sector number.
pub(crate) fn encrypt(key: &[u8; 16], data: &mut [u8], first_sector: u64) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for (i, sector) in data.chunks_mut(512).enumerate() {
        let mut previous = [0u8; 16];
        previous[..8].copy_from_slice(&(first_sector + i as u64).to_le_bytes());
        for block in sector.chunks_mut(16) {
            for (b, p) in block.iter_mut().zip(previous.iter()) {
                *b ^= p;
            }
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
            previous.copy_from_slice(block);
        }
    }
}
