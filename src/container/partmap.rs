/// Multi-partition media
///
/// A partitioned image carries a single map block at block 0 followed by the
/// partition extents themselves. Partitions are fixed byte ranges: content
/// may be rewritten but never resized, so replacements must match the extent
/// length exactly.
use crate::error::{NestError, Result};
use crate::filesystem::pascal::BLOCK_SIZE;

/// Map block magic
const MAP_MAGIC: [u8; 4] = *b"2MAP";
/// Map format version
const MAP_VERSION: u16 = 1;
/// Bytes per map entry
const MAP_ENTRY_SIZE: usize = 40;
/// Fixed header bytes before the entry table
const MAP_HEADER_SIZE: usize = 8;
/// Entries that fit in the single map block
pub const MAX_PARTITIONS: usize = (BLOCK_SIZE - MAP_HEADER_SIZE) / MAP_ENTRY_SIZE;
/// Name field width in a map entry
const MAP_NAME_SIZE: usize = 32;

/// One partition in the map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartEntry {
    /// Partition name
    pub name: String,
    /// First block of the extent
    pub start_block: usize,
    /// Extent length in blocks
    pub block_count: usize,
}

impl PartEntry {
    /// Extent length in bytes
    pub fn byte_len(&self) -> usize {
        self.block_count * BLOCK_SIZE
    }
}

/// A partitioned image: map block plus partition extents
#[derive(Debug, Clone)]
pub struct PartitionMap {
    bytes: Vec<u8>,
    entries: Vec<PartEntry>,
}

impl PartitionMap {
    /// True when the buffer starts with the map magic
    pub fn sniff(bytes: &[u8]) -> bool {
        bytes.starts_with(&MAP_MAGIC)
    }

    /// Parse a partitioned image
    pub fn parse(bytes: Vec<u8>) -> Result<PartitionMap> {
        if !Self::sniff(&bytes) || bytes.len() < BLOCK_SIZE || bytes.len() % BLOCK_SIZE != 0 {
            return Err(NestError::invalid_format("not a partition map"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != MAP_VERSION {
            return Err(NestError::invalid_format(format!(
                "unsupported partition map version {}",
                version
            )));
        }
        let count = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        if count == 0 || count > MAX_PARTITIONS {
            return Err(NestError::invalid_format(format!(
                "partition count {} out of range",
                count
            )));
        }

        let total_blocks = bytes.len() / BLOCK_SIZE;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let offset = MAP_HEADER_SIZE + i * MAP_ENTRY_SIZE;
            let raw = &bytes[offset..offset + MAP_ENTRY_SIZE];
            entries.push(parse_entry(raw)?);
        }
        validate_layout(&entries, total_blocks)?;

        Ok(PartitionMap { bytes, entries })
    }

    /// Build a fresh partitioned image with the given partition sizes laid
    /// out contiguously from block 1
    pub fn create(partitions: &[(&str, usize)]) -> Result<PartitionMap> {
        if partitions.is_empty() || partitions.len() > MAX_PARTITIONS {
            return Err(NestError::invalid_format(format!(
                "need 1-{} partitions",
                MAX_PARTITIONS
            )));
        }
        let mut entries = Vec::with_capacity(partitions.len());
        let mut next_block = 1;
        for (name, block_count) in partitions {
            if name.is_empty() || name.len() > MAP_NAME_SIZE || *block_count == 0 {
                return Err(NestError::invalid_format(format!(
                    "bad partition definition {:?}",
                    name
                )));
            }
            entries.push(PartEntry {
                name: name.to_string(),
                start_block: next_block,
                block_count: *block_count,
            });
            next_block += block_count;
        }

        let mut map = PartitionMap {
            bytes: vec![0u8; next_block * BLOCK_SIZE],
            entries,
        };
        map.write_map_block();
        Ok(map)
    }

    /// Partitions in map order
    pub fn entries(&self) -> &[PartEntry] {
        &self.entries
    }

    /// Look up a partition by 1-based index
    pub fn entry(&self, index: usize) -> Result<&PartEntry> {
        index
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .ok_or_else(|| NestError::not_found(format!("partition {}", index)))
    }

    /// Indices (1-based) of partitions matching a name, case-insensitively
    pub fn matches(&self, name: &str) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.name.eq_ignore_ascii_case(name))
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// Copy out a partition's bytes
    pub fn extract(&self, index: usize) -> Result<Vec<u8>> {
        let entry = self.entry(index)?;
        let start = entry.start_block * BLOCK_SIZE;
        Ok(self.bytes[start..start + entry.byte_len()].to_vec())
    }

    /// Replace a partition's bytes; the extent size is fixed
    pub fn replace(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let entry = self.entry(index)?;
        if data.len() != entry.byte_len() {
            return Err(NestError::SizeMismatch {
                expected: entry.byte_len(),
                actual: data.len(),
            });
        }
        let start = entry.start_block * BLOCK_SIZE;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Render the image back into bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Re-parse the map block and compare it with the cached entry table
    pub fn check_consistency(&self) -> Result<()> {
        let count = u16::from_le_bytes([self.bytes[6], self.bytes[7]]) as usize;
        if count != self.entries.len() {
            return Err(NestError::health(format!(
                "map block says {} partitions, model caches {}",
                count,
                self.entries.len()
            )));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = MAP_HEADER_SIZE + i * MAP_ENTRY_SIZE;
            let parsed = parse_entry(&self.bytes[offset..offset + MAP_ENTRY_SIZE])
                .map_err(|e| NestError::health(e.to_string()))?;
            if &parsed != entry {
                return Err(NestError::health(format!(
                    "partition {} differs between map block and model",
                    i + 1
                )));
            }
        }
        validate_layout(&self.entries, self.bytes.len() / BLOCK_SIZE)
            .map_err(|e| NestError::health(e.to_string()))
    }

    fn write_map_block(&mut self) {
        let block = &mut self.bytes[..BLOCK_SIZE];
        block.fill(0);
        block[..4].copy_from_slice(&MAP_MAGIC);
        block[4..6].copy_from_slice(&MAP_VERSION.to_le_bytes());
        block[6..8].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = MAP_HEADER_SIZE + i * MAP_ENTRY_SIZE;
            block[offset..offset + 4].copy_from_slice(&(entry.start_block as u32).to_le_bytes());
            block[offset + 4..offset + 8]
                .copy_from_slice(&(entry.block_count as u32).to_le_bytes());
            block[offset + 8..offset + 8 + entry.name.len()]
                .copy_from_slice(entry.name.as_bytes());
        }
    }
}

fn parse_entry(raw: &[u8]) -> Result<PartEntry> {
    let start_block = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let block_count = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
    let name_field = &raw[8..8 + MAP_NAME_SIZE];
    let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(MAP_NAME_SIZE);
    let name = String::from_utf8_lossy(&name_field[..name_len]).to_string();
    if name.is_empty() || block_count == 0 {
        return Err(NestError::invalid_format("empty partition entry"));
    }
    Ok(PartEntry {
        name,
        start_block,
        block_count,
    })
}

/// Extents must start after the map block, stay inside the image and not overlap
fn validate_layout(entries: &[PartEntry], total_blocks: usize) -> Result<()> {
    let mut previous_end = 1;
    for entry in entries {
        if entry.start_block < previous_end
            || entry.start_block + entry.block_count > total_blocks
        {
            return Err(NestError::invalid_format(format!(
                "partition {} extent {}..{} overlaps or exceeds the image",
                entry.name,
                entry.start_block,
                entry.start_block + entry.block_count
            )));
        }
        previous_end = entry.start_block + entry.block_count;
    }
    Ok(())
}

/// A single partition extracted from its map: a fixed-size extent whose
/// content may be any other container kind
#[derive(Debug, Clone)]
pub struct PartitionSlot {
    /// 1-based index within the parent map
    index: usize,
    name: String,
    bytes: Vec<u8>,
    /// Extent length fixed at construction, cross-checked by health checks
    extent_len: usize,
}

impl PartitionSlot {
    /// Wrap one partition's bytes
    pub fn new(index: usize, name: &str, bytes: Vec<u8>) -> PartitionSlot {
        PartitionSlot {
            index,
            name: name.to_string(),
            extent_len: bytes.len(),
            bytes,
        }
    }

    /// 1-based index within the parent map
    pub fn index(&self) -> usize {
        self.index
    }

    /// Partition name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The partition's content bytes
    pub fn content(&self) -> &[u8] {
        &self.bytes
    }

    /// Replace the content; a partition never changes size
    pub fn replace_content(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() != self.extent_len {
            return Err(NestError::SizeMismatch {
                expected: self.extent_len,
                actual: data.len(),
            });
        }
        self.bytes = data;
        Ok(())
    }

    /// Render back to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// The extent length must never drift
    pub fn check_consistency(&self) -> Result<()> {
        if self.bytes.len() != self.extent_len {
            return Err(NestError::health(format!(
                "partition {} holds {} bytes but its extent is {}",
                self.index,
                self.bytes.len(),
                self.extent_len
            )));
        }
        Ok(())
    }
}
