/// Pascal-style volume: a flat directory of contiguously allocated files
///
/// Layout (512-byte blocks): blocks 0-1 boot, blocks 2-5 the directory,
/// data from block 6. The directory is a run of 26-byte entries; entry 0
/// describes the volume, the rest one file each. Files occupy contiguous
/// block runs, so free space is the set of gaps between them and allocation
/// is first-fit.
use crate::error::{NestError, Result};
use crate::filesystem::FileSystemInfo;
use std::collections::BTreeMap;

/// Bytes per block
pub const BLOCK_SIZE: usize = 512;
/// Blocks per cached track
pub const BLOCKS_PER_TRACK: usize = 8;
/// First data block (after boot and directory)
pub const DATA_START: usize = 6;
/// First directory block
const DIR_START: usize = 2;
/// Directory length in blocks
const DIR_BLOCKS: usize = 4;
/// Bytes per directory entry
const ENTRY_SIZE: usize = 26;
/// Maximum file entries the directory can hold
pub const MAX_FILES: usize = (DIR_BLOCKS * BLOCK_SIZE - ENTRY_SIZE) / ENTRY_SIZE;
/// Maximum volume name length
const MAX_VOLUME_NAME: usize = 7;
/// Maximum file name length
const MAX_FILE_NAME: usize = 15;
/// Entry kind tag for the volume entry
const KIND_VOLUME: u16 = 0;
/// Entry kind tag for a data file
const KIND_DATA: u16 = 5;

/// One file in the volume directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File name (stored uppercase)
    pub name: String,
    /// First block of the file's extent
    pub first_block: usize,
    /// One past the last block of the extent
    pub next_block: usize,
    /// Bytes used in the final block (1..=512; 0 only when the file is empty)
    pub bytes_in_last: usize,
}

impl FileEntry {
    /// File size in bytes
    pub fn size(&self) -> usize {
        if self.next_block == self.first_block {
            0
        } else {
            (self.next_block - self.first_block - 1) * BLOCK_SIZE + self.bytes_in_last
        }
    }

    /// Blocks occupied by the file
    pub fn block_count(&self) -> usize {
        self.next_block - self.first_block
    }
}

/// Write-back cache of dirty blocks, grouped into tracks for flushing
#[derive(Debug, Clone, Default)]
struct BlockCache {
    pending: BTreeMap<usize, Vec<u8>>,
}

impl BlockCache {
    fn write(&mut self, block: usize, data: Vec<u8>) {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        self.pending.insert(block, data);
    }

    fn read<'a>(&'a self, block: usize, backing: &'a [u8]) -> &'a [u8] {
        match self.pending.get(&block) {
            Some(data) => data,
            None => &backing[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE],
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Tracks with at least one pending block
    fn dirty_tracks(&self) -> Vec<usize> {
        let mut tracks: Vec<usize> = self
            .pending
            .keys()
            .map(|b| b / BLOCKS_PER_TRACK)
            .collect();
        tracks.dedup();
        tracks
    }

    fn flush(&mut self, blocks: &mut [u8]) {
        for (block, data) in std::mem::take(&mut self.pending) {
            blocks[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE].copy_from_slice(&data);
        }
    }
}

/// A mounted Pascal-style volume
#[derive(Debug, Clone)]
pub struct PascalVolume {
    blocks: Vec<u8>,
    total_blocks: usize,
    volume_name: String,
    entries: Vec<FileEntry>,
    /// Cached free-block count, cross-checked by [`PascalVolume::check_consistency`]
    free_blocks: usize,
    cache: BlockCache,
}

impl PascalVolume {
    /// Create a freshly formatted volume
    pub fn format(volume_name: &str, total_blocks: usize) -> Result<PascalVolume> {
        let name = normalize_name(volume_name, MAX_VOLUME_NAME)?;
        if total_blocks <= DATA_START {
            return Err(NestError::filesystem(format!(
                "volume of {} blocks has no data area",
                total_blocks
            )));
        }

        let mut volume = PascalVolume {
            blocks: vec![0u8; total_blocks * BLOCK_SIZE],
            total_blocks,
            volume_name: name,
            entries: Vec::new(),
            free_blocks: total_blocks - DATA_START,
            cache: BlockCache::default(),
        };
        volume.write_directory();
        volume.flush_tracks();
        Ok(volume)
    }

    /// Mount a volume from raw image bytes
    pub fn mount(bytes: Vec<u8>) -> Result<PascalVolume> {
        if bytes.len() % BLOCK_SIZE != 0 {
            return Err(NestError::filesystem(format!(
                "image length {} is not block-aligned",
                bytes.len()
            )));
        }
        let total_blocks = bytes.len() / BLOCK_SIZE;
        if total_blocks <= DATA_START {
            return Err(NestError::filesystem("image too small to hold a volume"));
        }

        let dir = &bytes[DIR_START * BLOCK_SIZE..(DIR_START + DIR_BLOCKS) * BLOCK_SIZE];
        let (volume_name, eov_blocks, num_files) = parse_volume_entry(&dir[..ENTRY_SIZE])?;
        if eov_blocks != total_blocks {
            return Err(NestError::filesystem(format!(
                "directory says {} blocks but image holds {}",
                eov_blocks, total_blocks
            )));
        }
        if num_files > MAX_FILES {
            return Err(NestError::filesystem(format!(
                "directory claims {} files (max {})",
                num_files, MAX_FILES
            )));
        }

        let mut entries = Vec::with_capacity(num_files);
        for i in 1..=num_files {
            let raw = &dir[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE];
            entries.push(parse_file_entry(raw)?);
        }
        validate_extents(&entries, total_blocks)?;

        let free_blocks = compute_free(&entries, total_blocks);
        Ok(PascalVolume {
            blocks: bytes,
            total_blocks,
            volume_name,
            entries,
            free_blocks,
            cache: BlockCache::default(),
        })
    }

    /// Volume name
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    /// Total blocks on the volume
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Cached free-block count
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Directory entries in on-disk (block) order
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Summary for display
    pub fn info(&self) -> FileSystemInfo {
        FileSystemInfo {
            fs_type: "Pascal".to_string(),
            volume_name: self.volume_name.clone(),
            total_blocks: self.total_blocks,
            free_blocks: self.free_blocks,
            file_count: self.entries.len(),
        }
    }

    /// Find a file by name (case-insensitive)
    pub fn find(&self, name: &str) -> Option<&FileEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Read a file's contents
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .find(name)
            .ok_or_else(|| NestError::not_found(name.to_string()))?;
        let mut data = Vec::with_capacity(entry.size());
        for block in entry.first_block..entry.next_block {
            let chunk = self.cache.read(block, &self.blocks);
            if block + 1 == entry.next_block {
                data.extend_from_slice(&chunk[..entry.bytes_in_last]);
            } else {
                data.extend_from_slice(chunk);
            }
        }
        Ok(data)
    }

    /// Create a file, or replace an existing one's contents
    ///
    /// Placement is validated in full before any state is touched, so a
    /// rejected write leaves the volume exactly as it was.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let name = normalize_name(name, MAX_FILE_NAME)?;
        let blocks_needed = data.len().div_ceil(BLOCK_SIZE);
        let existing = self
            .entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(&name));

        if existing.is_none() && self.entries.len() >= MAX_FILES {
            return Err(NestError::filesystem("directory is full"));
        }

        // Choose a home for the new extent, ignoring the entry being replaced
        let mut survivors: Vec<&FileEntry> = self.entries.iter().collect();
        if let Some(idx) = existing {
            survivors.remove(idx);
        }
        let available = self.total_blocks
            - DATA_START
            - survivors.iter().map(|e| e.block_count()).sum::<usize>();
        let first_block = find_gap(&survivors, self.total_blocks, blocks_needed).ok_or(
            NestError::OutOfSpace {
                needed: blocks_needed,
                available,
            },
        )?;

        // Placement accepted; commit
        if let Some(idx) = existing {
            self.entries.remove(idx);
        }
        let entry = FileEntry {
            name,
            first_block,
            next_block: first_block + blocks_needed,
            bytes_in_last: last_block_bytes(data.len()),
        };
        let insert_at = self
            .entries
            .iter()
            .position(|e| e.first_block > first_block)
            .unwrap_or(self.entries.len());
        self.entries.insert(insert_at, entry);

        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let mut block = chunk.to_vec();
            block.resize(BLOCK_SIZE, 0);
            self.cache.write(first_block + i, block);
        }
        self.free_blocks = compute_free(&self.entries, self.total_blocks);
        self.write_directory();
        Ok(())
    }

    /// Delete a file
    pub fn delete_file(&mut self, name: &str) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| NestError::not_found(name.to_string()))?;
        self.entries.remove(idx);
        self.free_blocks = compute_free(&self.entries, self.total_blocks);
        self.write_directory();
        Ok(())
    }

    /// Rename a file
    pub fn rename_file(&mut self, from: &str, to: &str) -> Result<()> {
        let to = normalize_name(to, MAX_FILE_NAME)?;
        if self
            .entries
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case(&to) && !e.name.eq_ignore_ascii_case(from))
        {
            return Err(NestError::InvalidFilename(format!("{} already exists", to)));
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name.eq_ignore_ascii_case(from))
            .ok_or_else(|| NestError::not_found(from.to_string()))?;
        entry.name = to;
        self.write_directory();
        Ok(())
    }

    /// Rename the volume itself
    pub fn rename_volume(&mut self, name: &str) -> Result<()> {
        self.volume_name = normalize_name(name, MAX_VOLUME_NAME)?;
        self.write_directory();
        Ok(())
    }

    /// True while mutations are buffered in the per-track cache
    pub fn has_unflushed(&self) -> bool {
        !self.cache.is_empty()
    }

    /// Tracks with pending writes
    pub fn dirty_tracks(&self) -> Vec<usize> {
        self.cache.dirty_tracks()
    }

    /// Apply all pending track buffers to the image bytes
    pub fn flush_tracks(&mut self) {
        self.cache.flush(&mut self.blocks);
    }

    /// Render the volume back to raw image bytes (flushes first)
    pub fn to_bytes(&mut self) -> Vec<u8> {
        self.flush_tracks();
        self.blocks.clone()
    }

    /// Re-derive directory bookkeeping from the backing bytes and compare
    /// with the cached model
    pub fn check_consistency(&self) -> Result<()> {
        let mut dir = Vec::with_capacity(DIR_BLOCKS * BLOCK_SIZE);
        for block in DIR_START..DIR_START + DIR_BLOCKS {
            dir.extend_from_slice(self.cache.read(block, &self.blocks));
        }

        let (name, eov, num_files) = parse_volume_entry(&dir[..ENTRY_SIZE])
            .map_err(|e| NestError::health(format!("volume entry unreadable: {}", e)))?;
        if name != self.volume_name || eov != self.total_blocks {
            return Err(NestError::health(format!(
                "volume entry says {}/{} blocks, model says {}/{}",
                name, eov, self.volume_name, self.total_blocks
            )));
        }
        if num_files != self.entries.len() {
            return Err(NestError::health(format!(
                "directory holds {} entries, model caches {}",
                num_files, self.entries.len()
            )));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            let raw = &dir[(i + 1) * ENTRY_SIZE..(i + 2) * ENTRY_SIZE];
            let parsed = parse_file_entry(raw)
                .map_err(|e| NestError::health(format!("entry {} unreadable: {}", i, e)))?;
            if &parsed != entry {
                return Err(NestError::health(format!(
                    "entry {} differs between directory and model",
                    i
                )));
            }
        }
        validate_extents(&self.entries, self.total_blocks)
            .map_err(|e| NestError::health(e.to_string()))?;
        let derived = compute_free(&self.entries, self.total_blocks);
        if derived != self.free_blocks {
            return Err(NestError::health(format!(
                "free-space counter is {} but extents leave {} free",
                self.free_blocks, derived
            )));
        }
        Ok(())
    }

    /// Serialize the directory into the block cache
    fn write_directory(&mut self) {
        let mut dir = vec![0u8; DIR_BLOCKS * BLOCK_SIZE];
        write_volume_entry(
            &mut dir[..ENTRY_SIZE],
            &self.volume_name,
            self.total_blocks,
            self.entries.len(),
        );
        for (i, entry) in self.entries.iter().enumerate() {
            write_file_entry(&mut dir[(i + 1) * ENTRY_SIZE..(i + 2) * ENTRY_SIZE], entry);
        }
        for (i, chunk) in dir.chunks(BLOCK_SIZE).enumerate() {
            self.cache.write(DIR_START + i, chunk.to_vec());
        }
    }
}

/// Bytes used in a file's final block
fn last_block_bytes(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        let rem = len % BLOCK_SIZE;
        if rem == 0 {
            BLOCK_SIZE
        } else {
            rem
        }
    }
}

/// First-fit gap search over entries sorted by first block
fn find_gap(sorted: &[&FileEntry], total_blocks: usize, needed: usize) -> Option<usize> {
    let mut candidate = DATA_START;
    for entry in sorted {
        if entry.first_block.saturating_sub(candidate) >= needed {
            return Some(candidate);
        }
        candidate = entry.next_block;
    }
    if total_blocks.saturating_sub(candidate) >= needed {
        Some(candidate)
    } else {
        None
    }
}

/// Free blocks left by the given extents
fn compute_free(entries: &[FileEntry], total_blocks: usize) -> usize {
    total_blocks - DATA_START - entries.iter().map(|e| e.block_count()).sum::<usize>()
}

/// Extents must be sorted, non-overlapping and inside the data area
///
/// Zero-length extents occupy no blocks and may share a first block with a
/// neighbour, so they are exempt from the overlap check.
fn validate_extents(entries: &[FileEntry], total_blocks: usize) -> Result<()> {
    let mut previous_end = DATA_START;
    for entry in entries {
        if entry.block_count() == 0 {
            continue;
        }
        if entry.first_block < previous_end || entry.next_block > total_blocks {
            return Err(NestError::filesystem(format!(
                "extent {}..{} for {} overlaps or exceeds the volume",
                entry.first_block, entry.next_block, entry.name
            )));
        }
        previous_end = entry.next_block;
    }
    Ok(())
}

/// Uppercase, validate and bound a directory name
fn normalize_name(name: &str, max_len: usize) -> Result<String> {
    if name.is_empty() || name.len() > max_len {
        return Err(NestError::InvalidFilename(format!(
            "{:?} (must be 1-{} characters)",
            name, max_len
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b':' && b != b'\\' && b != b'/')
    {
        return Err(NestError::InvalidFilename(name.to_string()));
    }
    Ok(name.to_ascii_uppercase())
}

fn read_u16(raw: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([raw[offset], raw[offset + 1]]) as usize
}

fn write_u16(raw: &mut [u8], offset: usize, value: usize) {
    raw[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
}

fn parse_volume_entry(raw: &[u8]) -> Result<(String, usize, usize)> {
    if read_u16(raw, 4) != KIND_VOLUME as usize {
        return Err(NestError::filesystem("first directory entry is not a volume"));
    }
    let name_len = raw[6] as usize;
    if name_len == 0 || name_len > MAX_VOLUME_NAME {
        return Err(NestError::filesystem("bad volume name length"));
    }
    let name = String::from_utf8_lossy(&raw[7..7 + name_len]).to_string();
    let eov = read_u16(raw, 14);
    let num_files = read_u16(raw, 16);
    Ok((name, eov, num_files))
}

fn write_volume_entry(raw: &mut [u8], name: &str, total_blocks: usize, num_files: usize) {
    write_u16(raw, 0, 0);
    write_u16(raw, 2, DATA_START);
    write_u16(raw, 4, KIND_VOLUME as usize);
    raw[6] = name.len() as u8;
    raw[7..7 + name.len()].copy_from_slice(name.as_bytes());
    write_u16(raw, 14, total_blocks);
    write_u16(raw, 16, num_files);
}

fn parse_file_entry(raw: &[u8]) -> Result<FileEntry> {
    if read_u16(raw, 4) != KIND_DATA as usize {
        return Err(NestError::filesystem("unexpected directory entry kind"));
    }
    let first_block = read_u16(raw, 0);
    let next_block = read_u16(raw, 2);
    if next_block < first_block {
        return Err(NestError::filesystem("directory extent runs backwards"));
    }
    let name_len = raw[6] as usize;
    if name_len == 0 || name_len > MAX_FILE_NAME {
        return Err(NestError::filesystem("bad file name length"));
    }
    let name = String::from_utf8_lossy(&raw[7..7 + name_len]).to_string();
    let bytes_in_last = read_u16(raw, 22);
    if bytes_in_last > BLOCK_SIZE || (next_block > first_block && bytes_in_last == 0) {
        return Err(NestError::filesystem("bad final-block byte count"));
    }
    Ok(FileEntry {
        name,
        first_block,
        next_block,
        bytes_in_last,
    })
}

fn write_file_entry(raw: &mut [u8], entry: &FileEntry) {
    write_u16(raw, 0, entry.first_block);
    write_u16(raw, 2, entry.next_block);
    write_u16(raw, 4, KIND_DATA as usize);
    raw[6] = entry.name.len() as u8;
    raw[7..7 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
    write_u16(raw, 22, entry.bytes_in_last);
    write_u16(raw, 24, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> PascalVolume {
        PascalVolume::format("TEST", 64).unwrap()
    }

    #[test]
    fn test_format_and_mount() {
        let mut v = volume();
        let bytes = v.to_bytes();
        let mounted = PascalVolume::mount(bytes).unwrap();
        assert_eq!(mounted.volume_name(), "TEST");
        assert_eq!(mounted.total_blocks(), 64);
        assert_eq!(mounted.free_blocks(), 64 - DATA_START);
        assert!(mounted.entries().is_empty());
    }

    #[test]
    fn test_write_and_read_file() {
        let mut v = volume();
        let data = vec![0xA5u8; 1000];
        v.write_file("hello.txt", &data).unwrap();
        assert_eq!(v.read_file("HELLO.TXT").unwrap(), data);
        assert_eq!(v.free_blocks(), 64 - DATA_START - 2);
        v.check_consistency().unwrap();
    }

    #[test]
    fn test_replace_file_in_place() {
        let mut v = volume();
        v.write_file("a", &[1u8; 600]).unwrap();
        v.write_file("b", &[2u8; 600]).unwrap();
        v.write_file("a", &[3u8; 600]).unwrap();
        assert_eq!(v.read_file("a").unwrap(), vec![3u8; 600]);
        assert_eq!(v.read_file("b").unwrap(), vec![2u8; 600]);
        v.check_consistency().unwrap();
    }

    #[test]
    fn test_replace_grows_into_later_gap() {
        let mut v = volume();
        v.write_file("a", &[1u8; 512]).unwrap();
        v.write_file("b", &[2u8; 512]).unwrap();
        // A no longer fits in place; it must relocate past B
        v.write_file("a", &[3u8; 2048]).unwrap();
        let a = v.find("a").unwrap();
        let b = v.find("b").unwrap();
        assert!(a.first_block > b.first_block);
        assert_eq!(v.read_file("a").unwrap(), vec![3u8; 2048]);
        v.check_consistency().unwrap();
    }

    #[test]
    fn test_out_of_space() {
        let mut v = PascalVolume::format("TINY", 10).unwrap();
        // 4 data blocks available
        v.write_file("a", &[1u8; 3 * 512]).unwrap();
        let before = v.free_blocks();
        let err = v.write_file("b", &[2u8; 2 * 512]).unwrap_err();
        assert!(matches!(
            err,
            NestError::OutOfSpace {
                needed: 2,
                available: 1
            }
        ));
        // Rejection mutated nothing
        assert_eq!(v.free_blocks(), before);
        assert!(v.find("b").is_none());
        v.check_consistency().unwrap();
    }

    #[test]
    fn test_delete_frees_space() {
        let mut v = volume();
        v.write_file("a", &[1u8; 2048]).unwrap();
        let free_before = v.free_blocks();
        v.delete_file("a").unwrap();
        assert_eq!(v.free_blocks(), free_before + 4);
        assert!(v.find("a").is_none());
        v.check_consistency().unwrap();
    }

    #[test]
    fn test_rename_file_and_volume() {
        let mut v = volume();
        v.write_file("old", &[1u8; 10]).unwrap();
        v.rename_file("old", "new").unwrap();
        assert!(v.find("old").is_none());
        assert!(v.find("NEW").is_some());

        v.rename_volume("renamed").unwrap();
        assert_eq!(v.volume_name(), "RENAMED");
        v.check_consistency().unwrap();
    }

    #[test]
    fn test_rename_collision_rejected() {
        let mut v = volume();
        v.write_file("a", &[1u8; 10]).unwrap();
        v.write_file("b", &[2u8; 10]).unwrap();
        assert!(matches!(
            v.rename_file("a", "B"),
            Err(NestError::InvalidFilename(_))
        ));
    }

    #[test]
    fn test_invalid_names() {
        let mut v = volume();
        assert!(v.write_file("", &[]).is_err());
        assert!(v.write_file("way.too.long.name.txt", &[]).is_err());
        assert!(v.write_file("a:b", &[]).is_err());
    }

    #[test]
    fn test_empty_file() {
        let mut v = volume();
        v.write_file("empty", &[]).unwrap();
        let entry = v.find("empty").unwrap();
        assert_eq!(entry.size(), 0);
        assert_eq!(entry.block_count(), 0);
        assert_eq!(v.read_file("empty").unwrap(), Vec::<u8>::new());
        v.check_consistency().unwrap();
    }

    #[test]
    fn test_track_cache_flush() {
        let mut v = volume();
        v.write_file("a", &[1u8; 512]).unwrap();
        assert!(v.has_unflushed());
        assert!(!v.dirty_tracks().is_empty());
        v.flush_tracks();
        assert!(!v.has_unflushed());
        // Reads see the same data before and after flushing
        assert_eq!(v.read_file("a").unwrap(), vec![1u8; 512]);
    }

    #[test]
    fn test_mount_rejects_garbage() {
        assert!(PascalVolume::mount(vec![0u8; 100]).is_err());
        assert!(PascalVolume::mount(vec![0xFFu8; 32 * BLOCK_SIZE]).is_err());
    }

    #[test]
    fn test_survives_serialize_round_trip() {
        let mut v = volume();
        v.write_file("one", &[1u8; 700]).unwrap();
        v.write_file("two", &[2u8; 300]).unwrap();
        let mut mounted = PascalVolume::mount(v.to_bytes()).unwrap();
        assert_eq!(mounted.entries().len(), 2);
        assert_eq!(mounted.read_file("one").unwrap(), vec![1u8; 700]);
        assert_eq!(mounted.read_file("two").unwrap(), vec![2u8; 300]);
        mounted.check_consistency().unwrap();
        let _ = mounted.to_bytes();
    }
}
