/// Stored-method ZIP archive
///
/// Reads and writes the ZIP subset this crate needs for exploring nested
/// media: method 0 (stored) records, one disk, no zip64.
/// ZIP does not enforce unique member names, which is why name matches can
/// be ambiguous at the chain level.
use crate::error::{NestError, Result};

const LOCAL_SIG: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const CENTRAL_SIG: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
const EOCD_SIG: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const EOCD_LEN: usize = 22;
/// EOCD may be followed by a comment of up to 65535 bytes
const EOCD_SEARCH: usize = EOCD_LEN + u16::MAX as usize;
/// MS-DOS date for 1980-01-01, used on all written records
const DOS_EPOCH_DATE: u16 = 0x0021;

/// One archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipRecord {
    /// Member name (case preserved)
    pub name: String,
    /// Uncompressed contents
    pub data: Vec<u8>,
}

/// An in-memory stored-method ZIP archive
#[derive(Debug, Clone)]
pub struct ZipArchive {
    records: Vec<ZipRecord>,
    /// Cached record count, cross-checked by [`ZipArchive::check_consistency`]
    cached_count: usize,
    /// Cached total stored bytes, cross-checked likewise
    cached_data_size: usize,
}

impl ZipArchive {
    /// Create an empty archive
    pub fn new() -> ZipArchive {
        ZipArchive {
            records: Vec::new(),
            cached_count: 0,
            cached_data_size: 0,
        }
    }

    /// True when the buffer starts like a ZIP archive
    pub fn sniff(bytes: &[u8]) -> bool {
        bytes.starts_with(&LOCAL_SIG) || bytes.starts_with(&EOCD_SIG)
    }

    /// Parse an archive from bytes
    pub fn parse(bytes: &[u8]) -> Result<ZipArchive> {
        let eocd = find_eocd(bytes)?;
        let total_entries = read_u16(bytes, eocd + 10) as usize;
        let cd_offset = read_u32(bytes, eocd + 16) as usize;

        let mut records = Vec::with_capacity(total_entries);
        let mut pos = cd_offset;
        for _ in 0..total_entries {
            if pos + CENTRAL_HEADER_LEN > bytes.len() || bytes[pos..pos + 4] != CENTRAL_SIG {
                return Err(NestError::invalid_format("bad central directory entry"));
            }
            let method = read_u16(bytes, pos + 10);
            let crc = read_u32(bytes, pos + 16);
            let csize = read_u32(bytes, pos + 20) as usize;
            let uncompressed = read_u32(bytes, pos + 24) as usize;
            let name_len = read_u16(bytes, pos + 28) as usize;
            let extra_len = read_u16(bytes, pos + 30) as usize;
            let comment_len = read_u16(bytes, pos + 32) as usize;
            let local_offset = read_u32(bytes, pos + 42) as usize;

            if method != 0 {
                return Err(NestError::invalid_format(format!(
                    "compression method {} not supported (stored only)",
                    method
                )));
            }
            if csize != uncompressed {
                return Err(NestError::invalid_format(
                    "stored entry sizes disagree in central directory",
                ));
            }
            let name_bytes = bytes
                .get(pos + CENTRAL_HEADER_LEN..pos + CENTRAL_HEADER_LEN + name_len)
                .ok_or_else(|| NestError::invalid_format("truncated central directory"))?;
            let name = String::from_utf8_lossy(name_bytes).to_string();

            let data = read_local_data(bytes, local_offset, csize)?;
            if crc32fast::hash(&data) != crc {
                return Err(NestError::invalid_format(format!("CRC mismatch for {}", name)));
            }

            records.push(ZipRecord { name, data });
            pos += CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;
        }

        let cached_data_size = records.iter().map(|r| r.data.len()).sum();
        Ok(ZipArchive {
            cached_count: records.len(),
            cached_data_size,
            records,
        })
    }

    /// Render the archive into its complete byte form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offsets = Vec::with_capacity(self.records.len());

        for record in &self.records {
            offsets.push(out.len() as u32);
            let crc = crc32fast::hash(&record.data);
            out.extend_from_slice(&LOCAL_SIG);
            out.extend_from_slice(&20u16.to_le_bytes()); // version needed
            out.extend_from_slice(&0u16.to_le_bytes()); // flags
            out.extend_from_slice(&0u16.to_le_bytes()); // method: stored
            out.extend_from_slice(&0u16.to_le_bytes()); // time
            out.extend_from_slice(&DOS_EPOCH_DATE.to_le_bytes());
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(record.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(record.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // extra
            out.extend_from_slice(record.name.as_bytes());
            out.extend_from_slice(&record.data);
        }

        let cd_offset = out.len() as u32;
        for (record, offset) in self.records.iter().zip(&offsets) {
            let crc = crc32fast::hash(&record.data);
            out.extend_from_slice(&CENTRAL_SIG);
            out.extend_from_slice(&20u16.to_le_bytes()); // version made by
            out.extend_from_slice(&20u16.to_le_bytes()); // version needed
            out.extend_from_slice(&0u16.to_le_bytes()); // flags
            out.extend_from_slice(&0u16.to_le_bytes()); // method
            out.extend_from_slice(&0u16.to_le_bytes()); // time
            out.extend_from_slice(&DOS_EPOCH_DATE.to_le_bytes());
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(record.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(record.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // extra
            out.extend_from_slice(&0u16.to_le_bytes()); // comment
            out.extend_from_slice(&0u16.to_le_bytes()); // disk start
            out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(record.name.as_bytes());
        }
        let cd_size = out.len() as u32 - cd_offset;

        out.extend_from_slice(&EOCD_SIG);
        out.extend_from_slice(&0u16.to_le_bytes()); // this disk
        out.extend_from_slice(&0u16.to_le_bytes()); // cd disk
        out.extend_from_slice(&(self.records.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.records.len() as u16).to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment length
        out
    }

    /// Archive members in record order
    pub fn records(&self) -> &[ZipRecord] {
        &self.records
    }

    /// Indices of members matching a name, case-insensitively
    pub fn matches(&self, name: &str) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.name.eq_ignore_ascii_case(name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Read a member's data by name
    pub fn record_data(&self, name: &str) -> Result<&[u8]> {
        let found = self.matches(name);
        match found.as_slice() {
            [] => Err(NestError::not_found(name.to_string())),
            [idx] => Ok(&self.records[*idx].data),
            _ => Err(NestError::AmbiguousMatch(name.to_string())),
        }
    }

    /// Append a member; duplicate names are legal in ZIP
    pub fn add_record(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(NestError::InvalidFilename(name.to_string()));
        }
        if self.records.len() >= u16::MAX as usize {
            return Err(NestError::invalid_format(
                "archive is full (65535 records)",
            ));
        }
        check_record_size(&data)?;
        self.cached_count += 1;
        self.cached_data_size += data.len();
        self.records.push(ZipRecord {
            name: name.to_string(),
            data,
        });
        Ok(())
    }

    /// Remove the member with the given name
    pub fn remove_record(&mut self, name: &str) -> Result<()> {
        let found = self.matches(name);
        let idx = match found.as_slice() {
            [] => return Err(NestError::not_found(name.to_string())),
            [idx] => *idx,
            _ => return Err(NestError::AmbiguousMatch(name.to_string())),
        };
        let removed = self.records.remove(idx);
        self.cached_count -= 1;
        self.cached_data_size -= removed.data.len();
        Ok(())
    }

    /// Replace a member's data, by record index
    pub fn replace_record(&mut self, idx: usize, data: Vec<u8>) -> Result<()> {
        check_record_size(&data)?;
        let record = self
            .records
            .get_mut(idx)
            .ok_or_else(|| NestError::not_found(format!("record {}", idx + 1)))?;
        self.cached_data_size = self.cached_data_size - record.data.len() + data.len();
        record.data = data;
        Ok(())
    }

    /// Compare cached summary counters against the record list
    pub fn check_consistency(&self) -> Result<()> {
        if self.cached_count != self.records.len() {
            return Err(NestError::health(format!(
                "archive caches {} records but holds {}",
                self.cached_count,
                self.records.len()
            )));
        }
        let actual: usize = self.records.iter().map(|r| r.data.len()).sum();
        if self.cached_data_size != actual {
            return Err(NestError::health(format!(
                "archive caches {} data bytes but holds {}",
                self.cached_data_size, actual
            )));
        }
        Ok(())
    }
}

impl Default for ZipArchive {
    fn default() -> Self {
        ZipArchive::new()
    }
}

/// Header size fields are 32-bit; a record bigger than that cannot be
/// written without truncating, so it is rejected on the way in
fn check_record_size(data: &[u8]) -> Result<()> {
    if data.len() > u32::MAX as usize {
        return Err(NestError::invalid_format(format!(
            "record of {} bytes exceeds the format limit",
            data.len()
        )));
    }
    Ok(())
}

/// Locate the end-of-central-directory record
fn find_eocd(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < EOCD_LEN {
        return Err(NestError::invalid_format("too short for a ZIP archive"));
    }
    let start = bytes.len().saturating_sub(EOCD_SEARCH);
    for pos in (start..=bytes.len() - EOCD_LEN).rev() {
        if bytes[pos..pos + 4] == EOCD_SIG {
            return Ok(pos);
        }
    }
    Err(NestError::invalid_format("no end-of-central-directory record"))
}

/// Read a stored entry's data via its local header
fn read_local_data(bytes: &[u8], offset: usize, csize: usize) -> Result<Vec<u8>> {
    if offset + LOCAL_HEADER_LEN > bytes.len() || bytes[offset..offset + 4] != LOCAL_SIG {
        return Err(NestError::invalid_format("bad local file header"));
    }
    let name_len = read_u16(bytes, offset + 26) as usize;
    let extra_len = read_u16(bytes, offset + 28) as usize;
    let data_start = offset + LOCAL_HEADER_LEN + name_len + extra_len;
    bytes
        .get(data_start..data_start + csize)
        .map(|d| d.to_vec())
        .ok_or_else(|| NestError::invalid_format("truncated entry data"))
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_archive_round_trip() {
        let archive = ZipArchive::new();
        let bytes = archive.to_bytes();
        assert!(ZipArchive::sniff(&bytes));
        let parsed = ZipArchive::parse(&bytes).unwrap();
        assert!(parsed.records().is_empty());
    }

    #[test]
    fn test_add_and_round_trip() {
        let mut archive = ZipArchive::new();
        archive.add_record("ONE", vec![0x01; 1024]).unwrap();
        archive.add_record("TWO", vec![0x02; 2048]).unwrap();

        let bytes = archive.to_bytes();
        assert!(ZipArchive::sniff(&bytes));
        let parsed = ZipArchive::parse(&bytes).unwrap();
        assert_eq!(parsed.records().len(), 2);
        assert_eq!(parsed.records()[0].name, "ONE");
        assert_eq!(parsed.records()[1].name, "TWO");
        assert_eq!(parsed.record_data("one").unwrap(), &[0x01; 1024][..]);
        parsed.check_consistency().unwrap();
    }

    #[test]
    fn test_remove_record() {
        let mut archive = ZipArchive::new();
        archive.add_record("A", vec![1]).unwrap();
        archive.add_record("B", vec![2]).unwrap();
        archive.remove_record("a").unwrap();
        assert_eq!(archive.records().len(), 1);
        assert_eq!(archive.records()[0].name, "B");
        archive.check_consistency().unwrap();

        assert!(matches!(
            archive.remove_record("missing"),
            Err(NestError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_names_are_ambiguous() {
        let mut archive = ZipArchive::new();
        archive.add_record("Same", vec![1]).unwrap();
        archive.add_record("SAME", vec![2]).unwrap();
        assert!(matches!(
            archive.record_data("same"),
            Err(NestError::AmbiguousMatch(_))
        ));
    }

    #[test]
    fn test_crc_validated_on_parse() {
        let mut archive = ZipArchive::new();
        archive.add_record("X", vec![0xAA; 64]).unwrap();
        let mut bytes = archive.to_bytes();
        // Corrupt one data byte; the local header is 30 bytes + 1 name byte
        bytes[40] ^= 0xFF;
        assert!(matches!(
            ZipArchive::parse(&bytes),
            Err(NestError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_rejects_non_zip() {
        assert!(!ZipArchive::sniff(b"not a zip"));
        assert!(ZipArchive::parse(b"not a zip at all, nope").is_err());
    }

    #[test]
    fn test_replace_record() {
        let mut archive = ZipArchive::new();
        archive.add_record("X", vec![1; 10]).unwrap();
        archive.replace_record(0, vec![2; 20]).unwrap();
        assert_eq!(archive.records()[0].data, vec![2; 20]);
        archive.check_consistency().unwrap();
        assert!(archive.replace_record(5, vec![]).is_err());
    }

    #[test]
    fn test_record_count_limit() {
        let mut archive = ZipArchive::new();
        for _ in 0..u16::MAX {
            archive.add_record("R", Vec::new()).unwrap();
        }
        // The count field is 16-bit; one more would truncate on write
        assert!(matches!(
            archive.add_record("R", Vec::new()),
            Err(NestError::InvalidFormat(_))
        ));
        assert_eq!(archive.records().len(), u16::MAX as usize);
        archive.check_consistency().unwrap();
    }
}
