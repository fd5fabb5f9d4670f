/// Block disk image container
///
/// A plain block image has no wrapper magic; it is recognized by its size
/// shape (whole 512-byte blocks) and extension hints. Opening the container
/// and mounting its filesystem are separate fallible steps so that damaged
/// volumes can still be inspected at the block level.
use crate::error::{NestError, Result};
use crate::filesystem::pascal::{PascalVolume, BLOCK_SIZE, DATA_START};
use crate::filesystem::FileSystemInfo;
use tracing::debug;

/// Smallest plausible volume: boot blocks, directory, one data block
pub const MIN_BLOCKS: usize = DATA_START + 1;

/// A disk image: raw block bytes plus an optionally mounted volume
#[derive(Debug, Clone)]
pub struct DiskImage {
    raw: Vec<u8>,
    volume: Option<PascalVolume>,
}

impl DiskImage {
    /// True when the buffer has the shape of a block image
    pub fn sniff(bytes: &[u8]) -> bool {
        bytes.len() % BLOCK_SIZE == 0 && bytes.len() >= MIN_BLOCKS * BLOCK_SIZE
    }

    /// Open the container without mounting its filesystem
    pub fn open(bytes: Vec<u8>) -> Result<DiskImage> {
        if !Self::sniff(&bytes) {
            return Err(NestError::invalid_format(format!(
                "{} bytes is not a whole number of blocks",
                bytes.len()
            )));
        }
        Ok(DiskImage { raw: bytes, volume: None })
    }

    /// Create a freshly formatted image
    pub fn create(volume_name: &str, total_blocks: usize) -> Result<DiskImage> {
        let volume = PascalVolume::format(volume_name, total_blocks)?;
        Ok(DiskImage {
            raw: Vec::new(),
            volume: Some(volume),
        })
    }

    /// Attempt to mount the filesystem; separate from [`DiskImage::open`]
    /// and idempotent once it has succeeded
    pub fn analyze(&mut self) -> Result<()> {
        if self.volume.is_none() {
            let volume = PascalVolume::mount(self.raw.clone())?;
            debug!(
                volume = volume.volume_name(),
                files = volume.entries().len(),
                "mounted volume"
            );
            self.volume = Some(volume);
        }
        Ok(())
    }

    /// True once a filesystem has been mounted
    pub fn is_analyzed(&self) -> bool {
        self.volume.is_some()
    }

    /// The mounted volume
    pub fn volume(&self) -> Result<&PascalVolume> {
        self.volume
            .as_ref()
            .ok_or_else(|| NestError::filesystem("filesystem has not been analyzed"))
    }

    /// The mounted volume, mutably
    pub fn volume_mut(&mut self) -> Result<&mut PascalVolume> {
        self.volume
            .as_mut()
            .ok_or_else(|| NestError::filesystem("filesystem has not been analyzed"))
    }

    /// Mounted-volume summary
    pub fn info(&self) -> Result<FileSystemInfo> {
        Ok(self.volume()?.info())
    }

    /// True while the volume has unflushed per-track writes
    pub fn has_unflushed(&self) -> bool {
        self.volume.as_ref().is_some_and(|v| v.has_unflushed())
    }

    /// Render the image into its complete byte form, flushing any dirty
    /// track buffers first
    pub fn to_bytes(&mut self) -> Vec<u8> {
        match &mut self.volume {
            Some(volume) => {
                let tracks = volume.dirty_tracks();
                if !tracks.is_empty() {
                    debug!(tracks = tracks.len(), "flushing dirty tracks before serialize");
                }
                volume.to_bytes()
            }
            None => self.raw.clone(),
        }
    }

    /// Verify the mounted volume's bookkeeping against its backing bytes
    pub fn check_consistency(&self) -> Result<()> {
        match &self.volume {
            Some(volume) => volume.check_consistency(),
            None => Ok(()),
        }
    }
}
