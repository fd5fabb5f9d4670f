/// Filesystem implementations

pub mod pascal;

pub use pascal::{FileEntry, PascalVolume};

/// Mounted-filesystem summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemInfo {
    /// Filesystem type name
    pub fs_type: String,
    /// Volume name
    pub volume_name: String,
    /// Total blocks on the volume
    pub total_blocks: usize,
    /// Free blocks
    pub free_blocks: usize,
    /// Number of files
    pub file_count: usize,
}
