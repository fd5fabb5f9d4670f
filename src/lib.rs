/*!
# a2nest

A Rust library for exploring and editing nested Apple II-era media: disk
images, archives and partitioned disks that may contain each other to any
depth ("turducken" files).

## Features

- Extended paths addressing any object in a nesting tree (`disk.po:Archive.zip`)
- Uniform container surface over archives, disk images, partitions and
  partition maps
- Transactional saves: a mutated leaf is re-serialized and pushed up through
  every enclosing container, and a rejection at any level leaves the host
  file byte-for-byte untouched
- Two-phase disk-image handling: a damaged filesystem can still be opened
  and inspected at the container level
- Recursive tree walking with caller-supplied descend policies

## Quick Start

```rust,no_run
use a2nest::{Container, NodeChain, OpenMode};

// Open an archive stored on a disk image
let mut chain = NodeChain::open_path("disk.po:Archive.zip", OpenMode::ReadWrite)?;

// Mutate the leaf
if let Container::Archive(archive) = chain.leaf_mut() {
    archive.add_record("NOTES", b"hello".to_vec())?;
}

// Push the change up through every level and rewrite the host file
chain.save_updates()?;
# Ok::<(), a2nest::NestError>(())
```

## Modules

- `path`: extended-path parsing
- `container`: container kinds and the capability surface over them
- `filesystem`: mounted-volume implementation used by disk images
- `chain`: node chains, save propagation and health checking
- `walk`: recursive enumeration with descend policies
- `error`: error types and Result alias
*/

#![warn(missing_docs)]

/// Node chains, save propagation and health checking
pub mod chain;
/// Container kinds and the capability surface over them
pub mod container;
/// Error types and Result alias
pub mod error;
/// Filesystem implementations
pub mod filesystem;
/// Extended-path parsing
pub mod path;
/// Recursive enumeration with descend policies
pub mod walk;

// Re-export common types
pub use chain::{Node, NodeChain, OpenMode};
pub use container::{
    detect, ChildEntry, ChildRef, Container, ContainerKind, DiskImage, PartEntry, PartitionMap,
    PartitionSlot, ZipArchive, ZipRecord,
};
pub use error::{NestError, Result};
pub use filesystem::{FileEntry, FileSystemInfo, PascalVolume};
pub use path::{PathSpec, Segment, SEPARATOR};
pub use walk::{policies, walk, DescendPolicy, WalkEntry};
