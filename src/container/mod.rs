/// Container kinds and the uniform capability surface over them
///
/// Four kinds of container can appear at any level of a nested ("turducken")
/// file. They are a closed set: the save propagator has to reason
/// exhaustively about how each kind can reject a write, so dispatch is a
/// `match` over an enum rather than open-ended trait objects.

/// Block disk images
pub mod image;
/// Partition maps and fixed-extent partitions
pub mod partmap;
/// Stored-method ZIP archives
pub mod zip;

pub use image::DiskImage;
pub use partmap::{PartEntry, PartitionMap, PartitionSlot};
pub use zip::{ZipArchive, ZipRecord};

use crate::error::{NestError, Result};
use crate::path::Segment;
use std::fmt;
use tracing::debug;

/// The closed set of container kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// File archive with named records
    Archive,
    /// Block disk image holding a filesystem
    DiskImage,
    /// One fixed-extent partition
    Partition,
    /// Partitioned media holding indexed sub-regions
    MultiPartSet,
}

impl ContainerKind {
    /// Human-readable kind name
    pub fn name(&self) -> &'static str {
        match self {
            ContainerKind::Archive => "archive",
            ContainerKind::DiskImage => "disk image",
            ContainerKind::Partition => "partition",
            ContainerKind::MultiPartSet => "partition map",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identifies one child within its parent container; written back through
/// the same reference during save propagation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildRef {
    /// Child addressed by name
    Name(String),
    /// Child addressed by 1-based index
    Index(usize),
}

impl fmt::Display for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildRef::Name(name) => write!(f, "{}", name),
            ChildRef::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// One enumerated child
#[derive(Debug, Clone)]
pub struct ChildEntry {
    /// How to extract/replace this child in its parent
    pub key: ChildRef,
    /// Display name
    pub name: String,
    /// Child size in bytes
    pub size: usize,
}

/// Sniff a byte buffer (plus an optional filename hint) for its container kind
pub fn detect(bytes: &[u8], name_hint: Option<&str>) -> Result<ContainerKind> {
    let kind = if ZipArchive::sniff(bytes) {
        ContainerKind::Archive
    } else if PartitionMap::sniff(bytes) {
        ContainerKind::MultiPartSet
    } else if DiskImage::sniff(bytes) {
        ContainerKind::DiskImage
    } else {
        return Err(NestError::unrecognized(format!(
            "{} ({} bytes)",
            name_hint.unwrap_or("buffer"),
            bytes.len()
        )));
    };
    debug!(kind = kind.name(), len = bytes.len(), "detected container");
    Ok(kind)
}

/// One container instance, dispatching the capability surface per kind
#[derive(Debug, Clone)]
pub enum Container {
    /// ZIP archive
    Archive(ZipArchive),
    /// Block disk image
    Image(DiskImage),
    /// Fixed-extent partition
    Part(PartitionSlot),
    /// Partition map
    MultiPart(PartitionMap),
}

impl Container {
    /// Parse a byte buffer as the given kind
    ///
    /// For a `DiskImage` this only opens the wrapper; mounting the
    /// filesystem is a separate step ([`DiskImage::analyze`]).
    pub fn open(kind: ContainerKind, bytes: Vec<u8>) -> Result<Container> {
        match kind {
            ContainerKind::Archive => Ok(Container::Archive(ZipArchive::parse(&bytes)?)),
            ContainerKind::DiskImage => Ok(Container::Image(DiskImage::open(bytes)?)),
            ContainerKind::MultiPartSet => Ok(Container::MultiPart(PartitionMap::parse(bytes)?)),
            ContainerKind::Partition => Err(NestError::invalid_format(
                "partitions exist only inside a partition map",
            )),
        }
    }

    /// This container's kind
    pub fn kind(&self) -> ContainerKind {
        match self {
            Container::Archive(_) => ContainerKind::Archive,
            Container::Image(_) => ContainerKind::DiskImage,
            Container::Part(_) => ContainerKind::Partition,
            Container::MultiPart(_) => ContainerKind::MultiPartSet,
        }
    }

    /// Short description used in save-rejection messages
    pub fn describe(&self) -> String {
        match self {
            Container::Archive(a) => format!("archive with {} records", a.records().len()),
            Container::Image(i) => match i.volume() {
                Ok(v) => format!("disk image {}", v.volume_name()),
                Err(_) => "disk image (unmounted)".to_string(),
            },
            Container::Part(p) => format!("partition {} ({})", p.index(), p.name()),
            Container::MultiPart(m) => {
                format!("partition map with {} partitions", m.entries().len())
            }
        }
    }

    /// Enumerate addressable children
    ///
    /// A `DiskImage` must have been analyzed first; enumeration of a damaged
    /// volume fails here rather than at open time.
    pub fn children(&self) -> Result<Vec<ChildEntry>> {
        match self {
            Container::Archive(archive) => Ok(archive
                .records()
                .iter()
                .enumerate()
                .map(|(i, r)| ChildEntry {
                    key: ChildRef::Index(i + 1),
                    name: r.name.clone(),
                    size: r.data.len(),
                })
                .collect()),
            Container::Image(image) => Ok(image
                .volume()?
                .entries()
                .iter()
                .map(|e| ChildEntry {
                    key: ChildRef::Name(e.name.clone()),
                    name: e.name.clone(),
                    size: e.size(),
                })
                .collect()),
            Container::Part(part) => Ok(vec![ChildEntry {
                key: ChildRef::Index(1),
                name: part.name().to_string(),
                size: part.content().len(),
            }]),
            Container::MultiPart(map) => Ok(map
                .entries()
                .iter()
                .enumerate()
                .map(|(i, e)| ChildEntry {
                    key: ChildRef::Index(i + 1),
                    name: e.name.clone(),
                    size: e.byte_len(),
                })
                .collect()),
        }
    }

    /// Resolve a path segment to a child reference using this container's
    /// own matching rules
    ///
    /// This is where a purely numeric segment becomes a 1-based index: always
    /// for a partition map, and as a fallback for archives when no record
    /// name matches.
    pub fn find_child(&self, segment: &Segment) -> Result<ChildRef> {
        let name = segment
            .name()
            .ok_or_else(|| NestError::malformed("segment does not name a child"))?;
        match self {
            Container::Archive(archive) => {
                let found = archive.matches(name);
                match found.as_slice() {
                    [] => match segment.index() {
                        Some(i) if i <= archive.records().len() => Ok(ChildRef::Index(i)),
                        _ => Err(NestError::not_found(name.to_string())),
                    },
                    [idx] => Ok(ChildRef::Index(idx + 1)),
                    _ => Err(NestError::AmbiguousMatch(name.to_string())),
                }
            }
            Container::Image(image) => {
                let entry = image
                    .volume()?
                    .find(name)
                    .ok_or_else(|| NestError::not_found(name.to_string()))?;
                Ok(ChildRef::Name(entry.name.clone()))
            }
            Container::Part(_) => Err(NestError::not_found(name.to_string())),
            Container::MultiPart(map) => {
                if let Some(index) = segment.index() {
                    map.entry(index)?;
                    return Ok(ChildRef::Index(index));
                }
                let found = map.matches(name);
                match found.as_slice() {
                    [] => Err(NestError::not_found(name.to_string())),
                    [idx] => Ok(ChildRef::Index(*idx)),
                    _ => Err(NestError::AmbiguousMatch(name.to_string())),
                }
            }
        }
    }

    /// Copy out the bytes backing one child
    pub fn extract_child(&self, child: &ChildRef) -> Result<Vec<u8>> {
        match (self, child) {
            (Container::Archive(archive), ChildRef::Index(i)) => i
                .checked_sub(1)
                .and_then(|i| archive.records().get(i))
                .map(|r| r.data.clone())
                .ok_or_else(|| NestError::not_found(format!("record {}", i))),
            (Container::Archive(archive), ChildRef::Name(name)) => {
                archive.record_data(name).map(|d| d.to_vec())
            }
            (Container::Image(image), ChildRef::Name(name)) => image.volume()?.read_file(name),
            (Container::Part(part), ChildRef::Index(1)) => Ok(part.to_bytes()),
            (Container::MultiPart(map), ChildRef::Index(i)) => map.extract(*i),
            (container, child) => Err(NestError::not_found(format!(
                "{} cannot address {}",
                container.kind(),
                child
            ))),
        }
    }

    /// Write new bytes for one child into this container's in-memory model
    ///
    /// All-or-nothing per level: on any error the model is untouched, so a
    /// rejected save leaves every ancestor healthy.
    pub fn replace_child(&mut self, child: &ChildRef, data: Vec<u8>) -> Result<()> {
        match (self, child) {
            (Container::Archive(archive), ChildRef::Index(i)) => {
                let idx = i
                    .checked_sub(1)
                    .ok_or_else(|| NestError::not_found(format!("record {}", i)))?;
                archive.replace_record(idx, data)
            }
            (Container::Archive(archive), ChildRef::Name(name)) => {
                let found = archive.matches(name);
                match found.as_slice() {
                    [] => Err(NestError::not_found(name.to_string())),
                    [idx] => archive.replace_record(*idx, data),
                    _ => Err(NestError::AmbiguousMatch(name.to_string())),
                }
            }
            (Container::Image(image), ChildRef::Name(name)) => {
                image.volume_mut()?.write_file(name, &data)
            }
            (Container::Part(part), ChildRef::Index(1)) => part.replace_content(data),
            (Container::MultiPart(map), ChildRef::Index(i)) => map.replace(*i, &data),
            (container, child) => Err(NestError::not_found(format!(
                "{} cannot address {}",
                container.kind(),
                child
            ))),
        }
    }

    /// Render this container into its complete on-the-wire form
    ///
    /// Disk images flush their per-track caches first; serialization never
    /// leaves buffered state behind.
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        match self {
            Container::Archive(archive) => Ok(archive.to_bytes()),
            Container::Image(image) => Ok(image.to_bytes()),
            Container::Part(part) => Ok(part.to_bytes()),
            Container::MultiPart(map) => Ok(map.to_bytes()),
        }
    }

    /// Re-derive bookkeeping from backing bytes and compare with cached
    /// summaries; a failure indicates a bug, not a user error
    pub fn check_health(&self) -> Result<()> {
        match self {
            Container::Archive(archive) => archive.check_consistency(),
            Container::Image(image) => image.check_consistency(),
            Container::Part(part) => part.check_consistency(),
            Container::MultiPart(map) => map.check_consistency(),
        }
    }
}
