/// Node chains: opening a nested path and saving changes back up it
///
/// A chain is the ordered list of container nodes from the host file down to
/// the addressed leaf. Each node owns a private copy of its bytes, so a
/// mutated child can never corrupt a parent that has not yet accepted the
/// write. Saving re-serializes bottom-up: every level's `replace_child`
/// either fully succeeds or fully fails, and the host file itself is only
/// rewritten once every ancestor has accepted the change. A rejected save
/// therefore leaves the host byte-for-byte untouched.
use crate::container::{detect, ChildRef, Container, ContainerKind};
use crate::error::{NestError, Result};
use crate::path::{PathSpec, Segment};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Whether a chain may write back to its host file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Inspection only; `save_updates` is rejected
    ReadOnly,
    /// Mutation and save allowed
    ReadWrite,
}

/// One opened container in a chain
#[derive(Debug)]
pub struct Node {
    kind: ContainerKind,
    container: Container,
    /// The bytes this node was built from; a private copy, never a view
    /// into the parent
    backing: Vec<u8>,
    dirty: bool,
    /// Identifies which child of the parent this node came from; `None`
    /// only for the root
    parent_link: Option<ChildRef>,
}

impl Node {
    /// This node's container kind
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// The node's container, read-only
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// True when this node has unsaved mutations
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The child reference this node was extracted through
    pub fn parent_link(&self) -> Option<&ChildRef> {
        self.parent_link.as_ref()
    }

    /// Size of the node's backing bytes
    pub fn backing_len(&self) -> usize {
        self.backing.len()
    }
}

/// An open chain of nested containers rooted at a host file
///
/// The host file handle is held for the chain's lifetime and released on
/// drop, on every exit path. Dropping a chain without saving discards any
/// in-memory mutations; the host file is only ever touched by a successful
/// [`NodeChain::save_updates`].
#[derive(Debug)]
pub struct NodeChain {
    host_path: PathBuf,
    host: std::fs::File,
    mode: OpenMode,
    nodes: Vec<Node>,
}

impl NodeChain {
    /// Open the chain addressed by an extended path
    ///
    /// Walks the segments from the host file inward: enumerate the current
    /// container, match the segment (numeric segments are 1-based partition
    /// indices against a partition map), extract the child's bytes, detect
    /// its kind and descend. Descending through a partition map inserts the
    /// fixed-extent partition node before its content.
    pub fn open(spec: &PathSpec, mode: OpenMode) -> Result<NodeChain> {
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == OpenMode::ReadWrite {
            options.write(true);
        }
        let mut host = options.open(&spec.host)?;
        let mut bytes = Vec::new();
        host.read_to_end(&mut bytes)?;

        let hint = spec.host.file_name().map(|n| n.to_string_lossy().to_string());
        let kind = detect(&bytes, hint.as_deref())?;
        let container = Container::open(kind, bytes.clone())?;
        debug!(host = %spec.host.display(), kind = kind.name(), "opened root node");

        let mut chain = NodeChain {
            host_path: spec.host.clone(),
            host,
            mode,
            nodes: vec![Node {
                kind,
                container,
                backing: bytes,
                dirty: false,
                parent_link: None,
            }],
        };

        for (i, segment) in spec.segments.iter().enumerate() {
            let is_last = i + 1 == spec.segments.len();
            match segment {
                Segment::Root => {
                    if !is_last {
                        return Err(NestError::malformed(
                            "empty segment is only allowed at the end of a path",
                        ));
                    }
                    // The volume object itself is the target; make sure the
                    // filesystem is actually reachable
                    chain.descend_partition_content()?;
                    chain.analyze_current()?;
                }
                Segment::Name(_) => {
                    chain.descend_partition_content()?;
                    chain.analyze_current()?;
                    chain.descend(segment)?;
                }
            }
        }

        debug!(depth = chain.depth(), "chain complete");
        Ok(chain)
    }

    /// Parse and open in one step
    pub fn open_path(ext_path: &str, mode: OpenMode) -> Result<NodeChain> {
        let spec = PathSpec::parse(ext_path)?;
        NodeChain::open(&spec, mode)
    }

    /// Number of nodes, root included
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    /// Host file path
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// A node by level (0 = root)
    pub fn node(&self, level: usize) -> Option<&Node> {
        self.nodes.get(level)
    }

    /// The deepest node
    pub fn leaf(&self) -> &Node {
        // A chain always holds at least the root node
        self.nodes.last().expect("chain has a root node")
    }

    /// Mutable access to the leaf's container; marks the leaf dirty
    pub fn leaf_mut(&mut self) -> &mut Container {
        let node = self.nodes.last_mut().expect("chain has a root node");
        node.dirty = true;
        &mut node.container
    }

    /// Mutable access to an arbitrary level's container; marks it dirty
    pub fn node_mut(&mut self, level: usize) -> Option<&mut Container> {
        let node = self.nodes.get_mut(level)?;
        node.dirty = true;
        Some(&mut node.container)
    }

    /// True when any node carries unsaved mutations
    pub fn is_dirty(&self) -> bool {
        self.nodes.iter().any(|n| n.dirty)
    }

    /// Mount the leaf's filesystem if it is an unanalyzed disk image
    pub fn analyze_leaf(&mut self) -> Result<()> {
        self.analyze_current()
    }

    /// Save all unsaved mutations back to the host file
    ///
    /// Walks from the deepest dirty node to the root. At each level the
    /// serialized child is offered to its parent; any rejection aborts the
    /// whole save with [`NestError::PropagationFailed`] and the host file
    /// untouched. The in-memory edit survives a rejection: drop the chain to
    /// discard it, or revert and retry. With no dirty nodes this is a no-op.
    pub fn save_updates(&mut self) -> Result<()> {
        let Some(start) = self.nodes.iter().rposition(|n| n.dirty) else {
            debug!("no dirty nodes; nothing to save");
            return Ok(());
        };
        if self.mode != OpenMode::ReadWrite {
            return Err(NestError::filesystem("chain was opened read-only"));
        }

        let mut level = start;
        loop {
            let new_bytes = self.nodes[level].container.serialize()?;
            if level == 0 {
                self.rewrite_host(&new_bytes)?;
                self.nodes[0].backing = new_bytes;
                self.nodes[0].dirty = false;
                debug!(host = %self.host_path.display(), "host file rewritten");
                return Ok(());
            }

            let link = self.nodes[level]
                .parent_link
                .clone()
                .ok_or_else(|| NestError::health("non-root node has no parent link"))?;
            let parent = level - 1;
            match self.nodes[parent].container.replace_child(&link, new_bytes.clone()) {
                Ok(()) => {
                    debug!(level, child = %link, "level accepted replacement");
                    self.nodes[parent].dirty = true;
                    self.nodes[level].dirty = false;
                    self.nodes[level].backing = new_bytes;
                    level = parent;
                }
                Err(cause) => {
                    let detail = self.nodes[parent].container.describe();
                    warn!(level = parent, %detail, %cause, "save rejected; host untouched");
                    return Err(NestError::PropagationFailed {
                        level: parent,
                        detail,
                        cause: Box::new(cause),
                    });
                }
            }
        }
    }

    /// Verify every node's cached bookkeeping against its backing bytes
    ///
    /// Required to pass after every save attempt, successful or rejected;
    /// a failure indicates a bug in a container's `replace_child`.
    pub fn check_health(&self) -> Result<()> {
        for (level, node) in self.nodes.iter().enumerate() {
            node.container.check_health().map_err(|e| {
                NestError::health(format!("level {} ({}): {}", level, node.container.describe(), e))
            })?;
        }
        Ok(())
    }

    /// If the current deepest node is a partition, descend into its content
    fn descend_partition_content(&mut self) -> Result<()> {
        let last = self.nodes.last().expect("chain has a root node");
        if !matches!(last.container, Container::Part(_)) {
            return Ok(());
        }
        let link = ChildRef::Index(1);
        let bytes = last.container.extract_child(&link)?;
        let name = match &last.container {
            Container::Part(part) => part.name().to_string(),
            _ => unreachable!(),
        };
        let kind = detect(&bytes, Some(&name))?;
        let container = Container::open(kind, bytes.clone())?;
        debug!(partition = %name, kind = kind.name(), "descended into partition content");
        self.nodes.push(Node {
            kind,
            container,
            backing: bytes,
            dirty: false,
            parent_link: Some(link),
        });
        Ok(())
    }

    /// Mount the deepest node's filesystem when it is a disk image
    fn analyze_current(&mut self) -> Result<()> {
        let last = self.nodes.last_mut().expect("chain has a root node");
        if let Container::Image(image) = &mut last.container {
            image.analyze()?;
        }
        Ok(())
    }

    /// Resolve one segment against the deepest node and push the child
    fn descend(&mut self, segment: &Segment) -> Result<()> {
        let last = self.nodes.last().expect("chain has a root node");
        let link = last.container.find_child(segment)?;
        let bytes = last.container.extract_child(&link)?;

        if let Container::MultiPart(map) = &last.container {
            // Partitions get an explicit fixed-extent node of their own
            let index = match link {
                ChildRef::Index(i) => i,
                ChildRef::Name(_) => {
                    return Err(NestError::health("partition resolved to a name reference"))
                }
            };
            let name = map.entry(index)?.name.clone();
            let slot = crate::container::PartitionSlot::new(index, &name, bytes.clone());
            debug!(partition = index, name = %name, "descended into partition");
            self.nodes.push(Node {
                kind: ContainerKind::Partition,
                container: Container::Part(slot),
                backing: bytes,
                dirty: false,
                parent_link: Some(link),
            });
            return Ok(());
        }

        let kind = detect(&bytes, segment.name())?;
        let container = Container::open(kind, bytes.clone())?;
        debug!(child = %link, kind = kind.name(), "descended");
        self.nodes.push(Node {
            kind,
            container,
            backing: bytes,
            dirty: false,
            parent_link: Some(link),
        });
        Ok(())
    }

    /// Rewrite the host file in place through the held handle
    fn rewrite_host(&mut self, bytes: &[u8]) -> Result<()> {
        self.host.seek(SeekFrom::Start(0))?;
        self.host.write_all(bytes)?;
        self.host.set_len(bytes.len() as u64)?;
        self.host.flush()?;
        Ok(())
    }
}
