/// Recursive enumeration of a whole nesting tree
///
/// Walking is read-only and depth-limited by a caller-supplied policy: a
/// predicate over (parent kind, child kind, child name) consulted before
/// descending into any child that itself looks like a container. The policy
/// only limits enumeration; it plays no part in mutation or saving.
use crate::container::{detect, Container, ContainerKind};
use crate::error::Result;
use crate::path::SEPARATOR;
use std::path::Path;
use tracing::debug;

/// Decides whether enumeration descends into a given child container
pub type DescendPolicy = dyn Fn(ContainerKind, ContainerKind, &str) -> bool;

/// One visited object in the tree
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Full extended path of this object
    pub path: String,
    /// Child name within its parent
    pub name: String,
    /// Detected container kind, or `None` for a plain file
    pub kind: Option<ContainerKind>,
    /// Size in bytes
    pub size: usize,
    /// Nesting depth (1 = direct child of the host container)
    pub depth: usize,
}

/// Stock descend policies
pub mod policies {
    use crate::container::ContainerKind;

    /// Descend into everything that looks like a container
    pub fn always(_parent: ContainerKind, _child: ContainerKind, _name: &str) -> bool {
        true
    }

    /// Descend into partitions and sub-volumes, but not into files stored
    /// inside a mounted filesystem
    pub fn wrappers_only(parent: ContainerKind, _child: ContainerKind, _name: &str) -> bool {
        parent != ContainerKind::DiskImage
    }

    /// Descend into anything except archives
    pub fn no_archives(_parent: ContainerKind, child: ContainerKind, _name: &str) -> bool {
        child != ContainerKind::Archive
    }
}

/// Enumerate the nesting tree under a host file
pub fn walk(
    host: &Path,
    policy: &DescendPolicy,
    visit: &mut dyn FnMut(&WalkEntry),
) -> Result<()> {
    let bytes = std::fs::read(host)?;
    let hint = host.file_name().map(|n| n.to_string_lossy().to_string());
    let kind = detect(&bytes, hint.as_deref())?;
    let mut container = Container::open(kind, bytes)?;
    if let Container::Image(image) = &mut container {
        image.analyze()?;
    }
    walk_container(&container, &host.display().to_string(), 1, policy, visit)
}

fn walk_container(
    container: &Container,
    prefix: &str,
    depth: usize,
    policy: &DescendPolicy,
    visit: &mut dyn FnMut(&WalkEntry),
) -> Result<()> {
    for child in container.children()? {
        let path = format!("{}{}{}", prefix, SEPARATOR, child.name);
        let bytes = container.extract_child(&child.key)?;

        let sub = match detect(&bytes, Some(&child.name)) {
            Ok(kind) => Container::open(kind, bytes).ok(),
            Err(_) => None,
        };

        visit(&WalkEntry {
            path: path.clone(),
            name: child.name.clone(),
            kind: sub.as_ref().map(|c| c.kind()),
            size: child.size,
            depth,
        });

        if let Some(mut sub) = sub {
            if !policy(container.kind(), sub.kind(), &child.name) {
                continue;
            }
            if let Container::Image(image) = &mut sub {
                // A damaged nested filesystem stops descent but not the walk
                if image.analyze().is_err() {
                    debug!(path = %path, "nested filesystem not mountable; skipping");
                    continue;
                }
            }
            walk_container(&sub, &path, depth + 1, policy, visit)?;
        }
    }
    Ok(())
}
