/// Extended-path parsing
///
/// An extended path addresses an object at arbitrary nesting depth:
/// `disk.po:Archive.zip:inner.po` names an image stored in an archive stored
/// on a disk. The outer separator is `:`; a backslash escapes a literal
/// separator (or backslash) inside a segment. A trailing empty segment
/// addresses the final container's own root/volume object, which is how
/// whole-volume operations such as a volume rename are expressed.
use crate::error::{NestError, Result};
use std::fmt;
use std::path::PathBuf;

/// Reserved separator between nesting levels
pub const SEPARATOR: char = ':';

/// One component of an extended path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A child name; may be numeric, which chain building interprets
    /// contextually as a 1-based index
    Name(String),
    /// Trailing empty segment: address the container/volume object itself
    Root,
}

impl Segment {
    /// Interpret this segment as a 1-based index, if it is purely numeric
    pub fn index(&self) -> Option<usize> {
        match self {
            Segment::Name(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse::<usize>().ok().filter(|&n| n > 0)
            }
            _ => None,
        }
    }

    /// The segment's name text, if it has one
    pub fn name(&self) -> Option<&str> {
        match self {
            Segment::Name(s) => Some(s),
            Segment::Root => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Name(s) => write!(f, "{}", escape(s)),
            Segment::Root => Ok(()),
        }
    }
}

/// A parsed extended path: host file plus the in-container segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    /// Host file on the local filesystem
    pub host: PathBuf,
    /// Ordered descent from the host file to the addressed object
    pub segments: Vec<Segment>,
}

impl PathSpec {
    /// Parse an extended path string
    ///
    /// The parser only tokenizes; whether a numeric segment is a name or a
    /// partition index is decided against the actual container during chain
    /// building.
    pub fn parse(input: &str) -> Result<PathSpec> {
        if input.is_empty() {
            return Err(NestError::malformed("empty path"));
        }

        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut chars = input.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(next @ (SEPARATOR | '\\')) => current.push(next),
                    Some(other) => {
                        // Not an escape we recognize; keep both characters
                        current.push('\\');
                        current.push(other);
                    }
                    None => {
                        return Err(NestError::malformed("dangling escape at end of path"));
                    }
                },
                SEPARATOR => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }
        parts.push(current);

        let host = parts.remove(0);
        if host.is_empty() {
            return Err(NestError::malformed("missing host file"));
        }

        let last = parts.len().checked_sub(1);
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            if part.is_empty() {
                if Some(i) == last {
                    segments.push(Segment::Root);
                } else {
                    return Err(NestError::malformed(format!(
                        "empty segment at position {}",
                        i + 1
                    )));
                }
            } else {
                segments.push(Segment::Name(part));
            }
        }

        Ok(PathSpec {
            host: PathBuf::from(host),
            segments,
        })
    }

    /// True when the path addresses only the host file itself
    pub fn is_host_only(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", escape(&self.host.to_string_lossy()))?;
        for segment in &self.segments {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

/// Escape separators and backslashes so the text re-parses as one segment
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == SEPARATOR || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
