//! # aep-manifest
//!
//! The binary file-list manifest and the virtual file tree built from it.
//!
//! The manifest is a compact pre-order dump of the remote data tree:
//!
//! ```text
//! u32 file_count; u32 dir_count; u8 depth_max;
//! { u8 depth; cstring name; i64 size; }*
//! ```
//!
//! `depth` is the absolute nesting level (children of the root are at 0),
//! a size of zero marks a directory, and sibling order is manifest order.
//! Integers are host byte order. The tree is immutable after load and is
//! authoritative for the size and shape of every virtual file.

pub mod writer;

pub use writer::ManifestWriter;

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading the manifest. All of them are fatal to the
/// shim at init.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest truncated at byte {0}")]
    Truncated(usize),

    #[error("entry name at byte {0} is empty or not valid UTF-8")]
    BadName(usize),

    #[error("entry depth {depth} outside header bound {max}")]
    BadDepth { depth: u8, max: u8 },

    #[error("entry depth {0} skips a nesting level")]
    SkippedDepth(u8),

    #[error("entry count does not match header ({header} declared, {found} found)")]
    CountMismatch { header: u32, found: u32 },

    #[error("regular file {0:?} has children")]
    FileWithChildren(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Index of a node in the tree arena. `NodeId::ROOT` is the synthetic `/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

struct RawNode {
    /// Name bytes inside the manifest buffer.
    name_off: u32,
    name_len: u16,
    size: i64,
    first_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
}

/// The virtual file tree. Nodes live in an arena sized from the header
/// counts; names borrow from the mapped manifest, which is kept alive for
/// the lifetime of the tree.
pub struct FileTree {
    buf: Mmap,
    nodes: Vec<RawNode>,
    file_count: u32,
    dir_count: u32,
}

impl FileTree {
    /// Map and parse the manifest in one pass.
    pub fn load(path: &Path) -> Result<FileTree> {
        let file = File::open(path)?;
        let buf = unsafe { Mmap::map(&file)? };
        let tree = Self::parse(buf)?;
        debug!(
            files = tree.file_count,
            dirs = tree.dir_count,
            "manifest loaded"
        );
        Ok(tree)
    }

    fn parse(buf: Mmap) -> Result<FileTree> {
        let bytes: &[u8] = &buf;
        let mut pos = 0usize;

        let file_count = read_u32(bytes, &mut pos)?;
        let dir_count = read_u32(bytes, &mut pos)?;
        let depth_max = read_u8(bytes, &mut pos)?;
        let declared = file_count
            .checked_add(dir_count)
            .ok_or(ManifestError::Truncated(0))?;

        let mut nodes = Vec::with_capacity(declared as usize + 1);
        nodes.push(RawNode {
            name_off: 0,
            name_len: 0,
            size: 0,
            first_child: None,
            next_sibling: None,
        });

        // stack[d] is the parent for entries at depth d; tails[d] the last
        // node attached there.
        let mut stack = vec![NodeId::ROOT; depth_max as usize + 1];
        let mut tails: Vec<Option<NodeId>> = vec![None; depth_max as usize + 1];
        let mut last: Option<(NodeId, u8)> = None;

        while pos < bytes.len() {
            let depth = read_u8(bytes, &mut pos)?;
            if depth > depth_max {
                return Err(ManifestError::BadDepth {
                    depth,
                    max: depth_max,
                });
            }
            let name_pos = pos;
            let (name_off, name_len) = read_cstr(bytes, &mut pos)?;
            if name_len == 0 {
                return Err(ManifestError::BadName(name_pos));
            }
            let size = read_i64(bytes, &mut pos)?;

            match last {
                Some((last_id, last_depth)) if depth as u16 == last_depth as u16 + 1 => {
                    // Descend: the previous entry becomes the parent.
                    let parent = &nodes[last_id.0 as usize];
                    if parent.size != 0 {
                        let name = node_name(bytes, parent);
                        return Err(ManifestError::FileWithChildren(name.to_string()));
                    }
                    stack[depth as usize] = last_id;
                    tails[depth as usize] = None;
                }
                Some((_, last_depth)) if depth > last_depth => {
                    return Err(ManifestError::SkippedDepth(depth));
                }
                None if depth != 0 => {
                    return Err(ManifestError::SkippedDepth(depth));
                }
                _ => {}
            }

            let id = NodeId(nodes.len() as u32);
            if id.0 > declared {
                return Err(ManifestError::CountMismatch {
                    header: declared,
                    found: id.0,
                });
            }
            nodes.push(RawNode {
                name_off,
                name_len,
                size,
                first_child: None,
                next_sibling: None,
            });

            let parent = stack[depth as usize];
            match tails[depth as usize] {
                Some(prev) => nodes[prev.0 as usize].next_sibling = Some(id),
                None => nodes[parent.0 as usize].first_child = Some(id),
            }
            tails[depth as usize] = Some(id);
            last = Some((id, depth));
        }

        let found = nodes.len() as u32 - 1;
        if found != declared {
            return Err(ManifestError::CountMismatch {
                header: declared,
                found,
            });
        }

        Ok(FileTree {
            buf,
            nodes,
            file_count,
            dir_count,
        })
    }

    /// Descend from the root along the components of a normalized virtual
    /// path (`/a/b/c`). `/` names the root itself.
    pub fn lookup(&self, vpath: &str) -> Option<NodeId> {
        let mut cur = NodeId::ROOT;
        for comp in vpath.split('/').filter(|c| !c.is_empty()) {
            cur = self.children(cur).find(|&id| self.name(id) == comp)?;
        }
        Some(cur)
    }

    pub fn name(&self, id: NodeId) -> &str {
        let node = &self.nodes[id.0 as usize];
        node_name(&self.buf, node)
    }

    /// Manifest size in bytes; zero encodes a directory.
    pub fn size(&self, id: NodeId) -> i64 {
        self.nodes[id.0 as usize].size
    }

    pub fn is_dir(&self, id: NodeId) -> bool {
        self.nodes[id.0 as usize].size == 0
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].first_child
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].next_sibling
    }

    /// Children of `id` in manifest order.
    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children {
            tree: self,
            next: self.first_child(id),
        }
    }

    pub fn file_count(&self) -> u32 {
        self.file_count
    }

    pub fn dir_count(&self) -> u32 {
        self.dir_count
    }
}

pub struct Children<'a> {
    tree: &'a FileTree,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.tree.next_sibling(cur);
        Some(cur)
    }
}

fn node_name<'a>(bytes: &'a [u8], node: &RawNode) -> &'a str {
    let start = node.name_off as usize;
    let end = start + node.name_len as usize;
    // Validated during parse.
    std::str::from_utf8(&bytes[start..end]).unwrap_or("")
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
    let v = *bytes.get(*pos).ok_or(ManifestError::Truncated(*pos))?;
    *pos += 1;
    Ok(v)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    let slice = bytes.get(*pos..end).ok_or(ManifestError::Truncated(*pos))?;
    let v = u32::from_ne_bytes(slice.try_into().unwrap());
    *pos = end;
    Ok(v)
}

fn read_i64(bytes: &[u8], pos: &mut usize) -> Result<i64> {
    let end = *pos + 8;
    let slice = bytes.get(*pos..end).ok_or(ManifestError::Truncated(*pos))?;
    let v = i64::from_ne_bytes(slice.try_into().unwrap());
    *pos = end;
    Ok(v)
}

/// Read a NUL-terminated name; returns (offset, length) into the buffer.
fn read_cstr(bytes: &[u8], pos: &mut usize) -> Result<(u32, u16)> {
    let start = *pos;
    let rel = bytes[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(ManifestError::Truncated(start))?;
    if rel > u16::MAX as usize {
        return Err(ManifestError::BadName(start));
    }
    if std::str::from_utf8(&bytes[start..start + rel]).is_err() {
        return Err(ManifestError::BadName(start));
    }
    *pos = start + rel + 1;
    Ok((start as u32, rel as u16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_bytes(bytes: &[u8]) -> Result<FileTree> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        FileTree::load(f.path())
    }

    /// `/d` containing `f1` (1 byte), `d2` (dir), `f3` (3 bytes).
    fn sample() -> Vec<u8> {
        let mut w = ManifestWriter::new();
        w.dir(0, "d");
        w.file(1, "f1", 1);
        w.dir(1, "d2");
        w.file(1, "f3", 3);
        w.finish()
    }

    #[test]
    fn children_in_manifest_order() {
        let tree = load_bytes(&sample()).unwrap();
        let d = tree.lookup("/d").unwrap();
        assert!(tree.is_dir(d));

        let kinds: Vec<(String, bool)> = tree
            .children(d)
            .map(|id| (tree.name(id).to_string(), tree.is_dir(id)))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("f1".to_string(), false),
                ("d2".to_string(), true),
                ("f3".to_string(), false),
            ]
        );
    }

    #[test]
    fn lookup_descends_and_reports_sizes() {
        let tree = load_bytes(&sample()).unwrap();
        let f3 = tree.lookup("/d/f3").unwrap();
        assert_eq!(tree.size(f3), 3);
        assert_eq!(tree.name(f3), "f3");
        assert!(tree.lookup("/d/missing").is_none());
        assert!(tree.lookup("/other").is_none());
        assert_eq!(tree.lookup("/"), Some(NodeId::ROOT));
    }

    #[test]
    fn deep_nesting_and_sibling_pops() {
        let mut w = ManifestWriter::new();
        w.dir(0, "a");
        w.dir(1, "b");
        w.file(2, "c", 10);
        w.file(2, "c2", 20);
        w.file(1, "b2", 30);
        w.file(0, "a2", 40);
        let tree = load_bytes(&w.finish()).unwrap();

        assert_eq!(tree.size(tree.lookup("/a/b/c").unwrap()), 10);
        assert_eq!(tree.size(tree.lookup("/a/b/c2").unwrap()), 20);
        assert_eq!(tree.size(tree.lookup("/a/b2").unwrap()), 30);
        assert_eq!(tree.size(tree.lookup("/a2").unwrap()), 40);
        assert_eq!(tree.file_count(), 4);
        assert_eq!(tree.dir_count(), 2);
    }

    #[test]
    fn truncated_manifest_is_an_error() {
        let bytes = sample();
        for cut in [0, 4, 9, bytes.len() - 3] {
            assert!(load_bytes(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn skipped_depth_is_an_error() {
        let mut w = ManifestWriter::new();
        w.dir(0, "a");
        w.file(2, "deep", 1);
        assert!(matches!(
            load_bytes(&w.finish()),
            Err(ManifestError::SkippedDepth(2))
        ));
    }

    #[test]
    fn file_with_children_is_an_error() {
        let mut w = ManifestWriter::new();
        w.file(0, "f", 5);
        w.file(1, "child", 1);
        assert!(matches!(
            load_bytes(&w.finish()),
            Err(ManifestError::FileWithChildren(_))
        ));
    }

    #[test]
    fn count_mismatch_is_an_error() {
        let mut bytes = sample();
        // Claim one more file than the body carries.
        let declared = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        bytes[0..4].copy_from_slice(&(declared + 1).to_ne_bytes());
        assert!(matches!(
            load_bytes(&bytes),
            Err(ManifestError::CountMismatch { .. })
        ));
    }
}
