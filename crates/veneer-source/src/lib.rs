#![forbid(unsafe_code)]
//! The source tree: a mutable model of the files being represented.
//!
//! Entries live in an arena indexed by `EntryId`; directories own their
//! children as id lists and children point back with a parent id. Building
//! the tree bottom-up resolves each file's physical extents through the
//! injected locator and charts them in the embedded geometry, so that by
//! the time a volume writer runs, placement arithmetic is already done.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use veneer_error::{Result, VeneerError};
use veneer_extent::{Extent, ExtentList, Locate, Medium};
use veneer_geometry::Geometry;
use veneer_types::{DevNum, MediumId, Timespec};

/// Stable handle of an entry within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub usize);

/// Captured inode metadata of a source entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryStat {
    pub dev: u64,
    pub ino: u64,
    pub size: i64,
    pub block_size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub atime: Timespec,
}

impl EntryStat {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.size() as i64,
            block_size: meta.blksize() as i64,
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: Timespec::new(meta.mtime(), meta.mtime_nsec() as u32),
            ctime: Timespec::new(meta.ctime(), meta.ctime_nsec() as u32),
            atime: Timespec::new(meta.atime(), meta.atime_nsec() as u32),
        }
    }
}

/// File or directory payload of an entry.
pub enum EntryKind {
    File {
        /// Retained read-only handle; dropped early under eager-close.
        handle: Option<Arc<File>>,
    },
    Dir {
        children: Vec<EntryId>,
    },
}

pub struct EntryNode {
    /// Decoded Unicode name as it will appear (pre-canonicalization).
    pub name: String,
    pub path: PathBuf,
    pub stat: EntryStat,
    pub parent: Option<EntryId>,
    pub kind: EntryKind,
}

impl EntryNode {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir { .. })
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    #[must_use]
    pub fn children(&self) -> &[EntryId] {
        match &self.kind {
            EntryKind::Dir { children } => children,
            EntryKind::File { .. } => &[],
        }
    }

    /// This entry exposed as a source medium (files only).
    #[must_use]
    pub fn as_medium(&self) -> Option<Medium> {
        match &self.kind {
            EntryKind::File {
                handle: Some(handle),
            } => Some(Medium::file(
                MediumId(self.stat.ino),
                Arc::clone(handle),
                Some(DevNum::from_raw(self.stat.dev)),
                self.stat.block_size,
            )),
            _ => None,
        }
    }
}

/// The traversed and/or user-assembled source file set, both file-tree and
/// disk-block aware.
pub struct Original {
    pub entries: Vec<EntryNode>,
    pub root: Option<EntryId>,
    /// Directories in depth-first discovery order. Reversed iteration gives
    /// leaves-first emission for the volume writers.
    pub path_table: Vec<EntryId>,
    pub file_table: Vec<EntryId>,
    /// Resolved physical extents per file entry.
    pub layout: HashMap<EntryId, ExtentList>,
    pub geometry: Geometry,
    locator: Box<dyn Locate>,
    allow_name: Box<dyn Fn(&str) -> bool>,
    /// Close file handles as soon as extents are resolved instead of
    /// holding them until commit.
    pub eager_close: bool,
}

impl Original {
    #[must_use]
    pub fn new(locator: Box<dyn Locate>) -> Self {
        Self {
            entries: Vec::new(),
            root: None,
            path_table: Vec::new(),
            file_table: Vec::new(),
            layout: HashMap::new(),
            geometry: Geometry::default(),
            locator,
            allow_name: Box::new(|_| true),
            eager_close: false,
        }
    }

    /// Install the name filter applied to every directory child.
    pub fn set_name_filter(&mut self, allow: Box<dyn Fn(&str) -> bool>) {
        self.allow_name = allow;
    }

    #[must_use]
    pub fn entry(&self, id: EntryId) -> &EntryNode {
        &self.entries[id.0]
    }

    #[must_use]
    pub fn entry_mut(&mut self, id: EntryId) -> &mut EntryNode {
        &mut self.entries[id.0]
    }

    /// Depth of an entry: 0 for the root.
    #[must_use]
    pub fn depth(&self, id: EntryId) -> usize {
        let mut depth = 0;
        let mut cursor = id;
        while let Some(parent) = self.entry(cursor).parent {
            depth += 1;
            cursor = parent;
        }
        depth
    }

    /// Open an existing directory as the tree root and traverse it.
    pub fn open_root(&mut self, path: &Path) -> Result<EntryId> {
        let meta = std::fs::metadata(path).map_err(|source| VeneerError::CannotOpen {
            what: path.display().to_string(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(VeneerError::CannotOpen {
                what: path.display().to_string(),
                source: std::io::Error::other("root must be a directory"),
            });
        }
        let id = self.push_node(EntryNode {
            name: decode_name(path.file_name().unwrap_or_default()),
            path: path.to_path_buf(),
            stat: EntryStat::from_metadata(&meta),
            parent: None,
            kind: EntryKind::Dir {
                children: Vec::new(),
            },
        });
        self.root = Some(id);
        self.on_folder(id)?;
        Ok(id)
    }

    /// Start with a virtual root holding no source directory; entries are
    /// added explicitly afterwards. Used for scratch-partition images.
    pub fn fake_root(&mut self) -> EntryId {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let stat = EntryStat {
            mode: 0o040_755,
            mtime: Timespec::new(now.as_secs() as i64, now.subsec_nanos()),
            ctime: Timespec::new(now.as_secs() as i64, now.subsec_nanos()),
            atime: Timespec::new(now.as_secs() as i64, now.subsec_nanos()),
            ..EntryStat::default()
        };
        let id = self.push_node(EntryNode {
            name: String::new(),
            path: PathBuf::new(),
            stat,
            parent: None,
            kind: EntryKind::Dir {
                children: Vec::new(),
            },
        });
        self.root = Some(id);
        self.path_table.push(id);
        id
    }

    /// Stat a user-provided path and register it under `dir` as whatever
    /// supported kind it is.
    pub fn insert_stat(&mut self, dir: EntryId, path: &Path) -> Result<()> {
        let meta = std::fs::symlink_metadata(path).map_err(|source| VeneerError::CannotOpen {
            what: path.display().to_string(),
            source,
        })?;
        if meta.is_file() {
            self.place_child(dir, path, false)
        } else if meta.is_dir() {
            self.place_child(dir, path, true)
        } else {
            warn!(
                target: "veneer::source",
                path = %path.display(),
                mode = meta.mode(),
                "unsupported file type skipped"
            );
            Ok(())
        }
    }

    fn push_node(&mut self, node: EntryNode) -> EntryId {
        let id = EntryId(self.entries.len());
        self.entries.push(node);
        id
    }

    fn place_child(&mut self, dir: EntryId, path: &Path, is_dir: bool) -> Result<()> {
        let meta = std::fs::metadata(path).map_err(|source| VeneerError::CannotOpen {
            what: path.display().to_string(),
            source,
        })?;
        let node = EntryNode {
            name: decode_name(path.file_name().unwrap_or_default()),
            path: path.to_path_buf(),
            stat: EntryStat::from_metadata(&meta),
            parent: Some(dir),
            kind: if is_dir {
                EntryKind::Dir {
                    children: Vec::new(),
                }
            } else {
                EntryKind::File { handle: None }
            },
        };
        let id = self.push_node(node);
        match &mut self.entry_mut(dir).kind {
            EntryKind::Dir { children } => children.push(id),
            EntryKind::File { .. } => {
                return Err(VeneerError::assertion("placing a child under a file"))
            }
        }
        if is_dir {
            self.on_folder(id)?;
        } else {
            self.on_file(id)?;
        }
        Ok(())
    }

    /// Directory callback: register in the path table, traverse children.
    fn on_folder(&mut self, id: EntryId) -> Result<()> {
        self.path_table.push(id);
        let dir_path = self.entry(id).path.clone();
        if dir_path.as_os_str().is_empty() {
            return Ok(());
        }
        let reader = std::fs::read_dir(&dir_path).map_err(|source| VeneerError::CannotOpen {
            what: dir_path.display().to_string(),
            source,
        })?;
        let mut names: Vec<(String, PathBuf, bool)> = Vec::new();
        for dirent in reader {
            let dirent = match dirent {
                Ok(d) => d,
                Err(error) => {
                    warn!(target: "veneer::source", %error, "directory entry unreadable");
                    continue;
                }
            };
            let name = decode_name(&dirent.file_name());
            if !(self.allow_name)(&name) {
                debug!(target: "veneer::source", name, "entry excluded by filter");
                continue;
            }
            let kind = match dirent.file_type() {
                Ok(t) => t,
                Err(error) => {
                    warn!(target: "veneer::source", name, %error, "file type unknown, skipped");
                    continue;
                }
            };
            // no symlinks, pipes, sockets or device nodes in the image
            if kind.is_file() {
                names.push((name, dirent.path(), false));
            } else if kind.is_dir() {
                names.push((name, dirent.path(), true));
            }
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, path, is_dir) in names {
            self.place_child(id, &path, is_dir)?;
        }
        Ok(())
    }

    /// File callback: open, resolve extents, chart them, retain the handle.
    fn on_file(&mut self, id: EntryId) -> Result<()> {
        let path = self.entry(id).path.clone();
        let file = File::open(&path).map_err(|source| VeneerError::CannotOpen {
            what: path.display().to_string(),
            source,
        })?;
        let handle = Arc::new(file);
        if let EntryKind::File { handle: slot } = &mut self.entry_mut(id).kind {
            *slot = Some(Arc::clone(&handle));
        }
        self.file_table.push(id);

        let node = self.entry(id);
        let medium = node.as_medium().ok_or_else(|| {
            VeneerError::assertion("file entry without a handle cannot be charted")
        })?;
        let whole = Extent::new(0, node.stat.size, medium);
        let resolved = self.locator.resolve(&whole);
        self.geometry.chart_list(&resolved);
        self.layout.insert(id, resolved);

        if self.eager_close {
            if let EntryKind::File { handle: slot } = &mut self.entry_mut(id).kind {
                *slot = None;
            }
        }
        Ok(())
    }

    /// Sum of source file sizes (not extent footprints).
    #[must_use]
    pub fn logical_size(&self) -> i64 {
        self.file_table
            .iter()
            .map(|&id| self.entry(id).stat.size)
            .sum()
    }
}

/// Decode a platform name into Unicode, replacing undecodable bytes.
#[must_use]
pub fn decode_name(raw: &std::ffi::OsStr) -> String {
    raw.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use veneer_extent::NoLocator;

    fn build_tree() -> (tempfile::TempDir, Original) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut f = std::fs::File::create(dir.path().join("a.txt")).unwrap();
        f.write_all(b"hello world\n").unwrap();
        let mut g = std::fs::File::create(dir.path().join("sub/b.bin")).unwrap();
        g.write_all(&[0_u8; 4096]).unwrap();

        let mut tree = Original::new(Box::new(NoLocator));
        tree.open_root(dir.path()).unwrap();
        (dir, tree)
    }

    #[test]
    fn traversal_builds_tables_and_layout() {
        let (_keep, tree) = build_tree();
        assert_eq!(tree.path_table.len(), 2); // root + sub
        assert_eq!(tree.file_table.len(), 2);
        for &file in &tree.file_table {
            let extents = &tree.layout[&file];
            assert_eq!(extents.len(), 1);
            assert_eq!(extents[0].length(), tree.entry(file).stat.size);
        }
        let root = tree.root.unwrap();
        assert_eq!(tree.depth(root), 0);
        let sub = *tree
            .path_table
            .iter()
            .find(|&&id| id != root)
            .unwrap();
        assert_eq!(tree.depth(sub), 1);
    }

    #[test]
    fn name_filter_excludes_children() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("keep.txt")).unwrap();
        std::fs::File::create(dir.path().join("skip.tmp")).unwrap();

        let mut tree = Original::new(Box::new(NoLocator));
        tree.set_name_filter(Box::new(|name| !name.ends_with(".tmp")));
        tree.open_root(dir.path()).unwrap();
        assert_eq!(tree.file_table.len(), 1);
        assert_eq!(tree.entry(tree.file_table[0]).name, "keep.txt");
    }

    #[test]
    fn fake_root_accepts_inserted_files() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("x.dat");
        std::fs::write(&payload, b"1234").unwrap();

        let mut tree = Original::new(Box::new(NoLocator));
        let root = tree.fake_root();
        tree.insert_stat(root, &payload).unwrap();
        assert_eq!(tree.file_table.len(), 1);
        assert_eq!(tree.entry(root).children().len(), 1);
        assert_eq!(tree.logical_size(), 4);
    }

    #[test]
    fn eager_close_drops_handles_after_charting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        let mut tree = Original::new(Box::new(NoLocator));
        tree.eager_close = true;
        tree.open_root(dir.path()).unwrap();
        let file = tree.file_table[0];
        assert!(matches!(
            tree.entry(file).kind,
            EntryKind::File { handle: None }
        ));
        // the charted extents keep their own reference to the medium
        assert_eq!(tree.layout[&file].len(), 1);
    }
}
