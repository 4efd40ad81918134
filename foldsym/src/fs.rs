//! Filesystem adapter for the artifact cache and the symfs view.
//!
//! The store and the view only touch the disk through [`ArtifactFs`], so the
//! registry invariants can be exercised against [`MemFs`] in tests.

use std::{
    collections::BTreeMap,
    fmt, fs, io,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use symbolic::common::ByteView;

pub trait ArtifactFs: Send + Sync + fmt::Debug {
    /// Read a whole file, following symlinks
    fn read(&self, path: &Path) -> io::Result<ByteView<'static>>;

    fn exists(&self, path: &Path) -> bool;

    /// Replace `path` with `data` so that readers see either the old or the
    /// new content, never a partial file
    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Point `link` at `target`, replacing whatever `link` was
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Regular files called `name` anywhere below `root`, sorted
    fn find_by_name(&self, root: &Path, name: &str) -> Vec<PathBuf>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl ArtifactFs for StdFs {
    fn read(&self, path: &Path) -> io::Result<ByteView<'static>> {
        ByteView::open(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let parent = parent_dir(path)?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        let parent = parent_dir(link)?;
        fs::create_dir_all(parent)?;
        let file_name = link
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "link has no file name"))?;
        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(file_name);
        tmp_name.push(".tmp");
        let tmp = parent.join(tmp_name);
        if fs::symlink_metadata(&tmp).is_ok() {
            fs::remove_file(&tmp)?;
        }
        std::os::unix::fs::symlink(target, &tmp)?;
        fs::rename(&tmp, link)
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symfs views need symlink support",
        ))
    }

    fn find_by_name(&self, root: &Path, name: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut dirs = vec![root.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else { continue };
                let path = entry.path();
                if file_type.is_dir() {
                    dirs.push(path);
                } else if file_type.is_file() && entry.file_name() == name {
                    found.push(path);
                }
            }
        }
        found.sort();
        found
    }
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        Some(_) => Ok(Path::new(".")),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )),
    }
}

#[derive(Debug, Clone)]
enum MemEntry {
    File(Arc<Vec<u8>>),
    Link(PathBuf),
}

/// In-memory filesystem, symlinks included
#[derive(Debug, Default)]
pub struct MemFs {
    entries: Mutex<BTreeMap<PathBuf, MemEntry>>,
}

const MAX_LINK_HOPS: usize = 8;

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .insert(path.into(), MemEntry::File(Arc::new(data.into())));
    }

    /// Target of `path` if it is a symlink
    pub fn link_target(&self, path: &Path) -> Option<PathBuf> {
        match self.entries.lock().get(path) {
            Some(MemEntry::Link(target)) => Some(target.clone()),
            _ => None,
        }
    }

    fn resolve(&self, path: &Path) -> Option<Arc<Vec<u8>>> {
        let entries = self.entries.lock();
        let mut current = path.to_path_buf();
        for _ in 0..MAX_LINK_HOPS {
            match entries.get(&current)? {
                MemEntry::File(data) => return Some(Arc::clone(data)),
                MemEntry::Link(target) => current = target.clone(),
            }
        }
        None
    }
}

impl ArtifactFs for MemFs {
    fn read(&self, path: &Path) -> io::Result<ByteView<'static>> {
        self.resolve(path)
            .map(|data| ByteView::from_vec(data.as_ref().clone()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.add_file(path, data);
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        self.entries
            .lock()
            .insert(link.to_path_buf(), MemEntry::Link(target.to_path_buf()));
        Ok(())
    }

    fn find_by_name(&self, root: &Path, name: &str) -> Vec<PathBuf> {
        self.entries
            .lock()
            .iter()
            .filter(|(path, entry)| {
                matches!(entry, MemEntry::File(_))
                    && path.starts_with(root)
                    && path.file_name().map_or(false, |n| n == name)
            })
            .map(|(path, _)| path.clone())
            .collect()
    }
}
