use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::{DirEntry, WalkDir};

pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "mp4", "aac", "wav", "wv", "ape", "mpc", "aiff",
    "aif",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    File(PathBuf),
    /// A directory (or root) that could not be read. The walk carries on with its siblings.
    Skipped { path: PathBuf, error: String },
}

/// Enumerates candidate audio files under a set of roots.
#[derive(Debug, Clone)]
pub struct Walker {
    roots: Vec<PathBuf>,
    extensions: HashSet<String>,
    recursive: bool,
}

impl Walker {
    pub fn new<P, S>(roots: &[P], extensions: &[S], recursive: bool) -> Self
    where
        P: AsRef<Path>,
        S: AsRef<str>,
    {
        let mut unique = Vec::new();
        for root in roots {
            let root = absolute_root(root.as_ref());
            if !unique.contains(&root) {
                unique.push(root);
            }
        }
        let extensions = extensions
            .iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self {
            roots: unique,
            extensions,
            recursive,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Walks every root in order. Each call starts a fresh traversal.
    pub fn entries(&self) -> impl Iterator<Item = WalkEntry> + '_ {
        self.roots.iter().flat_map(move |root| {
            let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
            if !self.recursive {
                walker = walker.max_depth(1);
            }
            walker
                .into_iter()
                .filter_map(move |entry| match entry {
                    Ok(entry) => self.accept(&entry).then(|| WalkEntry::File(entry.into_path())),
                    Err(err) => {
                        let path = err.path().unwrap_or(root.as_path()).to_path_buf();
                        warn!("Skipping unreadable directory {:?}: {}", path, err);
                        Some(WalkEntry::Skipped {
                            path,
                            error: err.to_string(),
                        })
                    }
                })
        })
    }

    /// Counting pass: number of files `entries` would yield right now.
    pub fn count_files(&self) -> usize {
        self.entries()
            .filter(|entry| matches!(entry, WalkEntry::File(_)))
            .count()
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .map(|ext| self.extensions.contains(&ext))
            .unwrap_or(false)
    }

    fn accept(&self, entry: &DirEntry) -> bool {
        entry.file_type().is_file() && self.is_supported(entry.path())
    }
}

/// Relative roots are resolved against the working directory once, up front.
fn absolute_root(root: &Path) -> PathBuf {
    if root.is_absolute() {
        return root.to_path_buf();
    }
    match std::path::absolute(root) {
        Ok(path) => path,
        Err(err) => {
            warn!("Cannot make {:?} absolute: {}", root, err);
            root.to_path_buf()
        }
    }
}
