use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use common::{checksum_file, system_time_nanos, Fingerprint};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileChange {
    New,
    Unchanged,
    Modified,
}

/// Unchanged only when both the write time and the content hash match.
pub fn classify(stored: Option<&Fingerprint>, current: &Fingerprint) -> FileChange {
    match stored {
        None => FileChange::New,
        Some(stored) if stored == current => FileChange::Unchanged,
        Some(_) => FileChange::Modified,
    }
}

pub fn fingerprint_file(path: &Path) -> io::Result<Fingerprint> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(Fingerprint {
        last_write: system_time_nanos(modified),
        checksum: checksum_file(path)?,
    })
}

/// Cataloged paths that the walk did not observe, sorted.
pub fn missing_paths<I>(catalog_paths: I, observed: &HashSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut missing: Vec<String> = catalog_paths
        .into_iter()
        .filter(|path| !observed.contains(path))
        .collect();
    missing.sort();
    missing
}

#[cfg(test)]
mod tests {
    use super::{classify, fingerprint_file, missing_paths, FileChange};
    use common::{Checksum, Fingerprint};
    use std::collections::HashSet;
    use std::fs;

    #[test]
    fn classifies_by_full_fingerprint() {
        let stored = Fingerprint {
            last_write: 10,
            checksum: Checksum([1; 32]),
        };
        let touched = Fingerprint {
            last_write: 11,
            ..stored
        };
        let rewritten = Fingerprint {
            checksum: Checksum([2; 32]),
            ..stored
        };

        assert_eq!(classify(None, &stored), FileChange::New);
        assert_eq!(classify(Some(&stored), &stored), FileChange::Unchanged);
        assert_eq!(classify(Some(&stored), &touched), FileChange::Modified);
        assert_eq!(classify(Some(&stored), &rewritten), FileChange::Modified);
    }

    #[test]
    fn content_change_alters_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, b"first").unwrap();
        let before = fingerprint_file(&path).unwrap();
        assert_eq!(fingerprint_file(&path).unwrap(), before);

        fs::write(&path, b"second").unwrap();
        let after = fingerprint_file(&path).unwrap();
        assert_ne!(after.checksum, before.checksum);
    }

    #[test]
    fn missing_paths_are_sorted() {
        let observed: HashSet<String> = ["/m/b".to_string()].into_iter().collect();
        let catalog = vec!["/m/c".to_string(), "/m/b".to_string(), "/m/a".to_string()];
        assert_eq!(missing_paths(catalog, &observed), vec!["/m/a", "/m/c"]);
    }
}
