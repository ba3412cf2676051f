use std::collections::BTreeMap;

use common::{Checksum, DuplicateEntry, DuplicateReason, Track};
use tracing::debug;

use crate::{Catalog, LibraryError};

/// Reports tracks sharing a checksum, then tracks sharing a recording id.
pub fn find_duplicates(catalog: &Catalog) -> Result<Vec<DuplicateEntry>, LibraryError> {
    find_duplicates_where(catalog, |_| true)
}

/// Like [`find_duplicates`], over the tracks whose path passes `include` only.
pub fn find_duplicates_where<F>(
    catalog: &Catalog,
    include: F,
) -> Result<Vec<DuplicateEntry>, LibraryError>
where
    F: Fn(&str) -> bool,
{
    let mut tracks = catalog.list_tracks()?;
    tracks.retain(|track| include(&track.path));
    let mut out = duplicates_by(&tracks, DuplicateReason::SameHash, |track| {
        Some(GroupKey::Checksum(track.checksum))
    });
    out.extend(duplicates_by(&tracks, DuplicateReason::SameMBID, |track| {
        track
            .recording_mbid
            .as_deref()
            .filter(|mbid| !mbid.is_empty())
            .map(|mbid| GroupKey::Recording(mbid.to_string()))
    }));
    debug!("Found {} duplicate entries", out.len());
    Ok(out)
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Checksum(Checksum),
    Recording(String),
}

fn duplicates_by<F>(tracks: &[Track], reason: DuplicateReason, key: F) -> Vec<DuplicateEntry>
where
    F: Fn(&Track) -> Option<GroupKey>,
{
    let mut groups: BTreeMap<GroupKey, Vec<&str>> = BTreeMap::new();
    for track in tracks {
        if let Some(key) = key(track) {
            groups.entry(key).or_default().push(track.path.as_str());
        }
    }

    let mut paths: Vec<&str> = groups
        .into_values()
        .filter(|members| members.len() > 1)
        .flatten()
        .collect();
    paths.sort_unstable();
    paths
        .into_iter()
        .map(|path| DuplicateEntry {
            path: path.to_string(),
            reason,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{find_duplicates, find_duplicates_where};
    use crate::tests::{fingerprint, open_catalog, track_meta};
    use common::{Checksum, DuplicateReason, Fingerprint};

    #[test]
    fn reports_hash_then_recording_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir, true);

        let shared = Fingerprint {
            last_write: 5,
            checksum: Checksum([7; 32]),
        };
        let mut tagged = track_meta("take", None, None, "");
        tagged.recording_mbid = Some("0f1e2d3c".to_string());

        catalog
            .upsert_track("/m/z/copy.flac", &shared, &track_meta("copy", None, None, ""))
            .unwrap();
        catalog
            .upsert_track("/m/a/orig.flac", &shared, &track_meta("orig", None, None, ""))
            .unwrap();
        catalog
            .upsert_track("/m/live.mp3", &fingerprint(1), &tagged)
            .unwrap();
        catalog
            .upsert_track("/m/demo.mp3", &fingerprint(2), &tagged)
            .unwrap();
        catalog
            .upsert_track("/m/single.mp3", &fingerprint(3), &track_meta("s", None, None, ""))
            .unwrap();

        let found: Vec<(String, DuplicateReason)> = find_duplicates(&catalog)
            .unwrap()
            .into_iter()
            .map(|entry| (entry.path, entry.reason))
            .collect();
        assert_eq!(
            found,
            vec![
                ("/m/a/orig.flac".to_string(), DuplicateReason::SameHash),
                ("/m/z/copy.flac".to_string(), DuplicateReason::SameHash),
                ("/m/demo.mp3".to_string(), DuplicateReason::SameMBID),
                ("/m/live.mp3".to_string(), DuplicateReason::SameMBID),
            ]
        );
    }

    #[test]
    fn track_in_both_groups_is_listed_twice() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir, true);
        let shared = Fingerprint {
            last_write: 9,
            checksum: Checksum([3; 32]),
        };
        let mut tagged = track_meta("take", None, None, "");
        tagged.recording_mbid = Some("aa11".to_string());

        catalog.upsert_track("/m/b.flac", &shared, &tagged).unwrap();
        catalog.upsert_track("/m/a.flac", &shared, &tagged).unwrap();
        catalog
            .upsert_track("/m/c.mp3", &fingerprint(4), &tagged)
            .unwrap();

        let found: Vec<(String, DuplicateReason)> = find_duplicates(&catalog)
            .unwrap()
            .into_iter()
            .map(|entry| (entry.path, entry.reason))
            .collect();
        assert_eq!(
            found,
            vec![
                ("/m/a.flac".to_string(), DuplicateReason::SameHash),
                ("/m/b.flac".to_string(), DuplicateReason::SameHash),
                ("/m/a.flac".to_string(), DuplicateReason::SameMBID),
                ("/m/b.flac".to_string(), DuplicateReason::SameMBID),
                ("/m/c.mp3".to_string(), DuplicateReason::SameMBID),
            ]
        );
    }

    #[test]
    fn excluded_paths_do_not_form_groups() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir, true);
        catalog
            .upsert_track("/m/a.flac", &fingerprint(1), &track_meta("a", None, None, ""))
            .unwrap();
        catalog
            .upsert_track("/m/b.flac", &fingerprint(1), &track_meta("b", None, None, ""))
            .unwrap();

        assert_eq!(find_duplicates(&catalog).unwrap().len(), 2);
        assert!(find_duplicates_where(&catalog, |path| path != "/m/b.flac")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn distinct_tracks_have_no_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir, true);
        catalog
            .upsert_track("/m/1.mp3", &fingerprint(1), &track_meta("1", None, None, ""))
            .unwrap();
        catalog
            .upsert_track("/m/2.mp3", &fingerprint(2), &track_meta("2", None, None, ""))
            .unwrap();
        assert!(find_duplicates(&catalog).unwrap().is_empty());
    }
}
