//! Hooks for exercising catalog failure paths in tests.

use redb::ReadableTable;

use crate::{Catalog, TRACKS_BY_PATH_TABLE, TRACKS_TABLE};

/// Overwrites the stored row of the track at `path` with bytes that do not decode.
pub fn corrupt_track_row(catalog: &Catalog, path: &str) {
    let write_txn = catalog.db.begin_write().expect("begin write");
    {
        let by_path = write_txn
            .open_table(TRACKS_BY_PATH_TABLE)
            .expect("open path table");
        let id = by_path
            .get(path)
            .expect("read path table")
            .map(|value| value.value())
            .expect("track is cataloged");
        let mut tracks = write_txn.open_table(TRACKS_TABLE).expect("open tracks");
        tracks.insert(id, &[0xffu8, 0xff][..]).expect("overwrite row");
    }
    write_txn.commit().expect("commit");
}
