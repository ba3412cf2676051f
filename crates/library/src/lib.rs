use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{
    system_time_secs, Artist, EntityId, Fingerprint, Genre, Release, Track, UNKNOWN_ARTIST_ID,
    UNKNOWN_NAME, UNKNOWN_RELEASE_ID,
};
use metadata::TrackMetadata;
use redb::{
    CommitError, Database, DatabaseError, ReadTransaction, ReadableTable, StorageError,
    TableDefinition, TableError, TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod change;
pub mod duplicates;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod walk;

pub use change::{classify, fingerprint_file, missing_paths, FileChange};
pub use duplicates::{find_duplicates, find_duplicates_where};
pub use walk::{WalkEntry, Walker, DEFAULT_EXTENSIONS};

const INDEX_VERSION: u32 = 1;
const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const ARTISTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("artists");
const ARTISTS_BY_NAME_TABLE: TableDefinition<&str, u64> = TableDefinition::new("artists_by_name");
const ARTIST_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artist_tracks");
const RELEASES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("releases");
const RELEASES_BY_NAME_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("releases_by_name");
const RELEASE_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("release_tracks");
const GENRES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("genres");
const GENRES_BY_NAME_TABLE: TableDefinition<&str, u64> = TableDefinition::new("genres_by_name");
const GENRE_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("genre_tracks");
const TRACKS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("tracks");
const TRACKS_BY_PATH_TABLE: TableDefinition<&str, u64> = TableDefinition::new("tracks_by_path");
const TRACK_GENRES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("track_genres");

const EMPTY_VALUE: &[u8] = &[];

const META_VERSION_KEY: &str = "version";
const META_REVISION_KEY: &str = "revision";
const META_NEXT_TRACK_KEY: &str = "next_track_id";

type LinkTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Tables backing one named entity kind (artist, release, genre).
#[derive(Clone, Copy)]
struct NamedTables {
    entities: TableDefinition<'static, u64, &'static [u8]>,
    by_name: TableDefinition<'static, &'static str, u64>,
    tracks: LinkTable,
    next_id_key: &'static str,
    sentinel: Option<EntityId>,
}

const ARTISTS: NamedTables = NamedTables {
    entities: ARTISTS_TABLE,
    by_name: ARTISTS_BY_NAME_TABLE,
    tracks: ARTIST_TRACKS_TABLE,
    next_id_key: "next_artist_id",
    sentinel: Some(UNKNOWN_ARTIST_ID),
};

const RELEASES: NamedTables = NamedTables {
    entities: RELEASES_TABLE,
    by_name: RELEASES_BY_NAME_TABLE,
    tracks: RELEASE_TRACKS_TABLE,
    next_id_key: "next_release_id",
    sentinel: Some(UNKNOWN_RELEASE_ID),
};

const GENRES: NamedTables = NamedTables {
    entities: GENRES_TABLE,
    by_name: GENRES_BY_NAME_TABLE,
    tracks: GENRE_TRACKS_TABLE,
    next_id_key: "next_genre_id",
    sentinel: None,
};

#[derive(Clone, Debug)]
pub struct CatalogOptions {
    /// Delete genres that no longer have any track.
    pub prune_genres: bool,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self { prune_genres: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCounts {
    pub artists: usize,
    pub releases: usize,
    pub genres: usize,
    pub tracks: usize,
}

/// Persistent artist/release/genre/track catalog.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
    options: CatalogOptions,
}

impl Catalog {
    pub fn open(path: &Path, options: CatalogOptions) -> Result<Self, LibraryError> {
        let db = open_or_create_db(path)?;
        let catalog = Self {
            db: Arc::new(db),
            options,
        };
        catalog.init_tables()?;
        info!("Opened catalog at {:?}", path);
        Ok(catalog)
    }

    fn init_tables(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.open_table(ARTISTS_BY_NAME_TABLE)?;
            write_txn.open_table(ARTIST_TRACKS_TABLE)?;
            write_txn.open_table(RELEASES_BY_NAME_TABLE)?;
            write_txn.open_table(RELEASE_TRACKS_TABLE)?;
            write_txn.open_table(GENRES_TABLE)?;
            write_txn.open_table(GENRES_BY_NAME_TABLE)?;
            write_txn.open_table(GENRE_TRACKS_TABLE)?;
            write_txn.open_table(TRACKS_TABLE)?;
            write_txn.open_table(TRACKS_BY_PATH_TABLE)?;
            write_txn.open_table(TRACK_GENRES_TABLE)?;
        }

        match read_meta_u64(&write_txn, META_VERSION_KEY)? {
            Some(version) if version == u64::from(INDEX_VERSION) => {
                write_txn.commit()?;
                return Ok(());
            }
            Some(version) => {
                write_txn.abort()?;
                return Err(LibraryError::VersionMismatch(version as u32));
            }
            None => {}
        }

        // Fresh catalog: reserve the sentinel ids.
        {
            let mut artists = write_txn.open_table(ARTISTS_TABLE)?;
            let bytes = encode_value(&NamedRecord::new(UNKNOWN_ARTIST_ID, UNKNOWN_NAME))?;
            artists.insert(UNKNOWN_ARTIST_ID, bytes.as_slice())?;
        }
        {
            let mut releases = write_txn.open_table(RELEASES_TABLE)?;
            let bytes = encode_value(&NamedRecord::new(UNKNOWN_RELEASE_ID, UNKNOWN_NAME))?;
            releases.insert(UNKNOWN_RELEASE_ID, bytes.as_slice())?;
        }
        write_meta_u64(&write_txn, ARTISTS.next_id_key, UNKNOWN_ARTIST_ID + 1)?;
        write_meta_u64(&write_txn, RELEASES.next_id_key, UNKNOWN_RELEASE_ID + 1)?;
        write_meta_u64(&write_txn, GENRES.next_id_key, 1)?;
        write_meta_u64(&write_txn, META_NEXT_TRACK_KEY, 1)?;
        write_meta_u64(&write_txn, META_REVISION_KEY, 0)?;
        write_meta_u64(&write_txn, META_VERSION_KEY, u64::from(INDEX_VERSION))?;
        write_txn.commit()?;
        info!("Initialized empty catalog");
        Ok(())
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    /// Number of committed write transactions since the catalog was created.
    pub fn revision(&self) -> Result<u64, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        let revision = match table.get(META_REVISION_KEY)? {
            Some(value) => decode_value(value.value())?,
            None => 0,
        };
        Ok(revision)
    }

    pub fn counts(&self) -> Result<CatalogCounts, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let artists = read_txn.open_table(ARTISTS_TABLE)?.len()? as usize;
        let releases = read_txn.open_table(RELEASES_TABLE)?.len()? as usize;
        let genres = read_txn.open_table(GENRES_TABLE)?.len()? as usize;
        let tracks = read_txn.open_table(TRACKS_TABLE)?.len()? as usize;
        Ok(CatalogCounts {
            artists: artists.saturating_sub(1),
            releases: releases.saturating_sub(1),
            genres,
            tracks,
        })
    }

    pub fn artist(&self, id: EntityId) -> Result<Option<Artist>, LibraryError> {
        Ok(self.read_named(ARTISTS, id)?.map(Into::into))
    }

    pub fn artist_by_name(&self, name: &str) -> Result<Option<Artist>, LibraryError> {
        Ok(self.read_named_by_name(ARTISTS, name)?.map(Into::into))
    }

    pub fn list_artists(&self) -> Result<Vec<Artist>, LibraryError> {
        Ok(self.list_named(ARTISTS)?.into_iter().map(Into::into).collect())
    }

    pub fn release(&self, id: EntityId) -> Result<Option<Release>, LibraryError> {
        Ok(self.read_named(RELEASES, id)?.map(Into::into))
    }

    pub fn release_by_name(&self, name: &str) -> Result<Option<Release>, LibraryError> {
        Ok(self.read_named_by_name(RELEASES, name)?.map(Into::into))
    }

    pub fn list_releases(&self) -> Result<Vec<Release>, LibraryError> {
        Ok(self.list_named(RELEASES)?.into_iter().map(Into::into).collect())
    }

    pub fn genre(&self, id: EntityId) -> Result<Option<Genre>, LibraryError> {
        Ok(self.read_named(GENRES, id)?.map(Into::into))
    }

    pub fn genre_by_name(&self, name: &str) -> Result<Option<Genre>, LibraryError> {
        Ok(self.read_named_by_name(GENRES, name)?.map(Into::into))
    }

    pub fn list_genres(&self) -> Result<Vec<Genre>, LibraryError> {
        Ok(self.list_named(GENRES)?.into_iter().map(Into::into).collect())
    }

    pub fn track(&self, id: EntityId) -> Result<Option<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let track = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(track)
    }

    pub fn track_by_path(&self, path: &str) -> Result<Option<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        read_track_by_path(&read_txn, path)
    }

    pub fn stored_fingerprint(&self, path: &str) -> Result<Option<Fingerprint>, LibraryError> {
        Ok(self.track_by_path(path)?.map(|track| track.fingerprint()))
    }

    /// All tracks, ordered by id.
    pub fn list_tracks(&self) -> Result<Vec<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let mut tracks = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            tracks.push(decode_value(entry.1.value())?);
        }
        Ok(tracks)
    }

    /// Every cataloged path, in lexical order.
    pub fn track_paths(&self) -> Result<Vec<String>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_BY_PATH_TABLE)?;
        let mut paths = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            paths.push(entry.0.value().to_string());
        }
        Ok(paths)
    }

    pub fn track_genres(&self, track_id: EntityId) -> Result<Vec<Genre>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let links = read_txn.open_table(TRACK_GENRES_TABLE)?;
        let genres = read_txn.open_table(GENRES_TABLE)?;
        let prefix = prefix_key(track_id);
        let end = range_end(&prefix);
        let mut out = Vec::new();
        for entry in links.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let genre_id = parse_id(split_key_last(entry.0.value())?.1)?;
            if let Some(value) = genres.get(genre_id)? {
                let record: NamedRecord = decode_value(value.value())?;
                out.push(record.into());
            }
        }
        Ok(out)
    }

    /// Creates or updates the track stored under `path`, in one transaction.
    pub fn upsert_track(
        &self,
        path: &str,
        fingerprint: &Fingerprint,
        metadata: &TrackMetadata,
    ) -> Result<UpsertOutcome, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let artist_id = find_or_create_named(&write_txn, ARTISTS, metadata.artist.as_deref())?;
            let release_id =
                find_or_create_named(&write_txn, RELEASES, metadata.release.as_deref())?;
            let mut genre_ids: Vec<EntityId> = Vec::new();
            for name in &metadata.genres {
                let id = find_or_create_named(&write_txn, GENRES, Some(name.as_str()))?;
                if !genre_ids.contains(&id) {
                    genre_ids.push(id);
                }
            }

            let previous = write_track_by_path(&write_txn, path)?;
            let (track_id, outcome) = match &previous {
                Some(track) => (track.id, UpsertOutcome::Updated),
                None => (next_id(&write_txn, META_NEXT_TRACK_KEY)?, UpsertOutcome::Added),
            };

            let track = Track {
                id: track_id,
                path: path.to_string(),
                track_number: metadata.track_number,
                disc_number: metadata.disc_number,
                name: metadata.title.clone(),
                duration_ms: metadata.duration.as_millis().min(u128::from(u64::MAX)) as u64,
                creation_time: system_time_secs(metadata.creation_time),
                genre_list: metadata.genre_list.clone(),
                last_write: fingerprint.last_write,
                checksum: fingerprint.checksum,
                recording_mbid: metadata.recording_mbid.clone(),
                artist_id,
                release_id,
            };
            store_track(&write_txn, &track)?;

            if let Some(previous) = &previous {
                if previous.artist_id != artist_id {
                    unlink(&write_txn, ARTISTS.tracks, previous.artist_id, track_id)?;
                }
                if previous.release_id != release_id {
                    unlink(&write_txn, RELEASES.tracks, previous.release_id, track_id)?;
                }
            }
            link(&write_txn, ARTISTS.tracks, artist_id, track_id)?;
            link(&write_txn, RELEASES.tracks, release_id, track_id)?;

            let current_genres = linked_ids(&write_txn, TRACK_GENRES_TABLE, track_id)?;
            let mut dropped_genres = Vec::new();
            for genre_id in &current_genres {
                if !genre_ids.contains(genre_id) {
                    unlink(&write_txn, TRACK_GENRES_TABLE, track_id, *genre_id)?;
                    unlink(&write_txn, GENRES.tracks, *genre_id, track_id)?;
                    dropped_genres.push(*genre_id);
                }
            }
            for genre_id in &genre_ids {
                if !current_genres.contains(genre_id) {
                    link(&write_txn, TRACK_GENRES_TABLE, track_id, *genre_id)?;
                    link(&write_txn, GENRES.tracks, *genre_id, track_id)?;
                }
            }

            if let Some(previous) = &previous {
                if previous.artist_id != artist_id {
                    prune_named(&write_txn, ARTISTS, previous.artist_id)?;
                }
                if previous.release_id != release_id {
                    prune_named(&write_txn, RELEASES, previous.release_id)?;
                }
            }
            if self.options.prune_genres {
                for genre_id in dropped_genres {
                    prune_named(&write_txn, GENRES, genre_id)?;
                }
            }

            bump_revision(&write_txn)?;
            outcome
        };
        write_txn.commit()?;
        debug!("Catalog {:?} {}", outcome, path);
        Ok(outcome)
    }

    /// Deletes the track stored under `path` and prunes what it leaves orphaned.
    pub fn remove_track(&self, path: &str) -> Result<bool, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let track = match write_track_by_path(&write_txn, path)? {
            Some(track) => track,
            None => {
                write_txn.abort()?;
                return Ok(false);
            }
        };

        {
            let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
            tracks.remove(track.id)?;
            let mut by_path = write_txn.open_table(TRACKS_BY_PATH_TABLE)?;
            by_path.remove(track.path.as_str())?;
        }
        unlink(&write_txn, ARTISTS.tracks, track.artist_id, track.id)?;
        unlink(&write_txn, RELEASES.tracks, track.release_id, track.id)?;
        let genre_ids = linked_ids(&write_txn, TRACK_GENRES_TABLE, track.id)?;
        for genre_id in &genre_ids {
            unlink(&write_txn, TRACK_GENRES_TABLE, track.id, *genre_id)?;
            unlink(&write_txn, GENRES.tracks, *genre_id, track.id)?;
        }

        prune_named(&write_txn, ARTISTS, track.artist_id)?;
        prune_named(&write_txn, RELEASES, track.release_id)?;
        if self.options.prune_genres {
            for genre_id in genre_ids {
                prune_named(&write_txn, GENRES, genre_id)?;
            }
        }

        bump_revision(&write_txn)?;
        write_txn.commit()?;
        debug!("Removed {} from catalog", path);
        Ok(true)
    }

    /// Deletes every track whose path is not in `observed`, one transaction per track.
    pub fn remove_missing(&self, observed: &HashSet<String>) -> Result<usize, LibraryError> {
        let missing = missing_paths(self.track_paths()?, observed);
        let mut removed = 0usize;
        for path in missing {
            if self.remove_track(&path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} missing files from catalog", removed);
        }
        Ok(removed)
    }

    fn read_named(
        &self,
        tables: NamedTables,
        id: EntityId,
    ) -> Result<Option<NamedRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables.entities)?;
        let record = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(record)
    }

    fn read_named_by_name(
        &self,
        tables: NamedTables,
        name: &str,
    ) -> Result<Option<NamedRecord>, LibraryError> {
        let id = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(tables.by_name)?;
            let id = table.get(name)?.map(|value| value.value());
            id
        };
        match id {
            Some(id) => self.read_named(tables, id),
            None => Ok(None),
        }
    }

    fn list_named(&self, tables: NamedTables) -> Result<Vec<NamedRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables.entities)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            out.push(decode_value(entry.1.value())?);
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NamedRecord {
    id: EntityId,
    name: String,
}

impl NamedRecord {
    fn new(id: EntityId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

impl From<NamedRecord> for Artist {
    fn from(record: NamedRecord) -> Self {
        Artist {
            id: record.id,
            name: record.name,
        }
    }
}

impl From<NamedRecord> for Release {
    fn from(record: NamedRecord) -> Self {
        Release {
            id: record.id,
            name: record.name,
        }
    }
}

impl From<NamedRecord> for Genre {
    fn from(record: NamedRecord) -> Self {
        Genre {
            id: record.id,
            name: record.name,
        }
    }
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    VersionMismatch(u32),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::KeyParse(value) => write!(f, "key parse error: {}", value),
            LibraryError::VersionMismatch(version) => {
                write!(f, "catalog version mismatch: {}", version)
            }
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn read_track_by_path(
    read_txn: &ReadTransaction,
    path: &str,
) -> Result<Option<Track>, LibraryError> {
    let tracks = read_txn.open_table(TRACKS_TABLE)?;
    let by_path = read_txn.open_table(TRACKS_BY_PATH_TABLE)?;
    lookup_track(&tracks, &by_path, path)
}

fn write_track_by_path(
    write_txn: &WriteTransaction,
    path: &str,
) -> Result<Option<Track>, LibraryError> {
    let tracks = write_txn.open_table(TRACKS_TABLE)?;
    let by_path = write_txn.open_table(TRACKS_BY_PATH_TABLE)?;
    lookup_track(&tracks, &by_path, path)
}

fn lookup_track<T, P>(tracks: &T, by_path: &P, path: &str) -> Result<Option<Track>, LibraryError>
where
    T: ReadableTable<u64, &'static [u8]>,
    P: ReadableTable<&'static str, u64>,
{
    let id = match by_path.get(path)? {
        Some(value) => value.value(),
        None => return Ok(None),
    };
    let track = match tracks.get(id)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(track)
}

fn store_track(txn: &WriteTransaction, track: &Track) -> Result<(), LibraryError> {
    let bytes = encode_value(track)?;
    let mut tracks = txn.open_table(TRACKS_TABLE)?;
    tracks.insert(track.id, bytes.as_slice())?;
    let mut by_path = txn.open_table(TRACKS_BY_PATH_TABLE)?;
    by_path.insert(track.path.as_str(), track.id)?;
    Ok(())
}

fn find_or_create_named(
    txn: &WriteTransaction,
    tables: NamedTables,
    name: Option<&str>,
) -> Result<EntityId, LibraryError> {
    let name = match name {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            return tables
                .sentinel
                .ok_or_else(|| LibraryError::KeyParse("empty entity name".to_string()))
        }
    };

    let existing = {
        let by_name = txn.open_table(tables.by_name)?;
        let existing = by_name.get(name)?.map(|value| value.value());
        existing
    };
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = next_id(txn, tables.next_id_key)?;
    let bytes = encode_value(&NamedRecord::new(id, name))?;
    let mut entities = txn.open_table(tables.entities)?;
    entities.insert(id, bytes.as_slice())?;
    let mut by_name = txn.open_table(tables.by_name)?;
    by_name.insert(name, id)?;
    debug!("Created {} {:?} ({})", tables.next_id_key, name, id);
    Ok(id)
}

/// Removes the entity when nothing references it anymore. Sentinels are kept.
fn prune_named(
    txn: &WriteTransaction,
    tables: NamedTables,
    id: EntityId,
) -> Result<bool, LibraryError> {
    if tables.sentinel == Some(id) {
        return Ok(false);
    }
    if !linked_ids(txn, tables.tracks, id)?.is_empty() {
        return Ok(false);
    }

    let record: Option<NamedRecord> = {
        let mut entities = txn.open_table(tables.entities)?;
        let removed = entities.remove(id)?;
        let record = match removed {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        record
    };
    if let Some(record) = record {
        let mut by_name = txn.open_table(tables.by_name)?;
        by_name.remove(record.name.as_str())?;
        debug!("Pruned orphaned {:?} ({})", record.name, id);
        return Ok(true);
    }
    Ok(false)
}

fn link(
    txn: &WriteTransaction,
    table: LinkTable,
    owner: EntityId,
    member: EntityId,
) -> Result<(), LibraryError> {
    let mut links = txn.open_table(table)?;
    links.insert(link_key(owner, member).as_str(), EMPTY_VALUE)?;
    Ok(())
}

fn unlink(
    txn: &WriteTransaction,
    table: LinkTable,
    owner: EntityId,
    member: EntityId,
) -> Result<(), LibraryError> {
    let mut links = txn.open_table(table)?;
    links.remove(link_key(owner, member).as_str())?;
    Ok(())
}

fn linked_ids(
    txn: &WriteTransaction,
    table: LinkTable,
    owner: EntityId,
) -> Result<Vec<EntityId>, LibraryError> {
    let links = txn.open_table(table)?;
    let prefix = prefix_key(owner);
    let end = range_end(&prefix);
    let mut out = Vec::new();
    for entry in links.range(prefix.as_str()..end.as_str())? {
        let entry = entry?;
        out.push(parse_id(split_key_last(entry.0.value())?.1)?);
    }
    Ok(out)
}

fn next_id(txn: &WriteTransaction, key: &str) -> Result<EntityId, LibraryError> {
    let id = read_meta_u64(txn, key)?.unwrap_or(1);
    write_meta_u64(txn, key, id + 1)?;
    Ok(id)
}

fn bump_revision(txn: &WriteTransaction) -> Result<(), LibraryError> {
    let revision = read_meta_u64(txn, META_REVISION_KEY)?.unwrap_or(0);
    write_meta_u64(txn, META_REVISION_KEY, revision + 1)
}

fn read_meta_u64(txn: &WriteTransaction, key: &str) -> Result<Option<u64>, LibraryError> {
    let table = txn.open_table(META_TABLE)?;
    let value = match table.get(key)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(value)
}

fn write_meta_u64(txn: &WriteTransaction, key: &str, value: u64) -> Result<(), LibraryError> {
    let bytes = encode_value(&value)?;
    let mut table = txn.open_table(META_TABLE)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn link_key(owner: EntityId, member: EntityId) -> String {
    let mut out = prefix_key(owner);
    out.push_str(&format!("{:020}", member));
    out
}

fn prefix_key(owner: EntityId) -> String {
    let mut out = format!("{:020}", owner);
    out.push(KEY_SEP);
    out
}

fn range_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}

fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}

fn parse_id(value: &str) -> Result<EntityId, LibraryError> {
    value
        .parse()
        .map_err(|_| LibraryError::KeyParse(value.to_string()))
}
