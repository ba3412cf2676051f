use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type EntityId = u64;

pub const UNKNOWN_ARTIST_ID: EntityId = 1;
pub const UNKNOWN_RELEASE_ID: EntityId = 1;
pub const UNKNOWN_NAME: &str = "<unknown>";

const CHECKSUM_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: EntityId,
    pub name: String,
}

impl Artist {
    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN_ARTIST_ID
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: EntityId,
    pub name: String,
}

impl Release {
    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN_RELEASE_ID
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub id: EntityId,
    pub name: String,
}

/// One catalog row per audio file, keyed by its absolute path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: EntityId,
    pub path: String,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub name: String,
    pub duration_ms: u64,
    /// Seconds since the unix epoch.
    pub creation_time: u64,
    pub genre_list: String,
    /// Nanoseconds since the unix epoch.
    pub last_write: u64,
    pub checksum: Checksum,
    #[serde(default)]
    pub recording_mbid: Option<String>,
    pub artist_id: EntityId,
    pub release_id: EntityId,
}

impl Track {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            last_write: self.last_write,
            checksum: self.checksum,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Change-detection fingerprint of a file on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub last_write: u64,
    pub checksum: Checksum,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanErrorKind {
    CannotReadFile,
    CannotParseFile,
    NoAudioTrack,
    BadDuration,
}

impl ScanErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanErrorKind::CannotReadFile => "cannot read file",
            ScanErrorKind::CannotParseFile => "cannot parse file",
            ScanErrorKind::NoAudioTrack => "no audio track",
            ScanErrorKind::BadDuration => "bad duration",
        }
    }
}

impl fmt::Display for ScanErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DuplicateReason {
    SameHash,
    SameMBID,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::SameHash => "same hash",
            DuplicateReason::SameMBID => "same MusicBrainz recording id",
        }
    }
}

impl fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    pub path: String,
    pub kind: ScanErrorKind,
    pub system_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub path: String,
    pub reason: DuplicateReason,
}

/// Streams `reader` through BLAKE3 with a fixed-size buffer.
pub fn checksum_reader<R: Read>(mut reader: R) -> io::Result<Checksum> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHECKSUM_CHUNK];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(Checksum(*hasher.finalize().as_bytes()))
}

pub fn checksum_file(path: &Path) -> io::Result<Checksum> {
    checksum_reader(File::open(path)?)
}

pub fn system_time_nanos(time: SystemTime) -> u64 {
    let nanos = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    nanos.min(u128::from(u64::MAX)) as u64
}

pub fn system_time_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// Catalog key for a file path.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
