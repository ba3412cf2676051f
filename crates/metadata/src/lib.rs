use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use lofty::error::{ErrorKind, LoftyError};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::Tag;

pub use common::ScanErrorKind;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

const MAX_PLAUSIBLE_DURATION: Duration = Duration::from_secs(48 * 60 * 60);

/// Track-level tags of one audio file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: String,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub duration: Duration,
    pub creation_time: SystemTime,
    pub artist: Option<String>,
    pub release: Option<String>,
    pub genre_list: String,
    pub genres: Vec<String>,
    pub recording_mbid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractError {
    pub kind: ScanErrorKind,
    pub system_error: Option<String>,
}

impl ExtractError {
    pub fn new(kind: ScanErrorKind) -> Self {
        Self {
            kind,
            system_error: None,
        }
    }

    fn io(err: std::io::Error) -> Self {
        Self {
            kind: ScanErrorKind::CannotReadFile,
            system_error: Some(err.to_string()),
        }
    }

    fn lofty(err: LoftyError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Io(_) => ScanErrorKind::CannotReadFile,
            _ => ScanErrorKind::CannotParseFile,
        };
        Self {
            kind,
            system_error: Some(err.to_string()),
        }
    }
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.system_error {
            Some(detail) => write!(f, "{}: {}", self.kind, detail),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Reads the tags of `path`. Never touches the catalog.
pub fn extract(path: &Path) -> Result<TrackMetadata, ExtractError> {
    let file_meta = fs::metadata(path).map_err(ExtractError::io)?;
    if !file_meta.is_file() {
        return Err(ExtractError {
            kind: ScanErrorKind::CannotReadFile,
            system_error: Some("not a regular file".to_string()),
        });
    }

    let tagged_file = Probe::open(path)
        .map_err(ExtractError::lofty)?
        .guess_file_type()
        .map_err(ExtractError::io)?
        .read()
        .map_err(ExtractError::lofty)?;

    let properties = tagged_file.properties();
    if properties.sample_rate().is_none() && properties.channels().is_none() {
        return Err(ExtractError::new(ScanErrorKind::NoAudioTrack));
    }

    let duration = properties.duration();
    check_duration(duration)?;

    let creation_time = file_meta.created().unwrap_or_else(|_| SystemTime::now());

    let mut metadata = TrackMetadata {
        title: file_stem(path),
        track_number: None,
        disc_number: None,
        duration,
        creation_time,
        artist: None,
        release: None,
        genre_list: String::new(),
        genres: Vec::new(),
        recording_mbid: None,
    };

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        apply_tag(&mut metadata, tag);
    }

    Ok(metadata)
}

fn check_duration(duration: Duration) -> Result<(), ExtractError> {
    if duration.is_zero() || duration > MAX_PLAUSIBLE_DURATION {
        return Err(ExtractError::new(ScanErrorKind::BadDuration));
    }
    Ok(())
}

fn apply_tag(metadata: &mut TrackMetadata, tag: &Tag) {
    if let Some(title) = tag_text(tag, &ItemKey::TrackTitle) {
        metadata.title = title;
    }
    metadata.artist = tag_text(tag, &ItemKey::TrackArtist)
        .or_else(|| tag_text(tag, &ItemKey::AlbumArtist));
    metadata.release = tag_text(tag, &ItemKey::AlbumTitle);
    metadata.track_number = tag.get_string(&ItemKey::TrackNumber).and_then(parse_number);
    metadata.disc_number = tag.get_string(&ItemKey::DiscNumber).and_then(parse_number);
    metadata.recording_mbid = tag_text(tag, &ItemKey::MusicBrainzRecordingId);

    let raw: Vec<&str> = tag
        .get_strings(&ItemKey::Genre)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    metadata.genre_list = raw.join("; ");
    metadata.genres = parse_genres(&metadata.genre_list);
}

fn tag_text(tag: &Tag, key: &ItemKey) -> Option<String> {
    tag.get_string(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn parse_number(text: &str) -> Option<u32> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

/// Splits a raw genre string into unique genre names, keeping tag order.
pub fn parse_genres(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if out.iter().any(|existing| existing == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}
