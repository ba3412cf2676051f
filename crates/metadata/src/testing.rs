//! Helpers that write small but valid audio files for tests.

use std::fs;
use std::path::Path;

use lofty::config::WriteOptions;
use lofty::prelude::{Accessor, TagExt};
use lofty::tag::{Tag, TagType};

pub const SAMPLE_RATE: u32 = 8000;

#[derive(Debug, Default, Clone)]
pub struct WavTags<'a> {
    pub title: Option<&'a str>,
    pub artist: Option<&'a str>,
    pub release: Option<&'a str>,
    pub genre: Option<&'a str>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
}

/// Writes an 8 kHz mono 8-bit PCM file. Different seeds give different bytes.
pub fn write_wav(path: &Path, samples: usize, seed: u8) {
    let data: Vec<u8> = (0..samples)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();

    let mut out = Vec::with_capacity(44 + data.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&8u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create test directory");
    }
    fs::write(path, out).expect("write test wav");
}

pub fn write_wav_with_tags(path: &Path, samples: usize, seed: u8, tags: &WavTags<'_>) {
    write_wav(path, samples, seed);

    let mut tag = Tag::new(TagType::Id3v2);
    if let Some(title) = tags.title {
        tag.set_title(title.to_string());
    }
    if let Some(artist) = tags.artist {
        tag.set_artist(artist.to_string());
    }
    if let Some(release) = tags.release {
        tag.set_album(release.to_string());
    }
    if let Some(genre) = tags.genre {
        tag.set_genre(genre.to_string());
    }
    if let Some(track) = tags.track_number {
        tag.set_track(track);
    }
    if let Some(disc) = tags.disc_number {
        tag.set_disk(disc);
    }
    tag.save_to_path(path, WriteOptions::default())
        .expect("write test tags");
}
