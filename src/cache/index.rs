//! On-disk index of the clip cache: `index.json`, rewritten atomically (temp file + rename).

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::CachedClip;
use crate::request::CLIP_FORMAT_VERSION;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IndexFile {
    pub format_version: u32,
    pub next_seq: u64,
    pub entries: Vec<CachedClip>,
}

pub(crate) enum LoadedIndex {
    Missing,
    Loaded(IndexFile),
    /// Unreadable, unparsable or written by another artifact format version.
    Incompatible(String),
}

pub(crate) fn load_index(path: &Path) -> LoadedIndex {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return LoadedIndex::Missing,
        Err(e) => return LoadedIndex::Incompatible(format!("read failed: {}", e)),
    };
    match serde_json::from_slice::<IndexFile>(&bytes) {
        Ok(index) if index.format_version == CLIP_FORMAT_VERSION => LoadedIndex::Loaded(index),
        Ok(index) => LoadedIndex::Incompatible(format!(
            "format version {} != {}",
            index.format_version, CLIP_FORMAT_VERSION
        )),
        Err(e) => LoadedIndex::Incompatible(format!("parse failed: {}", e)),
    }
}

pub(crate) fn write_index(path: &Path, index: &IndexFile) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("index path has no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, index).map_err(io::Error::other)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
