//! Input discovery and destination planning.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Result, RetempoError};
use crate::job::MediaKind;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "webm", "flv", "wmv"];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "m4b", "wav", "ogg", "flac"];

/// One input file and the destination it maps to before conflict resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub source: PathBuf,
    pub dest: PathBuf,
}

pub fn extensions(kind: MediaKind) -> &'static [&'static str] {
    match kind {
        MediaKind::Video => VIDEO_EXTENSIONS,
        MediaKind::Audio => AUDIO_EXTENSIONS,
    }
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| allowed.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Every file under `dir` with an extension of `kind`, sorted by path
pub fn scan_sources<P: AsRef<Path>>(dir: P, kind: MediaKind) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(RetempoError::Config(format!(
            "Source directory does not exist: {}",
            dir.display()
        )));
    }

    let allowed = extensions(kind);
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && has_extension(entry.path(), allowed) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();

    info!("Found {} {} files in {}", files.len(), kind, dir.display());
    Ok(files)
}

/// Destination for `source`: same relative path under `dst_root`.
///
/// Audio is always written as mp3.
pub fn plan_destination(src_root: &Path, dst_root: &Path, source: &Path, kind: MediaKind) -> PathBuf {
    let relative = pathdiff::diff_paths(source, src_root)
        .filter(|relative| !relative.starts_with(".."))
        .or_else(|| source.file_name().map(PathBuf::from))
        .unwrap_or_else(|| source.to_path_buf());

    let dest = dst_root.join(relative);
    match kind {
        MediaKind::Video => dest,
        MediaKind::Audio => dest.with_extension("mp3"),
    }
}

/// Scan `src_root` and map every input under `dst_root`
pub fn plan_batch(src_root: &Path, dst_root: &Path, kind: MediaKind) -> Result<Vec<SourceFile>> {
    let sources = scan_sources(src_root, kind)?
        .into_iter()
        .map(|source| {
            let dest = plan_destination(src_root, dst_root, &source, kind);
            debug!("{} -> {}", source.display(), dest.display());
            SourceFile { source, dest }
        })
        .collect();
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use assert_fs::TempDir;
    use assert_fs::prelude::*;

    use super::*;

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        dir.child("b.MP4").write_str("x").unwrap();
        dir.child("a.mkv").write_str("x").unwrap();
        dir.child("nested/c.webm").write_str("x").unwrap();
        dir.child("notes.txt").write_str("x").unwrap();
        dir.child("song.mp3").write_str("x").unwrap();

        let found = scan_sources(dir.path(), MediaKind::Video).unwrap();
        assert_eq!(
            found,
            vec![
                dir.child("a.mkv").path().to_path_buf(),
                dir.child("b.MP4").path().to_path_buf(),
                dir.child("nested/c.webm").path().to_path_buf(),
            ]
        );

        let audio = scan_sources(dir.path(), MediaKind::Audio).unwrap();
        assert_eq!(audio, vec![dir.child("song.mp3").path().to_path_buf()]);
    }

    #[test]
    fn test_scan_missing_dir_is_config_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.child("nope");
        assert!(matches!(
            scan_sources(missing.path(), MediaKind::Video),
            Err(RetempoError::Config(_))
        ));
    }

    #[test]
    fn test_plan_destination_mirrors_tree() {
        let src = Path::new("/media/in");
        let dst = Path::new("/media/out");
        assert_eq!(
            plan_destination(src, dst, Path::new("/media/in/season1/ep1.mkv"), MediaKind::Video),
            PathBuf::from("/media/out/season1/ep1.mkv")
        );
        assert_eq!(
            plan_destination(src, dst, Path::new("/media/in/book/ch1.m4b"), MediaKind::Audio),
            PathBuf::from("/media/out/book/ch1.mp3")
        );
        // Outside the source root: keep only the file name
        assert_eq!(
            plan_destination(src, dst, Path::new("/elsewhere/x.mp4"), MediaKind::Video),
            PathBuf::from("/media/out/x.mp4")
        );
    }

    #[test]
    fn test_plan_batch() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        src.child("talk.wav").write_str("x").unwrap();

        let planned = plan_batch(src.path(), dst.path(), MediaKind::Audio).unwrap();
        assert_eq!(
            planned,
            vec![SourceFile {
                source: src.child("talk.wav").path().to_path_buf(),
                dest: dst.path().join("talk.mp3"),
            }]
        );
    }
}
