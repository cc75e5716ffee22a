//! Destination conflict handling.
//!
//! Every destination of a batch goes through one [`OverwriteResolver`]. Its
//! claimed-names set is guarded by a single lock held across the whole
//! check-then-claim sequence, so two jobs can never be handed the same path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::OverwriteMode;
use crate::error::{Result, RetempoError};

/// Highest `(N)` suffix tried before giving up
pub const MAX_RENAME_SUFFIX: u32 = 9999;

/// Outcome of resolving one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Encode to this path
    Proceed(PathBuf),
    /// Encode to this path, replacing what is there
    Overwrite(PathBuf),
    /// Destination already present; do not encode
    Skip(PathBuf),
}

impl Resolution {
    pub fn path(&self) -> &Path {
        match self {
            Resolution::Proceed(path) | Resolution::Overwrite(path) | Resolution::Skip(path) => {
                path
            }
        }
    }
}

#[derive(Debug)]
pub struct OverwriteResolver {
    mode: OverwriteMode,
    claimed: Mutex<HashSet<PathBuf>>,
}

impl OverwriteResolver {
    pub fn new(mode: OverwriteMode) -> Self {
        Self {
            mode,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Decide the effective destination for `candidate` and claim it.
    ///
    /// Every claimed path is unique within the batch. A name an earlier job
    /// already claimed moves on to the first unclaimed `name(N)`; Skip and
    /// Overwrite then only apply to a file that is actually on disk.
    pub async fn resolve(&self, candidate: &Path) -> Result<Resolution> {
        let mut claimed = self.claimed.lock().await;

        let resolution = match self.mode {
            OverwriteMode::Rename => {
                let taken = |path: &Path| claimed.contains(path) || path.exists();
                if taken(candidate) {
                    Resolution::Proceed(first_numbered(candidate, taken)?)
                } else {
                    Resolution::Proceed(candidate.to_path_buf())
                }
            }
            mode => {
                let target = if claimed.contains(candidate) {
                    let free = first_numbered(candidate, |path| claimed.contains(path))?;
                    debug!(
                        "{} is already a destination of this batch, using {}",
                        candidate.display(),
                        free.display()
                    );
                    free
                } else {
                    candidate.to_path_buf()
                };
                match (target.exists(), mode) {
                    (false, _) => Resolution::Proceed(target),
                    (true, OverwriteMode::Skip) => Resolution::Skip(target),
                    (true, _) => Resolution::Overwrite(target),
                }
            }
        };

        debug!("Destination {} resolved to {:?}", candidate.display(), resolution);
        claimed.insert(resolution.path().to_path_buf());
        Ok(resolution)
    }
}

/// Smallest `name(N)` variant of `candidate` for which `taken` is false
fn first_numbered<F>(candidate: &Path, taken: F) -> Result<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    (1..=MAX_RENAME_SUFFIX)
        .map(|n| numbered_path(candidate, n))
        .find(|path| !taken(path))
        .ok_or_else(|| RetempoError::NamingExhausted(candidate.to_path_buf()))
}

/// `dir/name.ext` -> `dir/name(n).ext`
pub fn numbered_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{}({})", stem, n),
    };
    path.with_file_name(file_name)
}
