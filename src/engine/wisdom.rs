//! Persistent record of transform timings and planned sizes.
//!
//! Benchmarking candidate transform lengths is the slowest part of planning with lookahead,
//! so the measured timings are kept in a small JSON file and reused by later runs. The file
//! is a cache: if it is missing, unreadable or cannot be written, planning simply starts from
//! scratch and a warning is logged.

use crate::volume::Dims;
use preferences::Preferences;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Bumped whenever the meaning of the stored timings changes.
const WISDOM_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
pub struct Wisdom {
    pub version: u32,
    /// Seconds per 1D transform, keyed by transform length.
    pub timings: BTreeMap<usize, f64>,
    /// Work sizes for which 3D plans have been built.
    pub planned: BTreeSet<Dims>,
}

impl Wisdom {
    pub fn new() -> Self {
        Wisdom {
            version: WISDOM_VERSION,
            ..Default::default()
        }
    }

    pub fn timing(&self, len: usize) -> Option<f64> {
        self.timings.get(&len).copied()
    }

    pub fn record_timing(&mut self, len: usize, seconds: f64) {
        self.timings.insert(len, seconds);
    }

    pub fn record_plan(&mut self, dims: Dims) {
        self.planned.insert(dims);
    }

    /// Loads the wisdom stored at `path`, falling back to an empty record.
    pub fn load_or_default(path: &Path) -> Self {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                log::debug!("no wisdom loaded from {path:?}: {err}");
                return Wisdom::new();
            }
        };
        match Wisdom::load_from(&mut file) {
            Ok(wisdom) if wisdom.version == WISDOM_VERSION => wisdom,
            Ok(wisdom) => {
                log::warn!(
                    "ignoring wisdom {path:?} of version {}, expected {WISDOM_VERSION}",
                    wisdom.version
                );
                Wisdom::new()
            }
            Err(err) => {
                log::warn!("could not parse wisdom {path:?}: {err:?}");
                Wisdom::new()
            }
        }
    }

    /// Writes the wisdom to `path`. Failures are logged, never returned.
    pub fn save_best_effort(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                log::warn!("could not create wisdom directory {parent:?}: {err}");
                return;
            }
        }
        match File::create(path) {
            Ok(mut file) => {
                if let Err(err) = self.save_to(&mut file) {
                    log::warn!("error saving wisdom to {path:?}: {err:?}");
                }
            }
            Err(err) => log::warn!("could not create wisdom file {path:?}: {err}"),
        }
    }
}

/// `~/.config/deconv3d/wisdom.json`, if a home directory is known.
pub fn default_wisdom_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".config").join("deconv3d").join("wisdom.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_wisdom_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wisdom.json");
        let mut wisdom = Wisdom::new();
        wisdom.record_timing(64, 0.5);
        wisdom.record_timing(81, 0.25);
        wisdom.record_plan([64, 81, 16]);
        wisdom.save_best_effort(&path);

        let loaded = Wisdom::load_or_default(&path);
        assert_eq!(loaded, wisdom);
        assert_eq!(loaded.timing(81), Some(0.25));
        assert_eq!(loaded.timing(82), None);
    }

    #[test]
    fn test_missing_or_corrupt_wisdom_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(Wisdom::load_or_default(&missing), Wisdom::new());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(Wisdom::load_or_default(&corrupt), Wisdom::new());
    }
}
