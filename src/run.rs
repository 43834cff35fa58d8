//! Run identity and the `.3pio/` directory layout (A4).
//!
//! [`RunId::generate`] produces a `YYYYMMDDThhmmss-<adjective>-<noun>` token;
//! [`RunPaths`] centralizes every path spec.md §6 lists, computed once at
//! startup and passed by value to every component from then on.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "eager", "fuzzy", "quiet", "swift", "bold", "keen", "lucky", "mellow",
    "nimble", "proud", "sunny", "tidy", "vivid", "witty", "zesty", "amber", "crisp", "daring",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "badger", "heron", "lynx", "marten", "osprey", "puffin", "raven", "sable",
    "tapir", "urchin", "vole", "wombat", "yak", "zebra", "gecko", "ibex", "jackal", "koala",
];

/// A unique, human-memorable identifier for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId(String);

impl RunId {
    /// Generates a new run identifier using the current time and two words
    /// drawn from small built-in lists.
    pub fn generate() -> Self {
        Self::from_parts(Utc::now(), &mut rand::thread_rng())
    }

    fn from_parts(now: chrono::DateTime<Utc>, rng: &mut impl rand::Rng) -> Self {
        let timestamp = now.format("%Y%m%dT%H%M%S");
        let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("plain");
        let noun = NOUNS.choose(rng).copied().unwrap_or("run");
        Self(format!("{timestamp}-{adjective}-{noun}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every filesystem path associated with one run, rooted at `<cwd>/.3pio/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub base_dir: PathBuf,
    pub run_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub adapters_dir: PathBuf,
    pub run_report: PathBuf,
    pub output_log: PathBuf,
    pub ipc_file: PathBuf,
    pub debug_log: PathBuf,
}

impl RunPaths {
    pub fn new(cwd: &Path, run_id: &RunId) -> Self {
        let base_dir = cwd.join(".3pio");
        let run_dir = base_dir.join("runs").join(run_id.as_str());
        Self {
            reports_dir: run_dir.join("reports"),
            adapters_dir: run_dir.join("adapters"),
            run_report: run_dir.join("test-run.md"),
            output_log: run_dir.join("output.log"),
            ipc_file: base_dir.join("ipc").join(format!("{}.jsonl", run_id.as_str())),
            debug_log: base_dir.join("debug.log"),
            run_dir,
            base_dir,
        }
    }

    /// Creates every directory this run needs. `adapters/` is created empty:
    /// asset extraction is out of scope (§A5), but the documented layout is
    /// always present on disk.
    pub fn ensure_created(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.reports_dir)?;
        std::fs::create_dir_all(&self.adapters_dir)?;
        if let Some(parent) = self.ipc_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_the_expected_shape() {
        let id = RunId::generate();
        let s = id.as_str();
        let (timestamp, rest) = s.split_once('-').unwrap();
        assert_eq!(timestamp.len(), 15); // YYYYMMDDThhmmss
        assert!(rest.contains('-'));
    }

    #[test]
    fn paths_are_rooted_under_dot_3pio() {
        let id = RunId::generate();
        let paths = RunPaths::new(Path::new("/work"), &id);
        assert_eq!(paths.base_dir, PathBuf::from("/work/.3pio"));
        assert!(paths.run_dir.starts_with(&paths.base_dir));
        assert!(paths.ipc_file.starts_with(paths.base_dir.join("ipc")));
        assert_eq!(paths.run_report, paths.run_dir.join("test-run.md"));
    }

    #[test]
    fn ensure_created_makes_reports_and_adapters_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let id = RunId::generate();
        let paths = RunPaths::new(dir.path(), &id);
        paths.ensure_created().unwrap();
        assert!(paths.reports_dir.is_dir());
        assert!(paths.adapters_dir.is_dir());
        assert!(paths.ipc_file.parent().unwrap().is_dir());
    }
}
