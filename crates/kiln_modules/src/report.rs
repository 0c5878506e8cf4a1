//! The precompiled-modules report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_fs::{FileSystem, FsError};

/// Name of the report file written into the report directory.
pub const SUMMARY_FILE: &str = "Summary.csv";

/// Counts the module variants built in one build, per module name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleReport {
    built: BTreeMap<String, usize>,
}

impl ModuleReport {
    /// Records one variant of `module` being built.
    pub fn record_built(&mut self, module: &str) {
        *self.built.entry(module.to_string()).or_default() += 1;
    }

    /// Number of variants of `module` built so far.
    pub fn variants(&self, module: &str) -> usize {
        self.built.get(module).copied().unwrap_or(0)
    }

    /// Renders the CSV body.
    pub fn to_csv(&self) -> String {
        let mut csv = String::from("Name,Variants\n");
        for (name, count) in &self.built {
            csv.push_str(&format!("{name},{count}\n"));
        }
        csv
    }

    /// Writes `Summary.csv` into `dir` and returns its path.
    pub fn write(&self, dir: &Path, fs: &dyn FileSystem) -> Result<PathBuf, FsError> {
        let path = dir.join(SUMMARY_FILE);
        fs.write(&path, self.to_csv().as_bytes())
            .map_err(|e| FsError::io(&path, e))?;
        Ok(path)
    }
}
