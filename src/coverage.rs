//! Per-unit coverage fragment collection.
//!
//! When coverage is enabled each unit gets a second temp file, passed to the
//! engine through `{coverage}`. As units are flushed, every non-empty
//! fragment is copied into the configured directory as `unit-NNNN.cov`;
//! merging the fragments is left to the coverage tool.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::unit::WorkUnit;

/// Copies coverage fragments out of unit temp files.
#[derive(Debug)]
pub struct CoverageCollector {
    dir: PathBuf,
    collected: usize,
}

impl CoverageCollector {
    /// Creates the target directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, collected: 0 })
    }

    /// Copies the unit's fragment, if it has a non-empty one.
    ///
    /// Returns the path of the copy.
    pub fn collect(&mut self, unit: &WorkUnit) -> std::io::Result<Option<PathBuf>> {
        let Some(fragment) = unit.coverage_file() else {
            return Ok(None);
        };
        match std::fs::metadata(fragment) {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                debug!("No coverage data for {}", unit);
                return Ok(None);
            }
        }

        self.collected += 1;
        let target = self.dir.join(format!("unit-{:04}.cov", self.collected));
        std::fs::copy(fragment, &target)?;
        Ok(Some(target))
    }

    /// Number of fragments collected so far.
    pub fn collected(&self) -> usize {
        self.collected
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_only_non_empty_fragments() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("coverage");
        let mut collector = CoverageCollector::new(&out).unwrap();

        let mut empty = WorkUnit::new("a.t");
        empty.coverage_path(Some(tmp.path())).unwrap();
        assert!(collector.collect(&empty).unwrap().is_none());

        let mut full = WorkUnit::new("b.t");
        let fragment = full.coverage_path(Some(tmp.path())).unwrap().to_path_buf();
        std::fs::write(&fragment, "data").unwrap();
        let copy = collector.collect(&full).unwrap().unwrap();

        assert_eq!(copy, out.join("unit-0001.cov"));
        assert_eq!(std::fs::read_to_string(copy).unwrap(), "data");
        assert_eq!(collector.collected(), 1);

        assert!(collector.collect(&WorkUnit::new("c.t")).unwrap().is_none());
    }
}
