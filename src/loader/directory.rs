//! Directory loader: one unit per test file.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{LoaderError, LoaderResult, UnitLoader};
use crate::unit::WorkUnit;

/// Walks directories recursively and yields every file whose name ends with
/// the configured suffix. Files given directly are taken as-is.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    paths: Vec<PathBuf>,
    suffix: String,
}

impl DirectoryLoader {
    pub fn new(paths: Vec<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            paths,
            suffix: suffix.into(),
        }
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) -> LoaderResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(&path, out)?;
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&self.suffix))
            {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl UnitLoader for DirectoryLoader {
    fn load(&self) -> LoaderResult<Vec<WorkUnit>> {
        let mut files = Vec::new();
        for path in &self.paths {
            if path.is_dir() {
                let mut found = Vec::new();
                self.walk(path, &mut found)?;
                found.sort();
                debug!("Found {} files under {}", found.len(), path.display());
                files.extend(found);
            } else if path.is_file() {
                files.push(path.clone());
            } else {
                return Err(LoaderError::MissingPath(path.clone()));
            }
        }
        files.dedup();
        Ok(files.into_iter().map(WorkUnit::new).collect())
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_recursive_walk_sorted_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("b/BTest.php"));
        touch(&root.join("a/nested/CTest.php"));
        touch(&root.join("a/ATest.php"));
        touch(&root.join("a/Helper.php"));

        let loader = DirectoryLoader::new(vec![root.to_path_buf()], "Test.php");
        let units = loader.load().unwrap();
        let rel: Vec<String> = units
            .iter()
            .map(|u| {
                u.path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(rel, vec!["a/ATest.php", "a/nested/CTest.php", "b/BTest.php"]);
        assert!(units.iter().all(|u| u.filters.is_empty()));
    }

    #[test]
    fn test_plain_file_taken_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("whatever.txt");
        touch(&file);

        let loader = DirectoryLoader::new(vec![file.clone()], "Test.php");
        let units = loader.load().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].path, file);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DirectoryLoader::new(vec![dir.path().join("nope")], "Test.php");
        assert!(matches!(loader.load(), Err(LoaderError::MissingPath(_))));
    }
}
