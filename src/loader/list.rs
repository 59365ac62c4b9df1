//! List loader: units named explicitly in a file.
//!
//! ```text
//! # comments and blank lines are ignored
//! tests/FooTest.php
//! tests/BarTest.php::testA,testB
//! ```
//!
//! In functional mode, a line with filters yields one unit per filter so
//! that each test runs in its own engine invocation.

use std::path::PathBuf;

use super::{LoaderError, LoaderResult, UnitLoader};
use crate::unit::WorkUnit;

#[derive(Debug, Clone)]
pub struct ListLoader {
    file: PathBuf,
    functional: bool,
}

impl ListLoader {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            functional: false,
        }
    }

    pub fn with_functional(mut self, functional: bool) -> Self {
        self.functional = functional;
        self
    }

    fn parse(&self, content: &str) -> LoaderResult<Vec<WorkUnit>> {
        let mut units = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (path, filters) = match line.split_once("::") {
                Some((path, filters)) => {
                    let filters: Vec<String> = filters
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect();
                    if filters.is_empty() {
                        return Err(self.invalid(index, "empty filter list after `::`"));
                    }
                    (path.trim(), filters)
                }
                None => (line, Vec::new()),
            };
            if path.is_empty() {
                return Err(self.invalid(index, "missing path"));
            }

            if filters.is_empty() {
                units.push(WorkUnit::new(path));
            } else if self.functional {
                units.extend(filters.into_iter().map(|filter| {
                    WorkUnit::new(path)
                        .with_filters([filter])
                        .with_expected_tests(1)
                }));
            } else {
                let count = filters.len();
                units.push(
                    WorkUnit::new(path)
                        .with_filters(filters)
                        .with_expected_tests(count),
                );
            }
        }
        Ok(units)
    }

    fn invalid(&self, index: usize, message: &str) -> LoaderError {
        LoaderError::InvalidLine {
            file: self.file.clone(),
            line: index + 1,
            message: message.to_string(),
        }
    }
}

impl UnitLoader for ListLoader {
    fn load(&self) -> LoaderResult<Vec<WorkUnit>> {
        if !self.file.exists() {
            return Err(LoaderError::MissingPath(self.file.clone()));
        }
        let content = std::fs::read_to_string(&self.file)?;
        self.parse(&content)
    }

    fn name(&self) -> &'static str {
        "list"
    }
}
