//! Unit loaders.
//!
//! A loader turns configuration into the ordered list of [`WorkUnit`]s the
//! runner dispatches. Loading happens once, before any worker starts.
//!
//! | Loader | Source | Units |
//! |--------|--------|-------|
//! | [`directory::DirectoryLoader`] | recursive walk | one per file matching a suffix |
//! | [`list::ListLoader`] | list file | one per line, or one per test name |

pub mod directory;
pub mod list;

use std::path::PathBuf;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::config::{LoaderConfig, Order};
use crate::unit::WorkUnit;

pub use directory::DirectoryLoader;
pub use list::ListLoader;

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors raised while loading units.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// A configured path does not exist.
    #[error("Path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    /// A list file line could not be understood.
    #[error("{}:{line}: {message}", file.display())]
    InvalidLine {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces the units of a run.
pub trait UnitLoader: Send + Sync {
    /// Loads every unit, in a stable order.
    fn load(&self) -> LoaderResult<Vec<WorkUnit>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Builds the loader selected in the configuration.
pub fn from_config(config: &LoaderConfig) -> Box<dyn UnitLoader> {
    match config {
        LoaderConfig::Directory(dir) => {
            Box::new(DirectoryLoader::new(dir.paths.clone(), dir.suffix.clone()))
        }
        LoaderConfig::List(list) => {
            Box::new(ListLoader::new(list.file.clone()).with_functional(list.functional))
        }
    }
}

/// Reorders units for dispatch.
pub fn apply_order(units: &mut [WorkUnit], order: Order, seed: Option<u64>) {
    match order {
        Order::Default => {}
        Order::Reverse => units.reverse(),
        Order::Random => {
            let seed = seed.unwrap_or_else(rand::random);
            debug!("Shuffling units with seed {}", seed);
            let mut rng = StdRng::seed_from_u64(seed);
            units.shuffle(&mut rng);
        }
    }
}

/// Total expected tests, if every unit carries a hint.
pub fn expected_tests(units: &[WorkUnit]) -> Option<usize> {
    units.iter().map(|u| u.expected_tests).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(names: &[&str]) -> Vec<WorkUnit> {
        names.iter().map(|n| WorkUnit::new(*n)).collect()
    }

    fn names(units: &[WorkUnit]) -> Vec<String> {
        units.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_reverse_order() {
        let mut list = units(&["a", "b", "c"]);
        apply_order(&mut list, Order::Reverse, None);
        assert_eq!(names(&list), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_random_order_is_reproducible_with_seed() {
        let all: Vec<String> = (0..20).map(|i| format!("u{}", i)).collect();
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();

        let mut first = units(&refs);
        let mut second = units(&refs);
        apply_order(&mut first, Order::Random, Some(7));
        apply_order(&mut second, Order::Random, Some(7));
        assert_eq!(names(&first), names(&second));

        let mut sorted = names(&first);
        sorted.sort();
        let mut expected = all.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_expected_tests_requires_every_hint() {
        let hinted = vec![
            WorkUnit::new("a").with_expected_tests(2),
            WorkUnit::new("b").with_expected_tests(3),
        ];
        assert_eq!(expected_tests(&hinted), Some(5));

        let partial = vec![WorkUnit::new("a").with_expected_tests(2), WorkUnit::new("b")];
        assert_eq!(expected_tests(&partial), None);
    }
}
