//! Live progress reporters.
//!
//! [`ConsoleReporter`] prints one character per test case as units complete,
//! wrapping lines at a fixed width:
//!
//! ```text
//! ...........F.........E..............S......   45 / 120 ( 37%)
//! ........................................E...   90 / 120 ( 75%)
//! ..............................                120 / 120 (100%)
//! ```
//!
//! | Character | Meaning |
//! |-----------|---------|
//! | `.` | passed |
//! | `F` | failure |
//! | `E` | error |
//! | `W` | warning |
//! | `R` | risky |
//! | `S` | skipped |
//!
//! [`ProgressBarReporter`] shows an `indicatif` bar instead and lists each
//! unsuccessful unit as it completes.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Reporter, print_summary};
use crate::aggregator::UnitOutcome;
use crate::runner::RunResult;
use crate::unit::WorkUnit;

/// Lays out feedback characters in fixed-width rows with a progress suffix.
#[derive(Debug)]
pub struct DotPrinter {
    columns: usize,
    total: Option<usize>,
    printed: usize,
    column: usize,
    colored: bool,
}

impl DotPrinter {
    /// `columns` is the full terminal width, suffix included.
    pub fn new(columns: usize, colored: bool) -> Self {
        Self {
            columns,
            total: None,
            printed: 0,
            column: 0,
            colored,
        }
    }

    /// Sets the expected number of characters, enabling the `n / N (p%)`
    /// suffix.
    pub fn set_total(&mut self, total: Option<usize>) {
        self.total = total.filter(|t| *t > 0);
    }

    fn digits(&self) -> usize {
        self.total.map(|t| t.to_string().len()).unwrap_or(0)
    }

    /// Characters per row, excluding the suffix.
    fn width(&self) -> usize {
        match self.total {
            Some(_) => self.columns.saturating_sub(11 + 2 * self.digits()).max(1),
            None => self.columns.max(1),
        }
    }

    fn suffix(&self) -> String {
        match self.total {
            Some(total) => {
                let digits = self.digits();
                let percent = (self.printed * 100 / total).min(100);
                format!(
                    " {:>w$} / {:>w$} ({:>3}%)",
                    self.printed,
                    total,
                    percent,
                    w = digits
                )
            }
            None => String::new(),
        }
    }

    fn paint(&self, symbol: char) -> String {
        if !self.colored {
            return symbol.to_string();
        }
        let styled = console::style(symbol);
        match symbol {
            'E' | 'F' => styled.red().bold().to_string(),
            'W' | 'R' => styled.yellow().to_string(),
            'S' => styled.cyan().to_string(),
            _ => styled.to_string(),
        }
    }

    /// Returns the text to print for a unit's feedback characters.
    pub fn feed(&mut self, feedback: &str) -> String {
        let mut out = String::new();
        for symbol in feedback.chars() {
            out.push_str(&self.paint(symbol));
            self.printed += 1;
            self.column += 1;
            if self.column == self.width() {
                out.push_str(&self.suffix());
                out.push('\n');
                self.column = 0;
            }
        }
        out
    }

    /// Pads and terminates a partially filled last row.
    pub fn finish(&mut self) -> String {
        if self.column == 0 {
            return String::new();
        }
        let mut out = String::new();
        if self.total.is_some() {
            out.push_str(&" ".repeat(self.width() - self.column));
            out.push_str(&self.suffix());
        }
        out.push('\n');
        self.column = 0;
        out
    }
}

/// Prints progress characters, then the summary.
pub struct ConsoleReporter {
    printer: Mutex<DotPrinter>,
}

impl ConsoleReporter {
    pub fn new(columns: usize) -> Self {
        Self {
            printer: Mutex::new(DotPrinter::new(columns, console::colors_enabled())),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, units: usize, expected_tests: Option<usize>) {
        if let Ok(mut printer) = self.printer.lock() {
            printer.set_total(expected_tests);
        }
        println!("Running {} units", units);
        println!();
    }

    async fn on_unit_complete(&self, _unit: &WorkUnit, outcome: &UnitOutcome) {
        if let Ok(mut printer) = self.printer.lock() {
            print!("{}", printer.feed(&outcome.feedback));
        }
        let _ = std::io::stdout().flush();
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut printer) = self.printer.lock() {
            print!("{}", printer.finish());
        }
        print_summary(result);
    }
}

/// Shows an `indicatif` progress bar over units (or tests, when the loader
/// knows how many to expect).
pub struct ProgressBarReporter {
    bar: Mutex<Option<(indicatif::ProgressBar, bool)>>,
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl Default for ProgressBarReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for ProgressBarReporter {
    async fn on_run_start(&self, units: usize, expected_tests: Option<usize>) {
        let by_tests = expected_tests.is_some();
        let pb = indicatif::ProgressBar::new(expected_tests.unwrap_or(units) as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut bar) = self.bar.lock() {
            *bar = Some((pb, by_tests));
        }
    }

    async fn on_unit_complete(&self, unit: &WorkUnit, outcome: &UnitOutcome) {
        let Ok(bar) = self.bar.lock() else {
            return;
        };
        if let Some((pb, by_tests)) = bar.as_ref() {
            pb.inc(if *by_tests {
                outcome.totals.tests as u64
            } else {
                1
            });

            if !outcome.severity.is_success() {
                pb.println(format!("{} {}", console::style("FAIL").red(), unit));
            }
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut bar) = self.bar.lock()
            && let Some((pb, _)) = bar.take()
        {
            pb.finish_and_clear();
        }
        print_summary(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_wrap_with_progress_suffix() {
        // 20 columns, total 10: 20 - (11 + 2*2) = 5 characters per row.
        let mut printer = DotPrinter::new(20, false);
        printer.set_total(Some(10));

        assert_eq!(printer.feed("..F"), "..F");
        assert_eq!(printer.feed("..E.."), "..  5 / 10 ( 50%)\nE..");
        assert_eq!(printer.finish(), "    8 / 10 ( 80%)\n");
        assert_eq!(printer.finish(), "");
    }

    #[test]
    fn test_rows_without_total_have_no_suffix() {
        let mut printer = DotPrinter::new(3, false);
        assert_eq!(printer.feed("....."), "...\n..");
        assert_eq!(printer.finish(), "\n");
    }

    #[test]
    fn test_zero_total_is_treated_as_unknown() {
        let mut printer = DotPrinter::new(4, false);
        printer.set_total(Some(0));
        assert_eq!(printer.feed("...."), "....\n");
    }

    #[test]
    fn test_overshooting_total_caps_percent() {
        let mut printer = DotPrinter::new(14, false);
        printer.set_total(Some(1));
        // 14 - 13 = 1 character per row.
        assert_eq!(printer.feed(".."), ". 1 / 1 (100%)\n. 2 / 1 (100%)\n");
    }
}
