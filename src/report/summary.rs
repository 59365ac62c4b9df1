//! End-of-run text summary.
//!
//! ```text
//! Time: 00:01.204
//!
//! There was 1 error:
//!
//! 1) BarTest::testData with data set #0
//! RuntimeException: boom
//!
//! --
//!
//! There were 2 failures:
//!
//! 1) FooTest::testB
//! Failed asserting that false is true.
//!
//! 2) BazTest::testC
//! Failed asserting that 1 is 2.
//!
//! FAILURES!
//! Tests: 10, Assertions: 12, Failures: 2, Errors: 1.
//! ```
//!
//! Defects are numbered per category, sequentially across every merged
//! suite, in the order the cases appear in the merged tree.

use std::fmt::Write as _;
use std::time::Duration;

use super::model::{DefectKind, Suite, TestCase, Totals};

/// Renders the complete summary for a merged report.
pub fn render(merged: &Suite, elapsed: Duration) -> String {
    let mut out = render_body(merged, elapsed);
    out.push('\n');
    out.push_str(&footer(&merged.totals()));
    out
}

/// The summary without its footer: elapsed time and defect listings.
pub fn render_body(merged: &Suite, elapsed: Duration) -> String {
    let cases = merged.cases();

    let mut out = String::new();
    let _ = writeln!(out, "Time: {}", format_elapsed(elapsed));

    let mut first = true;
    for kind in DefectKind::LISTING_ORDER {
        let listing = defect_listing(&cases, kind);
        if listing.is_empty() {
            continue;
        }
        if !first {
            out.push_str("\n--\n");
        }
        first = false;
        out.push('\n');
        out.push_str(&listing);
    }
    out
}

/// `mm:ss.mmm`, or `hh:mm:ss.mmm` past an hour.
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    let hours = millis / 3_600_000;
    let minutes = (millis / 60_000) % 60;
    let seconds = (millis / 1000) % 60;
    let millis = millis % 1000;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
    }
}

/// The numbered listing for one defect kind, or an empty string.
fn defect_listing(cases: &[&TestCase], kind: DefectKind) -> String {
    let entries: Vec<(&TestCase, &str, &str)> = cases
        .iter()
        .flat_map(|case| {
            case.defects
                .iter()
                .filter(move |d| d.kind == kind)
                .map(move |d| (*case, d.ty.as_str(), d.text.as_str()))
        })
        .collect();
    if entries.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let count = entries.len();
    let verb = if count == 1 { "was" } else { "were" };
    let _ = writeln!(out, "There {} {} {}:", verb, count, kind.noun(count));

    for (index, (case, ty, text)) in entries.into_iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}) {}", index + 1, case.qualified_name());
        let text = text.trim();
        match (ty.is_empty(), text.is_empty()) {
            (true, true) => {}
            (false, true) => {
                let _ = writeln!(out, "{}", ty);
            }
            (true, false) => {
                let _ = writeln!(out, "{}", text);
            }
            (false, false) if text.starts_with(ty) => {
                let _ = writeln!(out, "{}", text);
            }
            (false, false) => {
                let _ = writeln!(out, "{}: {}", ty, text);
            }
        }
        if let Some(file) = &case.file {
            match case.line {
                Some(line) => {
                    let _ = writeln!(out, "\n{}:{}", file, line);
                }
                None => {
                    let _ = writeln!(out, "\n{}", file);
                }
            }
        }
    }
    out
}

/// The closing status line(s).
pub fn footer(totals: &Totals) -> String {
    let quiet = totals.warnings == 0 && totals.skipped == 0 && totals.risky == 0;
    if totals.is_successful() && quiet {
        format!(
            "OK ({}, {})\n",
            plural(totals.tests, "test", "tests"),
            plural(totals.assertions, "assertion", "assertions")
        )
    } else if totals.is_successful() {
        format!(
            "OK, but some tests were skipped or risky!\n{}\n",
            counts_line(totals, false)
        )
    } else {
        format!("FAILURES!\n{}\n", counts_line(totals, true))
    }
}

fn counts_line(totals: &Totals, with_failures: bool) -> String {
    let mut parts = vec![
        format!("Tests: {}", totals.tests),
        format!("Assertions: {}", totals.assertions),
    ];
    if with_failures {
        parts.push(format!("Failures: {}", totals.failures));
        parts.push(format!("Errors: {}", totals.errors));
    }
    for (label, count) in [
        ("Warnings", totals.warnings),
        ("Skipped", totals.skipped),
        ("Risky", totals.risky),
    ] {
        if count > 0 {
            parts.push(format!("{}: {}", label, count));
        }
    }
    format!("{}.", parts.join(", "))
}

fn plural(count: usize, one: &str, many: &str) -> String {
    format!("{} {}", count, if count == 1 { one } else { many })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::model::Defect;

    fn passing(n: usize) -> Suite {
        let mut suite = Suite::new("S");
        for i in 0..n {
            suite.push_case(TestCase::new(format!("t{}", i)).with_assertions(1));
        }
        suite
    }

    #[test]
    fn test_ok_footer_singular_and_plural() {
        assert_eq!(footer(&passing(1).totals()), "OK (1 test, 1 assertion)\n");
        assert_eq!(footer(&passing(10).totals()), "OK (10 tests, 10 assertions)\n");
    }

    #[test]
    fn test_ok_but_skipped_footer() {
        let suite = passing(2).with_case(
            TestCase::new("s").with_defect(Defect::new(DefectKind::Skipped, "", "")),
        );
        assert_eq!(
            footer(&suite.totals()),
            "OK, but some tests were skipped or risky!\nTests: 3, Assertions: 2, Skipped: 1.\n"
        );
    }

    #[test]
    fn test_failures_footer() {
        let mut totals = Totals {
            tests: 8,
            assertions: 9,
            failures: 3,
            errors: 1,
            ..Totals::default()
        };
        assert_eq!(
            footer(&totals),
            "FAILURES!\nTests: 8, Assertions: 9, Failures: 3, Errors: 1.\n"
        );

        totals.warnings = 2;
        assert!(footer(&totals).ends_with("Errors: 1, Warnings: 2.\n"));
    }

    #[test]
    fn test_listing_numbers_across_suites() {
        let fail = |name: &str, msg: &str| {
            TestCase::new(name)
                .with_class("C")
                .with_defect(Defect::new(DefectKind::Failure, "", msg))
        };
        let mut merged = Suite::new("");
        merged.push_suite(Suite::new("A").with_case(fail("one", "first")));
        merged.push_suite(
            Suite::new("B")
                .with_case(fail("two", "second"))
                .with_case(TestCase::new("e").with_defect(Defect::new(
                    DefectKind::Error,
                    "RuntimeException",
                    "boom",
                ))),
        );

        let text = render(&merged, Duration::from_millis(1204));
        assert!(text.starts_with("Time: 00:01.204\n"));

        let error_at = text.find("There was 1 error:").unwrap();
        let failures_at = text.find("There were 2 failures:").unwrap();
        assert!(error_at < failures_at);
        assert!(text.contains("1) e\nRuntimeException: boom\n"));
        assert!(text.contains("1) C::one\nfirst\n"));
        assert!(text.contains("2) C::two\nsecond\n"));
        assert!(text.contains("\n--\n"));
        assert!(text.ends_with("FAILURES!\nTests: 3, Assertions: 0, Failures: 2, Errors: 1.\n"));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(61_005)), "01:01.005");
        assert_eq!(format_elapsed(Duration::from_secs(3_661)), "01:01:01.000");
    }
}
