//! Combined JUnit log output.
//!
//! Writes the merged report tree once at the end of a run. The root
//! `<testsuites>` element wraps the single unit's suite when exactly one
//! unit ran, and otherwise a synthetic suite carrying the summed totals of
//! every unit:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites>
//!   <testsuite name="splitrun" tests="3" assertions="3" errors="0" failures="1"
//!              warnings="0" skipped="0" time="0.012000">
//!     <testsuite name="FooTest" file="tests/FooTest.php" ...>
//!       <testcase name="testA" class="FooTest" assertions="1" time="0.004000"/>
//!     </testsuite>
//!     <testsuite name="BarTest" ...>...</testsuite>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::Path;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::ReportResult;
use super::model::{Node, Suite, TestCase};

/// Serializes a merged report to a JUnit string.
///
/// `merged` is the synthetic root produced by the aggregator; its name is
/// replaced with `suite_name` when it is written.
pub fn to_xml_string(merged: &Suite, suite_name: &str) -> ReportResult<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("testsuites")))?;

    let mut units = merged.suites();
    match (units.next(), units.next(), merged.children.len()) {
        (Some(only), None, 1) => write_suite(&mut writer, only, &only.name)?,
        _ => write_suite(&mut writer, merged, suite_name)?,
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let xml = String::from_utf8(writer.into_inner())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(xml)
}

/// Writes the combined log to `path`, creating parent directories.
pub fn write_report(path: &Path, merged: &Suite, suite_name: &str) -> ReportResult<()> {
    let xml = to_xml_string(merged, suite_name)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, xml)?;
    tracing::info!("JUnit log written to: {}", path.display());
    Ok(())
}

fn write_suite<W: std::io::Write>(
    writer: &mut Writer<W>,
    suite: &Suite,
    name: &str,
) -> ReportResult<()> {
    let totals = suite.totals();

    let mut start = BytesStart::new("testsuite");
    start.push_attribute(("name", clean(name).as_str()));
    if let Some(file) = &suite.file {
        start.push_attribute(("file", clean(file).as_str()));
    }
    start.push_attribute(("tests", totals.tests.to_string().as_str()));
    start.push_attribute(("assertions", totals.assertions.to_string().as_str()));
    start.push_attribute(("errors", totals.errors.to_string().as_str()));
    start.push_attribute(("failures", totals.failures.to_string().as_str()));
    start.push_attribute(("warnings", totals.warnings.to_string().as_str()));
    start.push_attribute(("skipped", totals.skipped.to_string().as_str()));
    start.push_attribute(("time", format!("{:.6}", totals.time).as_str()));

    if suite.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &suite.children {
        match child {
            Node::Suite(nested) => write_suite(writer, nested, &nested.name)?,
            Node::Case(case) => write_case(writer, case)?,
        }
    }
    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_case<W: std::io::Write>(writer: &mut Writer<W>, case: &TestCase) -> ReportResult<()> {
    let mut start = BytesStart::new("testcase");
    start.push_attribute(("name", clean(&case.name).as_str()));
    if let Some(class) = &case.class {
        start.push_attribute(("class", clean(class).as_str()));
    }
    if let Some(classname) = &case.classname {
        start.push_attribute(("classname", clean(classname).as_str()));
    }
    if let Some(file) = &case.file {
        start.push_attribute(("file", clean(file).as_str()));
    }
    if let Some(line) = case.line {
        start.push_attribute(("line", line.to_string().as_str()));
    }
    start.push_attribute(("assertions", case.assertions.to_string().as_str()));
    start.push_attribute(("time", format!("{:.6}", case.time).as_str()));

    if case.defects.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for defect in &case.defects {
        let mut element = BytesStart::new(defect.kind.element());
        if !defect.ty.is_empty() {
            element.push_attribute(("type", clean(&defect.ty).as_str()));
        }
        if defect.text.is_empty() {
            writer.write_event(Event::Empty(element))?;
        } else {
            writer.write_event(Event::Start(element))?;
            writer.write_event(Event::Text(BytesText::new(&clean(&defect.text))))?;
            writer.write_event(Event::End(BytesEnd::new(defect.kind.element())))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot represent. Escaping is left to the writer.
fn clean(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::junit::parse_str;
    use crate::report::model::{Defect, DefectKind};

    fn unit(name: &str, cases: Vec<TestCase>) -> Suite {
        let mut suite = Suite::new(name);
        suite.file = Some(format!("tests/{}.php", name));
        for case in cases {
            suite.push_case(case);
        }
        suite
    }

    #[test]
    fn test_single_unit_is_written_directly() {
        let mut merged = Suite::new("");
        merged.push_suite(unit("FooTest", vec![TestCase::new("testA").with_assertions(1)]));

        let xml = to_xml_string(&merged, "splitrun").unwrap();
        assert!(xml.contains(r#"<testsuite name="FooTest" file="tests/FooTest.php" tests="1""#));
        assert!(!xml.contains(r#"name="splitrun""#));
    }

    #[test]
    fn test_many_units_get_synthetic_root_with_totals() {
        let failing = TestCase::new("testB")
            .with_assertions(2)
            .with_defect(Defect::new(DefectKind::Failure, "AssertionFailedError", "a < b & c"));
        let mut merged = Suite::new("");
        merged.push_suite(unit("FooTest", vec![TestCase::new("testA").with_assertions(1)]));
        merged.push_suite(unit("BarTest", vec![failing]));

        let xml = to_xml_string(&merged, "all").unwrap();
        assert!(xml.contains(
            r#"<testsuite name="all" tests="2" assertions="3" errors="0" failures="1""#
        ));
        assert!(xml.contains("a &lt; b &amp; c"));

        // The written log reads back to the same tree.
        let back = parse_str(&xml).unwrap();
        assert_eq!(back.name, "all");
        assert_eq!(back.suites().count(), 2);
        assert_eq!(back.totals(), merged.totals());
        assert_eq!(back.cases()[1].defects[0].text, "a < b & c");
    }

    #[test]
    fn test_empty_merge_writes_empty_suite() {
        let xml = to_xml_string(&Suite::new(""), "splitrun").unwrap();
        assert!(xml.contains(r#"<testsuite name="splitrun" tests="0""#));
    }

    #[test]
    fn test_write_report_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/junit.xml");
        write_report(&path, &Suite::new(""), "splitrun").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_clean_strips_control_characters() {
        assert_eq!(clean("a\u{1}b\tc"), "ab\tc");
    }
}
