//! JUnit XML report parsing.
//!
//! Reads the per-unit report an engine writes into the unit's temp file.
//! The parser is event-driven and tolerant: unknown elements and attributes
//! are ignored, numeric attributes that fail to parse default to zero, and
//! suite-level counts are not read at all (they are recomputed from the
//! cases, see [`Suite::totals`]).
//!
//! # Accepted format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites>
//!   <testsuite name="FooTest" file="tests/FooTest.php" tests="2" time="0.012">
//!     <testcase name="testA" class="FooTest" file="tests/FooTest.php" line="12"
//!               assertions="1" time="0.004"/>
//!     <testcase name="testB" class="FooTest" assertions="1" time="0.008">
//!       <failure type="AssertionFailedError">Failed asserting that 1 is 2.</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Defect elements are `failure`, `error`, `warning`, `skipped` and `risky`.

use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::model::{Defect, DefectKind, Suite, TestCase};
use super::{ReportError, ReportResult};

/// Reads a report file.
///
/// Returns `Ok(None)` if the file does not exist (the unit never ran) and
/// [`ReportError::EmptyReport`] if it exists but is empty (the engine died
/// before writing it).
pub fn read_report(path: &Path) -> ReportResult<Option<Suite>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Err(ReportError::EmptyReport {
            path: path.to_path_buf(),
        });
    }

    parse_str(&content)
        .map(Some)
        .map_err(|e| ReportError::Invalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Parses a JUnit document.
///
/// A document with exactly one top-level suite yields that suite; several
/// top-level suites are wrapped in an unnamed suite.
pub fn parse_str(xml: &str) -> ReportResult<Suite> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Suite> = Vec::new();
    let mut roots: Vec<Suite> = Vec::new();
    let mut case: Option<TestCase> = None;
    let mut defect: Option<Defect> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"testsuite" => stack.push(suite_from(&e)?),
                b"testcase" => case = Some(case_from(&e)?),
                name => {
                    if let Some(kind) = DefectKind::from_element(name)
                        && case.is_some()
                    {
                        defect = Some(defect_from(kind, &e)?);
                    }
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"testsuite" => attach_suite(&mut stack, &mut roots, suite_from(&e)?),
                b"testcase" => attach_case(&mut stack, case_from(&e)?)?,
                name => {
                    if let Some(kind) = DefectKind::from_element(name)
                        && let Some(case) = case.as_mut()
                    {
                        case.defects.push(defect_from(kind, &e)?);
                    }
                }
            },
            Event::Text(text) => {
                if let Some(defect) = defect.as_mut() {
                    append_text(&mut defect.text, &text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(defect) = defect.as_mut() {
                    append_text(&mut defect.text, &String::from_utf8_lossy(&data));
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"testsuite" => {
                    let suite = stack
                        .pop()
                        .ok_or_else(|| ReportError::Malformed("unbalanced </testsuite>".into()))?;
                    attach_suite(&mut stack, &mut roots, suite);
                }
                b"testcase" => {
                    if let Some(case) = case.take() {
                        attach_case(&mut stack, case)?;
                    }
                }
                name => {
                    if DefectKind::from_element(name).is_some()
                        && let Some(done) = defect.take()
                        && let Some(case) = case.as_mut()
                    {
                        case.defects.push(done);
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() || case.is_some() {
        return Err(ReportError::Malformed("unexpected end of document".into()));
    }

    match roots.len() {
        0 => Err(ReportError::Malformed("no <testsuite> element".into())),
        1 => Ok(roots.remove(0)),
        _ => {
            let mut wrapper = Suite::new("");
            for suite in roots {
                wrapper.push_suite(suite);
            }
            Ok(wrapper)
        }
    }
}

fn attach_suite(stack: &mut [Suite], roots: &mut Vec<Suite>, suite: Suite) {
    match stack.last_mut() {
        Some(parent) => parent.push_suite(suite),
        None => roots.push(suite),
    }
}

fn attach_case(stack: &mut [Suite], case: TestCase) -> ReportResult<()> {
    let parent = stack
        .last_mut()
        .ok_or_else(|| ReportError::Malformed(format!("test case `{}` outside a suite", case.name)))?;
    parent.push_case(case);
    Ok(())
}

fn append_text(target: &mut String, text: &str) {
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(text);
}

fn suite_from(e: &BytesStart<'_>) -> ReportResult<Suite> {
    let mut suite = Suite::default();
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.as_ref() {
            b"name" => suite.name = value.into_owned(),
            b"file" => suite.file = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(suite)
}

fn case_from(e: &BytesStart<'_>) -> ReportResult<TestCase> {
    let mut case = TestCase::default();
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.as_ref() {
            b"name" => case.name = value.into_owned(),
            b"class" => case.class = Some(value.into_owned()),
            b"classname" => case.classname = Some(value.into_owned()),
            b"file" => case.file = Some(value.into_owned()),
            b"line" => case.line = value.trim().parse().ok(),
            b"assertions" => case.assertions = value.trim().parse().unwrap_or(0),
            b"time" => case.time = value.trim().parse().unwrap_or(0.0),
            _ => {}
        }
    }
    Ok(case)
}

fn defect_from(kind: DefectKind, e: &BytesStart<'_>) -> ReportResult<Defect> {
    let mut ty = String::new();
    let mut message = String::new();
    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"type" => ty = attr.unescape_value()?.into_owned(),
            b"message" => message = attr.unescape_value()?.into_owned(),
            _ => {}
        }
    }
    Ok(Defect::new(kind, ty, message))
}
