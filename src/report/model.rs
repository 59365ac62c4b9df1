//! In-memory report tree.
//!
//! Mirrors the JUnit layout: suites contain test cases and nested suites, in
//! document order. Counts are never stored on a suite; they are always
//! recomputed from the test cases underneath, because partial reports from
//! crashed units may carry inconsistent rollups.

use std::fmt;

use serde::Serialize;

/// Kind of a defect attached to a test case.
///
/// Variants are declared in feedback priority order: when a test case
/// carries several defects, the first kind in this list decides its
/// progress character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectKind {
    Error,
    Failure,
    Risky,
    Warning,
    Skipped,
}

impl DefectKind {
    /// All kinds, in the order defect listings are printed.
    pub const LISTING_ORDER: [DefectKind; 5] = [
        DefectKind::Error,
        DefectKind::Failure,
        DefectKind::Warning,
        DefectKind::Risky,
        DefectKind::Skipped,
    ];

    /// Progress character for a test case whose worst defect is this kind.
    pub fn symbol(self) -> char {
        match self {
            DefectKind::Error => 'E',
            DefectKind::Failure => 'F',
            DefectKind::Risky => 'R',
            DefectKind::Warning => 'W',
            DefectKind::Skipped => 'S',
        }
    }

    /// XML element name.
    pub fn element(self) -> &'static str {
        match self {
            DefectKind::Error => "error",
            DefectKind::Failure => "failure",
            DefectKind::Risky => "risky",
            DefectKind::Warning => "warning",
            DefectKind::Skipped => "skipped",
        }
    }

    /// Parses an XML element name.
    pub fn from_element(name: &[u8]) -> Option<Self> {
        match name {
            b"error" => Some(DefectKind::Error),
            b"failure" => Some(DefectKind::Failure),
            b"risky" => Some(DefectKind::Risky),
            b"warning" => Some(DefectKind::Warning),
            b"skipped" => Some(DefectKind::Skipped),
            _ => None,
        }
    }

    /// Human-readable noun, singular or plural.
    pub fn noun(self, count: usize) -> &'static str {
        let one = count == 1;
        match self {
            DefectKind::Error if one => "error",
            DefectKind::Error => "errors",
            DefectKind::Failure if one => "failure",
            DefectKind::Failure => "failures",
            DefectKind::Risky if one => "risky test",
            DefectKind::Risky => "risky tests",
            DefectKind::Warning if one => "warning",
            DefectKind::Warning => "warnings",
            DefectKind::Skipped if one => "skipped test",
            DefectKind::Skipped => "skipped tests",
        }
    }
}

impl fmt::Display for DefectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element())
    }
}

/// A typed defect: error, failure, warning, skip or risky marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Defect {
    pub kind: DefectKind,

    /// The `type` attribute, usually an exception class.
    #[serde(rename = "type")]
    pub ty: String,

    /// Message and trace.
    pub text: String,
}

impl Defect {
    pub fn new(kind: DefectKind, ty: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            ty: ty.into(),
            text: text.into(),
        }
    }
}

/// A single test case.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestCase {
    pub name: String,
    pub class: Option<String>,
    pub classname: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub assertions: usize,

    /// Elapsed seconds.
    pub time: f64,

    pub defects: Vec<Defect>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_assertions(mut self, assertions: usize) -> Self {
        self.assertions = assertions;
        self
    }

    pub fn with_defect(mut self, defect: Defect) -> Self {
        self.defects.push(defect);
        self
    }

    /// The most severe defect kind on this case.
    pub fn worst(&self) -> Option<DefectKind> {
        self.defects.iter().map(|d| d.kind).min()
    }

    /// Progress character: the worst defect's symbol, or `.` for a pass.
    pub fn symbol(&self) -> char {
        self.worst().map(DefectKind::symbol).unwrap_or('.')
    }

    /// `Class::name`, falling back to the bare name.
    pub fn qualified_name(&self) -> String {
        match self.class.as_deref().or(self.classname.as_deref()) {
            Some(class) if !class.is_empty() => format!("{}::{}", class, self.name),
            _ => self.name.clone(),
        }
    }
}

/// Child of a suite, in document order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum Node {
    Suite(Suite),
    Case(TestCase),
}

/// A test suite.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Suite {
    pub name: String,
    pub file: Option<String>,
    pub children: Vec<Node>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn push_suite(&mut self, suite: Suite) {
        self.children.push(Node::Suite(suite));
    }

    pub fn push_case(&mut self, case: TestCase) {
        self.children.push(Node::Case(case));
    }

    /// Builder form of [`push_case`](Self::push_case).
    pub fn with_case(mut self, case: TestCase) -> Self {
        self.push_case(case);
        self
    }

    /// Direct child suites.
    pub fn suites(&self) -> impl Iterator<Item = &Suite> {
        self.children.iter().filter_map(|child| match child {
            Node::Suite(suite) => Some(suite),
            Node::Case(_) => None,
        })
    }

    /// Every test case underneath, depth-first in document order.
    pub fn cases(&self) -> Vec<&TestCase> {
        let mut out = Vec::new();
        self.collect_cases(&mut out);
        out
    }

    fn collect_cases<'a>(&'a self, out: &mut Vec<&'a TestCase>) {
        for child in &self.children {
            match child {
                Node::Suite(suite) => suite.collect_cases(out),
                Node::Case(case) => out.push(case),
            }
        }
    }

    /// Counts recomputed from the test cases.
    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for case in self.cases() {
            totals.add_case(case);
        }
        totals
    }
}

/// Aggregate counts over a set of test cases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
    pub tests: usize,
    pub assertions: usize,
    pub failures: usize,
    pub errors: usize,
    pub warnings: usize,
    pub skipped: usize,
    pub risky: usize,

    /// Summed test time in seconds.
    pub time: f64,
}

impl Totals {
    pub fn add_case(&mut self, case: &TestCase) {
        self.tests += 1;
        self.assertions += case.assertions;
        self.time += case.time;
        for defect in &case.defects {
            *self.count_mut(defect.kind) += 1;
        }
    }

    /// Adds another set of totals to this one.
    pub fn add(&mut self, other: &Totals) {
        self.tests += other.tests;
        self.assertions += other.assertions;
        self.failures += other.failures;
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.skipped += other.skipped;
        self.risky += other.risky;
        self.time += other.time;
    }

    pub fn count(&self, kind: DefectKind) -> usize {
        match kind {
            DefectKind::Error => self.errors,
            DefectKind::Failure => self.failures,
            DefectKind::Risky => self.risky,
            DefectKind::Warning => self.warnings,
            DefectKind::Skipped => self.skipped,
        }
    }

    fn count_mut(&mut self, kind: DefectKind) -> &mut usize {
        match kind {
            DefectKind::Error => &mut self.errors,
            DefectKind::Failure => &mut self.failures,
            DefectKind::Risky => &mut self.risky,
            DefectKind::Warning => &mut self.warnings,
            DefectKind::Skipped => &mut self.skipped,
        }
    }

    /// No failures and no errors. Warnings, skips and risky tests do not count.
    pub fn is_successful(&self) -> bool {
        self.failures == 0 && self.errors == 0
    }
}
