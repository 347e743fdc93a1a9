//! TAP report parsing
//!
//! Accepts TAP version 13 and later. Lines that are neither a version, plan,
//! test point, diagnostic, YAML block nor `Bail out!` are ignored.

use crate::result::{Directive, TestLine, Testsuite};
use thiserror::Error;

const MIN_VERSION: u32 = 13;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReportError {
    #[error("empty report")]
    Empty,

    #[error("expected TAP version line, got {0:?}")]
    MissingVersion(String),

    #[error("invalid plan {0:?}")]
    InvalidPlan(String),

    #[error("more than one plan")]
    DuplicatePlan,

    #[error("no plan found")]
    MissingPlan,
}

/// Parse the combined output of a test executable
pub fn parse(input: &[u8]) -> Result<Testsuite, ReportError> {
    let text = String::from_utf8_lossy(input);
    let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));

    let version = lines
        .by_ref()
        .find(|l| !l.trim().is_empty())
        .ok_or(ReportError::Empty)?;
    parse_version(version)?;

    let mut parser = Parser::default();
    for line in lines {
        if !parser.feed(line)? {
            break;
        }
    }
    parser.finish()
}

fn parse_version(line: &str) -> Result<u32, ReportError> {
    let invalid = || ReportError::MissingVersion(line.to_string());
    let version = line
        .trim()
        .strip_prefix("TAP version ")
        .ok_or_else(invalid)?
        .trim()
        .parse::<u32>()
        .map_err(|_| invalid())?;
    if version < MIN_VERSION {
        return Err(invalid());
    }
    Ok(version)
}

#[derive(Default)]
struct Parser {
    tests: Vec<TestLine>,
    plan: Option<u64>,
    bailed: bool,
    /// Indentation of the open YAML block
    yaml: Option<usize>,
}

impl Parser {
    /// Returns `false` once the stream must not be read any further
    fn feed(&mut self, line: &str) -> Result<bool, ReportError> {
        if let Some(indent) = self.yaml {
            if line.trim() == "..." {
                self.yaml = None;
            } else {
                let body = strip_indent(line, indent);
                self.annotate(body);
            }
            return Ok(true);
        }

        let trimmed = line.trim_start();

        if trimmed.starts_with("---") && trimmed.trim_end() == "---" && !self.tests.is_empty() {
            self.yaml = Some(indent_width(line));
        } else if trimmed.starts_with("1..") {
            if self.plan.is_some() {
                return Err(ReportError::DuplicatePlan);
            }
            self.plan = Some(parse_plan(trimmed)?);
        } else if trimmed.starts_with("Bail out!") {
            self.bailed = true;
            return Ok(false);
        } else if let Some(test) = parse_test(trimmed) {
            self.tests.push(test);
        } else if let Some(comment) = trimmed.strip_prefix('#') {
            let comment = comment.strip_prefix(' ').unwrap_or(comment);
            self.annotate(comment);
        }
        Ok(true)
    }

    /// Append a diagnostic line to the most recent test point
    fn annotate(&mut self, text: &str) {
        let Some(test) = self.tests.last_mut() else {
            return;
        };
        if !test.diagnostic.is_empty() {
            test.diagnostic.push('\n');
        }
        test.diagnostic.push_str(text);
    }

    fn finish(self) -> Result<Testsuite, ReportError> {
        if self.bailed {
            return Ok(Testsuite {
                ok: false,
                tests: self.tests,
                plan: self.plan,
            });
        }

        let plan = self.plan.ok_or(ReportError::MissingPlan)?;
        let complete = u64::try_from(self.tests.len()).is_ok_and(|n| n == plan);
        let ok = complete && self.tests.iter().all(TestLine::passed);

        Ok(Testsuite {
            ok,
            tests: self.tests,
            plan: Some(plan),
        })
    }
}

fn parse_plan(line: &str) -> Result<u64, ReportError> {
    let invalid = || ReportError::InvalidPlan(line.to_string());
    let rest = line.strip_prefix("1..").ok_or_else(invalid)?;
    let (count, reason) = match rest.find('#') {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    };
    if let Some(reason) = reason {
        if !reason.trim_start().to_ascii_uppercase().starts_with("SKIP") {
            return Err(invalid());
        }
    }
    count.trim().parse().map_err(|_| invalid())
}

fn parse_test(line: &str) -> Option<TestLine> {
    let (ok, rest) = if let Some(rest) = line.strip_prefix("not ok") {
        (false, rest)
    } else if let Some(rest) = line.strip_prefix("ok") {
        (true, rest)
    } else {
        return None;
    };
    if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        return None;
    }

    let rest = rest.trim_start();
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let number = rest[..digits].parse().ok();
    let rest = rest[digits..].trim_start();
    let rest = match rest.strip_prefix('-') {
        Some(after) if after.is_empty() || after.starts_with(char::is_whitespace) => {
            after.trim_start()
        }
        _ => rest,
    };

    let (description, directive) = match split_directive(rest) {
        Some((description, directive)) => (description, Some(directive)),
        None => (rest.trim_end(), None),
    };

    Some(TestLine {
        number,
        ok,
        description: description.replace("\\#", "#"),
        diagnostic: String::new(),
        directive,
    })
}

/// Split `desc # TODO reason` into its parts; `\#` does not start a directive
fn split_directive(text: &str) -> Option<(&str, Directive)> {
    let bytes = text.as_bytes();
    let pos = (0..bytes.len()).find(|&i| bytes[i] == b'#' && (i == 0 || bytes[i - 1] != b'\\'))?;

    let comment = text[pos + 1..].trim_start();
    let keyword = comment.get(..4)?;
    let reason = comment[4..].trim().to_string();
    let directive = if keyword.eq_ignore_ascii_case("TODO") {
        Directive::Todo(reason)
    } else if keyword.eq_ignore_ascii_case("SKIP") {
        Directive::Skip(reason)
    } else {
        return None;
    };
    Some((text[..pos].trim_end(), directive))
}

/// Leading spaces and tabs; other whitespace belongs to the content
fn indent_width(line: &str) -> usize {
    line.bytes().take_while(|b| matches!(b, b' ' | b'\t')).count()
}

fn strip_indent(line: &str, indent: usize) -> &str {
    &line[indent_width(line).min(indent)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(s: &str) -> Result<Testsuite, ReportError> {
        parse(s.as_bytes())
    }

    #[test]
    fn passing_suite() {
        let suite = parse_str("TAP version 13\n1..2\nok 1 - first\nok 2 second\n").unwrap();
        assert!(suite.ok);
        assert_eq!(suite.plan, Some(2));
        assert_eq!(suite.tests.len(), 2);
        assert_eq!(suite.tests[0].description, "first");
        assert_eq!(suite.tests[0].number, Some(1));
        assert_eq!(suite.tests[1].description, "second");
    }

    #[test]
    fn failing_test_fails_suite() {
        let suite = parse_str("TAP version 13\nok 1 - a\nnot ok 2 - b\n1..2\n").unwrap();
        assert!(!suite.ok);
        assert!(suite.tests[0].ok);
        assert!(!suite.tests[1].ok);
    }

    #[test]
    fn plan_mismatch_fails_suite() {
        let suite = parse_str("TAP version 13\n1..3\nok 1\nok 2\n").unwrap();
        assert!(!suite.ok);
    }

    #[test]
    fn diagnostics_attach_to_previous_test() {
        let input = "TAP version 13\n1..2\nok 1 - a\nnot ok 2 - b\n# expected 1\n# got 2\n";
        let suite = parse_str(input).unwrap();
        assert_eq!(suite.tests[0].diagnostic, "");
        assert_eq!(suite.tests[1].diagnostic, "expected 1\ngot 2");
    }

    #[test]
    fn comments_before_any_test_are_dropped() {
        let suite = parse_str("TAP version 13\n# setup\n1..1\nok 1\n").unwrap();
        assert!(suite.ok);
        assert_eq!(suite.tests[0].diagnostic, "");
    }

    #[test]
    fn yaml_block_is_diagnostic() {
        let input = "TAP version 13\n1..1\nnot ok 1 - x\n  ---\n  message: boom\n  line: 4\n  ...\n";
        let suite = parse_str(input).unwrap();
        assert_eq!(suite.tests[0].diagnostic, "message: boom\nline: 4");
    }

    #[test]
    fn yaml_block_keeps_unicode_whitespace() {
        let input = "TAP version 13\n1..1\nnot ok 1 - x\n ---\n\u{a0}message\n \u{3000}line\n ...\n";
        let suite = parse_str(input).unwrap();
        assert!(!suite.ok);
        assert_eq!(suite.tests[0].diagnostic, "\u{a0}message\n\u{3000}line");
    }

    #[test]
    fn todo_and_skip_count_as_passed() {
        let input = "TAP version 13\n1..2\nnot ok 1 - later # TODO not done\nok 2 - x # skip no db\n";
        let suite = parse_str(input).unwrap();
        assert!(suite.ok);
        assert_eq!(suite.tests[0].description, "later");
        assert_eq!(
            suite.tests[0].directive,
            Some(Directive::Todo("not done".into()))
        );
        assert_eq!(suite.tests[1].directive, Some(Directive::Skip("no db".into())));
    }

    #[test]
    fn escaped_hash_stays_in_description() {
        let suite = parse_str("TAP version 13\n1..1\nok 1 - issue \\#12\n").unwrap();
        assert_eq!(suite.tests[0].description, "issue #12");
        assert!(suite.tests[0].directive.is_none());
    }

    #[test]
    fn skipped_plan() {
        let suite = parse_str("TAP version 13\n1..0 # SKIP no tests\n").unwrap();
        assert!(suite.ok);
        assert!(suite.tests.is_empty());
    }

    #[test]
    fn bail_out_stops_parsing() {
        let suite = parse_str("TAP version 13\n1..3\nok 1\nBail out! db down\nok 2\n").unwrap();
        assert!(!suite.ok);
        assert_eq!(suite.tests.len(), 1);
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let suite = parse_str("\nTAP version 14\nrandom noise\n1..1\nok\n").unwrap();
        assert!(suite.ok);
        assert_eq!(suite.tests[0].number, None);
        assert_eq!(suite.tests[0].description, "");
    }

    #[test]
    fn okay_is_not_a_test_line() {
        let suite = parse_str("TAP version 13\n1..1\nokay then\nok 1\n").unwrap();
        assert_eq!(suite.tests.len(), 1);
        assert!(suite.ok);
    }

    #[test]
    fn errors() {
        assert_eq!(parse_str(""), Err(ReportError::Empty));
        assert_eq!(parse_str("\n  \n"), Err(ReportError::Empty));
        assert!(matches!(
            parse_str("ok 1\n1..1\n"),
            Err(ReportError::MissingVersion(_))
        ));
        assert!(matches!(
            parse_str("TAP version 12\n1..1\nok 1\n"),
            Err(ReportError::MissingVersion(_))
        ));
        assert!(matches!(
            parse_str("TAP version 13\n1..x\n"),
            Err(ReportError::InvalidPlan(_))
        ));
        assert_eq!(
            parse_str("TAP version 13\n1..1\nok 1\n1..1\n"),
            Err(ReportError::DuplicatePlan)
        );
        assert_eq!(
            parse_str("TAP version 13\nok 1\n"),
            Err(ReportError::MissingPlan)
        );
    }
}
