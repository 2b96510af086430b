//! Parsing of the annotation tool's captured process output.
//!
//! The remote process writes its combined stdout/stderr to a log file; each
//! poll reads the whole file and feeds it through [`parse`]. The tool tags
//! its messages with an uppercase keyword behind either a `HH:MM:SS`
//! timestamp or eight spaces of indentation; deeper-indented lines continue
//! the message above them. The wrapping `time -p` invocation contributes the
//! `real`/`user`/`sys` summary lines.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TAG_LINE: Regex = Regex::new(r"^(?:\d\d:\d\d:\d\d| {8}) ([A-Z]+)\s+(.+)$").unwrap();
    static ref CONTINUATION: Regex = Regex::new(r"^\s{8,}.+").unwrap();
    static ref REAL_TIME: Regex = Regex::new(r"^real \d.+").unwrap();
}

/// Structured signals extracted from one cumulative read of the process log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedOutput {
    /// Last progress string seen, e.g. "57%".
    pub progress: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub misc: Vec<String>,
    /// Wall-clock seconds reported by `time -p` for the whole invocation.
    pub real_seconds: Option<f64>,
}

impl ParsedOutput {
    pub fn is_empty(&self) -> bool {
        self.progress.is_none()
            && self.warnings.is_empty()
            && self.errors.is_empty()
            && self.misc.is_empty()
            && self.real_seconds.is_none()
    }

    pub fn warnings_text(&self) -> String {
        self.warnings.join("\n")
    }

    pub fn errors_text(&self) -> String {
        self.errors.join("\n")
    }

    pub fn misc_text(&self) -> String {
        self.misc.join("\n")
    }
}

enum Category {
    Warnings,
    Errors,
    Misc,
}

/// Classify the captured output of a remote process. Pure and stateless:
/// the same input always yields the same result.
pub fn parse(text: &str) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    let mut last_opened = Category::Misc;

    for line in text.lines() {
        if let Some(captures) = TAG_LINE.captures(line) {
            let tag = captures.get(1).map_or("", |m| m.as_str());
            let msg = captures.get(2).map_or("", |m| m.as_str()).trim();
            match tag {
                "PROGRESS" => parsed.progress = Some(msg.to_string()),
                "WARNING" => {
                    parsed.warnings.push(format!("WARNING {}", msg));
                    last_opened = Category::Warnings;
                }
                "ERROR" => {
                    parsed.errors.push(format!("ERROR {}", msg));
                    last_opened = Category::Errors;
                }
                _ => {
                    parsed.misc.push(format!("{} {}", tag, msg));
                    last_opened = Category::Misc;
                }
            }
        } else if CONTINUATION.is_match(line) {
            let target = match last_opened {
                Category::Warnings => &mut parsed.warnings,
                Category::Errors => &mut parsed.errors,
                Category::Misc => &mut parsed.misc,
            };
            target.push(line.trim().to_string());
        } else if REAL_TIME.is_match(line) {
            parsed.real_seconds = line[5..].trim().parse().ok();
        } else if line.starts_with("user") || line.starts_with("sys") {
            // time -p summary lines, not tool output.
        } else if !line.trim().is_empty() {
            parsed.misc.push(line.trim().to_string());
        }
    }

    // The tool emits no progress output at all on a no-op run.
    if parsed
        .misc
        .first()
        .map_or(false, |first| first.starts_with("Nothing to be done."))
    {
        parsed.progress = Some("100%".to_string());
    }

    parsed
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
12:00:01 PROGRESS 25%
12:00:02 WARNING  token model is stale
        and will be rebuilt on the next run
12:00:05 PROGRESS 57%
12:00:09 ERROR    segmenter failed on file a.txt
Unstructured diagnostic line
real 12.52
user 10.01
sys 1.20
";

    #[test]
    fn test_classifies_tagged_lines() {
        let parsed = parse(SAMPLE);
        assert_eq!(Some("57%".to_string()), parsed.progress);
        assert_eq!(
            vec![
                "WARNING token model is stale".to_string(),
                "and will be rebuilt on the next run".to_string(),
            ],
            parsed.warnings
        );
        assert_eq!(
            vec!["ERROR segmenter failed on file a.txt".to_string()],
            parsed.errors
        );
        assert_eq!(vec!["Unstructured diagnostic line".to_string()], parsed.misc);
    }

    #[test]
    fn test_real_time_captured_user_sys_ignored() {
        let parsed = parse(SAMPLE);
        assert_eq!(Some(12.52), parsed.real_seconds);
        assert!(!parsed.misc.iter().any(|l| l.starts_with("user")));
        assert!(!parsed.misc.iter().any(|l| l.starts_with("sys")));
    }

    #[test]
    fn test_indented_tag_lines() {
        let parsed = parse("         PROGRESS 100%");
        assert_eq!(Some("100%".to_string()), parsed.progress);
    }

    #[test]
    fn test_continuation_follows_last_opened_category() {
        let text = "\
12:00:09 ERROR    first problem
            more detail
12:00:10 WARNING  minor issue
            warning detail
";
        let parsed = parse(text);
        assert_eq!(
            vec!["ERROR first problem".to_string(), "more detail".to_string()],
            parsed.errors
        );
        assert_eq!(
            vec!["WARNING minor issue".to_string(), "warning detail".to_string()],
            parsed.warnings
        );
    }

    #[test]
    fn test_nothing_to_be_done_counts_as_complete() {
        let parsed = parse("Nothing to be done.\nreal 0.05\n");
        assert_eq!(Some("100%".to_string()), parsed.progress);
    }

    #[test]
    fn test_idempotent_on_identical_input() {
        assert_eq!(parse(SAMPLE), parse(SAMPLE));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse("").is_empty());
        assert!(parse("\n\n  \n").is_empty());
    }
}
