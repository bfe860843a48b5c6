//! Heuristic failure classification over emulation logs.
//!
//! Heuristics are rows in [`RULES`]; the engine only evaluates the table.
//! Patterns are case-insensitive regexes evaluated against the whole log
//! text, so they match anywhere in multi-line content.
use crate::util::truncate_string;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::sync::OnceLock;

/// Longest excerpt carried on a hypothesis.
const MAX_EXCERPT_BYTES: usize = 240;

/// One heuristic: when `pattern` matches (and `unless` does not), the
/// failure is plausibly explained by `reason`. Lower `rank` is more likely.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub reason: &'static str,
    pub pattern: &'static str,
    pub unless: Option<&'static str>,
    pub rank: u8,
}

pub const RULES: &[Rule] = &[
    Rule {
        reason: "Filesystem image build error",
        pattern: r"(mke2fs|e2fsck).*(error|aborted|unable|fail)|No such file or directory.*(root|image)|mount:.*failed",
        unless: None,
        rank: 10,
    },
    Rule {
        reason: "Architecture / binfmt issue",
        pattern: r"Unknown architecture|binfmt_misc|Exec format error|qemu-.*: Could not open|get architecture.*fail",
        unless: None,
        rank: 10,
    },
    Rule {
        reason: "QEMU boot/kernel failure",
        pattern: r"Kernel panic|Unable to mount root|Segmentation fault|qemu: .*error",
        unless: None,
        rank: 20,
    },
    Rule {
        reason: "Network bridging/tap error",
        pattern: r"(tap|bridge|br_add_if|br_dev_ioctl|SIOCSIF).* (fail|error|denied)|Network unreachable",
        unless: None,
        rank: 30,
    },
    Rule {
        reason: "Permission / capability problem",
        pattern: r"Permission denied|Operation not permitted|cap_net_admin",
        unless: None,
        rank: 30,
    },
    Rule {
        reason: "Web service did not come up",
        pattern: r"Web service on .* (down|failed)|httpd.*fail|lighttpd.*fail|nginx.*fail",
        unless: None,
        rank: 40,
    },
    Rule {
        reason: "Network reachable but web service not detected",
        pattern: r"Network reachable on \d+\.\d+\.\d+\.\d+",
        unless: Some(r"Web service on "),
        rank: 40,
    },
    Rule {
        reason: "Timeout / watchdog",
        pattern: r"\b(timeout|timed out)\b",
        unless: None,
        rank: 50,
    },
];

/// A ranked explanation for a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureHypothesis {
    pub reason: String,
    pub rank: u8,
    /// The log line that triggered the rule.
    pub excerpt: String,
}

struct CompiledRule {
    rule: Rule,
    pattern: Regex,
    unless: Option<Regex>,
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
}

fn compiled_rules() -> &'static [CompiledRule] {
    static COMPILED: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|rule| {
                let pattern = match compile(rule.pattern) {
                    Ok(pattern) => pattern,
                    Err(err) => {
                        tracing::error!(reason = rule.reason, error = %err, "skipping invalid rule");
                        return None;
                    }
                };
                let unless = match rule.unless.map(compile).transpose() {
                    Ok(unless) => unless,
                    Err(err) => {
                        tracing::error!(reason = rule.reason, error = %err, "skipping invalid rule");
                        return None;
                    }
                };
                Some(CompiledRule {
                    rule: *rule,
                    pattern,
                    unless,
                })
            })
            .collect()
    })
}

/// Map log text to hypotheses, most likely first.
///
/// Equal ranks keep table order. An empty result means no heuristic
/// matched; callers report that as an unknown failure cause.
pub fn classify(log_text: &str) -> Vec<FailureHypothesis> {
    let mut hypotheses: Vec<FailureHypothesis> = compiled_rules()
        .iter()
        .filter_map(|compiled| {
            let found = compiled.pattern.find(log_text)?;
            if compiled
                .unless
                .as_ref()
                .is_some_and(|unless| unless.is_match(log_text))
            {
                return None;
            }
            Some(FailureHypothesis {
                reason: compiled.rule.reason.to_string(),
                rank: compiled.rule.rank,
                excerpt: excerpt_around(log_text, found.start(), found.end()),
            })
        })
        .collect();
    // sort_by_key is stable, so ties stay in declaration order.
    hypotheses.sort_by_key(|hypothesis| hypothesis.rank);
    hypotheses
}

/// The full line(s) spanned by a match, trimmed and bounded.
fn excerpt_around(text: &str, start: usize, end: usize) -> String {
    let line_start = text[..start].rfind('\n').map_or(0, |idx| idx + 1);
    let line_end = text[end..].find('\n').map_or(text.len(), |idx| end + idx);
    truncate_string(text[line_start..line_end].trim(), MAX_EXCERPT_BYTES)
}
