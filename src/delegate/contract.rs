//! Output contracts: the fields each delegation must report, and the tiered
//! parser that recovers them.
//!
//! Tier 1 reads a JSON block. Missing fields fall through to tier 2, which
//! looks for well-known patterns in free-form output (`key: value` lines,
//! pull request URLs, markdown paths) and for new files in the worktree.
//! Anything still missing makes the result unparseable; values are never
//! guessed.

use glob::glob;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::SystemTime;

use super::extract::find_json_block;
use crate::phase::{Outcome, Phase};

static PR_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/[\w.-]+/[\w.-]+/pull/(\d+)").expect("valid regex")
});

static MARKDOWN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s`'(])((?:[\w.-]+/)+[\w.-]+\.md)\b").expect("valid regex"));

static FAILURE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:fail(?:s|ed|ing|ures?)?|errors?|broken)\b").expect("valid regex"));

static ZERO_FAILURES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:0|no|zero)\s+(?:fail(?:s|ed|ing|ures?)?|errors?)\b").expect("valid regex")
});

static TEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s+passed(?:[,;\s]+(\d+)\s+failed)?").expect("valid regex")
});

/// What a single delegation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Plan,
    Build,
    Review,
    PullRequest,
    Test,
    Document,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Plan => "plan",
            ContractKind::Build => "build",
            ContractKind::Review => "review",
            ContractKind::PullRequest => "pull_request",
            ContractKind::Test => "test",
            ContractKind::Document => "document",
        }
    }

    /// Slash command the agent is asked to run.
    pub fn command(&self) -> &'static str {
        match self {
            ContractKind::Plan => "/plan",
            ContractKind::Build => "/implement",
            ContractKind::Review => "/review",
            ContractKind::PullRequest => "/pull_request",
            ContractKind::Test => "/test",
            ContractKind::Document => "/document",
        }
    }

    /// The delegations making up one orchestration step of `phase`.
    pub fn step_for(phase: Phase) -> Vec<DelegationSpec> {
        match phase {
            Phase::Plan => vec![DelegationSpec::new(ContractKind::Plan)],
            Phase::Build => vec![DelegationSpec::new(ContractKind::Build)],
            Phase::Review => vec![
                DelegationSpec::new(ContractKind::Review),
                DelegationSpec::new(ContractKind::PullRequest),
            ],
            Phase::Test => vec![DelegationSpec::new(ContractKind::Test)],
            Phase::Document => vec![DelegationSpec::new(ContractKind::Document)],
        }
    }

    pub fn contract(&self) -> OutputContract {
        match self {
            ContractKind::Plan => OutputContract::new(*self, &["plan_file"]).with_glob("specs/*.md"),
            ContractKind::Build => {
                OutputContract::new(*self, &["validation_level", "lint", "typecheck", "tests"])
            }
            ContractKind::Review => OutputContract::new(*self, &["success", "review_summary"]),
            ContractKind::PullRequest => OutputContract::new(*self, &["pr_number", "pr_url"]),
            ContractKind::Test => OutputContract::new(*self, &["passed", "failed"]),
            ContractKind::Document => {
                OutputContract::new(*self, &["doc_file"]).with_glob("docs/*.md")
            }
        }
    }
}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delegation in a step, optionally sequenced after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationSpec {
    pub kind: ContractKind,
    pub after: Option<ContractKind>,
}

impl DelegationSpec {
    pub fn new(kind: ContractKind) -> Self {
        Self { kind, after: None }
    }

    pub fn after(mut self, dependency: ContractKind) -> Self {
        self.after = Some(dependency);
        self
    }
}

/// Which tier produced the fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseTier {
    Structured,
    Pattern,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub fields: BTreeMap<String, Value>,
    pub tier: ParseTier,
}

impl ParsedOutput {
    /// Fields flattened to artifact strings.
    pub fn artifacts(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), s)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub missing: Vec<String>,
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "missing required fields: {}", self.missing.join(", "))
    }
}

/// Required fields for one delegation kind.
#[derive(Debug, Clone)]
pub struct OutputContract {
    pub kind: ContractKind,
    pub required: Vec<&'static str>,
    /// Worktree-relative glob for files the delegation is expected to create
    pub file_glob: Option<&'static str>,
}

impl OutputContract {
    pub fn new(kind: ContractKind, required: &[&'static str]) -> Self {
        Self {
            kind,
            required: required.to_vec(),
            file_glob: None,
        }
    }

    pub fn with_glob(mut self, pattern: &'static str) -> Self {
        self.file_glob = Some(pattern);
        self
    }

    /// Parse `text` against the contract. `worktree` and `since` enable the
    /// new-file lookup of tier 2.
    pub fn parse(
        &self,
        text: &str,
        worktree: Option<&Path>,
        since: Option<SystemTime>,
    ) -> Result<ParsedOutput, ParseFailure> {
        let mut fields: BTreeMap<String, Value> = find_json_block(text)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default();

        if self.missing(&fields).is_empty() {
            return Ok(ParsedOutput {
                fields,
                tier: ParseTier::Structured,
            });
        }

        for (key, value) in self.extract_patterns(text, worktree, since) {
            fields.entry(key).or_insert(value);
        }

        let missing = self.missing(&fields);
        if missing.is_empty() {
            Ok(ParsedOutput {
                fields,
                tier: ParseTier::Pattern,
            })
        } else {
            Err(ParseFailure { missing })
        }
    }

    fn missing(&self, fields: &BTreeMap<String, Value>) -> Vec<String> {
        self.required
            .iter()
            .filter(|k| fields.get(**k).is_none_or(Value::is_null))
            .map(|k| k.to_string())
            .collect()
    }

    fn extract_patterns(
        &self,
        text: &str,
        worktree: Option<&Path>,
        since: Option<SystemTime>,
    ) -> BTreeMap<String, Value> {
        let mut found = BTreeMap::new();

        for key in &self.required {
            if let Some(value) = key_value_line(text, key) {
                found.insert(key.to_string(), Value::String(value));
            }
        }

        match self.kind {
            ContractKind::PullRequest => {
                if let Some(c) = PR_URL.captures_iter(text).last() {
                    found
                        .entry("pr_url".to_string())
                        .or_insert_with(|| Value::String(c[0].to_string()));
                    if let Ok(n) = c[1].parse::<u64>() {
                        found.entry("pr_number".to_string()).or_insert(Value::from(n));
                    }
                }
            }
            ContractKind::Test => {
                if let Some(c) = TEST_SUMMARY.captures_iter(text).last() {
                    let passed = c[1].parse::<u64>().unwrap_or(0);
                    let failed = c.get(2).and_then(|m| m.as_str().parse::<u64>().ok()).unwrap_or(0);
                    found.entry("passed".to_string()).or_insert(Value::from(passed));
                    found.entry("failed".to_string()).or_insert(Value::from(failed));
                }
            }
            _ => {}
        }

        if let Some(key) = self.path_field()
            && !found.contains_key(key)
        {
            let path = MARKDOWN_PATH
                .captures_iter(text)
                .last()
                .map(|c| c[1].to_string())
                .or_else(|| self.newest_matching_file(worktree, since));
            if let Some(path) = path {
                found.insert(key.to_string(), Value::String(path));
            }
        }

        found
    }

    /// Field holding a produced file path, when the contract has one.
    fn path_field(&self) -> Option<&'static str> {
        match self.kind {
            ContractKind::Plan => Some("plan_file"),
            ContractKind::Document => Some("doc_file"),
            _ => None,
        }
    }

    fn newest_matching_file(&self, worktree: Option<&Path>, since: Option<SystemTime>) -> Option<String> {
        let root = worktree?;
        let pattern = root.join(self.file_glob?);
        let entries = glob(&pattern.to_string_lossy()).ok()?;

        entries
            .flatten()
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                if since.is_some_and(|s| modified < s) {
                    return None;
                }
                Some((modified, path))
            })
            .max_by_key(|(modified, _)| *modified)
            .and_then(|(_, path)| {
                path.strip_prefix(root)
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            })
    }

    /// Decide the outcome of a successfully parsed delegation.
    pub fn judge(&self, parsed: &ParsedOutput) -> (Outcome, Option<String>) {
        let fields = &parsed.fields;
        if let Some(success) = fields.get("success") {
            match check_verdict(success) {
                CheckVerdict::Passed | CheckVerdict::Skipped => {}
                CheckVerdict::Failed => {
                    let reason = fields
                        .get("review_summary")
                        .or_else(|| fields.get("error"))
                        .map(value_text)
                        .unwrap_or_else(|| format!("{} reported success=false", self.kind));
                    return (Outcome::Failure, Some(reason));
                }
                CheckVerdict::Ambiguous => {
                    return (
                        Outcome::Unparseable,
                        Some(format!("{} reported success={}", self.kind, value_text(success))),
                    );
                }
            }
        }

        match self.kind {
            ContractKind::Build => {
                let mut failed = Vec::new();
                let mut unclear = Vec::new();
                for key in ["lint", "typecheck", "tests"] {
                    let Some(value) = fields.get(key) else {
                        continue;
                    };
                    match check_verdict(value) {
                        CheckVerdict::Passed | CheckVerdict::Skipped => {}
                        CheckVerdict::Failed => failed.push(key),
                        CheckVerdict::Ambiguous => unclear.push(format!("{}={}", key, value_text(value))),
                    }
                }
                if !failed.is_empty() {
                    return (
                        Outcome::Failure,
                        Some(format!("build validation failed: {}", failed.join(", "))),
                    );
                }
                if !unclear.is_empty() {
                    return (
                        Outcome::Unparseable,
                        Some(format!("build validation unclear: {}", unclear.join(", "))),
                    );
                }
            }
            ContractKind::Review => {
                if let Some(Value::Array(issues)) = fields.get("review_issues") {
                    let blockers = issues
                        .iter()
                        .filter(|i| i.get("issue_severity").and_then(Value::as_str) == Some("blocker"))
                        .count();
                    if blockers > 0 {
                        return (
                            Outcome::Failure,
                            Some(format!("review found {} blocker issue(s)", blockers)),
                        );
                    }
                }
            }
            ContractKind::Test => {
                let failed = fields.get("failed").and_then(value_count).unwrap_or(0);
                if failed > 0 {
                    return (Outcome::Failure, Some(format!("{} test(s) failed", failed)));
                }
            }
            _ => {}
        }
        (Outcome::Success, None)
    }
}

/// `key: value` or `key = value` on its own line, optionally bulleted.
fn key_value_line(text: &str, key: &str) -> Option<String> {
    let pattern = format!(
        r"(?im)^\s*(?:[-*]\s*)?\**{}\**\s*[:=]\s*(.+?)\s*$",
        regex::escape(key)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures_iter(text)
        .last()
        .map(|c| c[1].trim_matches(|ch| ch == '`' || ch == '"').to_string())
        .filter(|v| !v.is_empty())
}

/// How a reported check (`lint`, `tests`, `success`, ...) reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckVerdict {
    Passed,
    /// Not run at this validation level
    Skipped,
    Failed,
    Ambiguous,
}

/// Only explicit pass values pass. Any mention of a failure or error fails,
/// and everything else is ambiguous.
fn check_verdict(value: &Value) -> CheckVerdict {
    let text = match value {
        Value::Bool(true) => return CheckVerdict::Passed,
        Value::Bool(false) => return CheckVerdict::Failed,
        Value::String(s) => s.trim().to_lowercase(),
        _ => return CheckVerdict::Ambiguous,
    };
    if FAILURE_WORD.is_match(&ZERO_FAILURES.replace_all(&text, "")) {
        return CheckVerdict::Failed;
    }
    let lead = text
        .split(|c: char| !c.is_alphanumeric() && c != '/')
        .find(|w| !w.is_empty())
        .unwrap_or("");
    match lead {
        "true" | "pass" | "passed" | "passing" | "ok" | "success" | "succeeded" => CheckVerdict::Passed,
        "skip" | "skipped" | "n/a" => CheckVerdict::Skipped,
        "false" | "no" => CheckVerdict::Failed,
        _ => CheckVerdict::Ambiguous,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_structured_build_output() {
        let contract = ContractKind::Build.contract();
        let text = "Done.\n```json\n{\"validation_level\": 2, \"lint\": \"pass\", \"typecheck\": \"pass\", \"tests\": \"pass\"}\n```";
        let parsed = contract.parse(text, None, None).unwrap();
        assert_eq!(parsed.tier, ParseTier::Structured);
        assert_eq!(parsed.artifacts()["validation_level"], "2");
        assert_eq!(contract.judge(&parsed).0, Outcome::Success);
    }

    #[test]
    fn test_build_failure_is_judged() {
        let contract = ContractKind::Build.contract();
        let text = r#"{"validation_level": 1, "lint": "pass", "typecheck": "fail", "tests": false}"#;
        let parsed = contract.parse(text, None, None).unwrap();
        let (outcome, reason) = contract.judge(&parsed);
        assert_eq!(outcome, Outcome::Failure);
        assert!(reason.unwrap().contains("typecheck, tests"));
    }

    #[test]
    fn test_free_text_failures_are_not_success() {
        let contract = ContractKind::Build.contract();
        let text = "validation_level: 1\nlint: pass\ntypecheck: pass\ntests: 3 failed\n";
        let parsed = contract.parse(text, None, None).unwrap();
        assert_eq!(parsed.tier, ParseTier::Pattern);
        let (outcome, reason) = contract.judge(&parsed);
        assert_eq!(outcome, Outcome::Failure);
        assert!(reason.unwrap().contains("tests"));

        let text = "validation_level: 2\nlint: FAILED (2 errors)\ntypecheck: pass (0 issues)\ntests: passed 133/133\n";
        let parsed = contract.parse(text, None, None).unwrap();
        let (outcome, reason) = contract.judge(&parsed);
        assert_eq!(outcome, Outcome::Failure);
        assert_eq!(reason.unwrap(), "build validation failed: lint");
    }

    #[test]
    fn test_unclear_build_checks_are_unparseable() {
        let contract = ContractKind::Build.contract();
        let text = r#"{"validation_level": 1, "lint": "pass", "typecheck": "unknown", "tests": "skipped"}"#;
        let parsed = contract.parse(text, None, None).unwrap();
        let (outcome, reason) = contract.judge(&parsed);
        assert_eq!(outcome, Outcome::Unparseable);
        assert_eq!(reason.unwrap(), "build validation unclear: typecheck=unknown");
    }

    #[test]
    fn test_check_verdicts() {
        assert_eq!(check_verdict(&Value::Bool(true)), CheckVerdict::Passed);
        assert_eq!(check_verdict(&Value::from("OK")), CheckVerdict::Passed);
        assert_eq!(check_verdict(&Value::from("skipped")), CheckVerdict::Skipped);
        assert_eq!(check_verdict(&Value::from("3 failed")), CheckVerdict::Failed);
        assert_eq!(check_verdict(&Value::from("passed with 1 error")), CheckVerdict::Failed);
        assert_eq!(check_verdict(&Value::from("no")), CheckVerdict::Failed);
        assert_eq!(check_verdict(&Value::from("pass (0 failed, no errors)")), CheckVerdict::Passed);
        assert_eq!(check_verdict(&Value::from("mostly")), CheckVerdict::Ambiguous);
        assert_eq!(check_verdict(&Value::from(3)), CheckVerdict::Ambiguous);
    }

    #[test]
    fn test_missing_fields_fall_back_to_key_value_lines() {
        let contract = ContractKind::Build.contract();
        let text = "{\"lint\": \"pass\"}\n\n- validation_level: 3\n- typecheck: pass\n**tests**: pass\n";
        let parsed = contract.parse(text, None, None).unwrap();
        assert_eq!(parsed.tier, ParseTier::Pattern);
        assert_eq!(parsed.artifacts()["validation_level"], "3");
        assert_eq!(parsed.artifacts()["lint"], "pass");
    }

    #[test]
    fn test_missing_fields_without_patterns_are_unparseable() {
        let contract = ContractKind::Build.contract();
        let err = contract
            .parse(r#"{"lint": "pass", "tests": "pass"}"#, None, None)
            .unwrap_err();
        assert_eq!(err.missing, vec!["validation_level", "typecheck"]);
        assert!(err.to_string().contains("validation_level"));
    }

    #[test]
    fn test_pull_request_url_pattern() {
        let contract = ContractKind::PullRequest.contract();
        let text = "Opened https://github.com/acme/widgets/pull/128 for review.";
        let parsed = contract.parse(text, None, None).unwrap();
        assert_eq!(parsed.tier, ParseTier::Pattern);
        assert_eq!(parsed.fields["pr_number"], 128);
        assert_eq!(
            parsed.fields["pr_url"],
            "https://github.com/acme/widgets/pull/128"
        );
    }

    #[test]
    fn test_plan_path_in_free_text() {
        let contract = ContractKind::Plan.contract();
        let parsed = contract
            .parse("Plan written to `specs/issue-7-login.md`.", None, None)
            .unwrap();
        assert_eq!(parsed.artifacts()["plan_file"], "specs/issue-7-login.md");
    }

    #[test]
    fn test_plan_new_file_in_worktree() {
        let dir = tempdir().unwrap();
        let since = SystemTime::now() - std::time::Duration::from_secs(60);
        std::fs::create_dir_all(dir.path().join("specs")).unwrap();
        std::fs::write(dir.path().join("specs/plan-a.md"), "# plan").unwrap();

        let contract = ContractKind::Plan.contract();
        let parsed = contract
            .parse("I wrote the plan.", Some(dir.path()), Some(since))
            .unwrap();
        assert_eq!(parsed.artifacts()["plan_file"], "specs/plan-a.md");

        let later = SystemTime::now() + std::time::Duration::from_secs(60);
        assert!(contract.parse("I wrote the plan.", Some(dir.path()), Some(later)).is_err());
    }

    #[test]
    fn test_review_blockers_fail() {
        let contract = ContractKind::Review.contract();
        let text = r#"{"success": true, "review_summary": "ok", "review_issues": [
            {"review_issue_number": 1, "issue_description": "x", "issue_resolution": "y", "issue_severity": "blocker"},
            {"review_issue_number": 2, "issue_description": "x", "issue_resolution": "y", "issue_severity": "tech_debt"}
        ]}"#;
        let parsed = contract.parse(text, None, None).unwrap();
        let (outcome, reason) = contract.judge(&parsed);
        assert_eq!(outcome, Outcome::Failure);
        assert!(reason.unwrap().contains("1 blocker"));
    }

    #[test]
    fn test_success_false_uses_summary() {
        let contract = ContractKind::Review.contract();
        let parsed = contract
            .parse(r#"{"success": false, "review_summary": "UI does not match"}"#, None, None)
            .unwrap();
        assert_eq!(
            contract.judge(&parsed),
            (Outcome::Failure, Some("UI does not match".to_string()))
        );
    }

    #[test]
    fn test_test_summary_pattern() {
        let contract = ContractKind::Test.contract();
        let parsed = contract.parse("===== 41 passed, 2 failed in 3.1s =====", None, None).unwrap();
        assert_eq!(parsed.fields["failed"], 2);
        assert_eq!(contract.judge(&parsed).0, Outcome::Failure);

        let parsed = contract.parse("12 passed in 0.5s", None, None).unwrap();
        assert_eq!(contract.judge(&parsed).0, Outcome::Success);
    }

    #[test]
    fn test_null_counts_as_missing() {
        let contract = ContractKind::PullRequest.contract();
        assert!(contract
            .parse(r#"{"pr_number": null, "pr_url": "x"}"#, None, None)
            .is_err());
    }

    #[test]
    fn test_review_step_fans_out() {
        let step = ContractKind::step_for(Phase::Review);
        assert_eq!(step.len(), 2);
        assert!(step.iter().all(|s| s.after.is_none()));
    }
}
