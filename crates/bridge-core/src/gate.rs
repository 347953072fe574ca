//! Pre-dispatch static analysis of scripts.
//!
//! The gate counts meaningful lines, mutation calls and checkpoint calls, matches the
//! script against a [`RiskPolicy`] table, and turns the result into an allow / warn /
//! block decision. A blocked script never reaches the correlation store.

use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::GateThresholds;

static MUTATION_CALL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\.insert[A-Z][A-Za-z]*\(").ok());
static SYNC_CALL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"context\.sync\(\)").ok());
static SUCCESS_MARKER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)return\s*\{.*success.*\}").ok());

const MAX_SYNC_CALLS: usize = 3;

fn count_matches(regex: &Option<Regex>, script: &str) -> usize {
    regex
        .as_ref()
        .map_or(0, |regex| regex.find_iter(script).count())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Medium => "medium risk",
            Severity::High => "high risk",
        }
    }
}

/// One entry of the risk table: what to look for, how bad it is, what to do instead.
#[derive(Debug, Clone)]
pub struct RiskRule {
    pub name: String,
    pub pattern: Regex,
    pub severity: Severity,
    pub remediation: String,
}

impl RiskRule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        severity: Severity,
        remediation: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            severity,
            remediation: remediation.into(),
        })
    }
}

/// Ordered table of disallowed or discouraged script patterns.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    rules: Vec<RiskRule>,
}

static DEFAULT_RULES: Lazy<Vec<RiskRule>> = Lazy::new(|| {
    let table: [(&str, &str, Severity, &str); 5] = [
        (
            "body.clear()",
            r"body\.clear\(\)",
            Severity::High,
            "Do not clear the whole document; start from an empty document or edit targeted ranges",
        ),
        (
            r#"insertParagraph(..., "Start")"#,
            r#"insertParagraph\([^)]*,\s*["']Start["']\)"#,
            Severity::High,
            r#"Append content in order with "End" instead of inserting at the document start"#,
        ),
        (
            "search().insert*()",
            r"\.search\([^)]+\)\..*insert",
            Severity::Medium,
            r#"Search-based positioning is unreliable; keep a reference to the anchor and use insertParagraph(..., "After")"#,
        ),
        (
            "insertField(toc)",
            r"insertField\([^)]*FieldType\.toc",
            Severity::Medium,
            "Table-of-contents fields are unstable; build the contents list manually",
        ),
        (
            "shading.backgroundPatternColor",
            r"shading\.backgroundPatternColor",
            Severity::Medium,
            "Not supported by every host version; use font.highlightColor instead",
        ),
    ];

    table
        .into_iter()
        .filter_map(|(name, pattern, severity, remediation)| {
            RiskRule::new(name, pattern, severity, remediation).ok()
        })
        .collect()
});

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }
}

impl RiskPolicy {
    pub fn new(rules: Vec<RiskRule>) -> Self {
        Self { rules }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn push(&mut self, rule: RiskRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[RiskRule] {
        &self.rules
    }

    pub fn matches<'a>(&'a self, script: &'a str) -> impl Iterator<Item = &'a RiskRule> + 'a {
        self.rules
            .iter()
            .filter(move |rule| rule.pattern.is_match(script))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateLevel {
    Ok,
    Warn,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateMetrics {
    pub lines: usize,
    pub mutation_calls: usize,
    pub sync_calls: usize,
    pub has_risky_patterns: bool,
}

/// Gate verdict. `issues` drive the level; `hints` are structural remarks that only
/// travel along when the level is already `warn` or `block`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub level: GateLevel,
    pub issues: Vec<String>,
    pub hints: Vec<String>,
    pub suggestions: Vec<String>,
    pub metrics: GateMetrics,
}

impl Assessment {
    pub fn is_blocked(&self) -> bool {
        self.level == GateLevel::Block
    }

    /// Advisory lines attached to a successful response.
    pub fn advisories(&self) -> Vec<String> {
        match self.level {
            GateLevel::Ok => Vec::new(),
            GateLevel::Warn | GateLevel::Block => {
                self.issues.iter().chain(&self.hints).cloned().collect()
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RiskGate {
    policy: RiskPolicy,
    thresholds: GateThresholds,
}

impl RiskGate {
    pub fn new(policy: RiskPolicy, thresholds: GateThresholds) -> Self {
        Self { policy, thresholds }
    }

    pub fn thresholds(&self) -> GateThresholds {
        self.thresholds
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn assess(&self, script: &str) -> Assessment {
        let limits = self.thresholds;
        let mut issues = Vec::new();
        let mut hints = Vec::new();
        let mut suggestions = Vec::new();

        let lines = meaningful_lines(script);
        let mutation_calls = count_matches(&MUTATION_CALL, script);
        let sync_calls = count_matches(&SYNC_CALL, script);

        let mut has_risky_patterns = false;
        for rule in self.policy.matches(script) {
            has_risky_patterns = true;
            issues.push(format!(
                "Risky pattern detected: {} ({})",
                rule.name,
                rule.severity.label()
            ));
            suggestions.push(rule.remediation.clone());
        }

        if lines > limits.warn_lines {
            issues.push(format!(
                "Too many lines: {lines} (recommended <= {})",
                limits.warn_lines
            ));
            suggestions.push(
                "Split the script into several steps, one section or logical unit per step"
                    .to_string(),
            );
        }

        if mutation_calls > limits.warn_mutations {
            issues.push(format!(
                "Too many insert operations: {mutation_calls} (recommended <= {})",
                limits.warn_mutations
            ));
            suggestions.push("Issue fewer insert operations per execution".to_string());
        }

        if sync_calls == 0 {
            hints.push("No context.sync() call".to_string());
            suggestions.push("Call await context.sync() once the operations are queued".to_string());
        } else if sync_calls > MAX_SYNC_CALLS {
            hints.push(format!(
                "Too many context.sync() calls: {sync_calls} (may hurt performance)"
            ));
            suggestions.push("Batch operations to reduce the number of sync() calls".to_string());
        }

        let has_success_marker = SUCCESS_MARKER
            .as_ref()
            .is_some_and(|regex| regex.is_match(script));
        if !has_success_marker {
            hints.push("No success marker returned".to_string());
            suggestions.push(
                r#"Return a marker such as return { success: true, created: "..." } so the result can be verified"#
                    .to_string(),
            );
        }

        let level = if lines > limits.block_lines || mutation_calls > limits.block_mutations {
            GateLevel::Block
        } else if lines > limits.warn_lines
            || mutation_calls > limits.warn_mutations
            || has_risky_patterns
        {
            GateLevel::Warn
        } else {
            GateLevel::Ok
        };

        Assessment {
            level,
            issues,
            hints,
            suggestions,
            metrics: GateMetrics {
                lines,
                mutation_calls,
                sync_calls,
                has_risky_patterns,
            },
        }
    }

    /// Guidance returned in place of a dispatch when the script is blocked.
    pub fn block_guidance(&self, assessment: &Assessment) -> String {
        let limits = self.thresholds;
        let metrics = assessment.metrics;
        let mut out = String::from("## Script complexity too high, execution blocked\n\n### Issues\n\n");

        for issue in assessment.issues.iter().chain(&assessment.hints) {
            let _ = writeln!(out, "- {issue}");
        }

        out.push_str("\n### Metrics\n\n");
        let _ = writeln!(out, "- Lines: {}", metrics.lines);
        let _ = writeln!(out, "- Insert operations: {}", metrics.mutation_calls);
        let _ = writeln!(out, "- sync() calls: {}", metrics.sync_calls);
        let _ = writeln!(
            out,
            "- Risky patterns: {}",
            if metrics.has_risky_patterns { "yes" } else { "no" }
        );

        if !assessment.suggestions.is_empty() {
            out.push_str("\n### Suggestions\n\n");
            for (index, suggestion) in assessment.suggestions.iter().enumerate() {
                let _ = writeln!(out, "{}. {suggestion}", index + 1);
            }
        }

        out.push_str("\n### Required\n\nSplit the work into smaller steps and resubmit them one at a time. Each step must:\n\n");
        let _ = writeln!(out, "1. Stay within {} lines", limits.warn_lines);
        let _ = writeln!(
            out,
            "2. Use at most {} insert operations",
            limits.warn_mutations
        );
        out.push_str(
            "3. Validate itself by returning an explicit success marker, e.g. `return { success: true, created: \"...\" }`\n",
        );
        out.push_str("4. Handle a single logical unit (for example one section)\n");
        out
    }
}

fn meaningful_lines(script: &str) -> usize {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(lines: usize, mutations: usize) -> String {
        let mut out = Vec::new();
        for i in 0..mutations {
            out.push(format!("body.insertParagraph(\"row {i}\", \"End\");"));
        }
        while out.len() + 2 < lines {
            out.push(format!("const v{} = {};", out.len(), out.len()));
        }
        out.push("await context.sync();".to_string());
        out.push("return { success: true };".to_string());
        out.join("\n")
    }

    #[test]
    fn metrics_ignore_blank_and_comment_lines() {
        let gate = RiskGate::default();
        let assessment = gate.assess("// setup\n\n  const a = 1;\n   // note\nawait context.sync();\n");
        assert_eq!(assessment.metrics.lines, 2);
        assert_eq!(assessment.metrics.sync_calls, 1);
        assert_eq!(assessment.metrics.mutation_calls, 0);
    }

    #[test]
    fn small_clean_script_passes_without_advisories() {
        let assessment = RiskGate::default().assess(&script(25, 3));
        assert_eq!(assessment.metrics.lines, 25);
        assert_eq!(assessment.metrics.mutation_calls, 3);
        assert_eq!(assessment.level, GateLevel::Ok);
        assert!(assessment.issues.is_empty());
        assert!(assessment.advisories().is_empty());
    }

    #[test]
    fn long_script_is_blocked_without_mutations() {
        let assessment = RiskGate::default().assess(&script(90, 0));
        assert_eq!(assessment.metrics.mutation_calls, 0);
        assert_eq!(assessment.level, GateLevel::Block);
    }

    #[test]
    fn mutation_heavy_script_is_blocked() {
        let assessment = RiskGate::default().assess(&script(85, 20));
        assert_eq!(assessment.metrics.mutation_calls, 20);
        assert!(assessment.is_blocked());
    }

    #[test]
    fn moderate_size_warns() {
        let assessment = RiskGate::default().assess(&script(40, 6));
        assert_eq!(assessment.level, GateLevel::Warn);
        assert_eq!(assessment.issues.len(), 2);
    }

    #[test]
    fn each_default_rule_is_recognised() {
        let gate = RiskGate::default();
        let samples = [
            "context.document.body.clear();",
            r#"body.insertParagraph("Title", "Start");"#,
            r#"body.search("x").getFirst().insertText("y", "After");"#,
            "range.insertField(\"End\", Word.FieldType.toc);",
            "p.shading.backgroundPatternColor = \"#fff\";",
        ];
        for sample in samples {
            let assessment = gate.assess(sample);
            assert!(assessment.metrics.has_risky_patterns, "{sample}");
            assert_eq!(assessment.level, GateLevel::Warn, "{sample}");
        }
    }

    #[test]
    fn policy_table_is_extensible() {
        let mut policy = RiskPolicy::empty();
        policy.push(
            RiskRule::new("eval", r"\beval\(", Severity::High, "Never evaluate dynamic code")
                .unwrap(),
        );
        let gate = RiskGate::new(policy, GateThresholds::default());

        let assessment = gate.assess("eval(code);\nawait context.sync();\nreturn { success: true };");
        assert_eq!(assessment.level, GateLevel::Warn);
        assert_eq!(assessment.suggestions, vec!["Never evaluate dynamic code"]);
        assert!(!gate.assess("body.clear();").metrics.has_risky_patterns);
    }

    #[test]
    fn block_guidance_lists_numbered_requirements() {
        let gate = RiskGate::default();
        let guidance = gate.block_guidance(&gate.assess(&script(90, 0)));
        assert!(guidance.contains("Too many lines: 90"));
        assert!(guidance.contains("1. Stay within 30 lines"));
        assert!(guidance.contains("3. Validate itself by returning an explicit success marker"));
    }

    #[test]
    fn built_in_patterns_all_compile() {
        assert!(MUTATION_CALL.is_some());
        assert!(SYNC_CALL.is_some());
        assert!(SUCCESS_MARKER.is_some());
        assert_eq!(RiskPolicy::default().rules().len(), 5);
    }
}
