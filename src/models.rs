use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Ordered signature tokens, never more than three in practice
pub type Signature = SmallVec<[String; 3]>;

/// Canonical attack label attached to a session by the upstream classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackLabel {
    SqlInjection,
    CodeInjection,
    PathTraversal,
    /// Generic malicious traffic without a more specific family
    Malicious,
}

impl AttackLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackLabel::SqlInjection => "SQL_INJECTION",
            AttackLabel::CodeInjection => "CODE_INJECTION",
            AttackLabel::PathTraversal => "PATH_TRAVERSAL",
            AttackLabel::Malicious => "MALICIOUS",
        }
    }

    /// Map a label as stored upstream onto the canonical enum.
    ///
    /// The classifier has written both enum-like (`SQL_INJECTION`) and free-text
    /// (`SQL injection`) labels over time, so spacing, dashes and case are folded
    /// before matching. Unknown labels are treated as generic malicious traffic.
    pub fn from_store(raw: &str) -> Self {
        let folded: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();

        match folded.as_str() {
            "SQL_INJECTION" | "SQLI" | "SQL_INJECTION_ATTACK" => AttackLabel::SqlInjection,
            "CODE_INJECTION" | "COMMAND_INJECTION" | "RCE" | "REMOTE_CODE_EXECUTION"
            | "OS_COMMAND_INJECTION" => AttackLabel::CodeInjection,
            "PATH_TRAVERSAL" | "DIRECTORY_TRAVERSAL" | "LFI" | "LOCAL_FILE_INCLUSION" => {
                AttackLabel::PathTraversal
            }
            _ => AttackLabel::Malicious,
        }
    }

    /// Labels that mean "not an attack" and must never reach the pipeline
    pub fn is_benign(raw: &str) -> bool {
        matches!(
            raw.trim().to_ascii_uppercase().as_str(),
            "" | "NORMAL" | "BENIGN"
        )
    }
}

impl fmt::Display for AttackLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule family a cluster is synthesized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    Sqli,
    CodeInjection,
    PathTraversal,
    GenericAttack,
}

impl AttackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackType::Sqli => "sqli",
            AttackType::CodeInjection => "code_injection",
            AttackType::PathTraversal => "path_traversal",
            AttackType::GenericAttack => "generic_attack",
        }
    }
}

impl From<AttackLabel> for AttackType {
    fn from(label: AttackLabel) -> Self {
        match label {
            AttackLabel::SqlInjection => AttackType::Sqli,
            AttackLabel::CodeInjection => AttackType::CodeInjection,
            AttackLabel::PathTraversal => AttackType::PathTraversal,
            AttackLabel::Malicious => AttackType::GenericAttack,
        }
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attack-labeled session, represented by its most recent request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRequest {
    pub session_db_id: i64,
    pub label: AttackLabel,
    pub method: String,
    pub uri: String,
    pub user_agent: Option<String>,
    pub body: Option<String>,
}

/// A complete firewall rule derived from one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedRule {
    pub rule_id: i64,
    pub cluster_id: usize,
    pub attack_type: AttackType,
    pub label_mode: AttackLabel,
    pub signature: Signature,
    pub regex: String,
    pub variables: String,
    pub transformations: String,
    pub severity: String,
    pub tags: String,
    pub msg: String,
    pub secrule_text: String,
}

/// Output of one pipeline pass over a window's batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleBatch {
    pub rules: Vec<GeneratedRule>,
    pub min_session_db_id: i64,
    pub max_session_db_id: i64,
}

/// A rule as persisted, with the session range it was mined from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRule {
    pub rule_id: i64,
    pub cluster_id: usize,
    pub attack_type: String,
    pub label_mode: String,
    pub regex: String,
    pub variables: String,
    pub transformations: String,
    pub severity: String,
    pub tags: String,
    pub msg: String,
    pub secrule_text: String,
    pub source_min_session_db_id: i64,
    pub source_max_session_db_id: i64,
}

impl StoredRule {
    pub fn from_generated(rule: &GeneratedRule, min_session_db_id: i64, max_session_db_id: i64) -> Self {
        Self {
            rule_id: rule.rule_id,
            cluster_id: rule.cluster_id,
            attack_type: rule.attack_type.as_str().to_string(),
            label_mode: rule.label_mode.as_str().to_string(),
            regex: rule.regex.clone(),
            variables: rule.variables.clone(),
            transformations: rule.transformations.clone(),
            severity: rule.severity.clone(),
            tags: rule.tags.clone(),
            msg: rule.msg.clone(),
            secrule_text: rule.secrule_text.clone(),
            source_min_session_db_id: min_session_db_id,
            source_max_session_db_id: max_session_db_id,
        }
    }
}

/// Durable processing progress: last incorporated session and the next window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_session_id: i64,
    pub window_start_time: DateTime<Utc>,
    pub window_hours: u32,
}

impl Checkpoint {
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start_time + Duration::hours(i64::from(self.window_hours))
    }

    /// Checkpoint after consuming the current window
    pub fn advanced(&self, last_session_id: i64) -> Self {
        Self {
            last_session_id: last_session_id.max(self.last_session_id),
            window_start_time: self.window_end(),
            window_hours: self.window_hours,
        }
    }
}
