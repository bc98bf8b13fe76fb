/// Regex synthesis from a cluster signature
///
/// Path traversal clusters get a fixed-shape regex around repeated `../`
/// sequences. Every other family gets a sequential regex over the escaped
/// signature tokens joined by a bounded gap `.{0,N}`; an unbounded `.*` or
/// `.+` is never emitted, which keeps matching linear in the input length.
use regex::Regex;
use tracing::debug;

use crate::models::AttackType;
use crate::pipeline_config::PipelineConfig;

const TRAVERSAL_REPEAT: &str = r"(\.\./){2,}";
const PASSWD_TOKEN: &str = "etc/passwd";

pub struct RegexSynthesizer {
    max_gap: usize,
    traversal_lookahead: usize,
    max_len: usize,
}

impl RegexSynthesizer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            max_gap: config.max_gap,
            traversal_lookahead: config.traversal_lookahead,
            max_len: config.max_regex_len,
        }
    }

    fn path_traversal(&self, signature: &[String]) -> String {
        if signature.join(" ").contains(PASSWD_TOKEN) {
            format!(
                "{}.{{0,{}}}{}",
                TRAVERSAL_REPEAT, self.traversal_lookahead, PASSWD_TOKEN
            )
        } else {
            TRAVERSAL_REPEAT.to_string()
        }
    }

    /// Signature tokens in order, escaped, separated by a bounded gap
    fn sequential(&self, signature: &[String]) -> Option<String> {
        if signature.len() < 2 {
            return None;
        }

        let gap = format!(".{{0,{}}}", self.max_gap);
        let escaped: Vec<String> = signature.iter().map(|t| regex::escape(t)).collect();
        Some(escaped.join(&gap))
    }

    /// Build the rule regex, or `None` when the cluster cannot carry a safe one
    pub fn synthesize(&self, attack_type: AttackType, signature: &[String]) -> Option<String> {
        let candidate = match attack_type {
            AttackType::PathTraversal => self.path_traversal(signature),
            _ => self.sequential(signature)?,
        };

        if candidate.len() > self.max_len {
            debug!(
                "Rejecting {} regex: {} chars exceeds limit {}",
                attack_type,
                candidate.len(),
                self.max_len
            );
            return None;
        }

        if attack_type != AttackType::PathTraversal && !wildcards_bounded(&candidate) {
            debug!("Rejecting {} regex with unbounded wildcard: {}", attack_type, candidate);
            return None;
        }

        if let Err(e) = Regex::new(&candidate) {
            debug!("Rejecting {} regex that does not compile: {}", attack_type, e);
            return None;
        }

        Some(candidate)
    }
}

/// True when no unescaped `.` is followed by `*`, `+` or an open-ended `{n,}`
pub fn wildcards_bounded(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    let mut in_class = false;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' if !in_class => in_class = true,
            b']' if in_class => in_class = false,
            b'.' if !in_class => {
                match bytes.get(i + 1) {
                    Some(b'*') | Some(b'+') => return false,
                    Some(b'{') => {
                        let rest = &pattern[i + 2..];
                        let Some(close) = rest.find('}') else {
                            return false;
                        };
                        let quantifier = &rest[..close];
                        if quantifier.ends_with(',') || quantifier.is_empty() {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        i += 1;
    }

    true
}
