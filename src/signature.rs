/// Signature extraction
///
/// Picks the few tokens a cluster's rule is anchored on. Tokens that contain a
/// known attack primitive are ranked ahead of everything else; inside each group
/// the order is descending frequency, then ascending length, then first
/// appearance in the cluster.
use aho_corasick::AhoCorasick;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::models::Signature;
use crate::pipeline_config::PipelineConfig;

/// Substrings that qualify a signature as attack-specific
pub const ATTACK_PRIMITIVES: &[&str] = &[
    "../",
    "<path>",
    "etc/passwd",
    "proc/self/environ",
    ";",
    "&&",
    "|",
    "`",
    "curl",
    "wget",
    "sh",
    "bash",
    "union",
    "select",
    "insert",
    "drop",
    "sleep(",
    "benchmark(",
];

pub const STOP_TOKENS: &[&str] = &[
    "m",
    "p",
    "ua",
    "get",
    "post",
    "put",
    "delete",
    "http",
    "https",
    "ua=<browser>",
    "ua=<bot>",
    "ua=<unknown>",
    "<num>",
    "<id>",
    "and",
    "or",
];

const MAX_PATH_SEGMENTS: usize = 4;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9_<>./=:?-]+").expect("valid token regex"));
static QUALIFYING: Lazy<AhoCorasick> =
    Lazy::new(|| AhoCorasick::new(ATTACK_PRIMITIVES).expect("valid primitive automaton"));

pub fn tokenize(repr: &str) -> impl Iterator<Item = &str> {
    TOKEN_RE.find_iter(repr).map(|m| m.as_str())
}

/// Keep at most the first four path segments of a `p=` token
pub fn compress_path_token(token: &str) -> &str {
    let Some(path) = token.strip_prefix("p=") else {
        return token;
    };

    match path.match_indices('/').nth(MAX_PATH_SEGMENTS - 1) {
        Some((cut, _)) => &token[..2 + cut],
        None => token,
    }
}

/// True when any token (or the joined signature) contains an attack primitive
pub fn has_attack_primitive(tokens: &[String]) -> bool {
    QUALIFYING.is_match(&tokens.join(" "))
}

pub struct SignatureExtractor {
    min_token_len: usize,
    max_token_len: usize,
    max_tokens: usize,
}

impl SignatureExtractor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_token_len: config.min_token_len,
            max_token_len: config.max_token_len,
            max_tokens: config.max_signature_tokens,
        }
    }

    fn keep(&self, token: &str) -> bool {
        let len = token.chars().count();
        len >= self.min_token_len && len <= self.max_token_len && !STOP_TOKENS.contains(&token)
    }

    pub fn extract<S: AsRef<str>>(&self, reprs: &[S]) -> Signature {
        // first-seen order doubles as the final tie-breaker
        let mut order: Vec<&str> = Vec::new();
        let mut counts: FxHashMap<&str, usize> = FxHashMap::default();

        for repr in reprs {
            for raw in tokenize(repr.as_ref()) {
                let token = compress_path_token(raw.trim());
                if !self.keep(token) {
                    continue;
                }
                let count = counts.entry(token).or_insert(0);
                if *count == 0 {
                    order.push(token);
                }
                *count += 1;
            }
        }

        let (mut primary, mut rest): (Vec<&str>, Vec<&str>) =
            order.into_iter().partition(|t| QUALIFYING.is_match(*t));

        let rank = |a: &&str, b: &&str| {
            counts[b]
                .cmp(&counts[a])
                .then_with(|| a.len().cmp(&b.len()))
        };
        primary.sort_by(rank);
        rest.sort_by(rank);

        primary
            .into_iter()
            .chain(rest)
            .take(self.max_tokens)
            .map(str::to_string)
            .collect()
    }
}
