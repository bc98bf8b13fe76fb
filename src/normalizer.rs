/// Request normalization
///
/// Canonicalizes one labeled request into a compact single-line representation:
///
///   m=<method> p=<path> ua=<bot|browser|unknown> [b=<body>]
///
/// Numbers and long hex identifiers are collapsed into placeholders and every
/// `../` is tagged with a traversal marker, so requests that differ only in ids
/// or depth end up textually close for clustering.
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

use crate::models::LabeledRequest;

pub const NUM_PLACEHOLDER: &str = "<num>";
pub const ID_PLACEHOLDER: &str = "<id>";
pub const TRAVERSAL_MARKER: &str = "<path>";

const MAX_DECODE_ROUNDS: usize = 3;

const BOT_KEYWORDS: &[&str] = &["curl", "python", "sqlmap", "nikto", "wget", "go-http-client"];

static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\b").expect("valid number regex"));
static HEX_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-f0-9]{16,}\b").expect("valid hex id regex"));
static BOT_MATCHER: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(BOT_KEYWORDS)
        .expect("valid bot keyword automaton")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAgentClass {
    Bot,
    Browser,
    Unknown,
}

impl UserAgentClass {
    pub fn placeholder(&self) -> &'static str {
        match self {
            UserAgentClass::Bot => "<bot>",
            UserAgentClass::Browser => "<browser>",
            UserAgentClass::Unknown => "<unknown>",
        }
    }
}

/// Percent-decode repeatedly, stopping at the first round that changes nothing
pub fn multi_decode(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_DECODE_ROUNDS {
        let decoded = urlencoding::decode_binary(current.as_bytes());
        let decoded = String::from_utf8_lossy(&decoded).into_owned();
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

/// Replace standalone numbers and long hex identifiers with placeholders
fn collapse_identifiers(text: &str) -> String {
    let numbered = NUM_RE.replace_all(text, NUM_PLACEHOLDER);
    HEX_ID_RE.replace_all(&numbered, ID_PLACEHOLDER).into_owned()
}

/// Keep the representation on one line
fn flatten_whitespace(text: &str) -> Cow<'_, str> {
    if text.contains(['\r', '\n', '\t']) {
        Cow::Owned(text.replace(['\r', '\n', '\t'], " "))
    } else {
        Cow::Borrowed(text)
    }
}

pub fn normalize_path(uri: &str) -> String {
    let decoded = multi_decode(uri).to_lowercase();
    let collapsed = collapse_identifiers(&decoded);
    let marked = collapsed.replace("../", &format!("../{}", TRAVERSAL_MARKER));
    flatten_whitespace(&marked).into_owned()
}

pub fn classify_user_agent(user_agent: Option<&str>) -> UserAgentClass {
    match user_agent.map(str::trim) {
        None | Some("") => UserAgentClass::Unknown,
        Some(ua) if BOT_MATCHER.is_match(ua) => UserAgentClass::Bot,
        Some(_) => UserAgentClass::Browser,
    }
}

pub fn normalize_body(body: &str, max_len: usize) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let decoded = multi_decode(&trimmed.to_lowercase());
    let truncated: String = decoded.chars().take(max_len).collect();
    let collapsed = collapse_identifiers(&truncated);
    Some(flatten_whitespace(&collapsed).into_owned())
}

/// Build the clustering representation of a request
pub fn build_representation(req: &LabeledRequest, include_body: bool, body_max_len: usize) -> String {
    let mut repr = format!(
        "m={} p={} ua={}",
        flatten_whitespace(&req.method.trim().to_lowercase()),
        normalize_path(&req.uri),
        classify_user_agent(req.user_agent.as_deref()).placeholder()
    );

    if include_body {
        if let Some(body) = req.body.as_deref().and_then(|b| normalize_body(b, body_max_len)) {
            repr.push_str(" b=");
            repr.push_str(&body);
        }
    }

    repr
}
