//! Bounded, credential-free summaries for step trace entries.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const SUMMARY_LIMIT: usize = 512;

const REDACTED: &str = "[redacted]";
const SECRET_PREFIXES: [&str; 3] = ["sk-", "shpat_", "shpss_"];
const SENSITIVE_KEYS: [&str; 7] = [
    "api_key",
    "access_token",
    "token",
    "authorization",
    "secret",
    "password",
    "client_secret",
];

/// Serializes `value`, redacts sensitive keys and bounds the result.
pub fn summarize<T>(value: &T) -> String
where
    T: Serialize,
{
    match serde_json::to_value(value) {
        Ok(mut json) => {
            redact_value(&mut json);
            bound(json.to_string().as_str())
        }
        Err(error) => bound(format!("<unserializable: {error}>").as_str()),
    }
}

pub fn summarize_text(text: &str) -> String {
    bound(redact_text(text).as_str())
}

/// Truncated summaries end with a short digest of the full text so two
/// entries can still be told apart.
pub fn bound(text: &str) -> String {
    if text.chars().count() <= SUMMARY_LIMIT {
        return text.to_string();
    }
    let suffix = format!("…[sha256:{}]", &sha256_hex(text.as_bytes())[..12]);
    let keep = SUMMARY_LIMIT.saturating_sub(suffix.chars().count());
    let mut out = text.chars().take(keep).collect::<String>();
    out.push_str(suffix.as_str());
    out
}

fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if SENSITIVE_KEYS.iter().any(|k| lowered == *k) {
                    *inner = Value::String(String::from(REDACTED));
                } else {
                    redact_value(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        Value::String(text) => {
            let cleaned = redact_text(text.as_str());
            if cleaned != *text {
                *text = cleaned;
            }
        }
        _ => {}
    }
}

/// Masks bearer tokens and `sk-` style API keys inside free text. Words are
/// split on every character that cannot appear in a token, so keys inside
/// `key=value` pairs, JSON strings or parentheses are caught too.
pub fn redact_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut mask_next = false;
    let mut rest = text;
    while !rest.is_empty() {
        let word_len = rest.find(|c: char| !is_token_char(c)).unwrap_or(rest.len());
        let (word, tail) = rest.split_at(word_len);
        if !word.is_empty() {
            if mask_next {
                out.push_str(REDACTED);
                mask_next = false;
            } else if word.eq_ignore_ascii_case("bearer") {
                out.push_str(word);
                mask_next = true;
            } else {
                out.push_str(mask_api_key(word).as_str());
            }
        }
        let sep_len = tail.find(is_token_char).unwrap_or(tail.len());
        out.push_str(&tail[..sep_len]);
        rest = &tail[sep_len..];
    }
    out
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '+' | '/')
}

/// A prefix only counts at the start of the word or after punctuation, so
/// `task-runner` is left alone while `x_sk-abc` is masked.
fn mask_api_key(word: &str) -> String {
    let start = SECRET_PREFIXES
        .iter()
        .filter_map(|prefix| {
            word.match_indices(*prefix)
                .map(|(index, _)| index)
                .find(|&index| !word[..index].ends_with(char::is_alphanumeric))
        })
        .min();
    match start {
        Some(index) => format!("{}{REDACTED}", &word[..index]),
        None => word.to_string(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
