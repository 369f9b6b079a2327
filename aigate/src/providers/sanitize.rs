//! Upstream error bodies pass through here before reaching client responses
//! or logs: secret-like tokens are scrubbed and the text is truncated.

const MAX_API_ERROR_CHARS: usize = 300;
const REDACTED: &str = "[REDACTED]";

/// Prefixes of credential material that occasionally leaks into provider
/// error strings (echoed headers, malformed-key complaints).
const SECRET_PREFIXES: [&str; 4] = ["sk-", "Bearer ", "ya29.", "AIza"];

/// Length of the token run at the start of `tail` (the characters a key or
/// access token is made of).
fn secret_run_len(tail: &str) -> usize {
    tail.find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        .unwrap_or(tail.len())
}

/// Scrub known secret-like token prefixes from provider error strings.
///
/// Single left-to-right pass: wherever a known prefix is followed by a token
/// run, prefix and run are replaced together. A bare prefix with nothing
/// after it is ordinary text.
pub fn scrub_secret_patterns(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    'scan: while let Some(ch) = rest.chars().next() {
        for prefix in SECRET_PREFIXES {
            if let Some(tail) = rest.strip_prefix(prefix) {
                let run = secret_run_len(tail);
                if run > 0 {
                    out.push_str(REDACTED);
                    rest = &tail[run..];
                    continue 'scan;
                }
            }
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

/// Scrub secrets and clamp length so a provider cannot flood client
/// responses with megabyte error pages.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);
    match scrubbed.char_indices().nth(MAX_API_ERROR_CHARS) {
        Some((cut, _)) => format!("{}...", &scrubbed[..cut]),
        None => scrubbed,
    }
}
