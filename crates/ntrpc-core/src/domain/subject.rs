//! Subject helpers: dotted paths, wildcard matching and durable names.

/// Join a namespace prefix and a child name into a dotted subject.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Durable-safe token for a subject: `.` -> `-`, `>` -> `all`, `*` -> `wc`.
///
/// Every occurrence is replaced.
pub fn durable_name(subject: &str) -> String {
    let mut out = String::with_capacity(subject.len() + 8);
    for ch in subject.chars() {
        match ch {
            '.' => out.push('-'),
            '>' => out.push_str("all"),
            '*' => out.push_str("wc"),
            c => out.push(c),
        }
    }
    out
}

/// Default stream name backing a Queue on `subject`.
pub fn default_stream_name(subject: &str) -> String {
    format!("c-{}", durable_name(subject))
}

/// Default durable consumer name for a Queue on `subject`.
pub fn default_consumer_name(subject: &str) -> String {
    format!("c-{}", default_stream_name(subject))
}

/// Match a concrete subject against a pattern with `*` (one token) and `>`
/// (one or more trailing tokens).
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
