//! Tokenizing of free-form option strings (VM options, program arguments).

/// Splits `input` into arguments the way a POSIX shell would, minus expansion.
///
/// An unterminated quote is closed at the end of the input. Anything
/// `shell_words` still rejects is split on whitespace.
pub fn tokenize(input: &str) -> Vec<String> {
    if let Ok(words) = shell_words::split(input) {
        return words;
    }
    for close in ['"', '\''] {
        if let Ok(words) = shell_words::split(&format!("{input}{close}")) {
            return words;
        }
    }
    tracing::debug!(input, "options do not tokenize, splitting on whitespace");
    input.split_whitespace().map(str::to_string).collect()
}

/// Like [`tokenize`], treating a missing string as empty.
pub fn tokenize_opt(input: Option<&str>) -> Vec<String> {
    input.map(tokenize).unwrap_or_default()
}

/// Parses the integer in front of an optional `/suffix`: `"5858"` or
/// `"5858/0.0.0.0"`.
///
/// `None` means the value is not a number; callers skip it.
pub fn parse_int_before_slash(s: &str) -> Option<i64> {
    let head = match s.find('/') {
        Some(idx) if idx > 0 => &s[..idx],
        _ => s,
    };
    head.parse::<i64>().ok()
}
