use std::sync::LazyLock;

use regex::Regex;

const GENERIC_MESSAGE: &str = "An error occurred. Please try again or contact support.";

static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)(password|passwd|pwd|token|secret|api_key|key)\s*[=:]\s*[^\s;,]+", "$1=[REDACTED]"),
        (r"https?://[^\s/]+(/[^\s]*)?", "[API_ENDPOINT]"),
        (r"\b[\w.+-]+@[\w-]+(\.[\w-]+)*\.\w+\b", "[EMAIL]"),
        (r"[A-Za-z]:\\[\w\\.\- ]+", "[PATH]"),
        (r"(/[\w.\-]+){2,}/?", "[PATH]"),
        (r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b", "[IP_ADDRESS]"),
        (r"\b[A-Za-z0-9_\-]{32,}\b", "[TOKEN]"),
        (r"(?i)\bSELECT\b.+?\bFROM\b", "SELECT [QUERY] FROM"),
        (r"(?i)\bINSERT INTO\b.*", "INSERT [QUERY]"),
        (r"(?i)\bUPDATE\b.+?\bSET\b.*", "UPDATE [QUERY]"),
        (r"(?i)\bDELETE FROM\b.*", "DELETE [QUERY]"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
        Ok(regex) => Some((regex, replacement)),
        Err(err) => {
            tracing::error!(pattern, %err, "invalid sanitizer pattern");
            None
        }
    })
    .collect()
});

pub fn sanitize_message(message: &str) -> String {
    let mut sanitized = message.to_string();
    for (regex, replacement) in PATTERNS.iter() {
        sanitized = regex.replace_all(&sanitized, *replacement).into_owned();
    }
    if sanitized.trim().len() < 5 {
        return GENERIC_MESSAGE.to_string();
    }
    sanitized
}

pub fn report(context: &str, detail: &dyn std::fmt::Display) -> String {
    tracing::warn!(context, detail = %detail, "operation failed");
    let safe = sanitize_message(&detail.to_string());
    if context.is_empty() {
        safe
    } else {
        format!("Error {context}: {safe}")
    }
}
