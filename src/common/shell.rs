//! Shell utility functions
//!
//! Quoting helpers for the scripts and command lines gridware generates.

use std::env;

/// Escape a string for use in a shell command
///
/// Quotes only when the string contains characters that are special to the
/// shell, using single quotes.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '=' | '/' | '.' | ':' | ',' | '+'))
    {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Path of the running executable, or "gridware" if it cannot be determined.
pub fn current_exe_path() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| path.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "gridware".to_string())
}
