//! Structural checks run on proposed file contents before anything is
//! written. Dispatch is by file extension.

use std::path::Path;

/// `Err` carries a human-readable reason.
pub fn check_structure(path: &Path, content: &str) -> Result<(), String> {
    if content.trim().is_empty() {
        return Err("content is empty".into());
    }
    if content.contains('\0') {
        return Err("content contains NUL bytes".into());
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "toml" => toml::from_str::<toml::Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid TOML: {}", e)),
        "json" => serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid JSON: {}", e)),
        "yml" | "yaml" => serde_yaml::from_str::<serde_yaml::Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid YAML: {}", e)),
        "rs" => check_delimiters(content),
        _ => Ok(()),
    }
}

/// Bracket balance for Rust-like source, skipping strings, chars and
/// comments.
fn check_delimiters(src: &str) -> Result<(), String> {
    let chars: Vec<char> = src.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                let start = line;
                i += 2;
                let mut depth = 1;
                while i < chars.len() && depth > 0 {
                    match (chars[i], chars.get(i + 1).copied()) {
                        ('/', Some('*')) => {
                            depth += 1;
                            i += 1;
                        }
                        ('*', Some('/')) => {
                            depth -= 1;
                            i += 1;
                        }
                        ('\n', _) => line += 1,
                        _ => {}
                    }
                    i += 1;
                }
                if depth > 0 {
                    return Err(format!("unterminated block comment from line {}", start));
                }
                continue;
            }
            '"' => {
                let start = line;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("unterminated string from line {}", start)),
                        Some('\\') => i += 1,
                        Some('"') => break,
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '\'' => {
                // Char literal ('x' or '\n'); anything else is a lifetime.
                if next == Some('\\') {
                    let mut j = i + 2;
                    while j < chars.len() && chars[j] != '\'' && chars[j] != '\n' {
                        j += 1;
                    }
                    if chars.get(j) == Some(&'\'') {
                        i = j;
                    }
                } else if chars.get(i + 2) == Some(&'\'') {
                    i += 2;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, at)) => {
                        return Err(format!(
                            "'{}' on line {} closes '{}' from line {}",
                            c, line, open, at
                        ))
                    }
                    None => return Err(format!("unmatched '{}' on line {}", c, line)),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, at)) => Err(format!("unclosed '{}' from line {}", open, at)),
        None => Ok(()),
    }
}
