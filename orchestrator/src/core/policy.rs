//! Pure command-policy predicates and the argv tokenizer.
//!
//! These functions are deterministic and perform no I/O. The run executor and
//! the planner both consult them; keeping them free of process state means a
//! command is judged identically no matter who asks.

use anyhow::{Result, anyhow};

use crate::core::plan::ExecutorToolKind;

/// Raw sequences that must never appear in a `cmd` step.
///
/// Checked against the untrimmed command string, so quoting does not hide an
/// operator from the scan. Longest sequences first so reporting names the
/// most specific match.
pub const FORBIDDEN_OPERATORS: [&str; 8] = ["||", "&&", "$(", "|", ">", "<", ";", "`"];

/// True iff `command`, after leading-whitespace trim, begins with one of the
/// allowed tokens followed by a word boundary (end of string or whitespace).
pub fn is_command_allowed(command: &str, allowlist: &[String]) -> bool {
    let trimmed = command.trim_start();
    allowlist.iter().any(|token| {
        let Some(rest) = trimmed.strip_prefix(token.as_str()) else {
            return false;
        };
        rest.is_empty() || rest.starts_with(char::is_whitespace)
    })
}

/// True iff the raw command string contains any forbidden shell operator.
pub fn has_forbidden_shell_operators(command: &str) -> bool {
    forbidden_operator(command).is_some()
}

/// The first forbidden operator found in `command`, if any.
pub fn forbidden_operator(command: &str) -> Option<&'static str> {
    FORBIDDEN_OPERATORS
        .iter()
        .copied()
        .find(|op| command.contains(op))
}

/// Membership check for the closed executor-tool set.
pub fn is_executor_tool_allowed(tool: ExecutorToolKind) -> bool {
    matches!(tool, ExecutorToolKind::Codex)
}

/// Split a command line into argv tokens.
///
/// POSIX-style rules: whitespace outside quotes separates tokens,
/// single-quoted runs are literal, double-quoted runs honor `\"` and `\\`,
/// and a backslash outside quotes escapes the next character. Adjacent
/// quoted runs concatenate into one token.
pub fn tokenize(command: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(anyhow!("unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\')) => current.push(e),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(anyhow!("unterminated double quote")),
                        },
                        Some(c) => current.push(c),
                        None => return Err(anyhow!("unterminated double quote")),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(e) => current.push(e),
                    None => return Err(anyhow!("trailing backslash")),
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return Err(anyhow!("empty command"));
    }
    Ok(tokens)
}

/// Join argv tokens back into a shell-style command line.
///
/// Quotes a token only when it needs it; `tokenize` is a left inverse of
/// this for operator-free input.
pub fn join(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|token| {
            if token.is_empty() {
                "''".to_string()
            } else if token
                .chars()
                .any(|c| c.is_whitespace() || c == '\'' || c == '"' || c == '\\')
            {
                format!("'{}'", token.replace('\'', "'\\''"))
            } else {
                token.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
