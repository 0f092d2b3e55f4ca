//! Command-string validation and tokenization, kept separate from process
//! spawning so both are testable as pure functions.

use crate::error::HubError;

/// Substring deny-list checked against the raw command string before any
/// spawn. Matching commands are rejected outright.
const DENIED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "rm -rf --no-preserve-root",
    "mkfs",
    "of=/dev/sd",
    "of=/dev/nvme",
    "> /dev/sda",
    ":(){ :|:& };:",
];

/// Reject known-destructive command strings.
pub fn validate(raw: &str) -> Result<(), HubError> {
    for pattern in DENIED_PATTERNS {
        if raw.contains(pattern) {
            return Err(HubError::CommandRejected(format!(
                "command contains forbidden pattern {pattern:?}"
            )));
        }
    }
    Ok(())
}

/// Split a shell string into argv tokens with shell-word semantics:
/// whitespace separates words, single quotes are literal, double quotes
/// allow backslash escapes, a bare backslash escapes the next character.
pub fn tokenize(raw: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = raw.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.peek() {
                                if next == '"' || next == '\\' {
                                    current.push(next);
                                    chars.next();
                                } else {
                                    current.push('\\');
                                }
                            }
                        }
                        _ => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    current.push(c);
                }
            }
            _ => {
                in_word = true;
                current.push(ch);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Tokenize, falling back to an interactive shell when splitting yields
/// nothing usable (no words, or an empty first word).
pub fn tokenize_or_shell(raw: &str) -> Vec<String> {
    let words = tokenize(raw);
    match words.first() {
        Some(first) if !first.is_empty() => words,
        _ => vec![default_shell()],
    }
}

pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_words() {
        assert_eq!(tokenize("ls -la /tmp"), vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn single_quotes_are_literal() {
        assert_eq!(
            tokenize("echo 'hello world' done"),
            vec!["echo", "hello world", "done"]
        );
        assert_eq!(tokenize(r#"echo 'a "b" c'"#), vec!["echo", r#"a "b" c"#]);
    }

    #[test]
    fn double_quotes_allow_escapes() {
        assert_eq!(
            tokenize(r#"echo "say \"hi\"""#),
            vec!["echo", r#"say "hi""#]
        );
    }

    #[test]
    fn backslash_escapes_whitespace() {
        assert_eq!(tokenize(r"cat my\ file"), vec!["cat", "my file"]);
    }

    #[test]
    fn empty_input_falls_back_to_shell() {
        assert_eq!(tokenize(""), Vec::<String>::new());
        assert_eq!(tokenize("   "), Vec::<String>::new());
        let argv = tokenize_or_shell("   ");
        assert_eq!(argv.len(), 1);
        assert!(!argv[0].is_empty());
    }

    #[test]
    fn empty_quotes_still_produce_a_word() {
        assert_eq!(tokenize("''"), vec![""]);
        // But an empty argv[0] is not spawnable; the fallback kicks in.
        assert_eq!(tokenize_or_shell("''"), vec![default_shell()]);
    }

    #[test]
    fn rejects_destructive_commands() {
        for cmd in [
            "rm -rf /",
            "rm -rf /*",
            "sudo rm -rf / --no-preserve-root",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
        ] {
            assert!(validate(cmd).is_err(), "expected rejection for {cmd:?}");
        }
    }

    #[test]
    fn allows_ordinary_commands() {
        for cmd in ["bash", "ls -la", "rm -rf ./build", "echo rm"] {
            assert!(validate(cmd).is_ok(), "expected acceptance for {cmd:?}");
        }
    }
}
