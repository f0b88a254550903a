//! POSIX shell argument quoting.
//!
//! The rootfs builder composes a launcher script (`spec.md` §4.K step 4)
//! out of caller-controlled strings (image entrypoint/cmd, environment
//! values). `spec.md` §9 calls this out as a known correctness hazard and
//! asks for a dedicated, property-tested quoter rather than ad hoc string
//! concatenation.

/// Single-quote an argument for POSIX shell, escaping embedded single
/// quotes as `'\''`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_safe_unquoted_char) {
        return arg.to_string();
    }
    single_quote(arg)
}

/// Unconditionally single-quote a value, escaping embedded single quotes as
/// `'\''`. Unlike `shell_quote`, this never takes the bare-unquoted
/// shortcut — callers that need the literal single-quoted form regardless
/// of the value's contents (`shell_export`) use this directly.
fn single_quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn is_safe_unquoted_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | '=')
}

/// Join argv into a single shell command line, quoting each argument.
pub fn shell_join(argv: &[&str]) -> String {
    argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

/// Serialize `K=V` as `export K='V'`, always single-quoting the value —
/// even a bare digit — matching the env-injection format from `spec.md`
/// §4.K step 5 and the literal `export PORT='9'` form in §8 E2E scenario 6.
pub fn shell_export(name: &str, value: &str) -> String {
    format!("export {}={}", name, single_quote(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny POSIX-subset shell word splitter, used only to verify
    /// `shell_join`'s round-trip law (R2) without shelling out to a real
    /// shell in the test suite.
    fn parse_words(line: &str) -> Vec<String> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        let mut in_word = false;

        while let Some(c) = chars.next() {
            match c {
                '\'' => {
                    in_word = true;
                    loop {
                        match chars.next() {
                            Some('\'') => {
                                // Check for the `'\''` escaped-quote idiom.
                                if chars.peek() == Some(&'\\') {
                                    let mut lookahead = chars.clone();
                                    lookahead.next();
                                    if lookahead.next() == Some('\'') {
                                        chars.next();
                                        chars.next();
                                        current.push('\'');
                                        continue;
                                    }
                                }
                                break;
                            }
                            Some(other) => current.push(other),
                            None => break,
                        }
                    }
                }
                ' ' | '\t' => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                other => {
                    in_word = true;
                    current.push(other);
                }
            }
        }
        if in_word {
            words.push(current);
        }
        words
    }

    #[test]
    fn round_trip_simple_args() {
        let argv = ["echo", "hello", "world"];
        let joined = shell_join(&argv);
        assert_eq!(parse_words(&joined), argv);
    }

    #[test]
    fn round_trip_args_with_spaces_and_quotes() {
        let argv = [
            "sh",
            "-c",
            "it's a \"test\" with $VAR and spaces",
            "",
            "trailing'quote'",
        ];
        let joined = shell_join(&argv);
        assert_eq!(parse_words(&joined), argv);
    }

    #[test]
    fn round_trip_dollar_and_backtick() {
        let argv = ["$(rm -rf /)", "`whoami`", "a$b"];
        let joined = shell_join(&argv);
        assert_eq!(parse_words(&joined), argv);
    }

    #[test]
    fn export_line_is_single_quoted() {
        assert_eq!(shell_export("PORT", "3000"), "export PORT='3000'");
        assert_eq!(shell_export("MSG", "it's fine"), "export MSG='it'\\''s fine'");
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip_any_string(s in ".*") {
            let joined = shell_join(&[s.as_str()]);
            let words = parse_words(&joined);
            proptest::prop_assert_eq!(words, vec![s]);
        }
    }
}
