//! Environment references inside the configuration file.

/// Expand `${VAR}`, `${VAR:-default}` and `$VAR`. Undefined variables
/// expand to nothing; a lone `$` is kept.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let body: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match body.split_once(":-") {
                Some((name, default)) => match std::env::var(name) {
                    Ok(val) if !val.is_empty() => out.push_str(&val),
                    _ => out.push_str(default),
                },
                None => out.push_str(&std::env::var(&body).unwrap_or_default()),
            }
            continue;
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn braces_and_bare_names() {
        std::env::set_var("TUNRELAY_TEST_HOST", "127.0.0.1");
        std::env::set_var("TUNRELAY_TEST_PORT", "1080");
        assert_eq!(
            expand_env_vars("server: ${TUNRELAY_TEST_HOST}:$TUNRELAY_TEST_PORT"),
            "server: 127.0.0.1:1080"
        );
        std::env::remove_var("TUNRELAY_TEST_HOST");
        std::env::remove_var("TUNRELAY_TEST_PORT");
    }

    #[test]
    fn default_used_when_unset_or_empty() {
        std::env::remove_var("TUNRELAY_TEST_MISSING");
        assert_eq!(expand_env_vars("mode: ${TUNRELAY_TEST_MISSING:-direct}"), "mode: direct");
        std::env::set_var("TUNRELAY_TEST_EMPTY", "");
        assert_eq!(expand_env_vars("${TUNRELAY_TEST_EMPTY:-x}"), "x");
        std::env::remove_var("TUNRELAY_TEST_EMPTY");
    }

    #[test]
    fn undefined_expands_to_nothing() {
        std::env::remove_var("TUNRELAY_TEST_UNDEFINED");
        assert_eq!(expand_env_vars("a=${TUNRELAY_TEST_UNDEFINED}b"), "a=b");
        assert_eq!(expand_env_vars("cost $"), "cost $");
        assert_eq!(expand_env_vars("$ 5"), "$ 5");
    }
}
