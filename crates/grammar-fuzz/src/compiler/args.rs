//! Parsing of `[...]` argument action blocks: comma-separated, possibly
//! typed `k=v` pairs, respecting nested brackets and string literals.
//! Both prefix (`type name`) and postfix (`name: type`) notation are
//! accepted.

use super::CompileError;
use crate::graph::CallArg;

/// What the block annotates; rule invocations treat bare values as values,
/// declarations treat them as names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ArgUseCase {
    Call,
    Args,
    Locals,
    Returns,
}

impl ArgUseCase {
    fn describe(self) -> &'static str {
        match self {
            ArgUseCase::Call => "call",
            ArgUseCase::Args => "args",
            ArgUseCase::Locals => "locals",
            ArgUseCase::Returns => "returns",
        }
    }
}

pub(super) fn parse_arg_action_block(
    src: &str,
    use_case: ArgUseCase,
) -> Result<Vec<CallArg>, CompileError> {
    let src: Vec<char> = src.trim().chars().collect();
    let mut args = Vec::new();

    let mut save_pair = |key: Option<String>, value: Option<String>| -> Result<(), CompileError> {
        // With only one hand side present, the single value is a variable
        // name, except in calls where it stays a value.
        let (key, value) = match (key, value) {
            (None, value) if use_case == ArgUseCase::Call => (None, value),
            (None, value) => (value, None),
            pair => pair,
        };
        let mut ty = None;
        let mut name = None;
        if let Some(key) = key {
            if let Some((n, t)) = split_postfix_typed(&key) {
                ty = Some(t);
                name = Some(n);
            } else if let Some((t, n)) = split_prefix_typed(&key) {
                ty = Some(t);
                name = Some(n);
            } else if is_word(&key) && !key.is_empty() {
                name = Some(key);
            } else {
                return Err(CompileError::ArgBlock {
                    message: format!(
                        "unsupported type notation {:?} in {}",
                        key,
                        use_case.describe()
                    ),
                });
            }
        }
        for (part, label) in [(&ty, "type"), (&name, "name"), (&value, "value")] {
            if part.as_deref() == Some("") {
                return Err(CompileError::ArgBlock {
                    message: format!("{} in {} must not be empty", label, use_case.describe()),
                });
            }
        }
        args.push(CallArg { ty, name, value });
        Ok(())
    };

    let end = src.len();
    let (mut start, mut offset) = (0usize, 0usize);
    let mut depth = 0i64;
    let mut lhs: Option<String> = None;
    let segment = |from: usize, to: usize| -> String {
        src[from..to.min(end)].iter().collect::<String>().trim().to_owned()
    };

    while offset < end {
        let c = src[offset];
        match c {
            '\'' | '"' => {
                offset += 1;
                while offset < end && src[offset] != c {
                    if src[offset] == '\\' && offset + 1 < end && src[offset + 1] == c {
                        offset += 1;
                    }
                    offset += 1;
                }
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                save_pair(lhs.take(), Some(segment(start, offset)))?;
                start = offset + 1;
            }
            _ if offset + 1 < end
                && matches!(
                    (c, src[offset + 1]),
                    ('=' | '!' | '<' | '>' | '+' | '-' | '*' | '/' | '%' | '^' | ':', '=')
                ) =>
            {
                offset += 1;
            }
            '=' if lhs.is_none() => {
                lhs = Some(segment(start, offset));
                start = offset + 1;
            }
            _ => {}
        }
        offset += 1;
    }

    if depth != 0 {
        return Err(CompileError::ArgBlock {
            message: "non-matching bracket pairs in action".to_owned(),
        });
    }
    save_pair(lhs.take(), Some(segment(start, end)))?;

    Ok(args)
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// `name: type` notation; the type must not start with another colon (so
/// `a::b` paths do not split).
fn split_postfix_typed(key: &str) -> Option<(String, String)> {
    let colon = key.find(':')?;
    let name = key[..colon].trim_end();
    let ty = &key[colon + 1..];
    if !is_word(name) || ty.starts_with(':') || ty.trim().is_empty() {
        return None;
    }
    Some((name.to_owned(), ty.trim().to_owned()))
}

/// `type name` notation; the last whitespace-separated token is the name.
fn split_prefix_typed(key: &str) -> Option<(String, String)> {
    let split = key.rfind(char::is_whitespace)?;
    let ty = key[..split].trim();
    let name = key[split + 1..].trim();
    if !is_word(name) || ty.is_empty() {
        return None;
    }
    Some((ty.to_owned(), name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str, use_case: ArgUseCase) -> Vec<CallArg> {
        parse_arg_action_block(src, use_case).unwrap()
    }

    #[test]
    fn untyped_pairs() {
        let args = parse("a=1, b=2", ArgUseCase::Call);
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].name.as_deref(), Some("a"));
        assert_eq!(args[0].value.as_deref(), Some("1"));
        assert_eq!(args[1].value.as_deref(), Some("2"));
    }

    #[test]
    fn prefix_and_postfix_types() {
        let args = parse("int n = 0", ArgUseCase::Args);
        assert_eq!(args[0].ty.as_deref(), Some("int"));
        assert_eq!(args[0].name.as_deref(), Some("n"));
        assert_eq!(args[0].value.as_deref(), Some("0"));

        let args = parse("n: int = 0", ArgUseCase::Args);
        assert_eq!(args[0].ty.as_deref(), Some("int"));
        assert_eq!(args[0].name.as_deref(), Some("n"));
    }

    #[test]
    fn bare_name_in_declaration_vs_value_in_call() {
        let args = parse("depth", ArgUseCase::Locals);
        assert_eq!(args[0].name.as_deref(), Some("depth"));
        assert_eq!(args[0].value, None);

        let args = parse("depth + 1", ArgUseCase::Call);
        assert_eq!(args[0].name, None);
        assert_eq!(args[0].value.as_deref(), Some("depth + 1"));
    }

    #[test]
    fn nested_brackets_and_strings_do_not_split() {
        let args = parse("a=f(x, y), b=\"quo,ted\", c=[1, 2]", ArgUseCase::Call);
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].value.as_deref(), Some("f(x, y)"));
        assert_eq!(args[1].value.as_deref(), Some("\"quo,ted\""));
        assert_eq!(args[2].value.as_deref(), Some("[1, 2]"));
    }

    #[test]
    fn comparison_operators_are_not_assignments() {
        let args = parse("a == b", ArgUseCase::Call);
        assert_eq!(args[0].name, None);
        assert_eq!(args[0].value.as_deref(), Some("a == b"));
    }

    #[test]
    fn unbalanced_brackets_error() {
        assert!(parse_arg_action_block("a=(1", ArgUseCase::Call).is_err());
    }
}
