//! Escape decoding for string literals, charsets and character ranges,
//! following the canonical grammar tool's semantics (`\uXXXX`, `\u{…}`,
//! `\p{…}` / `\P{…}` Unicode properties, charset ranges, and the usual
//! single-character escapes).

use regex_syntax::hir::{Class, HirKind};

use super::CompileError;

/// Where a character is being decoded; gates which escapes are legal and
/// labels error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EscapeContext {
    LexerCharset,
    StringLiteral,
    CharacterRange,
    SetLiteral,
}

impl EscapeContext {
    fn describe(self) -> &'static str {
        match self {
            EscapeContext::LexerCharset => "lexer charset",
            EscapeContext::StringLiteral => "string literal",
            EscapeContext::CharacterRange => "character range",
            EscapeContext::SetLiteral => "set literal",
        }
    }
}

/// A decoded charset atom: either a single codepoint or, for property
/// escapes, a list of codepoint ranges.
#[derive(Debug, Clone)]
pub(super) enum Decoded {
    Scalar(u32),
    Ranges(Vec<(u32, u32)>),
}

/// Decodes one (possibly escaped) character starting at `offset`. Returns
/// the decoded atom and the offset past it.
pub(super) fn decode_char(
    chars: &[char],
    offset: usize,
    ctx: EscapeContext,
) -> Result<(Decoded, usize), CompileError> {
    let escape_error = |message: &str| CompileError::InvalidEscape {
        src: chars.iter().collect(),
        message: message.to_owned(),
    };

    if chars[offset] != '\\' {
        return Ok((Decoded::Scalar(chars[offset] as u32), offset + 1));
    }
    if offset + 2 > chars.len() {
        return Err(escape_error("escape must have at least two characters"));
    }

    let escaped = chars[offset + 1];
    let offset = offset + 2;

    if escaped == 'u' {
        let (hex_start, hex_end, next) = if chars.get(offset) == Some(&'{') {
            // \u{...}
            let hex_start = offset + 1;
            let hex_end = chars[hex_start..]
                .iter()
                .position(|&c| c == '}')
                .map(|p| hex_start + p)
                .ok_or_else(|| escape_error("missing closing bracket for unicode escape"))?;
            if hex_start == hex_end {
                return Err(escape_error("missing codepoint for unicode escape"));
            }
            (hex_start, hex_end, hex_end + 1)
        } else {
            // \uXXXX
            let hex_end = offset + 4;
            if hex_end > chars.len() {
                return Err(escape_error(
                    "non-bracketed unicode escape must be of form \\uXXXX",
                ));
            }
            (offset, hex_end, hex_end)
        };
        let digits: String = chars[hex_start..hex_end].iter().collect();
        let codepoint = u32::from_str_radix(&digits, 16)
            .map_err(|_| escape_error("invalid hex value"))?;
        if codepoint > 0x0010_FFFF {
            return Err(escape_error("invalid unicode codepoint"));
        }
        return Ok((Decoded::Scalar(codepoint), next));
    }

    if escaped == 'p' || escaped == 'P' {
        if ctx != EscapeContext::LexerCharset {
            return Err(CompileError::InvalidEscape {
                src: chars.iter().collect(),
                message: format!(
                    "unicode properties are allowed in lexer charsets only (not in {})",
                    ctx.describe()
                ),
            });
        }
        if chars.get(offset) != Some(&'{') {
            return Err(escape_error("unicode properties must use the format `\\p{...}`"));
        }
        let prop_start = offset + 1;
        let prop_end = chars[prop_start..]
            .iter()
            .position(|&c| c == '}')
            .map(|p| prop_start + p)
            .ok_or_else(|| escape_error("missing closing bracket for unicode property escape"))?;
        if prop_start == prop_end {
            return Err(escape_error("missing property name for unicode property escape"));
        }
        let name: String = chars[prop_start..prop_end].iter().collect();
        let ranges = property_ranges(&name, escaped == 'P')?;
        return Ok((Decoded::Ranges(ranges), prop_end + 1));
    }

    let value = match escaped {
        'n' => '\n',
        'r' => '\r',
        'b' => '\u{8}',
        't' => '\t',
        'f' => '\u{c}',
        '\\' => '\\',
        '-' => '-',
        ']' => ']',
        '\'' => '\'',
        _ => return Err(escape_error("invalid escaped value")),
    };
    Ok((Decoded::Scalar(value as u32), offset))
}

/// Decodes a quoted string literal body into its character content.
pub(super) fn unescape_string(s: &str) -> Result<String, CompileError> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut offset = 0;
    while offset < chars.len() {
        let (decoded, next) = decode_char(&chars, offset, EscapeContext::StringLiteral)?;
        let Decoded::Scalar(codepoint) = decoded else {
            unreachable!("property escapes are rejected outside charsets");
        };
        out.push(char::from_u32(codepoint).ok_or_else(|| CompileError::InvalidEscape {
            src: s.to_owned(),
            message: "codepoint is not a unicode scalar value".to_owned(),
        })?);
        offset = next;
    }
    Ok(out)
}

/// Decodes a `[...]` charset body into half-open codepoint ranges.
pub(super) fn charset_intervals(s: &str) -> Result<Vec<(u32, u32)>, CompileError> {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return Err(CompileError::EmptyCharset { src: s.to_owned() });
    }

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let mut offset = 0;
    while offset < chars.len() {
        let in_range = chars[offset] == '-' && offset != 0 && offset != chars.len() - 1;
        if in_range {
            offset += 1;
        }
        let (decoded, next) = decode_char(&chars, offset, EscapeContext::LexerCharset)?;
        offset = next;
        match decoded {
            Decoded::Ranges(property) => {
                if in_range || (offset < chars.len() - 1 && chars[offset] == '-') {
                    return Err(CompileError::InvalidEscape {
                        src: s.to_owned(),
                        message: "unicode property escapes are not allowed in charset ranges"
                            .to_owned(),
                    });
                }
                ranges.extend(property);
            }
            Decoded::Scalar(codepoint) => {
                if in_range {
                    let last = ranges.last_mut().ok_or_else(|| CompileError::InvalidEscape {
                        src: s.to_owned(),
                        message: "range has no start character".to_owned(),
                    })?;
                    last.1 = codepoint + 1;
                } else {
                    ranges.push((codepoint, codepoint + 1));
                }
            }
        }
    }
    Ok(ranges)
}

/// Decodes the endpoints of an `'a'..'z'` range into one half-open
/// codepoint range.
pub(super) fn range_interval(start: &str, stop: &str) -> Result<(u32, u32), CompileError> {
    let decode_single = |s: &str| -> Result<u32, CompileError> {
        let chars: Vec<char> = s.chars().collect();
        let (decoded, next) = decode_char(&chars, 0, EscapeContext::CharacterRange)?;
        let Decoded::Scalar(codepoint) = decoded else {
            unreachable!("property escapes are rejected outside charsets");
        };
        if next < chars.len() {
            return Err(CompileError::InvalidEscape {
                src: s.to_owned(),
                message: "only single characters are allowed in character ranges".to_owned(),
            });
        }
        Ok(codepoint)
    };
    Ok((decode_single(start)?, decode_single(stop)? + 1))
}

/// Decodes a single-character set literal (the `'x'` form inside `~(…)`).
pub(super) fn set_literal(s: &str) -> Result<(u32, u32), CompileError> {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return Err(CompileError::EmptyCharset { src: s.to_owned() });
    }
    let (decoded, next) = decode_char(&chars, 0, EscapeContext::SetLiteral)?;
    let Decoded::Scalar(codepoint) = decoded else {
        unreachable!("property escapes are rejected outside charsets");
    };
    if next < chars.len() {
        return Err(CompileError::InvalidEscape {
            src: s.to_owned(),
            message: "zero or multi-character literals are not allowed in lexer sets".to_owned(),
        });
    }
    Ok((codepoint, codepoint + 1))
}

/// Subtracts every range of `subtrahend` from `minuend`.
pub(super) fn multirange_diff(
    mut minuend: Vec<(u32, u32)>,
    subtrahend: &[(u32, u32)],
) -> Vec<(u32, u32)> {
    for &(s2, e2) in subtrahend {
        minuend = minuend
            .iter()
            .flat_map(|&(s1, e1)| {
                let left = (s1 < s2).then(|| (s1, e1.min(s2)));
                let right = (e1 > e2).then(|| (s1.max(e2), e1));
                [left, right]
            })
            .flatten()
            .filter(|&(s, e)| s < e)
            .collect();
    }
    minuend
}

/// Resolves a `\p{…}` / `\P{…}` property name to codepoint ranges through
/// the regex class tables.
fn property_ranges(name: &str, negated: bool) -> Result<Vec<(u32, u32)>, CompileError> {
    let pattern = format!("\\{}{{{}}}", if negated { 'P' } else { 'p' }, name);
    let hir = regex_syntax::Parser::new()
        .parse(&pattern)
        .map_err(|_| CompileError::UnknownProperty {
            name: name.to_owned(),
        })?;
    match hir.kind() {
        HirKind::Class(Class::Unicode(class)) => Ok(class
            .ranges()
            .iter()
            .map(|range| (range.start() as u32, range.end() as u32 + 1))
            .collect()),
        _ => Err(CompileError::UnknownProperty {
            name: name.to_owned(),
        }),
    }
}

/// Codepoint ranges backing the `.` wildcard, by resolution policy.
pub(super) fn dot_ranges(policy: &str) -> Result<Vec<(u32, u32)>, CompileError> {
    match policy {
        "any_ascii_letter" => Ok(vec![(0x41, 0x5B), (0x61, 0x7B)]),
        "any_ascii_char" => Ok(vec![(0x20, 0x7F)]),
        "any_unicode_char" => {
            // Printable: not a control/format/unassigned codepoint, not a
            // separator, plus the ASCII space.
            let printable = multirange_diff(
                property_ranges("C", true)?,
                &property_ranges("Z", false)?,
            );
            let mut ranges = printable;
            ranges.push((0x20, 0x21));
            Ok(ranges)
        }
        _ => Err(CompileError::UnknownDotPolicy {
            policy: policy.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_characters_pass_through() {
        assert_eq!(unescape_string("abc").unwrap(), "abc");
    }

    #[test]
    fn simple_escapes() {
        assert_eq!(unescape_string("a\\nb\\\\c\\'d").unwrap(), "a\nb\\c'd");
    }

    #[test]
    fn unicode_escapes() {
        assert_eq!(unescape_string("\\u0041").unwrap(), "A");
        assert_eq!(unescape_string("\\u{1F600}").unwrap(), "\u{1F600}");
        assert!(unescape_string("\\u{}").is_err());
        assert!(unescape_string("\\u12").is_err());
    }

    #[test]
    fn property_escapes_are_charset_only() {
        assert!(unescape_string("\\p{L}").is_err());
        let ranges = charset_intervals("\\p{Lu}").unwrap();
        assert!(ranges.iter().any(|&(s, e)| (s..e).contains(&('A' as u32))));
        assert!(!ranges.iter().any(|&(s, e)| (s..e).contains(&('a' as u32))));
    }

    #[test]
    fn charset_ranges() {
        assert_eq!(charset_intervals("a-z").unwrap(), [(97, 123)]);
        assert_eq!(
            charset_intervals("a-cx0-9").unwrap(),
            [(97, 100), (120, 121), (48, 58)]
        );
        // A leading or trailing dash is a literal dash.
        assert_eq!(charset_intervals("-a").unwrap(), [(45, 46), (97, 98)]);
        assert_eq!(charset_intervals("a-").unwrap(), [(97, 98), (45, 46)]);
    }

    #[test]
    fn character_range_endpoints() {
        assert_eq!(range_interval("a", "z").unwrap(), (97, 123));
        assert_eq!(range_interval("\\u0030", "\\u0039").unwrap(), (48, 58));
        assert!(range_interval("ab", "z").is_err());
    }

    #[test]
    fn multirange_subtraction() {
        assert_eq!(
            multirange_diff(vec![(0, 10)], &[(3, 5)]),
            [(0, 3), (5, 10)]
        );
        assert_eq!(multirange_diff(vec![(0, 10)], &[(0, 10)]), []);
        assert_eq!(
            multirange_diff(vec![(0, 4), (6, 10)], &[(2, 8)]),
            [(0, 2), (8, 10)]
        );
    }

    #[test]
    fn dot_policies() {
        assert_eq!(dot_ranges("any_ascii_letter").unwrap(), [(0x41, 0x5B), (0x61, 0x7B)]);
        assert_eq!(dot_ranges("any_ascii_char").unwrap(), [(0x20, 0x7F)]);
        assert!(dot_ranges("any_unicode_char").unwrap().len() > 100);
        assert!(dot_ranges("anything_else").is_err());
    }
}
