//! Trailing keyword parts of multi-keyword message sends.
//!
//! A step point of `dict at: k put: v` sits on `at:`. Editors also want `put:` to be a
//! breakpoint location for the same step point.

/// Step point position with the selector token found at its offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPointInfo {
    pub step_point: u32,
    /// 0-based character offset.
    pub offset: usize,
    pub selector: String,
}

impl StepPointInfo {
    /// Read the selector token starting at `offset` of `source`.
    pub fn at(source: &str, step_point: u32, offset: usize) -> Self {
        let chars: Vec<char> = source.chars().skip(offset).take(256).collect();
        let selector = match chars.first() {
            Some(c) if is_ident_start(*c) => {
                let len = chars.iter().take_while(|c| is_ident_part(**c)).count();
                let mut token: String = chars[..len].iter().collect();
                if chars.get(len) == Some(&':') && chars.get(len + 1) != Some(&'=') {
                    token.push(':');
                }
                token
            }
            Some(c) if is_binary(*c) => chars.iter().take_while(|c| is_binary(**c)).collect(),
            Some(c) => c.to_string(),
            None => String::new(),
        };
        Self {
            step_point,
            offset,
            selector,
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_binary(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '*' | '/' | '\\' | '<' | '>' | '=' | '~' | ',' | '@' | '%' | '|' | '&' | '?'
    )
}

/// Return `infos` followed, for every keyword selector, by its sibling keyword parts.
pub fn expand_keyword_parts(source: &str, infos: &[StepPointInfo]) -> Vec<StepPointInfo> {
    let chars: Vec<char> = source.chars().collect();
    let mut expanded = infos.to_vec();
    for info in infos.iter().filter(|i| i.selector.ends_with(':')) {
        let from = info.offset + info.selector.chars().count();
        expanded.extend(
            sibling_keywords(&chars, from)
                .into_iter()
                .map(|(offset, selector)| StepPointInfo {
                    step_point: info.step_point,
                    offset,
                    selector,
                }),
        );
    }
    expanded
}

/// Scan keyword tokens at the nesting depth of `from`.
fn sibling_keywords(chars: &[char], from: usize) -> Vec<(usize, String)> {
    let mut found = vec![];
    let mut depth = 0usize;
    let mut pos = from;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            '\'' => pos = skip_string(chars, pos),
            '"' => pos = skip_comment(chars, pos),
            '$' => pos += 2,
            '#' => {
                pos += 1;
                match chars.get(pos) {
                    Some('\'') => pos = skip_string(chars, pos),
                    Some('(' | '[' | '{') => {
                        depth += 1;
                        pos += 1;
                    }
                    Some(c) if is_binary(*c) => {
                        pos += chars[pos..].iter().take_while(|c| is_binary(**c)).count()
                    }
                    _ => {
                        pos += chars[pos..]
                            .iter()
                            .take_while(|c| is_ident_part(**c) || **c == ':')
                            .count()
                    }
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                pos += 1;
            }
            ')' | ']' | '}' => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                pos += 1;
            }
            '.' | ';' | '!' if depth == 0 => break,
            c if c.is_ascii_digit() => {
                pos += 1;
                while pos < chars.len() {
                    let next = chars[pos];
                    let fraction =
                        next == '.' && chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit());
                    if next.is_alphanumeric() || fraction {
                        pos += 1;
                    } else {
                        break;
                    }
                }
            }
            c if is_ident_start(c) => {
                let start = pos;
                pos += chars[pos..].iter().take_while(|c| is_ident_part(**c)).count();
                let keyword = chars.get(pos) == Some(&':') && chars.get(pos + 1) != Some(&'=');
                if keyword {
                    pos += 1;
                    if depth == 0 {
                        found.push((start, chars[start..pos].iter().collect()));
                    }
                }
            }
            _ => pos += 1,
        }
    }
    found
}

/// Position after the closing quote, doubled quotes are escapes.
fn skip_string(chars: &[char], open: usize) -> usize {
    let mut pos = open + 1;
    while pos < chars.len() {
        if chars[pos] == '\'' {
            if chars.get(pos + 1) == Some(&'\'') {
                pos += 2;
                continue;
            }
            return pos + 1;
        }
        pos += 1;
    }
    pos
}

fn skip_comment(chars: &[char], open: usize) -> usize {
    chars[open + 1..]
        .iter()
        .position(|c| *c == '"')
        .map(|p| open + p + 2)
        .unwrap_or(chars.len())
}
