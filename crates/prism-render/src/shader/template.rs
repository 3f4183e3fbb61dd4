//! WGSL template expansion.
//!
//! Shader sources are plain WGSL plus a handful of line directives:
//!
//! - `#include <name>` splices a chunk from the library.
//! - `#if EXPR` / `#elif EXPR` / `#else` / `#endif` keep or drop lines. An
//!   expression is a list of names, optionally negated with `!`, joined with
//!   `&&` or `||` (`&&` binds tighter). A name is true when it is defined with a
//!   value other than `0`.
//! - `#unroll i in A..B` / `#end_unroll` repeats the enclosed lines once per
//!   index. Bounds are integers or define names. Inside the body `@i@` becomes
//!   the index and `@i+K@` the index plus `K`.
//! - `{{NAME}}` is replaced with the define's value.
//!
//! Expansion runs in that order: includes, conditionals, unrolling, values.

use std::collections::BTreeMap;

use super::chunks;

/// Named values visible to a template.
pub type Defines = BTreeMap<String, String>;

/// Nested includes deeper than this are treated as a cycle.
pub const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown shader chunk <{0}>")]
    UnknownChunk(String),

    #[error("include depth limit reached while expanding <{0}>")]
    IncludeDepth(String),

    #[error("line {line}: {message}")]
    Directive { line: usize, message: String },

    #[error("template value '{0}' is not defined")]
    Undefined(String),
}

/// Expand `source` against `defines`.
pub fn expand(source: &str, defines: &Defines) -> Result<String, TemplateError> {
    let mut included = String::with_capacity(source.len());
    resolve_includes(source, 0, &mut included)?;
    let conditioned = apply_conditionals(&included, defines)?;
    let lines: Vec<&str> = conditioned.lines().collect();
    let mut unrolled = String::with_capacity(conditioned.len());
    unroll_lines(&lines, defines, &mut unrolled)?;
    substitute(&unrolled, defines)
}

fn directive_error(line: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::Directive {
        line: line + 1,
        message: message.into(),
    }
}

/// Split a directive line into its keyword and argument.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if !trimmed.starts_with('#') {
        return None;
    }
    match trimmed.split_once(char::is_whitespace) {
        Some((keyword, rest)) => Some((keyword, rest.trim())),
        None => Some((trimmed, "")),
    }
}

fn resolve_includes(source: &str, depth: usize, out: &mut String) -> Result<(), TemplateError> {
    for (index, line) in source.lines().enumerate() {
        match split_directive(line) {
            Some(("#include", argument)) => {
                let name = argument
                    .strip_prefix('<')
                    .and_then(|rest| rest.strip_suffix('>'))
                    .map(str::trim)
                    .ok_or_else(|| directive_error(index, format!("malformed include '{argument}'")))?;
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(TemplateError::IncludeDepth(name.to_string()));
                }
                let chunk = chunks::get(name).ok_or_else(|| TemplateError::UnknownChunk(name.to_string()))?;
                resolve_includes(chunk, depth + 1, out)?;
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Ok(())
}

fn is_defined(defines: &Defines, name: &str) -> bool {
    defines
        .get(name)
        .is_some_and(|value| !value.is_empty() && value != "0")
}

fn evaluate(expression: &str, defines: &Defines, line: usize) -> Result<bool, TemplateError> {
    if expression.is_empty() {
        return Err(directive_error(line, "missing condition"));
    }
    let mut any = false;
    for alternative in expression.split("||") {
        let mut all = true;
        for term in alternative.split("&&") {
            let term = term.trim();
            let (negated, name) = match term.strip_prefix('!') {
                Some(name) => (true, name.trim()),
                None => (false, term),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(directive_error(line, format!("invalid condition '{term}'")));
            }
            all &= is_defined(defines, name) != negated;
        }
        any |= all;
    }
    Ok(any)
}

struct Branch {
    /// Whether the enclosing block is emitting lines.
    parent_active: bool,
    /// Whether some branch of this block was already taken.
    taken: bool,
    seen_else: bool,
}

fn apply_conditionals(source: &str, defines: &Defines) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    let mut stack: Vec<Branch> = Vec::new();
    let mut active = true;

    for (index, line) in source.lines().enumerate() {
        match split_directive(line) {
            Some(("#if", expression)) => {
                let condition = evaluate(expression, defines, index)?;
                stack.push(Branch {
                    parent_active: active,
                    taken: condition,
                    seen_else: false,
                });
                active = active && condition;
            }
            Some(("#elif", expression)) => {
                let condition = evaluate(expression, defines, index)?;
                let branch = stack
                    .last_mut()
                    .ok_or_else(|| directive_error(index, "#elif without #if"))?;
                if branch.seen_else {
                    return Err(directive_error(index, "#elif after #else"));
                }
                let take = !branch.taken && condition;
                branch.taken |= take;
                active = branch.parent_active && take;
            }
            Some(("#else", _)) => {
                let branch = stack
                    .last_mut()
                    .ok_or_else(|| directive_error(index, "#else without #if"))?;
                if branch.seen_else {
                    return Err(directive_error(index, "duplicate #else"));
                }
                branch.seen_else = true;
                active = branch.parent_active && !branch.taken;
                branch.taken = true;
            }
            Some(("#endif", _)) => {
                let branch = stack
                    .pop()
                    .ok_or_else(|| directive_error(index, "#endif without #if"))?;
                active = branch.parent_active;
            }
            _ => {
                if active {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
    }

    if !stack.is_empty() {
        return Err(directive_error(
            source.lines().count().saturating_sub(1),
            "unterminated #if",
        ));
    }
    Ok(out)
}

fn bound(token: &str, defines: &Defines, line: usize) -> Result<u32, TemplateError> {
    let token = token.trim();
    if let Ok(value) = token.parse::<u32>() {
        return Ok(value);
    }
    let value = defines
        .get(token)
        .ok_or_else(|| TemplateError::Undefined(token.to_string()))?;
    value
        .parse::<u32>()
        .map_err(|_| directive_error(line, format!("unroll bound '{token}' is not an integer")))
}

fn unroll_lines(lines: &[&str], defines: &Defines, out: &mut String) -> Result<(), TemplateError> {
    let mut index = 0;
    while index < lines.len() {
        match split_directive(lines[index]) {
            Some(("#unroll", header)) => {
                let parts: Vec<&str> = header.split_whitespace().collect();
                let (variable, range) = match parts.as_slice() {
                    [variable, "in", range] => (*variable, *range),
                    _ => return Err(directive_error(index, format!("malformed unroll '{header}'"))),
                };
                let (start, end) = range
                    .split_once("..")
                    .ok_or_else(|| directive_error(index, format!("malformed range '{range}'")))?;
                let start = bound(start, defines, index)?;
                let end = bound(end, defines, index)?;

                let mut depth = 1;
                let mut close = index + 1;
                while close < lines.len() {
                    match split_directive(lines[close]) {
                        Some(("#unroll", _)) => depth += 1,
                        Some(("#end_unroll", _)) => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    close += 1;
                }
                if close == lines.len() {
                    return Err(directive_error(index, "unterminated #unroll"));
                }

                let body = &lines[index + 1..close];
                for value in start..end {
                    let replaced: Vec<String> = body
                        .iter()
                        .map(|line| replace_markers(line, variable, value))
                        .collect();
                    let refs: Vec<&str> = replaced.iter().map(String::as_str).collect();
                    unroll_lines(&refs, defines, out)?;
                }
                index = close + 1;
            }
            Some(("#end_unroll", _)) => {
                return Err(directive_error(index, "#end_unroll without #unroll"));
            }
            _ => {
                out.push_str(lines[index]);
                out.push('\n');
                index += 1;
            }
        }
    }
    Ok(())
}

/// Value of an `@var@` / `@var+K@` marker, `None` when `marker` is something else.
fn marker_value(marker: &str, variable: &str, value: u32) -> Option<u32> {
    let rest = marker.strip_prefix(variable)?;
    if rest.is_empty() {
        return Some(value);
    }
    let offset = rest.strip_prefix('+')?.trim().parse::<u32>().ok()?;
    Some(value + offset)
}

fn replace_markers(line: &str, variable: &str, value: u32) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find('@') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        if let Some(end) = after.find('@')
            && let Some(resolved) = marker_value(&after[..end], variable, value)
        {
            out.push_str(&resolved.to_string());
            rest = &after[end + 1..];
            continue;
        }
        out.push('@');
        rest = after;
    }
    out.push_str(rest);
    out
}

fn substitute(source: &str, defines: &Defines) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Undefined(after.lines().next().unwrap_or("").to_string()))?;
        let name = after[..end].trim();
        let value = defines
            .get(name)
            .ok_or_else(|| TemplateError::Undefined(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
