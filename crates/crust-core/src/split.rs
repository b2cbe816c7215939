//! ABI-preserving function splitting.
//!
//! A `#[no_mangle]` function whose signature must stay foreign-ABI-compatible
//! is split in two: a shim keeping the original signature, attributes, and
//! calling convention, whose body only forwards to a new `<name>_impl`
//! function holding the real logic. Direct calls elsewhere in the tree are
//! redirected to the implementation, so making it safe later never disturbs
//! external callers' linkage expectations.
//!
//! The transformation is lexical: it matches tokens and balanced delimiters,
//! skipping string literals and comments, and never type-checks anything.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crust_store::{NodeId, Store, StoreError};

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub tree: NodeId,
    pub split_functions: Vec<String>,
    pub changed: bool,
}

/// Split every named export found as a `#[no_mangle]` function in the tree.
/// Already-split functions (an `_impl` sibling exists) are left alone, so the
/// transformation is idempotent across iterations.
pub fn split_ffi_exports(
    store: &Store,
    tree: NodeId,
    exports: &BTreeSet<String>,
) -> Result<SplitOutcome, StoreError> {
    let tree_node = store.get_tree(tree)?;
    let mut texts: BTreeMap<String, String> = BTreeMap::new();
    for (path, id) in &tree_node.files {
        if path.ends_with(".rs") {
            let file = store.get_file(*id)?;
            texts.insert(path.clone(), String::from_utf8_lossy(&file.body).into_owned());
        }
    }

    let mut split_functions = Vec::new();
    for name in exports {
        for text in texts.values_mut() {
            if let Some(updated) = split_function(text, name) {
                *text = updated;
                split_functions.push(name.clone());
                break;
            }
        }
    }

    if split_functions.is_empty() {
        return Ok(SplitOutcome {
            tree,
            split_functions,
            changed: false,
        });
    }

    for name in &split_functions {
        for text in texts.values_mut() {
            *text = rename_calls(text, name, &format!("{name}_impl"));
        }
    }

    let mut files = tree_node.files.clone();
    for (path, text) in texts {
        let id = store.put_file(text.into_bytes())?;
        files.insert(path, id);
    }
    let new_tree = store.put_tree(files)?;
    debug!(functions = split_functions.len(), "split ffi entry points");
    Ok(SplitOutcome {
        tree: new_tree,
        split_functions,
        changed: new_tree != tree,
    })
}

/// Split one function in `text`, returning the rewritten file, or `None` if
/// the function is absent, lacks a link attribute, or was already split.
pub(crate) fn split_function(text: &str, name: &str) -> Option<String> {
    if text.contains(&format!("fn {name}_impl")) {
        return None;
    }
    let pattern = format!("fn {name}");

    let mut search_from = 0;
    while let Some(found) = text[search_from..].find(&pattern) {
        let idx = search_from + found;
        search_from = idx + pattern.len();

        if !is_token_boundary(text, idx, pattern.len()) {
            continue;
        }
        let line_start = text[..idx].rfind('\n').map_or(0, |i| i + 1);
        if !has_link_attribute(text, line_start) {
            continue;
        }

        let after = idx + pattern.len();
        let open_paren = after + text[after..].find('(')?;
        if !text[after..open_paren].trim().is_empty() {
            continue;
        }
        let close_paren = matching_delimiter(text, open_paren, b'(', b')')?;
        let body_open = find_body_open(text, close_paren + 1)?;
        let body_close = matching_delimiter(text, body_open, b'{', b'}')?;

        let header = &text[line_start..=body_open];
        let params = &text[open_paren + 1..close_paren];
        let args = param_names(params).join(", ");
        let body = &text[body_open + 1..body_close];

        let impl_header = header
            .replacen(&pattern, &format!("fn {name}_impl"), 1)
            .replacen("extern \"C\" ", "", 1);

        let mut out = String::with_capacity(text.len() + header.len() + 64);
        out.push_str(&text[..line_start]);
        out.push_str(header);
        out.push_str(&format!("\n    {name}_impl({args})\n}}\n\n"));
        out.push_str(&impl_header);
        out.push_str(body);
        out.push('}');
        out.push_str(&text[body_close + 1..]);
        return Some(out);
    }
    None
}

/// Redirect direct calls `from(…)` to `to(…)`, leaving declarations
/// (`fn from`) untouched.
pub(crate) fn rename_calls(text: &str, from: &str, to: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while let Some(found) = text[i..].find(from) {
        let at = i + found;
        let end = at + from.len();
        let before_ok = at == 0 || !is_ident_byte(bytes[at - 1]);
        let after_ok = end < bytes.len() && bytes[end] == b'(';
        let prefix = text[..at].trim_end();
        let is_decl = prefix.ends_with("fn")
            && !prefix
                .as_bytes()
                .get(prefix.len().wrapping_sub(3))
                .copied()
                .is_some_and(is_ident_byte);
        if before_ok && after_ok && !is_decl {
            out.push_str(&text[i..at]);
            out.push_str(to);
        } else {
            out.push_str(&text[i..end]);
        }
        i = end;
    }
    out.push_str(&text[i..]);
    out
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_token_boundary(text: &str, idx: usize, len: usize) -> bool {
    let bytes = text.as_bytes();
    let before_ok = idx == 0 || !is_ident_byte(bytes[idx - 1]);
    let end = idx + len;
    let after_ok = end >= bytes.len() || !is_ident_byte(bytes[end]);
    before_ok && after_ok
}

/// Does the attribute block directly above `line_start` export this symbol?
fn has_link_attribute(text: &str, line_start: usize) -> bool {
    let mut rest = &text[..line_start];
    loop {
        let rest_trimmed = rest.trim_end_matches(['\n', '\r']);
        let prev_start = rest_trimmed.rfind('\n').map_or(0, |i| i + 1);
        let line = rest_trimmed[prev_start..].trim();
        if line.starts_with("#[") {
            if line.contains("no_mangle") || line.contains("export_name") {
                return true;
            }
            rest = &rest_trimmed[..prev_start];
        } else {
            return false;
        }
    }
}

/// First `{` at nesting depth zero after the parameter list; `None` when a
/// `;` shows up first (a bodyless declaration).
fn find_body_open(text: &str, mut i: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if depth == 0 => return Some(i),
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b';' if depth == 0 => return None,
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the delimiter closing the one at `open_idx`, skipping string
/// literals, character literals, and comments.
fn matching_delimiter(text: &str, open_idx: usize, open: u8, close: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut i = open_idx;
    while i < bytes.len() {
        let b = bytes[i];
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        } else if b == b'"' {
            i = skip_string(bytes, i)?;
        } else if b == b'\'' {
            i = skip_char_or_lifetime(bytes, i);
        } else if b == b'/' && i + 1 < bytes.len() {
            match bytes[i + 1] {
                b'/' => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'*' => {
                    i += 2;
                    while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                        i += 1;
                    }
                    i += 1;
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn skip_string(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Distinguish `'a'`/`'\n'` from lifetimes like `'static`.
fn skip_char_or_lifetime(bytes: &[u8], start: usize) -> usize {
    if start + 1 < bytes.len() && bytes[start + 1] == b'\\' {
        let mut i = start + 2;
        while i < bytes.len() && bytes[i] != b'\'' {
            i += 1;
        }
        return i;
    }
    if start + 2 < bytes.len() && bytes[start + 2] == b'\'' {
        return start + 2;
    }
    start
}

/// Argument names from a parameter list, for the forwarding call.
fn param_names(params: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in params.chars() {
        match c {
            '(' | '[' | '<' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '>' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                if let Some(name) = param_name(&current) {
                    names.push(name);
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if let Some(name) = param_name(&current) {
        names.push(name);
    }
    names
}

fn param_name(param: &str) -> Option<String> {
    let pattern = param.split(':').next()?.trim();
    let name = pattern.strip_prefix("mut ").unwrap_or(pattern).trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
