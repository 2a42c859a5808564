// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

//! Section-based Markdown configuration parser.
//!
//! MyOS's on-disk config files (`Project.md`, `Templates.md`, `ACLs.md`,
//! `Config.md`) are plain Markdown with a simple convention: any line
//! starting with one or more `#` followed by a space opens a new section
//! named by whatever follows, and every line until the next such heading
//! (or a blank line) belongs to it. Hash count is irrelevant to section
//! opening: `# Permissions`, `## Folder`, and `### Folder` all open a
//! section the same way, which lets ACLs.md group role sections under a
//! cosmetic top heading without true nesting. The one exception is a
//! header-style property line (`#### inherit: dynamic`): when a `: `
//! follows the first space, the line is treated as a property of the
//! currently open section instead of a new heading, and is dropped
//! entirely if no section is open. A blank line always closes the
//! current section and returns to the sleeping state.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// One parsed value: MyOS config sections hold either a merged mapping of
/// keys to values, a flat list of bare entries, or (when a section mixes
/// scalar prose with a single stray heading) a simple string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Dict(HashMap<String, Vec<String>>),
    List(Vec<String>),
    Scalar(String),
}

/// A parsed document: section name -> finalized value.
pub type Document = HashMap<String, Value>;

#[derive(Debug, Default)]
struct Section {
    name: String,
    items: Vec<Item>,
}

#[derive(Debug)]
enum Item {
    Pair(String, Vec<String>),
    Bare(String),
    BareList(Vec<String>),
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Sleeping,
    Parsing,
}

/// Parses the section-delimited Markdown convention MyOS config files use.
///
/// Parsing never fails: malformed input degrades to an empty document, with
/// a `tracing::warn!` describing what was skipped. Callers that need a
/// stricter contract should validate the resulting `Document` themselves.
pub fn parse(content: &str) -> Document {
    let mut state = State::Sleeping;
    let mut sections: Vec<Section> = Vec::new();
    let mut current: Option<Section> = None;

    for raw_line in content.lines() {
        let stripped = raw_line.trim();

        // Header-style property ("#### inherit: dynamic"): only recognized
        // while a section is already open; otherwise the line is dropped.
        if is_header_property(stripped) {
            if state == State::Parsing {
                if let Some(sec) = current.as_mut() {
                    let content_part = stripped.trim_start_matches('#').trim();
                    if let Some(item) = parse_line(content_part) {
                        sec.items.push(item);
                    }
                }
            }
            continue;
        }

        // Any `#`-run followed by a space opens a new section, regardless
        // of hash count.
        if let Some(name) = top_level_heading(stripped) {
            close_section(&mut current, &mut sections);
            current = Some(Section {
                name: name.to_string(),
                items: Vec::new(),
            });
            state = State::Parsing;
            continue;
        }

        if state != State::Parsing {
            continue;
        }
        let Some(sec) = current.as_mut() else {
            continue;
        };

        if stripped.is_empty() {
            close_section(&mut current, &mut sections);
            state = State::Sleeping;
            continue;
        }

        match parse_line(stripped) {
            Some(item) => sec.items.push(item),
            None => {
                tracing::warn!(line = stripped, "invalid config line, closing section");
                close_section(&mut current, &mut sections);
                state = State::Sleeping;
            }
        }
    }
    close_section(&mut current, &mut sections);

    let mut doc = Document::new();
    for sec in sections {
        doc.insert(sec.name.clone(), finalize(sec.items));
    }
    doc
}

/// Finalizes the currently open section, if any, dropping it entirely when
/// it never collected any items (an empty cosmetic heading like `# Permissions`
/// immediately followed by a blank line).
fn close_section(current: &mut Option<Section>, sections: &mut Vec<Section>) {
    if let Some(sec) = current.take() {
        if !sec.items.is_empty() {
            sections.push(sec);
        }
    }
}

/// Parses a file, retrying with latin-1 if it isn't valid UTF-8.
pub fn parse_file(path: &Path) -> Result<Document> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let text = match String::from_utf8(bytes.clone()) {
        Ok(s) => s,
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    };
    Ok(parse(&text))
}

/// Returns the `inherit` property of a section, if one is present, handling
/// both the dict form (`inherit: fix`) and the list-of-dicts-with-one-dict
/// form the original implementation also accepts.
pub fn find_inherit(value: &Value) -> Option<String> {
    match value {
        Value::Dict(map) => map.get("inherit").and_then(|v| v.first()).cloned(),
        Value::List(items) => {
            // A single bare "inherit: x" line that fails to merge into a
            // dict (e.g. because the section also has plain list items)
            // shows up as a list entry of the form "inherit: x".
            items.iter().find_map(|item| {
                item.strip_prefix("inherit:")
                    .map(|rest| rest.trim().to_string())
            })
        }
        Value::Scalar(_) => None,
    }
}

/// A header-style property line is any `#`-prefixed line whose first `: `
/// occurs after its first space, e.g. `#### inherit: dynamic` (first space
/// right after the hash run, `: ` further along in "inherit: dynamic").
/// A plain heading like `## Admin` has no `: ` at all and fails this check.
fn is_header_property(stripped: &str) -> bool {
    if !stripped.starts_with('#') {
        return false;
    }
    let Some(first_space) = stripped.find(' ') else {
        return false;
    };
    match stripped.find(": ") {
        Some(colon_space) => colon_space > first_space,
        None => false,
    }
}

/// Opens a section for any `#`-run followed by a space, independent of
/// hash count, unless `is_header_property` already claimed the line.
fn top_level_heading(stripped: &str) -> Option<&str> {
    if !stripped.starts_with('#') {
        return None;
    }
    let first_space = stripped.find(' ')?;
    Some(stripped[first_space..].trim())
}

/// Parses a single section content line into an item: a `key: value` pair
/// (value comma-split into a list), a `* ` prefixed bare entry, a bare
/// comma-separated list, or a single bare token. Anything else (including
/// an empty line once its own trailing comment is stripped) returns `None`,
/// which closes the current section.
fn parse_line(line: &str) -> Option<Item> {
    let line = match line.find('#') {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    };
    if line.is_empty() {
        return None;
    }

    if let Some(pos) = line.find(": ") {
        let key = line[..pos].trim().to_string();
        let value = line[pos + 2..].trim();
        let values = if value.contains(',') {
            value.split(',').map(|v| v.trim().to_string()).collect()
        } else {
            vec![value.to_string()]
        };
        if !key.is_empty() {
            return Some(Item::Pair(key, values));
        }
        return None;
    }

    if let Some(rest) = line.strip_prefix("* ") {
        return Some(Item::Bare(rest.trim().to_string()));
    }

    if line.contains(',') {
        let items: Vec<String> = line.split(',').map(|v| v.trim().to_string()).collect();
        if items.len() == 1 && !items[0].is_empty() {
            return Some(Item::Bare(items.into_iter().next().unwrap()));
        }
        return Some(Item::BareList(items));
    }

    if !line.contains(' ') {
        return Some(Item::Bare(line.to_string()));
    }

    None
}

/// Merges items collected in one section into their final shape: a dict
/// when every item is a `key: value` pair (duplicate keys overwrite, last
/// one wins, mirroring a plain `dict.update`), otherwise a flat list of
/// bare entries (with any stray pair rendered back as `key: value`).
fn finalize(items: Vec<Item>) -> Value {
    if items.is_empty() {
        return Value::List(Vec::new());
    }

    let all_pairs = items.iter().all(|i| matches!(i, Item::Pair(_, _)));
    if all_pairs {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for item in items {
            if let Item::Pair(k, values) = item {
                map.insert(k, values);
            }
        }
        return Value::Dict(map);
    }

    let mut flat = Vec::new();
    for item in items {
        match item {
            Item::Bare(s) => flat.push(s),
            Item::BareList(values) => flat.extend(values),
            Item::Pair(k, values) => flat.push(format!("{k}: {}", values.join(", "))),
        }
    }
    if flat.len() == 1 {
        Value::Scalar(flat.into_iter().next().unwrap())
    } else {
        Value::List(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_templates_section_as_list() {
        let doc = parse("# Templates\n* standard\n* rust\n");
        match doc.get("Templates").unwrap() {
            Value::List(items) => assert_eq!(items, &vec!["standard".to_string(), "rust".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_properties_as_dict_with_inherit() {
        let doc = parse("# Templates\n#### inherit: dynamic\nName: demo\n");
        let value = doc.get("Templates").unwrap();
        assert_eq!(find_inherit(value).as_deref(), Some("dynamic"));
        match value {
            Value::Dict(map) => {
                assert_eq!(map.get("Name"), Some(&vec!["demo".to_string()]));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn strips_inline_comments_but_keeps_heading_hash() {
        let doc = parse("# Project\nName: demo # trailing note\n");
        match doc.get("Project").unwrap() {
            Value::Dict(map) => assert_eq!(map.get("Name"), Some(&vec!["demo".to_string()])),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_and_malformed_input_never_fails() {
        let doc = parse("not a heading\nneither: :: is this\n");
        assert!(doc.is_empty());
    }

    #[test]
    fn comma_list_single_line_becomes_list() {
        let doc = parse("# Roles\nadmin, editor, viewer\n");
        match doc.get("Roles").unwrap() {
            Value::List(items) => {
                assert_eq!(items, &vec!["admin".to_string(), "editor".to_string(), "viewer".to_string()])
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn single_bare_token_becomes_scalar() {
        let doc = parse("# Project\nstandalone\n");
        assert_eq!(doc.get("Project"), Some(&Value::Scalar("standalone".to_string())));
    }

    #[test]
    fn nested_hash_headings_open_sections_independent_of_hash_count() {
        let doc = parse("# Permissions\n\n## Folder\n- /{Folder}/: read, write\n\n## Admin\n- /*: read, write, execute\n");
        assert!(!doc.contains_key("Permissions"));
        match doc.get("Folder").unwrap() {
            Value::Dict(map) => {
                assert_eq!(
                    map.get("- /{Folder}/"),
                    Some(&vec!["read".to_string(), "write".to_string()])
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
        match doc.get("Admin").unwrap() {
            Value::Dict(map) => {
                assert_eq!(
                    map.get("- /*"),
                    Some(&vec!["read".to_string(), "write".to_string(), "execute".to_string()])
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn comma_separated_value_in_pair_splits_into_list() {
        let doc = parse("# Users\nOliver: Admin, Worker\n");
        match doc.get("Users").unwrap() {
            Value::Dict(map) => {
                assert_eq!(
                    map.get("Oliver"),
                    Some(&vec!["Admin".to_string(), "Worker".to_string()])
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn blank_line_closes_section_and_drops_trailing_stray_line() {
        let doc = parse("# Templates\nstandard\n\nstray\n");
        assert_eq!(doc.get("Templates"), Some(&Value::Scalar("standard".to_string())));
    }
}
