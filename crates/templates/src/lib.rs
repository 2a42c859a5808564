// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

//! Template scanning and embryo materialization ("birth").
//!
//! A project's `Templates/` directory holds one subtree per configured
//! template name; each template's top-level subdirectories double as ACL
//! role names (see `myos-acl`). An "embryo" is a virtual path that exists
//! in the merged template tree but not yet on disk; birthing it copies the
//! matching template subtree onto the physical filesystem.

use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Failure taxonomy for template resolution and materialization.
#[derive(Debug, Error)]
pub enum BirthError {
    #[error("invalid embryo path: {0}")]
    InvalidPath(String),
    #[error("no template provides path: {0}")]
    NoTemplate(String),
    #[error("unsafe template source: {0}")]
    UnsafeTemplate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lists the template names physically present under `templates_dir`.
pub fn list_templates(templates_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(templates_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Lists the immediate subdirectory names of a single template, which
/// double as the ACL role names that template contributes.
pub fn list_template_roles(templates_dir: &Path, template_name: &str) -> Vec<String> {
    let dir = templates_dir.join(template_name);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Resolves an embryo's virtual path to the template source directory or
/// file that should be copied to materialize it.
///
/// Runs the full path-traversal safety pipeline: percent-decoding of
/// encoded separators, rejection of `..`, rejection of absolute/UNC/drive
/// forms, and rejection of any hidden (`.`-prefixed) segment, before
/// searching each configured template in order for a matching subtree.
pub fn find_template_source(
    templates_dir: &Path,
    template_names: &[String],
    embryo_path: &str,
) -> Result<PathBuf, BirthError> {
    if embryo_path.is_empty() {
        return Err(BirthError::InvalidPath("empty path".to_string()));
    }

    let decoded = percent_decode(embryo_path);
    let normalized = decoded.replace('\\', "/");

    if normalized.split('/').any(|seg| seg == "..") {
        return Err(BirthError::InvalidPath(format!(
            "path traversal rejected (CWE-22): {embryo_path}"
        )));
    }
    if normalized.starts_with('/') {
        if normalized.starts_with("//") {
            return Err(BirthError::InvalidPath(format!(
                "UNC-style path rejected: {embryo_path}"
            )));
        }
        return Err(BirthError::InvalidPath(format!(
            "absolute path rejected: {embryo_path}"
        )));
    }
    let bytes = normalized.as_bytes();
    if bytes.len() > 2 && bytes[1] == b':' && bytes[2] == b'/' {
        return Err(BirthError::InvalidPath(format!(
            "drive-letter path rejected: {embryo_path}"
        )));
    }
    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    if segments.iter().any(|seg| seg.starts_with('.')) {
        return Err(BirthError::InvalidPath(format!(
            "hidden segment rejected: {embryo_path}"
        )));
    }

    for name in template_names {
        if name.contains("..") || name.contains('/') {
            continue;
        }
        let mut current = templates_dir.join(name);
        let mut matched = true;
        for seg in &segments {
            current = current.join(seg);
            if !current.exists() {
                matched = false;
                break;
            }
        }
        if matched {
            return Ok(current);
        }
    }

    Err(BirthError::NoTemplate(embryo_path.to_string()))
}

/// Materializes an embryo at `project_root.join(embryo_path)` by copying
/// the matching template subtree, refusing any symlink along the way.
pub fn give_birth(
    templates_dir: &Path,
    template_names: &[String],
    project_root: &Path,
    embryo_path: &str,
) -> Result<PathBuf, BirthError> {
    let source = find_template_source(templates_dir, template_names, embryo_path)?;
    validate_no_symlinks(&source)?;

    let rel = embryo_path.trim_start_matches('/');
    let target = project_root.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    copy_safely(&source, &target)?;
    tracing::info!(embryo = embryo_path, target = %target.display(), "birthed embryo");
    Ok(target)
}

/// Walks `source` refusing to proceed if any entry, file or directory, is
/// a symlink.
fn validate_no_symlinks(source: &Path) -> Result<(), BirthError> {
    let meta = fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        return Err(BirthError::UnsafeTemplate(format!(
            "template source is a symlink: {}",
            source.display()
        )));
    }
    if !meta.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        validate_no_symlinks(&entry.path())?;
    }
    Ok(())
}

fn copy_safely(source: &Path, target: &Path) -> Result<(), BirthError> {
    let meta = fs::symlink_metadata(source)?;
    if meta.is_dir() {
        fs::create_dir_all(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            copy_safely(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else if meta.is_file() {
        fs::copy(source, target)?;
    }
    Ok(())
}

/// Rejects any relative-path component that escapes via `..` or a root
/// marker; used when copying arbitrary relative paths out of a template.
pub fn ensure_safe_rel_path(path: &Path) -> Result<(), BirthError> {
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(BirthError::InvalidPath(format!(
                "unsafe path component in {}",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Minimal percent-decoder: first resolves the separator-shaped escapes
/// (`%2f`, `%5c`, `%2e`) the traversal check cares about, then decodes any
/// remaining `%XX` sequences.
fn percent_decode(input: &str) -> String {
    let once = replace_separator_escapes(input);
    decode_percent_generic(&once)
}

fn replace_separator_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &input[i + 1..i + 3];
            match hex.to_ascii_lowercase().as_str() {
                "2f" => {
                    out.push('/');
                    i += 3;
                    continue;
                }
                "5c" => {
                    out.push('\\');
                    i += 3;
                    continue;
                }
                "2e" => {
                    out.push('.');
                    i += 3;
                    continue;
                }
                _ => {}
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn decode_percent_generic(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_template(root: &Path, name: &str, rel_file: &str, contents: &str) {
        let file = root.join(name).join(rel_file);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, contents).unwrap();
    }

    #[test]
    fn resolves_matching_template_in_order() {
        let dir = tempdir().unwrap();
        make_template(dir.path(), "standard", "docs/readme.md", "hi");
        let names = vec!["standard".to_string()];
        let found = find_template_source(dir.path(), &names, "docs/readme.md").unwrap();
        assert!(found.ends_with("standard/docs/readme.md"));
    }

    #[test]
    fn rejects_dot_dot_traversal() {
        let dir = tempdir().unwrap();
        let names = vec!["standard".to_string()];
        let err = find_template_source(dir.path(), &names, "../etc/passwd").unwrap_err();
        assert!(matches!(err, BirthError::InvalidPath(_)));
    }

    #[test]
    fn rejects_absolute_path() {
        let dir = tempdir().unwrap();
        let names = vec!["standard".to_string()];
        let err = find_template_source(dir.path(), &names, "/etc/passwd").unwrap_err();
        assert!(matches!(err, BirthError::InvalidPath(_)));
    }

    #[test]
    fn rejects_hidden_segment() {
        let dir = tempdir().unwrap();
        let names = vec!["standard".to_string()];
        let err = find_template_source(dir.path(), &names, "foo/.git/config").unwrap_err();
        assert!(matches!(err, BirthError::InvalidPath(_)));
    }

    #[test]
    fn decodes_percent_encoded_separator_before_checking_traversal() {
        let dir = tempdir().unwrap();
        let names = vec!["standard".to_string()];
        let err = find_template_source(dir.path(), &names, "foo%2f..%2fbar").unwrap_err();
        assert!(matches!(err, BirthError::InvalidPath(_)));
    }

    #[test]
    fn give_birth_copies_directory_and_refuses_symlinks() {
        let dir = tempdir().unwrap();
        make_template(dir.path(), "standard", "src/main.rs", "fn main() {}");
        let project_root = tempdir().unwrap();
        let names = vec!["standard".to_string()];
        let target = give_birth(dir.path(), &names, project_root.path(), "src").unwrap();
        assert!(target.join("main.rs").is_file());
    }

    #[test]
    fn no_template_matches_reports_no_template() {
        let dir = tempdir().unwrap();
        let names = vec!["standard".to_string()];
        let err = find_template_source(dir.path(), &names, "missing/path").unwrap_err();
        assert!(matches!(err, BirthError::NoTemplate(_)));
    }
}
