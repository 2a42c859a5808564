// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

//! Project export/import packaging.
//!
//! Exporting copies a subtree plus its `.MyOS/` config (and any templates
//! it references) into a self-contained package directory, optionally
//! zipped. Importing reverses this, restoring the subtree either to its
//! recorded original location (`restore`) or under a caller-chosen root
//! (`adopt`), with zip-slip and symlink-traversal protections throughout.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use myos_project::{ProjectConfig, ProjectFinder};

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub package_path: PathBuf,
    pub export_root: PathBuf,
    pub subtree_path: PathBuf,
    pub zip_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ImportResult {
    pub import_root: PathBuf,
    pub subtree_path: PathBuf,
}

/// Exports `source_path`'s subtree (relative to its nearest enclosing
/// project) into a new package under `output_dir`.
pub fn export_subtree(
    source_path: &Path,
    output_dir: &Path,
    package_name: Option<&str>,
    zip_output: bool,
) -> Result<ExportResult> {
    let source_path = fs::canonicalize(source_path)
        .with_context(|| format!("resolving {}", source_path.display()))?;
    let export_root = ProjectFinder::find_nearest(&source_path)
        .ok_or_else(|| anyhow::anyhow!("{} is not inside a MyOS project", source_path.display()))?;
    let subtree_rel = source_path
        .strip_prefix(&export_root)
        .context("subtree is not inside its project root")?
        .to_path_buf();

    fs::create_dir_all(output_dir)?;
    let package_name = package_name
        .map(|s| s.to_string())
        .unwrap_or_else(|| default_package_name(&export_root));
    let package_path = output_dir.join(&package_name);
    if package_path.exists() {
        bail!("export package already exists: {}", package_path.display());
    }
    fs::create_dir_all(&package_path)?;

    copy_tree_no_symlinks(&source_path, &package_path)?;
    copy_tree_no_symlinks(&export_root.join(".MyOS"), &package_path.join(".MyOS"))?;
    write_export_metadata(&package_path.join(".MyOS").join("Project.md"), &export_root, &subtree_rel)?;
    copy_templates(&export_root, &package_path)?;

    let zip_path = if zip_output {
        let zip_path = zip_folder(&package_path)?;
        fs::remove_dir_all(&package_path)?;
        Some(zip_path)
    } else {
        None
    };

    Ok(ExportResult {
        package_path,
        export_root,
        subtree_path: subtree_rel,
        zip_path,
    })
}

fn default_package_name(export_root: &Path) -> String {
    let date = chrono::Utc::now().format("%Y%m%d");
    let name = export_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project");
    format!("{name}_export_{date}")
}

fn resolve_templates_dir(export_root: &Path) -> PathBuf {
    std::env::var("MYOS_TEMPLATES_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| export_root.join("Templates"))
}

fn copy_templates(export_root: &Path, package_path: &Path) -> Result<()> {
    let config = ProjectConfig::new(export_root);
    if config.templates.is_empty() {
        return Ok(());
    }
    let templates_source = resolve_templates_dir(export_root);
    for name in &config.templates {
        let src = templates_source.join(name);
        if !src.is_dir() {
            tracing::warn!(template = name, "template source missing, skipping");
            continue;
        }
        copy_tree_no_symlinks(&src, &package_path.join("Templates").join(name))?;
    }
    Ok(())
}

fn write_export_metadata(project_md: &Path, export_root: &Path, subtree_rel: &Path) -> Result<()> {
    let existing = fs::read_to_string(project_md).unwrap_or_else(|_| "# MyOS Project\n".to_string());
    let subtree_posix = subtree_rel.to_string_lossy().replace('\\', "/");
    let exported_at = chrono::Utc::now().to_rfc3339();
    let user = whoami::username();
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
    let block = format!(
        "\n# Export\nReferencePath: {}\nSubtree: /{subtree_posix}\nExportedAt: {exported_at}\nSource: {user}@{host}\n",
        export_root.display(),
    );
    fs::write(project_md, existing + &block)?;
    Ok(())
}

fn copy_tree_no_symlinks(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        bail!("source does not exist: {}", src.display());
    }
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree_no_symlinks(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn zip_folder(folder: &Path) -> Result<PathBuf> {
    let zip_path = folder.with_extension("zip");
    let file = File::create(&zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let base = folder;
    let mut stack = vec![folder.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = path.strip_prefix(base)?.to_string_lossy().replace('\\', "/");
            if path.is_dir() {
                writer.add_directory(format!("{rel}/"), options)?;
                stack.push(path);
            } else {
                writer.start_file(rel, options)?;
                let mut buf = Vec::new();
                File::open(&path)?.read_to_end(&mut buf)?;
                writer.write_all(&buf)?;
            }
        }
    }
    writer.finish()?;
    Ok(zip_path)
}

/// Imports a package (zip or directory) into `target_root` (for `adopt`
/// mode) or back to its recorded `ReferencePath` (for `restore` mode).
pub fn import_package(
    package_path: &Path,
    target_root: Option<&Path>,
    mode: &str,
    conflict: &str,
) -> Result<ImportResult> {
    let package_path = fs::canonicalize(package_path)?;
    if package_path.is_file()
        && package_path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) == Some("zip".to_string())
    {
        let tmp = tempfile::tempdir()?;
        safe_extract_zip(&package_path, tmp.path())?;
        import_from_folder(tmp.path(), target_root, mode, conflict)
    } else if package_path.is_dir() {
        import_from_folder(&package_path, target_root, mode, conflict)
    } else {
        bail!("package not found: {}", package_path.display());
    }
}

fn import_from_folder(
    package_root: &Path,
    target_root: Option<&Path>,
    mode: &str,
    conflict: &str,
) -> Result<ImportResult> {
    let project_md = package_root.join(".MyOS").join("Project.md");
    if !project_md.is_file() {
        bail!("package has no .MyOS/Project.md: {}", package_root.display());
    }
    let metadata = read_export_metadata(&project_md)?;
    let subtree_raw = metadata
        .get("Subtree")
        .ok_or_else(|| anyhow::anyhow!("package metadata has no Subtree entry"))?;
    let subtree_rel = validate_subtree_path(subtree_raw)?;

    let source_subtree = package_root.join(&subtree_rel);
    if !source_subtree.exists() {
        bail!("package subtree missing: {}", source_subtree.display());
    }

    let import_root = resolve_import_root(&metadata, target_root, mode)?;
    let dest_subtree = import_root.join(&subtree_rel);
    copy_tree_secure(&source_subtree, &dest_subtree, conflict)?;

    Ok(ImportResult {
        import_root,
        subtree_path: subtree_rel,
    })
}

fn resolve_import_root(
    metadata: &std::collections::HashMap<String, String>,
    target_root: Option<&Path>,
    mode: &str,
) -> Result<PathBuf> {
    match mode {
        "restore" => {
            if let Some(reference) = metadata.get("ReferencePath") {
                let path = PathBuf::from(reference);
                if path.exists() {
                    return Ok(path);
                }
            }
            target_root
                .map(Path::to_path_buf)
                .ok_or_else(|| anyhow::anyhow!("target_root is required for adopt mode or missing reference path"))
        }
        "adopt" => target_root
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow::anyhow!("target_root is required for adopt mode or missing reference path")),
        other => bail!("unknown import mode: {other}"),
    }
}

fn read_export_metadata(project_md: &Path) -> Result<std::collections::HashMap<String, String>> {
    let text = fs::read_to_string(project_md)?;
    let mut map = std::collections::HashMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(": ") else { continue };
        if matches!(key, "ReferencePath" | "Subtree" | "ExportedAt" | "Source") {
            map.insert(key.to_string(), value.trim().to_string());
        }
    }
    Ok(map)
}

fn validate_subtree_path(raw: &str) -> Result<PathBuf> {
    let trimmed = raw.trim_start_matches('/');
    let path = PathBuf::from(trimmed);
    if path.is_absolute() || path.components().any(|c| c.as_os_str() == "..") {
        bail!("unsafe subtree path in package metadata: {raw}");
    }
    Ok(path)
}

fn copy_tree_secure(src: &Path, dst: &Path, conflict: &str) -> Result<()> {
    if !matches!(conflict, "skip" | "merge" | "overwrite") {
        bail!("unknown conflict mode: {conflict}");
    }
    if fs::symlink_metadata(src)?.file_type().is_symlink() {
        bail!("Symlinked directories/files are not allowed in import");
    }
    if src.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                bail!("Symlinked directories/files are not allowed in import");
            }
            copy_tree_secure(&entry.path(), &dst.join(entry.file_name()), conflict)?;
        }
        return Ok(());
    }

    if dst.exists() {
        match conflict {
            "skip" | "merge" => return Ok(()),
            "overwrite" => fs::remove_file(dst)?,
            _ => unreachable!(),
        }
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn safe_extract_zip(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let dest_canon = fs::canonicalize(dest)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if name.starts_with('/')
            || name.starts_with('\\')
            || name.contains(':')
            || Path::new(&name).components().any(|c| matches!(c, std::path::Component::ParentDir))
        {
            bail!("Unsafe path in zip archive: {name}");
        }
        let member_path = dest.join(&name);
        fs::create_dir_all(member_path.parent().unwrap_or(dest))?;
        if name.ends_with('/') {
            fs::create_dir_all(&member_path)?;
            continue;
        }
        let resolved = dest.join(&name);
        let mut out = File::create(&resolved)?;
        std::io::copy(&mut entry, &mut out)?;
        let resolved_canon = fs::canonicalize(&resolved)?;
        if !resolved_canon.starts_with(&dest_canon) {
            fs::remove_file(&resolved)?;
            bail!("Zip traversal detected: {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_project(root: &Path) {
        ProjectConfig::make_project(root, None).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
    }

    #[test]
    fn export_then_import_adopt_round_trips_subtree() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("proj");
        make_project(&project);

        let out_dir = dir.path().join("out");
        let result = export_subtree(&project.join("src"), &out_dir, Some("pkg"), false).unwrap();
        assert!(result.package_path.join("src/main.rs").is_file());
        assert!(result.package_path.join(".MyOS/Project.md").is_file());

        let target = dir.path().join("adopted");
        let imported =
            import_package(&result.package_path, Some(&target), "adopt", "merge").unwrap();
        assert!(imported.import_root.join("src/main.rs").is_file());
    }

    #[test]
    fn validate_subtree_path_rejects_traversal() {
        assert!(validate_subtree_path("../etc").is_err());
        assert!(validate_subtree_path("/abs").is_ok());
    }

    #[test]
    fn zip_export_produces_zip_and_removes_folder() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("proj");
        make_project(&project);
        let out_dir = dir.path().join("out");
        let result = export_subtree(&project.join("src"), &out_dir, Some("pkg"), true).unwrap();
        assert!(result.zip_path.unwrap().is_file());
        assert!(!result.package_path.exists());
    }
}
