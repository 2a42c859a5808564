// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

//! Project configuration: the `.MyOS/` directory, its section files, and
//! the inheritance relationship between a project and its children.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use myos_config::{find_inherit, parse_file, Value};

const MYOS_DIR: &str = ".MyOS";
const PROJECT_MD: &str = "Project.md";
const TEMPLATES_MD: &str = "Templates.md";
const MANIFEST_MD: &str = "Manifest.md";
const CONFIG_MD: &str = "Config.md";

fn myos_version() -> String {
    std::env::var("MYOS_VERSION").unwrap_or_else(|_| "MyOS v0.1".to_string())
}

/// The three inheritance modes a config section can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InheritStatus {
    Fix,
    Dynamic,
    Not,
}

impl InheritStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "fix" => Some(Self::Fix),
            "dynamic" => Some(Self::Dynamic),
            "not" => Some(Self::Not),
            _ => None,
        }
    }
}

/// A loaded (or freshly-initialized) MyOS project rooted at a directory
/// containing a `.MyOS/` folder.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub root: PathBuf,
    pub templates: Vec<String>,
    pub version: Option<String>,
    pub metadata: HashMap<String, String>,
    config_sections: HashMap<String, Value>,
}

impl ProjectConfig {
    /// Constructs a view over `path`, loading its config if it is a valid
    /// project. Does not create anything on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let root = path.into();
        let mut cfg = Self {
            root,
            templates: Vec::new(),
            version: None,
            metadata: HashMap::new(),
            config_sections: HashMap::new(),
        };
        if cfg.is_valid() {
            cfg.load();
        }
        cfg
    }

    fn myos_dir(&self) -> PathBuf {
        self.root.join(MYOS_DIR)
    }

    pub fn is_valid(&self) -> bool {
        self.myos_dir().join(PROJECT_MD).is_file()
    }

    /// (Re-)loads `Templates.md`, `Manifest.md`, and `Config.md` from disk.
    pub fn load(&mut self) {
        self.load_templates();
        self.load_manifest();
        self.config_sections = load_config_sections(&self.myos_dir());
    }

    fn load_templates(&mut self) {
        let path = self.myos_dir().join(TEMPLATES_MD);
        let Ok(doc) = parse_file(&path) else {
            self.templates = Vec::new();
            return;
        };
        self.templates = match doc.get("Templates") {
            Some(Value::List(items)) => items.clone(),
            Some(Value::Scalar(s)) => vec![s.clone()],
            Some(Value::Dict(map)) => map
                .get("items")
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            None => Vec::new(),
        };
    }

    fn load_manifest(&mut self) {
        let path = self.myos_dir().join(MANIFEST_MD);
        let Ok(doc) = parse_file(&path) else {
            self.version = None;
            self.metadata = HashMap::new();
            return;
        };
        let mut metadata = HashMap::new();
        let mut version = None;
        if let Some(Value::Dict(map)) = doc.get("Project") {
            for (key, values) in map {
                let lowered = key.to_lowercase();
                let joined = values.join(", ");
                if lowered == "version" {
                    version = Some(joined);
                } else {
                    metadata.insert(lowered, joined);
                }
            }
        }
        self.version = version;
        self.metadata = metadata;
    }

    /// Writes `Project.md` (if missing), `Templates.md`, and `Manifest.md`
    /// back to disk. `None` arguments preserve the existing on-disk state.
    pub fn save(&mut self, templates: Option<Vec<String>>, version: Option<String>) -> bool {
        if let Some(t) = templates {
            self.templates = t;
        }
        if let Some(v) = version {
            self.version = Some(v);
        }

        let dir = self.myos_dir();
        if fs::create_dir_all(&dir).is_err() {
            return false;
        }

        let project_md = dir.join(PROJECT_MD);
        if !project_md.is_file() && fs::write(&project_md, "# MyOS Project\n").is_err() {
            return false;
        }

        let templates_md = dir.join(TEMPLATES_MD);
        if self.templates.is_empty() {
            let _ = fs::remove_file(&templates_md);
        } else {
            let mut body = String::from("# Templates\n");
            for t in &self.templates {
                body.push_str(t);
                body.push('\n');
            }
            if fs::write(&templates_md, body).is_err() {
                return false;
            }
        }

        let manifest_md = dir.join(MANIFEST_MD);
        if self.version.is_none() && self.metadata.is_empty() {
            let _ = fs::remove_file(&manifest_md);
        } else {
            let mut body = String::from("# Project\n");
            let version = self.version.clone().unwrap_or_else(myos_version);
            body.push_str(&format!("Version: {version}\n"));
            for (k, v) in &self.metadata {
                body.push_str(&format!("{k}: {v}\n"));
            }
            if fs::write(&manifest_md, body).is_err() {
                return false;
            }
        }
        true
    }

    /// Returns the declared (or default `dynamic`) inherit status of a
    /// `Config.md` section.
    pub fn get_inherit_status(&self, section_name: &str) -> InheritStatus {
        let Some(value) = self.config_sections.get(section_name) else {
            return InheritStatus::Dynamic;
        };
        match find_inherit(value).and_then(|raw| InheritStatus::parse(&raw)) {
            Some(status) => status,
            None => {
                tracing::warn!(section = section_name, "invalid inherit status, defaulting to dynamic");
                InheritStatus::Dynamic
            }
        }
    }

    /// Walks one level up; returns `Some` only if the parent directory is
    /// itself a valid project.
    pub fn get_parent_project(&self) -> Option<ProjectConfig> {
        let parent_dir = self.root.parent()?;
        let candidate = ProjectConfig::new(parent_dir);
        candidate.is_valid().then_some(candidate)
    }

    /// Immediate subdirectories that are themselves valid projects.
    pub fn get_child_projects(&self) -> Vec<ProjectConfig> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut children = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let candidate = ProjectConfig::new(&path);
            if candidate.is_valid() {
                children.push(candidate);
            }
        }
        children
    }

    /// Creates a new `.MyOS/` at `dir_path` by copying the nearest ancestor
    /// project's `.MyOS/`, then pruning any copied section file (other than
    /// `Project.md`) whose section declares `inherit: not`.
    pub fn create(dir_path: impl Into<PathBuf>) -> Result<ProjectConfig> {
        let dir_path = dir_path.into();
        fs::create_dir_all(&dir_path)?;

        let target_myos = dir_path.join(MYOS_DIR);
        fs::create_dir_all(&target_myos)?;

        if let Some(parent_myos) = find_parent_myos(&dir_path) {
            copy_tree_no_symlinks(&parent_myos, &target_myos)?;
            prune_not_inherited(&target_myos)?;
        }

        if !target_myos.join(PROJECT_MD).is_file() {
            fs::write(target_myos.join(PROJECT_MD), "# MyOS Project\n")?;
        }

        Ok(ProjectConfig::new(dir_path))
    }

    /// Creates a project at `dir_path` (optionally seeding a template list)
    /// and reports whether the result is valid.
    pub fn make_project(dir_path: impl Into<PathBuf>, template: Option<&str>) -> Result<bool> {
        let mut project = ProjectConfig::create(dir_path)?;
        if let Some(t) = template {
            project.save(Some(vec![t.to_string()]), None);
        }
        Ok(project.is_valid())
    }

    /// Propagates a `Config.md` section to every direct child whose
    /// inherit status for that section is not `fix`. Returns, per child
    /// root, whether it was updated (`true`), skipped for being fixed
    /// (`false`), or absent from the parent's own config (empty map).
    pub fn propagate_config(&self, section_name: &str, dry_run: bool) -> HashMap<PathBuf, bool> {
        let mut results = HashMap::new();
        let Some(section) = self.config_sections.get(section_name) else {
            return results;
        };
        for child in self.get_child_projects() {
            if child.get_inherit_status(section_name) == InheritStatus::Fix {
                results.insert(child.root.clone(), false);
                continue;
            }
            let updated = if dry_run {
                true
            } else {
                write_config_section(&child.myos_dir(), section_name, section).is_ok()
            };
            results.insert(child.root.clone(), updated);
        }
        results
    }
}

fn load_config_sections(myos_dir: &Path) -> HashMap<String, Value> {
    parse_file(&myos_dir.join(CONFIG_MD)).unwrap_or_default()
}

fn write_config_section(myos_dir: &Path, section_name: &str, value: &Value) -> Result<()> {
    fs::create_dir_all(myos_dir)?;
    let path = myos_dir.join(CONFIG_MD);
    let mut existing = load_config_sections(myos_dir);
    existing.insert(section_name.to_string(), value.clone());

    let mut body = String::new();
    for (name, val) in &existing {
        body.push_str(&format!("# {name}\n"));
        match val {
            Value::Dict(map) => {
                for (k, vs) in map {
                    body.push_str(&format!("{k}: {}\n", vs.join(", ")));
                }
            }
            Value::List(items) => {
                for item in items {
                    body.push_str(&format!("* {item}\n"));
                }
            }
            Value::Scalar(s) => body.push_str(&format!("{s}\n")),
        }
        body.push('\n');
    }
    fs::write(path, body)?;
    Ok(())
}

fn find_parent_myos(start: &Path) -> Option<PathBuf> {
    let mut current = start.parent()?.to_path_buf();
    loop {
        let candidate = current.join(MYOS_DIR);
        if candidate.join(PROJECT_MD).is_file() {
            return Some(candidate);
        }
        current = current.parent()?.to_path_buf();
    }
}

fn copy_tree_no_symlinks(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("source directory does not exist: {}", src.display());
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
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn prune_not_inherited(myos_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(myos_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.file_name().map(|n| n == PROJECT_MD).unwrap_or(false) {
            continue;
        }
        let Some(ext) = path.extension() else { continue };
        if ext != "md" {
            continue;
        }
        let Ok(doc) = parse_file(&path) else { continue };
        let should_remove = doc.values().any(|v| {
            find_inherit(v)
                .and_then(|raw| InheritStatus::parse(&raw))
                .map(|status| status == InheritStatus::Not)
                .unwrap_or(false)
        });
        if should_remove {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Locates the nearest ancestor project directory (or the path itself).
pub struct ProjectFinder;

impl ProjectFinder {
    pub fn is_project(path: impl AsRef<Path>) -> bool {
        path.as_ref().join(MYOS_DIR).join(PROJECT_MD).is_file()
    }

    /// Walks upward from `start`, returning the first ancestor (inclusive)
    /// containing `.MyOS/Project.md`.
    pub fn find_nearest(start: impl AsRef<Path>) -> Option<PathBuf> {
        let mut current = std::fs::canonicalize(start.as_ref())
            .unwrap_or_else(|_| start.as_ref().to_path_buf());
        loop {
            if Self::is_project(&current) {
                return Some(current);
            }
            current = current.parent()?.to_path_buf();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn make_project_creates_minimal_structure() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("proj");
        let ok = ProjectConfig::make_project(&target, Some("standard")).unwrap();
        assert!(ok);
        assert!(target.join(".MyOS/Project.md").is_file());
        let cfg = ProjectConfig::new(&target);
        assert_eq!(cfg.templates, vec!["standard".to_string()]);
    }

    #[test]
    fn save_removes_templates_file_when_empty() {
        let dir = tempdir().unwrap();
        let mut cfg = ProjectConfig::create(dir.path().join("p")).unwrap();
        cfg.save(Some(vec!["a".to_string()]), None);
        assert!(cfg.root.join(".MyOS/Templates.md").is_file());
        cfg.save(Some(Vec::new()), None);
        assert!(!cfg.root.join(".MyOS/Templates.md").is_file());
    }

    #[test]
    fn inherit_status_defaults_to_dynamic() {
        let dir = tempdir().unwrap();
        let cfg = ProjectConfig::create(dir.path().join("p")).unwrap();
        assert_eq!(cfg.get_inherit_status("Nope"), InheritStatus::Dynamic);
    }

    #[test]
    fn project_finder_walks_up_to_nearest_project() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        ProjectConfig::make_project(&root, None).unwrap();
        let nested = root.join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        let found = ProjectFinder::find_nearest(&nested).unwrap();
        assert_eq!(found, fs::canonicalize(&root).unwrap());
    }

    #[test]
    fn child_inherits_parent_config_unless_fixed() {
        let dir = tempdir().unwrap();
        let parent = ProjectConfig::create(dir.path().join("parent")).unwrap();
        fs::write(
            parent.root.join(".MyOS/Config.md"),
            "# Build\ninherit: dynamic\ncmd: make\n",
        )
        .unwrap();
        let parent = ProjectConfig::new(&parent.root);

        let _child = ProjectConfig::create(parent.root.join("child")).unwrap();
        let results = parent.propagate_config("Build", false);
        assert_eq!(results.len(), 1);
        assert!(results.values().all(|v| *v));
    }
}
