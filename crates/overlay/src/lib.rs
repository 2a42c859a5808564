// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

//! The Blueprint Overlay: a FUSE filesystem that presents a project's
//! configured templates as lazily-materialized "embryo" directories
//! layered over the project's physical contents.
//!
//! Directories that exist only in the merged template tree are shown to
//! readers as if they already existed; the first write underneath one
//! triggers a "birth" that copies the matching template subtree onto
//! disk (`myos_templates::give_birth`), after which the path behaves like
//! an ordinary physical directory.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use myos_acl::AclPolicy;
use myos_project::ProjectConfig;
use thiserror::Error;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Failure taxonomy surfaced at the FUSE boundary; each variant maps to a
/// specific errno via [`OverlayError::errno`].
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("no embryo at path: {0}")]
    NoEmbryo(String),
    #[error(transparent)]
    Birth(#[from] myos_templates::BirthError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OverlayError {
    pub fn errno(&self) -> i32 {
        use myos_templates::BirthError;
        match self {
            OverlayError::AccessDenied(_) => libc::EACCES,
            OverlayError::NoEmbryo(_) => libc::ENOENT,
            OverlayError::Birth(BirthError::InvalidPath(_)) => libc::EINVAL,
            OverlayError::Birth(BirthError::NoTemplate(_)) => libc::ENOENT,
            OverlayError::Birth(BirthError::UnsafeTemplate(_)) => libc::EIO,
            OverlayError::Birth(BirthError::Io(_)) => libc::EIO,
            OverlayError::Io(_) => libc::EIO,
        }
    }
}

#[derive(Debug, Default)]
struct EmbryoNode {
    children: HashMap<String, EmbryoNode>,
}

fn load_template_tree(templates_dir: &Path, name: &str) -> EmbryoNode {
    fn walk(dir: &Path) -> EmbryoNode {
        let mut node = EmbryoNode::default();
        let Ok(entries) = fs::read_dir(dir) else {
            return node;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().into_string().ok() else { continue };
            if name.starts_with('.') {
                continue;
            }
            node.children.insert(name, walk(&entry.path()));
        }
        node
    }
    walk(&templates_dir.join(name))
}

fn merge_trees(into: &mut EmbryoNode, from: EmbryoNode) {
    for (name, child) in from.children {
        merge_trees(into.children.entry(name).or_default(), child);
    }
}

#[derive(Default)]
struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut ino_to_path = HashMap::new();
        ino_to_path.insert(ROOT_INO, String::new());
        let mut path_to_ino = HashMap::new();
        path_to_ino.insert(String::new(), ROOT_INO);
        Self {
            path_to_ino,
            ino_to_path,
            next_ino: ROOT_INO + 1,
        }
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).cloned()
    }
}

/// The mounted overlay: immutable template/ACL state plus the mutable
/// embryo cache and open-file table.
pub struct Overlay {
    project_root: PathBuf,
    templates_dir: PathBuf,
    template_names: Vec<String>,
    embryo_tree: EmbryoNode,
    mount_time: SystemTime,
    uid: u32,
    gid: u32,
    acl_policy: AclPolicy,
    acl_enabled: bool,
    acl_roles: std::collections::HashSet<String>,
    embryo_cache: Mutex<HashMap<String, bool>>,
    birth_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    inodes: Mutex<InodeTable>,
    open_files: Mutex<HashMap<u64, fs::File>>,
    next_fh: Mutex<u64>,
}

impl Overlay {
    /// Opens `project_root` for mounting, resolving `MYOS_TEMPLATES_DIR`
    /// (defaulting to `project_root/Templates`) and `MYOS_ROLES`.
    pub fn open(project_root: impl Into<PathBuf>) -> anyhow::Result<Overlay> {
        let project_root = project_root.into();
        let project_root = myos_project::ProjectFinder::find_nearest(&project_root)
            .ok_or_else(|| anyhow::anyhow!("not a MyOS project: {}", project_root.display()))?;

        let config = ProjectConfig::new(&project_root);
        let templates_dir = std::env::var("MYOS_TEMPLATES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_root.join("Templates"));

        let mut embryo_tree = EmbryoNode::default();
        for name in &config.templates {
            merge_trees(&mut embryo_tree, load_template_tree(&templates_dir, name));
        }

        let acl_policy = AclPolicy::from_project(&project_root, &templates_dir);
        let acl_enabled = project_root.join(".MyOS").join("ACLs.md").is_file();
        let acl_roles = myos_acl::resolve_effective_roles(&acl_policy);

        Ok(Overlay {
            project_root,
            templates_dir,
            template_names: config.templates.clone(),
            embryo_tree,
            mount_time: SystemTime::now(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            acl_policy,
            acl_enabled,
            acl_roles,
            embryo_cache: Mutex::new(HashMap::new()),
            birth_locks: Mutex::new(HashMap::new()),
            inodes: Mutex::new(InodeTable::new()),
            open_files: Mutex::new(HashMap::new()),
            next_fh: Mutex::new(1),
        })
    }

    fn physical_path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.project_root.clone()
        } else {
            self.project_root.join(rel)
        }
    }

    fn tree_node_at<'a>(&'a self, rel: &str) -> Option<&'a EmbryoNode> {
        let mut node = &self.embryo_tree;
        for seg in rel.split('/').filter(|s| !s.is_empty()) {
            node = node.children.get(seg)?;
        }
        Some(node)
    }

    fn is_embryo(&self, rel: &str) -> bool {
        if self.physical_path(rel).exists() {
            self.embryo_cache.lock().unwrap().insert(rel.to_string(), false);
            return false;
        }
        if let Some(&cached) = self.embryo_cache.lock().unwrap().get(rel) {
            return cached;
        }
        let result = self.tree_node_at(rel).is_some() && !rel.is_empty();
        self.embryo_cache.lock().unwrap().insert(rel.to_string(), result);
        result
    }

    fn contains_embryos(&self, rel: &str) -> bool {
        let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        let mut prefix = String::new();
        for seg in segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(seg);
            if self.is_embryo(&prefix) {
                return true;
            }
        }
        false
    }

    fn can_write_embryo(&self, rel: &str) -> bool {
        if !self.acl_enabled {
            return true;
        }
        if self.acl_roles.is_empty() {
            return false;
        }
        let path = format!("/{}", rel.trim_matches('/'));
        self.acl_roles
            .iter()
            .any(|role| self.acl_policy.can_access(role, &path, "write"))
    }

    /// Lists this directory's embryo children, gated on write access per
    /// the original implementation's visibility rule.
    fn get_embryos_at(&self, rel: &str) -> Vec<String> {
        let Some(node) = self.tree_node_at(rel) else {
            return Vec::new();
        };
        node.children
            .keys()
            .filter(|name| {
                let child = if rel.is_empty() {
                    (*name).clone()
                } else {
                    format!("{rel}/{name}")
                };
                self.is_embryo(&child) && self.can_write_embryo(&child)
            })
            .cloned()
            .collect()
    }

    fn invalidate_prefix(&self, prefix: &str) {
        let mut cache = self.embryo_cache.lock().unwrap();
        cache.retain(|k, _| k != prefix && !k.starts_with(&format!("{prefix}/")));
    }

    /// Finds the longest embryo-rooted ancestor of `rel` and births it,
    /// denying the operation if the caller lacks write access to it.
    fn birth_path(&self, rel: &str) -> Result<PathBuf, OverlayError> {
        let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        let mut embryo_prefix: Option<String> = None;
        let mut prefix = String::new();
        for seg in &segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(seg);
            if self.is_embryo(&prefix) {
                embryo_prefix = Some(prefix.clone());
            }
        }
        let embryo_prefix =
            embryo_prefix.ok_or_else(|| OverlayError::NoEmbryo(rel.to_string()))?;

        if !self.can_write_embryo(&embryo_prefix) {
            return Err(OverlayError::AccessDenied(embryo_prefix));
        }

        let lock = {
            let mut locks = self.birth_locks.lock().unwrap();
            locks
                .entry(embryo_prefix.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().unwrap();

        let embryo_virtual_path = format!("/{embryo_prefix}");
        let target = myos_templates::give_birth(
            &self.templates_dir,
            &self.template_names,
            &self.project_root,
            &embryo_virtual_path,
        )?;
        self.invalidate_prefix(&embryo_prefix);

        let remainder = &rel[embryo_prefix.len()..];
        Ok(if remainder.is_empty() {
            target
        } else {
            target.join(remainder.trim_start_matches('/'))
        })
    }

    fn ensure_birthed_ancestor(&self, rel: &str) -> Result<(), OverlayError> {
        if self.is_embryo(rel) || self.contains_embryos(rel) {
            self.birth_path(rel)?;
        }
        Ok(())
    }

    fn attr_for(&self, ino: u64, rel: &str) -> Option<FileAttr> {
        let physical = self.physical_path(rel);
        if let Ok(meta) = fs::symlink_metadata(&physical) {
            return Some(attr_from_metadata(ino, &meta, self.uid, self.gid));
        }
        if self.is_embryo(rel) {
            return Some(self.embryo_dir_attr(ino));
        }
        None
    }

    fn embryo_dir_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: 4096,
            blocks: 8,
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind: FileType::Directory,
            perm: 0o555,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn next_fh(&self) -> u64 {
        let mut next = self.next_fh.lock().unwrap();
        let fh = *next;
        *next += 1;
        fh
    }
}

fn attr_from_metadata(ino: u64, meta: &fs::Metadata, uid: u32, gid: u32) -> FileAttr {
    use std::os::unix::fs::MetadataExt;
    let kind = if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        crtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

impl Filesystem for Overlay {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let parent_path = match self.inodes.lock().unwrap().path_for(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let rel = join_rel(&parent_path, name);
        let ino = self.inodes.lock().unwrap().ino_for(&rel);
        match self.attr_for(ino, &rel) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inodes.lock().unwrap().path_for(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.attr_for(ino, &path) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inodes.lock().unwrap().path_for(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let physical = self.physical_path(&path);
        if !physical.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }

        let mut entries: Vec<(String, FileType)> = vec![
            (".".to_string(), FileType::Directory),
            ("..".to_string(), FileType::Directory),
        ];

        if let Ok(dir_entries) = fs::read_dir(&physical) {
            for entry in dir_entries.flatten() {
                let Some(name) = entry.file_name().into_string().ok() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                let kind = entry
                    .file_type()
                    .map(|ft| if ft.is_dir() { FileType::Directory } else { FileType::RegularFile })
                    .unwrap_or(FileType::RegularFile);
                entries.push((name, kind));
            }
        }

        let known: std::collections::HashSet<String> =
            entries.iter().map(|(n, _)| n.clone()).collect();
        for name in self.get_embryos_at(&path) {
            if !known.contains(name.as_str()) {
                entries.push((name, FileType::Directory));
            }
        }

        for (i, (name, kind)) in entries.into_iter().enumerate().skip(offset as usize) {
            let child_rel = if name == "." || name == ".." {
                path.clone()
            } else {
                join_rel(&path, &name)
            };
            let child_ino = self.inodes.lock().unwrap().ino_for(&child_rel);
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let parent_path = match self.inodes.lock().unwrap().path_for(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let rel = join_rel(&parent_path, name);
        if let Err(err) = self.ensure_birthed_ancestor(&rel) {
            reply.error(err.errno());
            return;
        }
        let physical = self.physical_path(&rel);
        if let Err(err) = fs::create_dir(&physical) {
            reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let ino = self.inodes.lock().unwrap().ino_for(&rel);
        match self.attr_for(ino, &rel) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(libc::EIO),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let parent_path = match self.inodes.lock().unwrap().path_for(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let rel = join_rel(&parent_path, name);
        if let Err(err) = self.ensure_birthed_ancestor(&rel) {
            reply.error(err.errno());
            return;
        }
        let physical = self.physical_path(&rel);
        let file = match fs::OpenOptions::new().write(true).create(true).truncate(true).open(&physical) {
            Ok(f) => f,
            Err(err) => {
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };
        let ino = self.inodes.lock().unwrap().ino_for(&rel);
        let fh = self.next_fh();
        self.open_files.lock().unwrap().insert(fh, file);
        match self.attr_for(ino, &rel) {
            Some(attr) => reply.created(&TTL, &attr, 0, fh, 0),
            None => reply.error(libc::EIO),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.inodes.lock().unwrap().path_for(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let physical = self.physical_path(&path);
        match fs::OpenOptions::new().read(true).write(true).open(&physical) {
            Ok(file) => {
                let fh = self.next_fh();
                self.open_files.lock().unwrap().insert(fh, file);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let files = self.open_files.lock().unwrap();
        match files.get(&fh) {
            Some(file) => match file.write_at(data, offset as u64) {
                Ok(n) => reply.written(n as u32),
                Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.open_files.lock().unwrap().remove(&fh);
        reply.ok();
    }
}

/// Mounts the overlay at `project_root` (blocking until unmounted).
pub fn mount(project_root: impl Into<PathBuf>, foreground: bool) -> anyhow::Result<()> {
    let overlay = Overlay::open(project_root)?;
    let mountpoint = overlay.project_root.clone();
    let mut options = vec![fuser::MountOption::FSName("myos".to_string())];
    if !foreground {
        options.push(fuser::MountOption::AutoUnmount);
    }
    tracing::info!(mountpoint = %mountpoint.display(), "mounting blueprint overlay");
    fuser::mount2(overlay, &mountpoint, &options)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_project_with_template(root: &Path) {
        ProjectConfig::make_project(root, Some("standard")).unwrap();
        fs::create_dir_all(root.join("Templates/standard/backend")).unwrap();
        fs::write(root.join("Templates/standard/backend/readme.md"), "hi").unwrap();
    }

    #[test]
    fn unbirthed_embryo_is_reported_as_embryo() {
        let dir = tempdir().unwrap();
        make_project_with_template(dir.path());
        let overlay = Overlay::open(dir.path()).unwrap();
        assert!(overlay.is_embryo("backend"));
    }

    #[test]
    fn birth_materializes_and_clears_embryo_status() {
        let dir = tempdir().unwrap();
        make_project_with_template(dir.path());
        let overlay = Overlay::open(dir.path()).unwrap();
        let target = overlay.birth_path("backend").unwrap();
        assert!(target.join("readme.md").is_file());
        assert!(!overlay.is_embryo("backend"));
    }

    #[test]
    fn acl_disabled_allows_birth() {
        let dir = tempdir().unwrap();
        make_project_with_template(dir.path());
        let overlay = Overlay::open(dir.path()).unwrap();
        assert!(overlay.can_write_embryo("backend"));
    }

    #[test]
    fn acl_enabled_without_roles_denies_birth() {
        let dir = tempdir().unwrap();
        make_project_with_template(dir.path());
        fs::write(dir.path().join(".MyOS/ACLs.md"), "# Users\nnobody: backend\n").unwrap();
        let overlay = Overlay::open(dir.path()).unwrap();
        assert!(overlay.acl_enabled);
        assert!(!overlay.can_write_embryo("backend"));
    }
}
