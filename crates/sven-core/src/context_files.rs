// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! AGENTS.md / CLAUDE.md discovery for the system prompt's project-guidelines
//! block.
//!
//! Discovery walks from a *stop directory* (the git root if `cwd` is inside a
//! repository, else the user's home directory) down to `cwd`, collecting at
//! most one context file per directory.  `AGENTS.md` wins over `CLAUDE.md`
//! when both exist in the same directory.

use std::path::{Path, PathBuf};

const CANDIDATE_NAMES: &[&str] = &["AGENTS.md", "CLAUDE.md"];

/// One discovered context file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub path: PathBuf,
    pub content: String,
}

/// Walk up from `cwd` looking for a `.git` entry. Returns `None` when `cwd`
/// is not inside a repository.
pub fn find_git_root(cwd: &Path) -> Option<PathBuf> {
    let mut dir = cwd;
    loop {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

/// Locate the stop directory for context-file discovery: the nearest
/// ancestor of `cwd` containing a `.git` entry, or the user's home
/// directory if `cwd` is not inside a repository.
pub fn find_stop_dir(cwd: &Path) -> PathBuf {
    find_git_root(cwd).unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| cwd.to_path_buf()))
}

/// Walk from `stop_dir` down to `cwd` (inclusive), reading at most one
/// context file per directory.  Returns an empty vector if `cwd` is not
/// inside `stop_dir`.
pub fn discover_context_files(stop_dir: &Path, cwd: &Path) -> Vec<ContextFile> {
    let Ok(relative) = cwd.strip_prefix(stop_dir) else {
        return Vec::new();
    };

    let mut dirs = vec![stop_dir.to_path_buf()];
    let mut acc = stop_dir.to_path_buf();
    for component in relative.components() {
        acc = acc.join(component);
        dirs.push(acc.clone());
    }

    dirs.into_iter().filter_map(|dir| read_context_file(&dir)).collect()
}

fn read_context_file(dir: &Path) -> Option<ContextFile> {
    for name in CANDIDATE_NAMES {
        let path = dir.join(name);
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(ContextFile { path, content });
        }
    }
    None
}

/// Wrap discovered context files in `<file path="...">` blocks inside a
/// `<project_guidelines>` envelope, in root-to-leaf order. Returns `None`
/// when there are no context files.
pub fn render_project_guidelines(files: &[ContextFile]) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    let blocks: Vec<String> = files
        .iter()
        .map(|f| format!("<file path=\"{}\">\n{}\n</file>", f.path.display(), f.content.trim_end()))
        .collect();
    Some(format!("<project_guidelines>\n{}\n</project_guidelines>", blocks.join("\n\n")))
}
