// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Skill discovery for the system-prompt skills manifest.
//!
//! A skill is a directory containing a `SKILL.md` file with a `---`-delimited
//! frontmatter header.  Only the manifest fields (name, description, location)
//! are surfaced to the model; the body is read later via the read tool.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

/// A discovered skill, ready for inclusion in the `<available_skills>` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub location: PathBuf,
}

/// Discover skills under `<config_dir>/skills/` (global) and
/// `<cwd>/.sven/skills/` (local).  Local entries override global ones on
/// name collision.  Invalid entries (missing `SKILL.md`, unparsable
/// frontmatter, empty description) are skipped with a warning.
pub fn discover_skills(config_dir: Option<&Path>, cwd: &Path) -> Vec<SkillInfo> {
    let mut by_name = std::collections::BTreeMap::new();

    if let Some(dir) = config_dir {
        for skill in scan_skill_dir(&dir.join("skills")) {
            by_name.insert(skill.name.clone(), skill);
        }
    }
    for skill in scan_skill_dir(&cwd.join(".sven").join("skills")) {
        by_name.insert(skill.name.clone(), skill);
    }

    by_name.into_values().collect()
}

fn scan_skill_dir(root: &Path) -> Vec<SkillInfo> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return found,
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let dir_name = match dir.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let skill_md = match find_skill_md(&dir) {
            Some(p) => p,
            None => continue,
        };
        let raw = match fs::read_to_string(&skill_md) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %skill_md.display(), error = %e, "failed to read SKILL.md");
                continue;
            }
        };
        match parse_frontmatter(&raw) {
            Some(fm) => {
                let name = fm.name.unwrap_or_else(|| dir_name.clone());
                if name != dir_name {
                    warn!(
                        frontmatter_name = %name,
                        dir_name = %dir_name,
                        "skill frontmatter name does not match its directory name"
                    );
                }
                found.push(SkillInfo { name, description: fm.description, location: skill_md });
            }
            None => {
                warn!(path = %skill_md.display(), "skipping skill with missing or invalid frontmatter");
            }
        }
    }
    found
}

/// Case-insensitive `SKILL.md` lookup within a skill directory.
fn find_skill_md(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.eq_ignore_ascii_case("SKILL.md"))
        {
            return Some(path);
        }
    }
    None
}

struct Frontmatter {
    name: Option<String>,
    description: String,
}

/// Minimal `key: value` parser over the fenced `---`-delimited header.
///
/// Unlike full YAML, this only understands single-line scalar values; a
/// `description` spanning multiple lines is unsupported and causes the
/// skill to be rejected along with any frontmatter missing `description`.
fn parse_frontmatter(raw: &str) -> Option<Frontmatter> {
    let rest = raw.trim_start_matches('\n').strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    let header = &rest[..end];

    let mut name = None;
    let mut description = None;
    for line in header.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':')?;
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key.trim() {
            "name" => name = Some(value.to_string()),
            "description" => description = Some(value.to_string()),
            _ => {}
        }
    }

    let description = description?;
    if description.is_empty() {
        return None;
    }
    Some(Frontmatter { name, description })
}
