// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent session.
//!
//! This is separate from [`sven_config::AgentConfig`], which holds only
//! config-file fields.  [`AgentRuntimeContext`] carries values detected or
//! specified at runtime: project root, the rendered project-guidelines block,
//! and the discovered skills manifest.

use std::path::PathBuf;

use crate::skills::SkillInfo;

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up, or the
    /// current directory when not inside a repository).
    pub project_root: Option<PathBuf>,
    /// Rendered `<project_guidelines>` block built from discovered AGENTS.md
    /// / CLAUDE.md files (see [`crate::context_files`]).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt (from `--append-system-prompt`).
    pub append_system_prompt: Option<String>,
    /// Full system prompt override (from `--system-prompt-file`).
    /// When set, replaces `AgentConfig::system_prompt` entirely.
    pub system_prompt_override: Option<String>,
    /// Skills discovered from the standard search hierarchy (§4.H).
    pub skills: Vec<SkillInfo>,
}

impl AgentRuntimeContext {
    /// Detect the project root, collect AGENTS.md/CLAUDE.md context files, and
    /// discover skills, starting from `cwd`.
    pub fn auto_detect(config_dir: Option<&std::path::Path>, cwd: &std::path::Path) -> Self {
        let stop_dir = crate::context_files::find_stop_dir(cwd);
        let files = crate::context_files::discover_context_files(&stop_dir, cwd);
        let project_context_file = crate::context_files::render_project_guidelines(&files);
        let skills = crate::skills::discover_skills(config_dir, cwd);
        let project_root = crate::context_files::find_git_root(cwd);

        Self {
            project_root,
            project_context_file,
            append_system_prompt: None,
            system_prompt_override: None,
            skills,
        }
    }
}
