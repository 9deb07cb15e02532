// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Local;
use std::path::Path;

use sven_config::AgentMode;

use crate::skills::SkillInfo;

/// Maximum total characters for the `<available_skills>` block in the system
/// prompt.
pub const MAX_SKILLS_PROMPT_CHARS: usize = 30_000;

/// All optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Rendered `<project_guidelines>` block (AGENTS.md / CLAUDE.md contents).
    pub project_context_file: Option<&'a str>,
    /// Text appended verbatim after the default Guidelines section.
    pub append: Option<&'a str>,
    /// Discovered skills. Metadata (name + description + location) is
    /// injected so the model knows what is available without loading bodies.
    pub skills: &'a [SkillInfo],
}

/// Format the available-skills block for injection into the system prompt.
/// Returns an empty string when `skills` is empty.
pub fn build_skills_section(skills: &[SkillInfo]) -> String {
    if skills.is_empty() {
        return String::new();
    }

    let entries: Vec<String> = skills
        .iter()
        .map(|s| {
            format!(
                "  <skill>\n    <name>{}</name>\n    <description>{}</description>\n    <location>{}</location>\n  </skill>",
                s.name,
                s.description.trim(),
                s.location.display(),
            )
        })
        .collect();

    // Walk forward accumulating size, stopping once the budget would be
    // exceeded. Skills are bounded in practice so a linear scan suffices.
    let mut used = 0usize;
    let fitted_count = entries
        .iter()
        .take_while(|e| {
            let next = used + e.len();
            if next <= MAX_SKILLS_PROMPT_CHARS {
                used = next;
                true
            } else {
                false
            }
        })
        .count();

    if fitted_count == 0 {
        return String::new();
    }

    let fitted = &entries[..fitted_count];
    let truncation_note = if fitted_count < entries.len() {
        format!("\n⚠ Skills truncated: showing {} of {}.", fitted_count, skills.len())
    } else {
        String::new()
    };

    format!(
        "## Skills\n\n\
         The following skills are available. Each entry's `<description>` \
         states when it applies. A skill's full body is not included here — \
         open the file at `<location>` with the read tool when it clearly \
         applies to the current task.\
         {truncation_note}\n\n\
         <available_skills>\n{}\n</available_skills>",
        fitted.join("\n")
    )
}

fn build_guidelines_section() -> String {
    "## Guidelines\n\n\
     - Be concise and precise. Use tools instead of guessing.\n\
     - Validate assumptions against the codebase before acting on them.\n\
     - Batch independent tool calls together in a single turn rather than one at a time.\n\
     - When a tool call fails, read the error and try a different approach rather than repeating it.\n\
     - Prefer the narrowest tool that answers the question; escalate only when it comes up short."
        .to_string()
}

/// Build the system prompt for the given agent mode.
///
/// `ctx` carries the project-guidelines and skills-manifest blocks discovered
/// for the current session.
pub fn system_prompt(mode: AgentMode, custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let identity = format!(
        "You are an AI coding agent operating in a terminal.\n\n\
         Operating Mode: `{mode}`\n\
         Current date and time: `{now}`\n\
         Current working directory: `{cwd}`\n\
         Operating system: `{os}`",
        now = Local::now().format("%Y-%m-%d %H:%M:%S"),
        cwd = std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_else(|_| "unknown".into()),
        os = std::env::consts::OS,
    );

    let mode_instructions = match mode {
        AgentMode::Research => {
            "You are in research mode. You may read and search but MUST NOT write, modify, \
             or delete any files, nor run commands that change state. Focus on gathering the \
             information needed to answer the request."
        }
        AgentMode::Plan => {
            "You are in plan mode. Analyse the request and produce a clear, structured plan \
             with numbered steps in Markdown. You may read files to inform the plan, but MUST \
             NOT modify them."
        }
        AgentMode::Agent => {
            "You are in agent mode. You may use any registered tool, including ones that \
             modify files or run commands. Work systematically, verify your changes, and \
             report progress clearly. Maximize parallel tool calls when the calls are \
             independent of each other."
        }
    };

    let project_section = if let Some(root) = ctx.project_root {
        format!(
            "\n\n## Project Context\n\nProject root directory: `{}`\n\
             Prefer absolute paths over relative paths in tool calls.",
            root.display()
        )
    } else {
        String::new()
    };

    let context_file_section = if let Some(content) = ctx.project_context_file {
        format!("\n\n## Project Instructions\n\n{content}")
    } else {
        String::new()
    };

    let skills_section = {
        let s = build_skills_section(ctx.skills);
        if s.is_empty() { String::new() } else { format!("\n\n{s}") }
    };

    let guidelines_section = build_guidelines_section();

    let append_section = if let Some(extra) = ctx.append {
        format!("\n\n{extra}")
    } else {
        String::new()
    };

    format!(
        "{identity}\n\n{mode_instructions}{project_section}{context_file_section}\
         {skills_section}\n\n{guidelines_section}{append_section}",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
