// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Two complementary pieces of session state:
//!
//! - [`Session`] is the agent loop's in-memory working copy: the message
//!   list it actually sends to the model, plus the token-budget accounting
//!   (`token_count`, calibration, cache totals) the turn loop and compactor
//!   read every turn. It is rebuilt from a [`SessionLog`]'s compacted view at
//!   load time and is not itself persisted incrementally.
//! - [`SessionLog`] is the durable, append-only record: every message,
//!   compaction, model/thinking-level change is written as one line to disk
//!   before control returns to the caller, so a crash never loses a
//!   committed entry. Its `messages()` view is what seeds a fresh `Session`.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sven_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log (legacy display record, kept for
/// callers that want a flat role/text view rather than the full [`Message`]
/// shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session: the working copy the agent loop reads
/// and writes every turn.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list.
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits).
    pub max_tokens: usize,
    /// Maximum output tokens the current model can produce in one
    /// completion; reserved out of `max_tokens` when computing the
    /// effective input budget.
    pub max_output_tokens: usize,
    /// Token overhead for things sent with every request but not counted in
    /// `token_count`: tool schemas and the dynamic context block.
    pub schema_overhead: usize,
    /// Running total of cache-read tokens across the whole session.
    pub cache_read_total: u32,
    /// Running total of cache-write tokens across the whole session.
    pub cache_write_total: u32,
    /// Correction factor applied to the chars/4 token estimate, learned from
    /// the provider's actually-reported input token counts.
    pub calibration_factor: f32,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            cache_read_total: 0,
            cache_write_total: 0,
            calibration_factor: 1.0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Fraction of context window consumed (0.0-1.0).
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Accumulate this turn's cache usage into the session-wide running totals.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read;
        self.cache_write_total += cache_write;
    }

    /// Fold a fresh (actual_input_tokens, our_estimate) observation into the
    /// calibration factor via an exponential moving average, so one noisy
    /// turn can't swing the budget math. Degenerate estimates are ignored.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let sample = actual_input as f32 / estimated as f32;
        let sample = sample.clamp(0.25, 4.0);
        self.calibration_factor = self.calibration_factor * 0.7 + sample * 0.3;
    }

    /// Tokens available for conversation content once the model's maximum
    /// output is reserved out of the context window.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }
}

// ─── Session log (§4.D) ──────────────────────────────────────────────────────

/// One append-only record in a session's durable log. Entries are never
/// mutated or reordered once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionEntry {
    Message(Message),
    ModelChange { model_id: String, provider: String },
    ThinkingLevelChange { level: String },
    Compaction { summary: String, first_kept_entry_id: u64, tokens_before: usize, details: String },
    CustomMessage { content: String, display: Option<String> },
}

/// One physical line in the on-disk log: an entry plus its place in the
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggedEntry {
    id: u64,
    parent_id: Option<u64>,
    entry: SessionEntry,
}

/// Written once at session creation, before any entry. Not itself part of
/// the leaf chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub version: u32,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
}

const SESSION_LOG_VERSION: u32 = 1;

/// An append-only, optionally-on-disk session log with fork support.
///
/// Entry ids are monotonically increasing unsigned integers assigned at
/// append time (not UUIDs) — that's what makes "the entry strictly after
/// entry id N" a well-defined total order for the compacted view below.
#[derive(Debug)]
pub struct SessionLog {
    path: Option<PathBuf>,
    header: SessionHeader,
    entries: Vec<LoggedEntry>,
    next_id: u64,
    leaf_id: Option<u64>,
}

impl SessionLog {
    /// Create a brand-new, in-memory-only log (no file backing). Useful for
    /// tests and for any caller that doesn't want disk persistence.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            path: None,
            header: SessionHeader { version: SESSION_LOG_VERSION, cwd: cwd.into(), created_at: Utc::now() },
            entries: Vec::new(),
            next_id: 1,
            leaf_id: None,
        }
    }

    /// Create a new log and write its header line to `path` immediately.
    pub fn create_at(path: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let mut log = Self::new(cwd);
        log.path = Some(path.clone());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "{}", serde_json::to_string(&HeaderLine { header: log.header.clone() })?)?;
        Ok(log)
    }

    /// Parse a log file written by [`Self::create_at`]/[`Self::append`]: the
    /// first line is the header, every following line a [`LoggedEntry`]. The
    /// leaf is the last entry in the file — appends are always linear within
    /// one file; forking starts a new file instead of branching in place.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)?;
        let mut lines = text.lines();

        let header_line: HeaderLine = lines
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty session log"))
            .and_then(|l| {
                serde_json::from_str(l).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;

        let mut entries = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LoggedEntry =
                serde_json::from_str(line).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            entries.push(entry);
        }

        let next_id = entries.iter().map(|e| e.id).max().map(|m| m + 1).unwrap_or(1);
        let leaf_id = entries.last().map(|e| e.id);

        Ok(Self { path: Some(path), header: header_line.header, entries, next_id, leaf_id })
    }

    /// Append an entry: assigns it the next id, sets its parent to the
    /// current leaf, writes it to disk (if backed by a file) before
    /// returning, and advances the leaf. Returns the assigned id.
    pub fn append(&mut self, entry: SessionEntry) -> std::io::Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let logged = LoggedEntry { id, parent_id: self.leaf_id, entry };

        if let Some(path) = &self.path {
            let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(&logged)?)?;
        }

        self.entries.push(logged);
        self.leaf_id = Some(id);
        Ok(id)
    }

    pub fn leaf_id(&self) -> Option<u64> {
        self.leaf_id
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    /// Start a new log at `new_path` whose chain is the prefix of this log up
    /// to and including `entry_id`. The new log's leaf becomes `entry_id`;
    /// further appends to it branch independently of `self`.
    pub fn fork(&self, entry_id: u64, new_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let new_path = new_path.into();
        let cutoff = self
            .entries
            .iter()
            .position(|e| e.id == entry_id)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "fork point not found in chain"))?;

        let mut forked = Self::create_at(&new_path, self.header.cwd.clone())?;
        forked.header = self.header.clone();
        // Re-write the header now that we've restored the original's
        // created_at/cwd, since create_at stamped its own.
        {
            let mut file = std::fs::File::create(&new_path)?;
            writeln!(file, "{}", serde_json::to_string(&HeaderLine { header: forked.header.clone() })?)?;
        }

        for logged in &self.entries[..=cutoff] {
            let mut file = std::fs::OpenOptions::new().append(true).open(&new_path)?;
            writeln!(file, "{}", serde_json::to_string(logged)?)?;
            forked.entries.push(logged.clone());
        }
        forked.next_id = self.entries[..=cutoff].iter().map(|e| e.id).max().map(|m| m + 1).unwrap_or(1);
        forked.leaf_id = Some(entry_id);

        Ok(forked)
    }

    /// Full `MessageEntry` list, ignoring compactions. Used for export and
    /// as the summarization request's input.
    pub fn all_messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .filter_map(|e| match &e.entry {
                SessionEntry::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Compacted view: if the chain contains at least one `Compaction` entry,
    /// a synthetic two-message preamble stands in for everything before the
    /// latest compaction, followed by the raw messages appended after it.
    /// Otherwise the full message list.
    pub fn messages(&self) -> Vec<Message> {
        let latest_compaction = self.entries.iter().rev().find_map(|e| match &e.entry {
            SessionEntry::Compaction { summary, .. } => Some((e.id, summary.clone())),
            _ => None,
        });

        let Some((compaction_id, summary)) = latest_compaction else {
            return self.all_messages();
        };

        let mut out = vec![
            Message::user("What did we do so far?"),
            Message::assistant(summary),
        ];
        out.extend(self.entries.iter().filter(|e| e.id > compaction_id).filter_map(|e| match &e.entry {
            SessionEntry::Message(m) => Some(m.clone()),
            _ => None,
        }));
        out
    }

    /// Seed a fresh in-memory [`Session`] from this log's compacted view.
    pub fn to_working_session(&self, max_tokens: usize) -> Session {
        let mut session = Session::new(max_tokens);
        session.push_many(self.messages());
        session
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeaderLine {
    header: SessionHeader,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
