// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The tool interface layer: the `Tool` trait, the registry that dispatches
//! calls to registered tools, the approval-policy gate, and the event types
//! a tool may emit as a side channel.
//!
//! Concrete tool implementations (file read/write/edit, shell, grep, find,
//! web fetch, ...) are external collaborators supplied by the embedding
//! application — they are not shipped from this crate.
pub mod events;
pub mod policy;
pub mod registry;
pub mod tool;

pub use events::{TodoItem, ToolEvent};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{
    never_cancelled, CancelSignal, OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart,
};
