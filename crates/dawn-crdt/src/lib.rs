// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `dawn-crdt` — eventually-consistent registries shared between peers.
//!
//! The primitive is a last-writer-wins map ([`CrdtMap`]): every write stamps
//! `(wall-clock timestamp, writer node id)` and merge keeps the greater stamp,
//! so two nodes that exchange states in any order converge. On top of it sit
//! the network-wide agent registry ([`AgentRegistry`], keyed
//! `<node_id>:<agent_id>`) and task registry ([`TaskRegistry`], keyed by task
//! id), plus the [`TaskManager`] state machine that is the authoritative
//! writer for locally-owned tasks.

pub mod agents;
pub mod lww;
pub mod tasks;

pub use agents::{AgentInfo, AgentRegistry, CapabilityKind, RegistryStats};
pub use lww::{unix_now, CrdtEntry, CrdtMap};
pub use tasks::{Task, TaskError, TaskManager, TaskRegistry, TaskStatus};
