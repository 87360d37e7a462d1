//! Core module: transport-agnostic domain and runtime.
//!
//! This module contains:
//! - `events`: Stream event types shared by every transport
//! - `classify`: Thinking heuristics for free-text output
//! - `interrupt`: Signal handling for graceful interruption
//! - `session`: Sessions, messages and their metadata
//! - `transcript`: Backend transcript line parsing and rendering
//! - `session_store`: Read-only access to persisted transcripts
//! - `sink`: Consumer callbacks for streamed requests
//! - `manager`: Session orchestration over the transport selector

pub mod classify;
pub mod events;
pub mod interrupt;
pub mod manager;
pub mod session;
pub mod session_store;
pub mod sink;
pub mod transcript;
