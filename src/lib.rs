//! Multi-Expert Meeting Orchestrator
//!
//! Coordinates LLM-backed expert personas into a structured discussion
//! about an equity subject:
//! - A moderator plans the roster and opens the meeting
//! - Selected experts speak serially, each seeing the prior transcript
//! - A closing summary condenses the debate
//! - Failed turns interrupt the meeting into a resumable cached state
//! - Completed meetings distill asynchronously into per-subject memory
//!
//! MEETING FLOW:
//! PLAN → RUN EXPERTS (serial) → SUMMARIZE → CLOSE (memory write)

pub mod agent;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod meeting;
pub mod memory;
pub mod models;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export the main service surface
pub use meeting::{ChatRequest, MeetingService, ProgressSink, ResponseSink};
pub use models::*;
