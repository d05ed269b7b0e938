//! memsoak-core - Core library for memsoak
//!
//! Soak testing for a tunnel controller: drive it through reconnect or
//! restart cycles while sampling process memory, and fail the run as soon
//! as memory crosses a ceiling or tunnel establishment stops advancing.
//!
//! - **orchestrator**: the single-owner run loop
//! - **dispatcher**: controller notices → coalesced reconnect/restart requests
//! - **lifecycle**: start/stop/restart of the controller, never overlapping
//! - **memory**: memory probes and the counting allocator
//! - **progress**: establishment counter and stall detection
//! - **notice**: controller notice envelope and classification
//! - **controller**: the contract the controller under test implements
//! - **simulated**: in-process controller for rehearsals and tests

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod notice;
pub mod orchestrator;
pub mod progress;
pub mod simulated;

// Re-export commonly used types
pub use config::{ControllerParams, RunConfig, TestMode};
pub use controller::{Controller, ControllerFactory};
pub use dispatcher::{NoticeReceiver, PendingAction};
pub use error::{Error, Result};
pub use memory::{MemoryProbe, MemorySample, ProcessMemoryProbe};
pub use orchestrator::{Orchestrator, RunReport, SampleStatus};
