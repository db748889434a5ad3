//! # Conclave
//!
//! Multi-agent delegation core - the closed council of role agents.
//!
//! A conversational agent fronts the user and escalates requests to an
//! orchestrator, which plans them and delegates discrete pieces to record
//! keeping agents. Tool-call ordering is enforced by a state machine, memory
//! lives in size-bounded blocks, and every cross-agent send is retried with
//! an idempotency key.
//!
//! ## Architecture
//!
//! ```text
//!                 user
//!                  │
//!          ┌───────▼────────┐   escalate    ┌──────────────────┐
//!          │ Conversational │──────────────►│   Orchestrator   │
//!          │                │◄──────────────│ plan ► delegate  │
//!          └────────────────┘ status update │ ► log ► evaluate │
//!                                           └────────┬─────────┘
//!                          ┌──────────────┬──────────┼──────────────┐
//!                          ▼              ▼          ▼              ▼
//!                     ┌─────────┐   ┌──────────┐ ┌───────────┐ ┌─────────────┐
//!                     │  Tasks  │   │ Projects │ │ Reminders │ │ Preferences │
//!                     └─────────┘   └──────────┘ └───────────┘ └─────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Memory block**: labelled, character-limited text an agent owns
//! - **Tool gate**: per-agent graph of which tool may follow which
//! - **Router**: maps a role name to the runtime's agent and enqueues requests
//! - **Session**: one request tracked from plan to status update

pub mod agent;
pub mod changelog;
pub mod channel;
pub mod clock;
pub mod conclave;
pub mod config;
pub mod definitions;
pub mod directory;
pub mod error;
pub mod gate;
pub mod memory;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod session;
pub mod tasks;
pub mod tools;

pub use agent::{Agent, AgentHandle, AgentState, Services};
pub use changelog::{Changelog, ChangelogEntry};
pub use channel::{ChannelPair, ConclaveChannel};
pub use clock::{Clock, FixedClock, SystemClock};
pub use conclave::{provision_agents, Conclave};
pub use crate::config::{load_config, ConclaveConfig};
pub use definitions::{AgentDefinition, AgentSpec};
pub use directory::AgentDirectory;
pub use error::ConclaveError;
pub use gate::{GateState, ToolGate, ToolRule, Transition};
pub use memory::{LimitPolicy, MemoryBlock, MemoryBlockStore};
pub use router::{DelegationRouter, DeliveryPolicy};
pub use runtime::{HttpRuntimeClient, LocalRuntime, RuntimeClient};
pub use session::{OrchestrationSession, OrchestratorPlan, SessionState};
pub use tasks::{TaskChange, TaskSet};
pub use tools::{Tool, ToolContext, ToolRegistry};

// Re-export commonly used protocol types
pub use protocol::{
    AgentId, AgentStatus, DeliveryId, DeliveryReceipt, Event, Op, Role, SessionId, ToolCall,
    ToolOutcome,
};
