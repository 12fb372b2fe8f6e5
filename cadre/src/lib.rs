// Temporaries in `async_stream` tail expressions drop in a different order
// under Rust 2024; the warning originates inside the macro expansion and is
// a known upstream issue in `async-stream`.
#![allow(tail_expr_drop_order)]
//! Cadre is an execution core for LLM-backed conversational agents.
//!
//! It provides the per-request machinery an agent framework needs and
//! nothing else: prompt assembly from instructions, retrieval, and
//! conversation memory; a multi-step generation loop against a pluggable
//! [`ModelProvider`](provider::ModelProvider); tool dispatch with span and
//! event bookkeeping; input/output guardrails with a streaming pipeline
//! that catches patterns split across chunk boundaries; a structured
//! interaction history with an updatable event timeline; and hierarchical
//! event propagation for delegated sub-agents.
//!
//! Provider adapters, durable stores, retrievers, and serving concerns
//! plug in through narrow traits and live outside this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadre::prelude::*;
//!
//! let runtime = Runtime::new();
//! let agent = Agent::builder("assistant")
//!     .instructions("You are a helpful assistant.")
//!     .provider(provider)
//!     .runtime(&runtime)
//!     .build()?;
//!
//! let result = agent.generate_text("Hello!", GenerateOptions::new()).await?;
//! println!("{}", result.text);
//! ```

pub mod agent;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod guardrail;
pub mod history;
pub mod hooks;
pub mod memory;
pub mod message;
pub mod prelude;
pub mod provider;
pub mod retriever;
pub mod runtime;
pub mod stream;
pub mod tool;
pub mod trace;
pub mod usage;

pub use agent::{Agent, AgentBuilder, GenerateOptions};
pub use error::{AgentError, Result};
pub use runtime::Runtime;
