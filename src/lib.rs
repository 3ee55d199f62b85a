//! # AutoTrail: Supervised DAG Workflow Engine
//!
//! AutoTrail executes a developer-defined directed acyclic graph of *steps* —
//! units of work wrapping user-supplied async callables — while giving an
//! operator live supervisory control over the run: pause, resume, skip,
//! interrupt, re-run, and send-message operations against individual steps,
//! plus point-in-time status queries, all served over a local control socket.
//!
//! ## Core Concepts
//!
//! - **Step** ([`step`]): a named, id-bearing wrapper around a user callable.
//! - **Rules** ([`rules`]): the per-step state machine and its preconditions.
//! - **Evaluator** ([`evaluator`]): the tick loop driving every step's machine.
//! - **Callback pipeline** ([`callbacks`]): the ordered stages that turn a
//!   tick's `(states, transitions)` into an `actions` map.
//! - **Worker supervision** ([`worker`]): spawn/poll/interrupt of a step's
//!   isolated execution.
//! - **API handler** ([`api`]): the operator-facing operations.
//! - **Control channel** ([`control`]): the Unix-socket wire protocol.
//! - **Context** ([`context`]): the concurrent per-step data map.
//! - **Manager** ([`manager`]): assembles everything and owns the run's
//!   lifecycle.
//!
//! ## Quick Start
//!
//! ```no_run
//! use autotrail::{Manager, ManagerConfig, StepRegistry, StepOutcome, StepContext};
//! use autotrail::step::StepFn;
//! use async_trait::async_trait;
//!
//! struct First;
//!
//! #[async_trait]
//! impl StepFn for First {
//!     async fn call(&self, _ctx: StepContext) -> StepOutcome {
//!         Ok(serde_json::json!("A-ok"))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = StepRegistry::new();
//! let a = registry.add_step("a", First);
//!
//! let manager = Manager::new(
//!     registry,
//!     vec![],
//!     vec![],
//!     ManagerConfig::default(),
//! )?;
//! # let _ = a;
//! # let _ = manager;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod callbacks;
pub mod channels;
pub mod config;
pub mod context;
pub mod control;
pub mod dag;
pub mod errors;
pub mod evaluator;
pub mod manager;
pub mod persistence;
pub mod rules;
pub mod step;
pub mod tags;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use config::EngineConfig;
pub use context::Context;
pub use errors::AutotrailError;
pub use manager::{Manager, ManagerConfig};
pub use step::{StepContext, StepOutcome, StepRegistry};
pub use types::{Action, State, StepId};
