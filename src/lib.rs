//! Beacon Rules - Ruleset Deployment Library
//!
//! The rule compilation and activation layer of the Beacon platform:
//! - Four authoring formats compiled to one uniform rule representation
//! - Deployment lifecycle with status, error and validity-window tracking
//! - Deferred rule actions with per-deployment cancellation
//! - Sandboxed execution for untrusted rule scripts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │   Ruleset   │────▶│   Compiler   │────▶│  Registry   │
//! │ (4 formats) │     │ (per format) │     │ (ordered)   │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        │                   │                    │
//!        ▼                   ▼                    ▼
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Validity   │     │   Facades    │     │  Scheduler  │
//! │ (calendar)  │     │ (platform)   │     │ (deferred)  │
//! └─────────────┘     └──────────────┘     └─────────────┘
//! ```

mod compiler;
mod deployment;
mod error;
mod facade;
mod scheduler;
pub mod types;
mod validity;

// Re-export public API
pub use compiler::{
    compiler_for, CompareOp, DslCompiler, FlowCompiler, JsonCompiler, RuleCompiler,
    SandboxPolicy, SchedulerBinding, ScriptCompiler, ScriptRuntime,
};
pub use deployment::RulesetDeployment;
pub use error::{Result, RuleError};
pub use facade::{
    AssetsFacade, Facades, HistoricDatapointsFacade, NotificationsFacade,
    PredictedDatapointsFacade, UsersFacade,
};
pub use scheduler::{RuleActionScheduler, ScheduledAction};
pub use validity::{CalendarEvent, Frequency, RecurrenceRule};

// Re-export core types for convenience
pub use types::{
    AssetStateChangeEvent, Clock, RuleFacts, RuleRegistry, Ruleset, RulesetLang, RulesetScope,
    RulesetStatus, SystemClock, UniformRule, DEFAULT_RULE_PRIORITY,
};
