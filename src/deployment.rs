//! Ruleset deployment lifecycle
//!
//! A deployment wraps one versioned ruleset for its whole life in the engine:
//! - Compile the source once through the format's compiler into the registry
//! - Track status and the first error; compilation never runs again after a
//!   recorded error
//! - Evaluate the optional validity window from the ruleset metadata
//! - Forward lifecycle hooks to the compiler and tear down deferred actions
//!   on stop

use crate::compiler::{compiler_for, RuleCompiler, SchedulerBinding, ScriptRuntime};
use crate::error::RuleError;
use crate::facade::Facades;
use crate::scheduler::RuleActionScheduler;
use crate::types::{
    AssetStateChangeEvent, Clock, RuleFacts, RuleRegistry, Ruleset, RulesetStatus, META_VALIDITY,
};
use crate::validity::CalendarEvent;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Sentinel window meaning "no occurrence left"
const EXPIRED_WINDOW: (i64, i64) = (i64::MIN, i64::MIN);

pub struct RulesetDeployment {
    ruleset: Ruleset,
    clock: Arc<dyn Clock>,
    scheduler: Arc<RuleActionScheduler>,
    facades: Facades,
    runtime: Arc<ScriptRuntime>,
    rules: RuleRegistry,
    status: RulesetStatus,
    error: Option<RuleError>,
    compiler: Option<Box<dyn RuleCompiler>>,
    validity: Option<CalendarEvent>,
    next_validity: Option<(i64, i64)>,
}

impl RulesetDeployment {
    pub fn new(
        ruleset: Ruleset,
        clock: Arc<dyn Clock>,
        scheduler: Arc<RuleActionScheduler>,
        facades: Facades,
        runtime: Arc<ScriptRuntime>,
    ) -> Self {
        // An unparseable validity spec is logged and ignored; the deployment
        // then never expires
        let validity = match ruleset.meta.get(META_VALIDITY) {
            None => None,
            Some(raw) => match serde_json::from_value::<CalendarEvent>(raw.clone()) {
                Ok(event) => Some(event),
                Err(e) => {
                    error!(
                        "Ruleset '{}' has invalid validity metadata, ignoring it: {}",
                        ruleset.name,
                        e
                    );
                    None
                },
            },
        };

        let mut deployment = Self {
            ruleset,
            clock,
            scheduler,
            facades,
            runtime,
            rules: RuleRegistry::new(),
            status: RulesetStatus::Ready,
            error: None,
            compiler: None,
            validity,
            next_validity: None,
        };
        deployment.update_validity();
        deployment
    }

    pub fn id(&self) -> i64 {
        self.ruleset.id
    }

    pub fn name(&self) -> &str {
        &self.ruleset.name
    }

    pub fn version(&self) -> i64 {
        self.ruleset.version
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// Registry key used for deferred actions of this deployment
    pub fn deployment_key(&self) -> String {
        format!("ruleset-{}-v{}", self.ruleset.id, self.ruleset.version)
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn status(&self) -> RulesetStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RulesetStatus) {
        self.status = status;
    }

    pub fn trigger_on_predicted_data(&self) -> bool {
        self.ruleset.trigger_on_predicted_data
    }

    // === Compilation ===

    /// Compile the ruleset source, once
    ///
    /// Returns whether the deployment holds usable rules afterwards. A
    /// deployment that already recorded an error refuses to compile again;
    /// a successfully compiled one returns `true` without recompiling.
    pub fn compile(&mut self) -> bool {
        if self.error.is_some() {
            return false;
        }
        if !self.rules.is_empty() {
            return true;
        }

        let binding = SchedulerBinding {
            scheduler: Arc::clone(&self.scheduler),
            deployment_key: self.deployment_key(),
        };
        let mut compiler = compiler_for(
            self.ruleset.lang,
            Arc::clone(&self.runtime),
            self.facades.clone(),
            binding,
        );

        match compiler.compile(&self.ruleset) {
            Ok(rules) => {
                for rule in rules {
                    if let Err(e) = self.rules.register(rule) {
                        self.fail_compilation(e);
                        return false;
                    }
                }
                self.compiler = Some(compiler);
                true
            },
            Err(e) => {
                self.fail_compilation(e);
                false
            },
        }
    }

    fn fail_compilation(&mut self, error: RuleError) {
        error!(
            "Failed to compile ruleset '{}' (id {}): {}",
            self.ruleset.name,
            self.ruleset.id,
            error
        );
        self.rules = RuleRegistry::new();
        self.set_error(error);
        self.status = RulesetStatus::CompilationError;
    }

    // === Lifecycle ===

    /// Activate the deployment
    pub fn start(&mut self, facts: &mut RuleFacts) {
        if let Some(compiler) = &mut self.compiler {
            compiler.start(facts);
        }
        self.status = RulesetStatus::Deployed;
        info!("Started ruleset deployment: {}", self);
    }

    /// Deactivate the deployment and cancel its deferred actions
    pub async fn stop(&mut self, facts: &mut RuleFacts) {
        if let Some(compiler) = &mut self.compiler {
            compiler.stop(facts);
        }
        self.scheduler.stop(&self.deployment_key()).await;
        self.status = RulesetStatus::Paused;
        info!("Stopped ruleset deployment: {}", self);
    }

    /// Forward a changed asset state to the compiler
    pub fn on_asset_states_changed(&mut self, facts: &mut RuleFacts, event: &AssetStateChangeEvent) {
        if let Some(compiler) = &mut self.compiler {
            compiler.on_asset_states_changed(facts, event);
        }
    }

    // === Validity ===

    /// Refresh the cached validity window
    ///
    /// No-op without a validity spec or once expired.
    pub fn update_validity(&mut self) {
        let Some(validity) = &self.validity else {
            return;
        };
        if self.has_expired() {
            return;
        }
        let now = self.clock.now_millis();
        self.next_validity = Some(
            validity
                .next_or_active_window(now)
                .unwrap_or(EXPIRED_WINDOW),
        );
    }

    /// Start of the current or next validity window; unbounded without one
    pub fn valid_from(&self) -> i64 {
        self.next_validity.map(|(from, _)| from).unwrap_or(i64::MIN)
    }

    /// End of the current or next validity window; unbounded without one
    pub fn valid_to(&self) -> i64 {
        self.next_validity.map(|(_, to)| to).unwrap_or(i64::MAX)
    }

    /// Whether the validity spec has no occurrence left
    pub fn has_expired(&self) -> bool {
        self.validity.is_some() && self.next_validity == Some(EXPIRED_WINDOW)
    }

    // === Errors ===

    pub fn set_error(&mut self, error: RuleError) {
        self.error = Some(error);
    }

    /// Message of the recorded root cause, if any
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    /// Whether the deployment is in a state the engine must treat as failed
    ///
    /// A looped deployment is always failed. Compilation and execution
    /// errors are failures unless the ruleset opted into continuing on
    /// error.
    pub fn is_error(&self) -> bool {
        if self.status == RulesetStatus::LoopError {
            return true;
        }
        (self.status == RulesetStatus::ExecutionError
            || self.status == RulesetStatus::CompilationError)
            && !self.ruleset.continue_on_error
    }
}

impl fmt::Display for RulesetDeployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RulesetDeployment {{ id: {}, name: '{}', version: {}, status: {:?} }}",
            self.ruleset.id, self.ruleset.name, self.ruleset.version, self.status
        )
    }
}
