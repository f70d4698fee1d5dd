//! The analysis loop.
//!
//! One `analyze` call selects a mode, runs a session turn by turn, and on
//! fallback runs a second classic session seeded from the first. Each turn:
//! route the model (switching and compacting first if needed), let the
//! planner plan, record its LLM usage, apply its state updates, then dispatch
//! its tool calls. Parallel-safe calls go out in batches no wider than
//! `max_fanouts`; each branch is admitted against the budget on its own.
//! Deadline, budget, and fallback are checked between turns only.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tubelens_agent::{SessionConfig, SessionManager};
use tubelens_core::{
    AnalysisMode, BudgetCaps, BudgetUsage, LensError, SessionError, SessionState, ToolCall,
    ToolFailure, TurnType,
};
use tubelens_logging::{EventLogger, OrchestratorEvent};
use tubelens_planner::{ModeDecision, ModeSelector, SelectionFactors, SelectionResult};
use tubelens_routing::ModelRouter;
use tubelens_supervisor::{BudgetTracker, ModelPricing};
use tubelens_tools::{Invocation, ToolCategory, ToolRegistry};

use crate::pipeline::{ClassicPipeline, PlannedCall, ResultBinding, StateUpdate, TurnPlanner};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    /// Admission stopped; the session was finalized with partial results.
    BudgetExhausted { reason: String },
    /// The time cap passed; the session was finalized with partial results.
    DeadlineReached,
    /// Abandoned for a classic session.
    FellBack { reason: String },
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub mode: AnalysisMode,
    pub outcome: SessionOutcome,
    pub usage: BudgetUsage,
    pub turns: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub video_id: String,
    pub decision: ModeDecision,
    /// In run order; a fallback adds a second, classic session.
    pub sessions: Vec<SessionReport>,
    /// State of the last session run.
    pub final_state: SessionState,
}

impl AnalysisReport {
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.sessions.last().map(|s| &s.outcome)
    }

    pub fn fell_back(&self) -> bool {
        self.sessions
            .iter()
            .any(|s| matches!(s.outcome, SessionOutcome::FellBack { .. }))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub budget_caps: BudgetCaps,
    pub retry: RetryPolicy,
    /// Hard stop for planners that never finish.
    pub max_turns: u32,
    /// Keep sessions in the manager after `analyze` returns.
    pub retain_sessions: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            budget_caps: BudgetCaps::default(),
            retry: RetryPolicy::default(),
            max_turns: 24,
            retain_sessions: false,
        }
    }
}

/// Per-session loop state. Owned by exactly one running loop.
struct SessionRun {
    session_id: String,
    mode: AnalysisMode,
    budget: BudgetTracker,
    turns: u32,
    admission_denied: Option<String>,
}

enum Loaded {
    State(SessionState),
    Abandon(SessionOutcome),
}

pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    sessions: SessionManager,
    selector: Arc<Mutex<ModeSelector>>,
    router: ModelRouter,
    pricing: ModelPricing,
    classic: Arc<dyn TurnPlanner>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(registry: Arc<ToolRegistry>, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            sessions: SessionManager::new(),
            selector: Arc::new(Mutex::new(ModeSelector::default())),
            router: ModelRouter::default(),
            pricing: ModelPricing::default(),
            classic: Arc::new(ClassicPipeline::standard()),
            config,
        }
    }

    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_selector(mut self, selector: ModeSelector) -> Self {
        self.selector = Arc::new(Mutex::new(selector));
        self
    }

    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_classic_planner(mut self, planner: Arc<dyn TurnPlanner>) -> Self {
        self.classic = planner;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn selector(&self) -> Arc<Mutex<ModeSelector>> {
        Arc::clone(&self.selector)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Analyze one video end to end.
    ///
    /// Agentic mode needs `agentic_planner`; without one the analysis runs
    /// classic regardless of the selector's decision.
    pub async fn analyze(
        &self,
        video_id: &str,
        factors: SelectionFactors,
        agentic_planner: Option<Arc<dyn TurnPlanner>>,
    ) -> Result<AnalysisReport, LensError> {
        let mut decision = self.selector.lock().await.select_mode(&factors);
        let agentic = match (decision.mode, agentic_planner) {
            (AnalysisMode::Agentic, Some(planner)) => Some(planner),
            (AnalysisMode::Agentic, None) => {
                warn!(video_id = %video_id, "Agentic mode selected but no planner configured");
                decision = ModeDecision {
                    mode: AnalysisMode::Classic,
                    confidence: 1.0,
                    fallback_recommended: false,
                    reason: format!("{}; no agentic planner configured", decision.reason),
                };
                None
            }
            (AnalysisMode::Classic, _) => None,
        };

        info!(
            video_id = %video_id,
            mode = %decision.mode,
            confidence = decision.confidence,
            reason = %decision.reason,
            "Analysis started"
        );

        let mut reports = Vec::new();
        let final_state = match agentic {
            Some(planner) => {
                let agentic_id = self.start_session(video_id, AnalysisMode::Agentic, None).await?;
                let (report, state) = self
                    .run_session(&agentic_id, AnalysisMode::Agentic, planner.as_ref())
                    .await?;
                let fallback_reason = match &report.outcome {
                    SessionOutcome::FellBack { reason } => Some(reason.clone()),
                    _ => None,
                };
                self.record_run(&report, &state).await;
                reports.push(report);

                match fallback_reason {
                    None => {
                        self.selector.lock().await.record_selection(
                            factors,
                            AnalysisMode::Agentic,
                            SelectionResult::Selected,
                        );
                        state
                    }
                    Some(reason) => {
                        self.selector.lock().await.record_selection(
                            factors,
                            AnalysisMode::Agentic,
                            SelectionResult::Fallback,
                        );
                        let classic_id = self
                            .start_session(video_id, AnalysisMode::Classic, Some(&agentic_id))
                            .await?;
                        EventLogger::log_event(
                            &agentic_id,
                            OrchestratorEvent::Fallback {
                                from_mode: AnalysisMode::Agentic.to_string(),
                                reason,
                                fallback_session_id: classic_id.clone(),
                            },
                        );
                        let classic = Arc::clone(&self.classic);
                        let (report, state) = self
                            .run_session(&classic_id, AnalysisMode::Classic, classic.as_ref())
                            .await?;
                        self.record_run(&report, &state).await;
                        reports.push(report);
                        state
                    }
                }
            }
            None => {
                let session_id = self.start_session(video_id, AnalysisMode::Classic, None).await?;
                let classic = Arc::clone(&self.classic);
                let (report, state) = self
                    .run_session(&session_id, AnalysisMode::Classic, classic.as_ref())
                    .await?;
                self.record_run(&report, &state).await;
                self.selector.lock().await.record_selection(
                    factors,
                    AnalysisMode::Classic,
                    SelectionResult::Selected,
                );
                reports.push(report);
                state
            }
        };

        if !self.config.retain_sessions {
            for report in &reports {
                if let Err(err) = self.sessions.end_session(&report.session_id).await {
                    debug!(session_id = %report.session_id, error = %err, "Session already gone");
                }
            }
        }

        info!(
            video_id = %video_id,
            sessions = reports.len(),
            outcome = ?reports.last().map(|r| &r.outcome),
            "Analysis finished"
        );

        Ok(AnalysisReport {
            video_id: video_id.to_string(),
            decision,
            sessions: reports,
            final_state,
        })
    }

    async fn start_session(
        &self,
        video_id: &str,
        mode: AnalysisMode,
        fallback_from: Option<&str>,
    ) -> Result<String, LensError> {
        let mut config = SessionConfig::new(mode, self.config.budget_caps.clone())
            .with_model(self.router.config().models.large.clone());
        if let Some(origin) = fallback_from {
            config = config.fallback_from(origin);
        }
        self.sessions.create_session(video_id, config).await
    }

    async fn record_run(&self, report: &SessionReport, state: &SessionState) {
        let pattern_quality = state
            .validation_results
            .as_ref()
            .filter(|v| !v.validated_patterns.is_empty())
            .map(|v| {
                v.validated_patterns.iter().map(|p| p.confidence).sum::<f64>()
                    / v.validated_patterns.len() as f64
            })
            .unwrap_or(0.0);
        self.selector.lock().await.update_performance(
            report.mode,
            report.outcome.is_completed(),
            report.usage.elapsed_ms,
            report.usage.costs.total,
            pattern_quality,
        );
    }

    /// Run turns until the planner finishes or a boundary check stops it.
    async fn run_session(
        &self,
        session_id: &str,
        mode: AnalysisMode,
        planner: &dyn TurnPlanner,
    ) -> Result<(SessionReport, SessionState), LensError> {
        let mut run = SessionRun {
            session_id: session_id.to_string(),
            mode,
            budget: BudgetTracker::new(self.config.budget_caps.clone())
                .with_pricing(self.pricing.clone()),
            turns: 0,
            admission_denied: None,
        };

        let outcome = loop {
            if let Some(outcome) = self.boundary_check(&run).await? {
                break outcome;
            }
            match self.run_turn(&mut run, planner).await {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(LensError::SessionCorrupted(reason)) => {
                    warn!(session_id = %session_id, reason = %reason, "Turn hit corrupted state");
                }
                Err(err) => {
                    planner.session_finished(session_id).await;
                    return Err(err);
                }
            }
            run.turns += 1;
        };

        if matches!(
            outcome,
            SessionOutcome::BudgetExhausted { .. } | SessionOutcome::DeadlineReached
        ) {
            info!(session_id = %session_id, outcome = ?outcome, "Finalizing with partial results");
            self.finalize_partial(&mut run, planner).await?;
        }
        planner.session_finished(session_id).await;

        let state = self.current_state(&run).await?;
        info!(
            session_id = %session_id,
            mode = %mode,
            turns = run.turns,
            tool_calls = run.budget.usage().tool_calls,
            tokens = run.budget.usage().tokens,
            outcome = ?outcome,
            "Session finished"
        );

        Ok((
            SessionReport {
                session_id: session_id.to_string(),
                mode,
                outcome,
                usage: run.budget.usage(),
                turns: run.turns,
            },
            state,
        ))
    }

    /// Fallback first, then deadline, then budget.
    async fn boundary_check(&self, run: &SessionRun) -> Result<Option<SessionOutcome>, LensError> {
        let usage = run.budget.usage();
        if run.mode == AnalysisMode::Agentic {
            let errors = self.sessions.nonrecoverable_error_count(&run.session_id).await?;
            let reason = self.selector.lock().await.fallback_reason(
                run.mode,
                run.budget.caps(),
                usage.elapsed_ms,
                usage.tokens,
                errors,
            );
            if let Some(reason) = reason {
                warn!(session_id = %run.session_id, reason = %reason, "Falling back to classic");
                return Ok(Some(SessionOutcome::FellBack { reason }));
            }
        }

        if usage.elapsed_ms >= run.budget.caps().max_duration_ms {
            return Ok(Some(SessionOutcome::DeadlineReached));
        }
        if let Some(reason) = run.budget.exceeded_reason() {
            return Ok(Some(SessionOutcome::BudgetExhausted { reason }));
        }
        if let Some(reason) = &run.admission_denied {
            return Ok(Some(SessionOutcome::BudgetExhausted {
                reason: reason.clone(),
            }));
        }
        if run.turns >= self.config.max_turns {
            return Ok(Some(SessionOutcome::BudgetExhausted {
                reason: format!("turn limit {} reached", self.config.max_turns),
            }));
        }
        Ok(None)
    }

    /// One turn. `Some` ends the session.
    async fn run_turn(
        &self,
        run: &mut SessionRun,
        planner: &dyn TurnPlanner,
    ) -> Result<Option<SessionOutcome>, LensError> {
        let state = match self.load_state(run).await? {
            Loaded::State(state) => state,
            Loaded::Abandon(outcome) => return Ok(Some(outcome)),
        };

        let turn = match planner.next_turn_type(&state).await {
            Ok(Some(turn)) => turn,
            Ok(None) => return Ok(Some(SessionOutcome::Completed)),
            Err(err) => {
                self.record_planner_error(run, planner, &err).await?;
                return Ok(None);
            }
        };

        let (state, model) = self.route_turn(run, state, turn).await?;
        debug!(session_id = %run.session_id, turn = %turn, model = %model, "Planning turn");

        let planned = match planner.plan_turn(&state, turn, &model).await {
            Ok(planned) => planned,
            Err(err) => {
                self.record_planner_error(run, planner, &err).await?;
                return Ok(None);
            }
        };

        if planned.tokens_used > 0 {
            run.budget.record_model_usage(&model, planned.tokens_used);
        }
        for update in planned.updates {
            self.apply_update(run, update).await?;
        }
        self.dispatch(run, planned.calls).await?;
        Ok(None)
    }

    /// Live state, or a recovered one. Agentic sessions whose state cannot
    /// be usefully rebuilt are abandoned for classic.
    async fn load_state(&self, run: &SessionRun) -> Result<Loaded, LensError> {
        match self.sessions.get_state(&run.session_id).await {
            Ok(state) => Ok(Loaded::State(state)),
            Err(LensError::SessionCorrupted(reason)) => {
                warn!(session_id = %run.session_id, reason = %reason, "Recovering session");
                let recovered = self.sessions.recover_session(&run.session_id).await?;
                if recovered.restart_in_classic && run.mode == AnalysisMode::Agentic {
                    return Ok(Loaded::Abandon(SessionOutcome::FellBack {
                        reason: format!("session state lost: {}", reason),
                    }));
                }
                Ok(Loaded::State(recovered.state))
            }
            Err(err) => Err(err),
        }
    }

    async fn current_state(&self, run: &SessionRun) -> Result<SessionState, LensError> {
        match self.sessions.get_state(&run.session_id).await {
            Err(LensError::SessionCorrupted(_)) => {
                Ok(self.sessions.recover_session(&run.session_id).await?.state)
            }
            other => other,
        }
    }

    /// Pick the model for this turn. A switch compacts the session before
    /// anything runs under the new model. Classic sessions make no LLM calls
    /// and keep their model.
    async fn route_turn(
        &self,
        run: &SessionRun,
        state: SessionState,
        turn: TurnType,
    ) -> Result<(SessionState, String), LensError> {
        if run.mode == AnalysisMode::Classic {
            let model = state.current_model.clone();
            return Ok((state, model));
        }

        let decision = self.router.route(turn, &state, &run.budget.usage());
        if !decision.switch_required {
            return Ok((state, decision.model));
        }

        let report = self
            .sessions
            .switch_model(&run.session_id, &state.current_model, &decision.model)
            .await?;
        EventLogger::log_event(
            &run.session_id,
            OrchestratorEvent::ModelSwitch {
                from: state.current_model.clone(),
                to: decision.model.clone(),
                reason: decision.reason.clone(),
            },
        );
        debug!(
            session_id = %run.session_id,
            dropped_tool_calls = report.dropped_tool_calls(),
            "Compaction finished before switch"
        );
        let state = self.sessions.get_state(&run.session_id).await?;
        Ok((state, decision.model))
    }

    async fn finalize_partial(
        &self,
        run: &mut SessionRun,
        planner: &dyn TurnPlanner,
    ) -> Result<(), LensError> {
        let state = self.current_state(run).await?;
        let model = state.current_model.clone();
        match planner.plan_turn(&state, TurnType::Finalization, &model).await {
            Ok(planned) => {
                if !planned.calls.is_empty() {
                    info!(
                        session_id = %run.session_id,
                        skipped = planned.calls.len(),
                        "Skipping tool calls during partial finalization"
                    );
                }
                if planned.tokens_used > 0 {
                    run.budget.record_model_usage(&model, planned.tokens_used);
                }
                for update in planned.updates {
                    self.apply_update(run, update).await?;
                }
                Ok(())
            }
            Err(err) => self.record_planner_error(run, planner, &err).await,
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(&self, run: &mut SessionRun, calls: Vec<PlannedCall>) -> Result<(), LensError> {
        let mut parallel = Vec::new();
        let mut sequential = Vec::new();
        let mut seen_keys = HashSet::new();
        for call in calls {
            match self.registry.get(&call.tool) {
                Some(definition) if definition.parallel_safe => {
                    // A repeat of a cacheable call waits for the first to land
                    // so it can be served from the cache.
                    let repeat = definition
                        .cache_key_for(&call.params)
                        .is_some_and(|key| !seen_keys.insert(key));
                    if repeat {
                        sequential.push(call);
                    } else {
                        parallel.push(call);
                    }
                }
                _ => sequential.push(call),
            }
        }

        while !parallel.is_empty() && run.admission_denied.is_none() {
            let width = run.budget.fanout_width(parallel.len()).max(1);
            let batch: Vec<PlannedCall> = parallel.drain(..width).collect();
            self.run_batch(run, batch).await?;
        }
        for call in sequential {
            if run.admission_denied.is_some() {
                break;
            }
            self.run_batch(run, vec![call]).await?;
        }
        Ok(())
    }

    /// Admit each call on its own, then run the admitted ones concurrently.
    async fn run_batch(&self, run: &mut SessionRun, batch: Vec<PlannedCall>) -> Result<(), LensError> {
        let state = self.sessions.get_state(&run.session_id).await?;

        let mut admitted = Vec::with_capacity(batch.len());
        for call in batch {
            let definition = match self.registry.validate(&call.tool, &call.params) {
                Ok(definition) => definition,
                Err(err) => {
                    self.record_rejection(run, &call, &err).await?;
                    continue;
                }
            };
            if self
                .registry
                .cached_call(&state, &call.tool, &call.params)
                .is_some()
            {
                admitted.push(call);
                continue;
            }
            if !run.budget.can_execute(&call.tool, definition.estimated_tokens) {
                let usage = run.budget.usage();
                let reason = format!(
                    "admission refused for {} at {} tool calls, {} tokens",
                    call.tool, usage.tool_calls, usage.tokens
                );
                info!(session_id = %run.session_id, reason = %reason, "Budget stop");
                run.admission_denied = Some(reason);
                break;
            }
            if definition.category == ToolCategory::Validation {
                if !run.budget.can_validate() {
                    debug!(session_id = %run.session_id, tool = %call.tool, "Validation cap reached");
                    continue;
                }
                run.budget.record_validation();
            }
            run.budget.record_tool_call(
                &call.tool,
                definition.estimated_tokens,
                definition.estimated_cost,
            );
            admitted.push(call);
        }

        let invocations = join_all(admitted.iter().map(|call| {
            self.registry.invoke(
                &state,
                Uuid::new_v4().to_string(),
                &call.tool,
                call.params.clone(),
            )
        }))
        .await;

        for (call, invocation) in admitted.into_iter().zip(invocations) {
            match invocation {
                Ok(invocation) => self.settle(run, &call, invocation).await?,
                Err(err) => self.record_rejection(run, &call, &err).await?,
            }
        }
        Ok(())
    }

    /// Record a finished call, bind its result or retry it.
    async fn settle(
        &self,
        run: &mut SessionRun,
        planned: &PlannedCall,
        first: Invocation,
    ) -> Result<(), LensError> {
        let mut invocation = first;
        let mut attempts = 1;
        loop {
            self.record_call(run, &invocation.call).await?;
            if invocation.call.is_success() {
                if let (Some(binding), Some(result)) = (planned.binding, &invocation.call.result) {
                    self.bind_result(run, binding, result).await?;
                }
                return Ok(());
            }

            let message = invocation.call.error.clone().unwrap_or_default();
            self.record_error(
                run,
                &format!("tool:{}", planned.tool),
                &message,
                invocation.recoverable,
            )
            .await?;
            if !invocation.recoverable || !self.config.retry.should_retry(attempts) {
                return Ok(());
            }

            let remaining = run
                .budget
                .caps()
                .max_duration_ms
                .saturating_sub(run.budget.elapsed_ms());
            let Some(delay) = self.config.retry.delay_within(attempts, remaining) else {
                return Ok(());
            };
            let Some(definition) = self.registry.get(&planned.tool) else {
                return Ok(());
            };
            if !run.budget.can_execute(&planned.tool, definition.estimated_tokens) {
                debug!(session_id = %run.session_id, tool = %planned.tool, "No budget left to retry");
                return Ok(());
            }

            debug!(
                session_id = %run.session_id,
                tool = %planned.tool,
                attempt = attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying tool"
            );
            tokio::time::sleep(delay).await;
            run.budget.record_tool_call(
                &planned.tool,
                definition.estimated_tokens,
                definition.estimated_cost,
            );
            let state = self.sessions.get_state(&run.session_id).await?;
            invocation = self
                .registry
                .invoke(
                    &state,
                    Uuid::new_v4().to_string(),
                    &planned.tool,
                    planned.params.clone(),
                )
                .await?;
            attempts += 1;
        }
    }

    async fn bind_result(
        &self,
        run: &SessionRun,
        binding: ResultBinding,
        result: &serde_json::Value,
    ) -> Result<(), LensError> {
        let state = self.sessions.get_state(&run.session_id).await?;
        let limit = run.budget.candidate_limit() as usize;
        match binding.to_update(result, &state, limit) {
            Ok(update) => self.apply_update(run, update).await,
            Err(err) => {
                self.record_error(run, &format!("binding:{:?}", binding), &format!("{:#}", err), false)
                    .await
            }
        }
    }

    /// Invalid updates are recorded as errors; the session carries on.
    async fn apply_update(&self, run: &SessionRun, update: StateUpdate) -> Result<(), LensError> {
        let id = run.session_id.as_str();
        let result = match update {
            StateUpdate::VideoContext(context) => self.sessions.update_video_context(id, context).await,
            StateUpdate::Hypothesis(hypothesis) => self.sessions.update_hypothesis(id, hypothesis).await,
            StateUpdate::SearchResults(results) => self.sessions.update_search_results(id, results).await,
            StateUpdate::ValidationResults(results) => {
                self.sessions.update_validation_results(id, results).await
            }
            StateUpdate::Patterns(patterns) => self.sessions.record_patterns(id, patterns).await,
        };
        match result {
            Err(LensError::InvalidState(message)) => {
                self.record_error(run, "state update", &message, false).await
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    async fn record_call(&self, run: &SessionRun, call: &ToolCall) -> Result<(), LensError> {
        EventLogger::log_event(
            &run.session_id,
            OrchestratorEvent::ToolCall {
                tool_name: call.tool_name.clone(),
                params_json: call.params.to_string(),
                success: call.is_success(),
                cached: call.cached,
                duration_ms: call.duration_ms(),
            },
        );
        self.sessions.record_tool_call(&run.session_id, call.clone()).await
    }

    async fn record_error(
        &self,
        run: &SessionRun,
        context: &str,
        message: &str,
        recoverable: bool,
    ) -> Result<(), LensError> {
        EventLogger::log_event(
            &run.session_id,
            OrchestratorEvent::Error {
                context: context.to_string(),
                error_msg: message.to_string(),
                recoverable,
            },
        );
        self.sessions
            .record_error(&run.session_id, SessionError::new(message, context, recoverable))
            .await
    }

    /// A call refused before dispatch (unknown tool, bad params). Recorded as
    /// a failed call without consuming budget.
    async fn record_rejection(
        &self,
        run: &SessionRun,
        call: &PlannedCall,
        err: &LensError,
    ) -> Result<(), LensError> {
        let failed = ToolCall::failure(
            Uuid::new_v4().to_string(),
            &call.tool,
            call.params.clone(),
            Utc::now(),
            err.to_string(),
        );
        self.record_call(run, &failed).await?;
        self.record_error(run, &format!("admission:{}", call.tool), &err.to_string(), false)
            .await
    }

    async fn record_planner_error(
        &self,
        run: &SessionRun,
        planner: &dyn TurnPlanner,
        err: &anyhow::Error,
    ) -> Result<(), LensError> {
        let (message, recoverable) = ToolFailure::classify(err);
        self.record_error(run, &format!("planner:{}", planner.name()), &message, recoverable)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tubelens_core::{Hypothesis, Tool};
    use tubelens_tools::AnalyticTool;

    use super::*;
    use crate::pipeline::PlannedTurn;

    // --- test doubles -----------------------------------------------------

    struct ScriptedTool {
        result: Value,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        transient_failures: usize,
        permanent: bool,
    }

    impl ScriptedTool {
        fn ok(result: Value) -> Arc<Self> {
            Arc::new(Self::build(result))
        }

        fn slow(result: Value, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::build(result)
            })
        }

        fn flaky(result: Value, transient_failures: usize) -> Arc<Self> {
            Arc::new(Self {
                transient_failures,
                ..Self::build(result)
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                permanent: true,
                ..Self::build(Value::Null)
            })
        }

        fn build(result: Value) -> Self {
            Self {
                result,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::ZERO,
                transient_failures: 0,
                permanent: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn call(&self, _params: Value) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.permanent {
                return Err(ToolFailure::permanent("engine rejected request").into());
            }
            if n < self.transient_failures {
                return Err(ToolFailure::transient("engine busy").into());
            }
            Ok(self.result.clone())
        }
    }

    /// Invalidates every session the first time it is called.
    struct SabotageTool {
        sessions: SessionManager,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Tool for SabotageTool {
        fn name(&self) -> &str {
            "sabotage"
        }

        async fn call(&self, _params: Value) -> Result<Value> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                for id in self.sessions.session_ids().await {
                    self.sessions.invalidate(&id, "store write lost").await?;
                }
            }
            Ok(json!({"title": "Knife skills", "channel": "UC1", "niche": "cooking"}))
        }
    }

    struct ScriptedPlanner {
        turns: std::sync::Mutex<VecDeque<(TurnType, PlannedTurn)>>,
        models: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedPlanner {
        fn new(turns: Vec<(TurnType, PlannedTurn)>) -> Arc<Self> {
            Arc::new(Self {
                turns: std::sync::Mutex::new(turns.into()),
                models: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TurnPlanner for ScriptedPlanner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn next_turn_type(&self, _state: &SessionState) -> Result<Option<TurnType>> {
            Ok(self.turns.lock().unwrap().front().map(|(turn, _)| *turn))
        }

        async fn plan_turn(&self, _state: &SessionState, _turn: TurnType, model: &str) -> Result<PlannedTurn> {
            self.models.lock().unwrap().push(model.to_string());
            Ok(self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .map(|(_, planned)| planned)
                .unwrap_or_default())
        }
    }

    fn calls(calls: Vec<PlannedCall>) -> PlannedTurn {
        PlannedTurn {
            calls,
            ..Default::default()
        }
    }

    fn transcript(language: &str) -> PlannedCall {
        PlannedCall::new("transcript", json!({"video_id": "vid-1", "language": language}))
    }

    fn favorable() -> SelectionFactors {
        SelectionFactors {
            video_has_high_tps: true,
            channel_has_patterns: true,
            has_competitive_data: true,
            has_semantic_clusters: true,
            previous_failures: 0,
            quota_available: true,
        }
    }

    fn classic_only() -> SelectionFactors {
        SelectionFactors {
            quota_available: false,
            ..Default::default()
        }
    }

    /// Every standard engine backed by a canned response.
    fn standard_tools() -> Vec<(AnalyticTool, Arc<ScriptedTool>)> {
        vec![
            (
                AnalyticTool::VideoContext,
                ScriptedTool::ok(json!({"title": "Knife skills", "channel": "UC1", "niche": "cooking"})),
            ),
            (AnalyticTool::Transcript, ScriptedTool::ok(json!({"text": "today we dice"}))),
            (AnalyticTool::ChannelBaseline, ScriptedTool::ok(json!({"medianViews": 12000}))),
            (AnalyticTool::PerformanceEnvelope, ScriptedTool::ok(json!({"percentile": 92.0}))),
            (
                AnalyticTool::TopicClusters,
                ScriptedTool::ok(json!({"patterns": [
                    {"pattern": "tight hooks", "score": 0.9},
                    {"pattern": "question titles", "score": 0.6}
                ]})),
            ),
            (
                AnalyticTool::SemanticNeighbors,
                ScriptedTool::ok(json!({"videoIds": ["n1", "n2"], "totalCandidates": 2})),
            ),
            (
                AnalyticTool::CompetitiveSuccesses,
                ScriptedTool::ok(json!({"videoIds": ["c1"]})),
            ),
            (
                AnalyticTool::ValidatePattern,
                ScriptedTool::ok(json!({"pattern": "tight hooks", "confidence": 0.8, "supported": true})),
            ),
        ]
    }

    fn registry(tools: &[(AnalyticTool, Arc<ScriptedTool>)]) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for (tool, handler) in tools {
            registry.register(tool.definition(handler.clone()));
        }
        Arc::new(registry)
    }

    fn replace(
        tools: &mut [(AnalyticTool, Arc<ScriptedTool>)],
        which: AnalyticTool,
        handler: Arc<ScriptedTool>,
    ) {
        if let Some(entry) = tools.iter_mut().find(|(t, _)| *t == which) {
            entry.1 = handler;
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1,
            jitter: false,
            ..Default::default()
        }
    }

    fn orchestrator(registry: Arc<ToolRegistry>, caps: BudgetCaps) -> Orchestrator {
        Orchestrator::new(
            registry,
            OrchestratorConfig {
                budget_caps: caps,
                retry: quick_retry(),
                ..Default::default()
            },
        )
    }

    // --- classic ----------------------------------------------------------

    #[tokio::test]
    async fn test_classic_pipeline_completes() {
        let tools = standard_tools();
        let orch = orchestrator(registry(&tools), BudgetCaps::default());

        let report = orch.analyze("vid-1", classic_only(), None).await.unwrap();

        assert_eq!(report.decision.mode, AnalysisMode::Classic);
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.outcome(), Some(&SessionOutcome::Completed));

        let state = &report.final_state;
        assert_eq!(state.mode, AnalysisMode::Classic);
        // lookup 1 + enrichment 4 + search 2 + validation 2
        assert_eq!(state.tool_calls.len(), 9);
        assert!(state.tool_calls.iter().all(|c| c.is_success()));
        assert_eq!(state.video_context.as_ref().unwrap().score, Some(92.0));
        assert_eq!(state.search_results.as_ref().unwrap().semantic_neighbors, vec!["n1", "n2"]);
        assert_eq!(state.validation_results.as_ref().unwrap().total_validations, 2);
        let hypothesis = state.hypothesis.as_ref().unwrap();
        assert!(hypothesis.statement.contains("tight hooks"));
        assert_eq!(report.sessions[0].usage.tool_calls, 9);

        // Sessions are released once the report is built.
        assert!(orch.sessions().session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_agentic_without_planner_runs_classic() {
        let tools = standard_tools();
        let orch = orchestrator(registry(&tools), BudgetCaps::default());
        let report = orch.analyze("vid-1", favorable(), None).await.unwrap();
        assert_eq!(report.decision.mode, AnalysisMode::Classic);
        assert!(report.decision.reason.contains("no agentic planner"));
        assert!(report.outcome().unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_deadline_finalizes_with_partial_results() {
        let mut tools = standard_tools();
        replace(
            &mut tools,
            AnalyticTool::VideoContext,
            ScriptedTool::slow(json!({"title": "Slow"}), Duration::from_millis(80)),
        );
        let caps = BudgetCaps {
            max_duration_ms: 50,
            ..Default::default()
        };
        let orch = orchestrator(registry(&tools), caps);

        let report = orch.analyze("vid-1", classic_only(), None).await.unwrap();
        assert_eq!(report.outcome(), Some(&SessionOutcome::DeadlineReached));
        // The slow call overran, was still recorded, and finalization ran.
        assert_eq!(report.final_state.tool_calls.len(), 1);
        assert!(report.final_state.hypothesis.is_some());
    }

    // --- agentic ----------------------------------------------------------

    #[tokio::test]
    async fn test_three_nonrecoverable_errors_fall_back() {
        let mut tools = standard_tools();
        replace(&mut tools, AnalyticTool::Transcript, ScriptedTool::broken());
        let orch = orchestrator(registry(&tools), BudgetCaps::default());

        let planner = ScriptedPlanner::new(vec![
            (
                TurnType::HypothesisGeneration,
                PlannedTurn {
                    calls: vec![transcript("en"), transcript("de"), transcript("fr")],
                    updates: vec![StateUpdate::Hypothesis(Hypothesis::new("Hooks drive retention", 0.5))],
                    tokens_used: 1_000,
                },
            ),
            (TurnType::Validation, calls(vec![])),
        ]);

        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(report.decision.mode, AnalysisMode::Agentic);
        assert_eq!(report.sessions.len(), 2);
        assert!(report.fell_back());
        match &report.sessions[0].outcome {
            SessionOutcome::FellBack { reason } => assert!(reason.contains("non-recoverable")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.sessions[1].mode, AnalysisMode::Classic);
        assert_eq!(
            report.final_state.fallback_from.as_deref(),
            Some(report.sessions[0].session_id.as_str())
        );
        assert_eq!(report.final_state.mode, AnalysisMode::Classic);

        let selector = orch.selector();
        let stats = selector.lock().await.performance_stats();
        assert_eq!(stats.agentic.runs, 1);
        assert_eq!(stats.agentic.successes, 0);
        assert_eq!(stats.classic.runs, 1);
        assert_eq!(stats.recent_selections, 1);
    }

    #[tokio::test]
    async fn test_single_error_does_not_fall_back() {
        let mut tools = standard_tools();
        replace(&mut tools, AnalyticTool::Transcript, ScriptedTool::broken());
        let orch = orchestrator(registry(&tools), BudgetCaps::default());

        let planner = ScriptedPlanner::new(vec![(
            TurnType::Enrichment,
            calls(vec![transcript("en")]),
        )]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(report.sessions.len(), 1);
        assert!(report.outcome().unwrap().is_completed());
        assert_eq!(report.final_state.errors.len(), 1);
        assert!(!report.final_state.errors[0].recoverable);
    }

    #[tokio::test]
    async fn test_token_fallback_uses_session_cap() {
        let tools = standard_tools();
        let caps = BudgetCaps {
            max_tokens: 10_000,
            ..Default::default()
        };
        let orch = orchestrator(registry(&tools), caps);

        let planner = ScriptedPlanner::new(vec![
            (
                TurnType::HypothesisGeneration,
                PlannedTurn {
                    updates: vec![StateUpdate::Hypothesis(Hypothesis::new("Hooks drive retention", 0.5))],
                    tokens_used: 9_000,
                    ..Default::default()
                },
            ),
            (TurnType::Validation, calls(vec![])),
            (TurnType::Finalization, calls(vec![])),
        ]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(report.sessions.len(), 2);
        match &report.sessions[0].outcome {
            SessionOutcome::FellBack { reason } => assert!(reason.contains("tokens")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.sessions[0].turns, 1);
        assert_eq!(report.sessions[1].mode, AnalysisMode::Classic);
        assert_eq!(
            report.final_state.fallback_from.as_deref(),
            Some(report.sessions[0].session_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_cacheable_call_runs_handler_once() {
        let tools = standard_tools();
        let transcript_tool = tools[1].1.clone();
        let orch = orchestrator(registry(&tools), BudgetCaps::default());

        let planner = ScriptedPlanner::new(vec![
            (TurnType::Enrichment, calls(vec![transcript("en")])),
            (TurnType::Enrichment, calls(vec![transcript("en")])),
        ]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(transcript_tool.calls(), 1);
        let recorded = &report.final_state.tool_calls;
        assert_eq!(recorded.len(), 2);
        assert!(!recorded[0].cached);
        assert!(recorded[1].cached);
        assert_eq!(recorded[0].result, recorded[1].result);
        // Cache hits skip admission.
        assert_eq!(report.sessions[0].usage.tool_calls, 1);
    }

    #[tokio::test]
    async fn test_duplicate_calls_in_one_batch_share_result() {
        let tools = standard_tools();
        let transcript_tool = tools[1].1.clone();
        let orch = orchestrator(registry(&tools), BudgetCaps::default());

        let planner = ScriptedPlanner::new(vec![(
            TurnType::Enrichment,
            calls(vec![transcript("en"), transcript("en")]),
        )]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(transcript_tool.calls(), 1);
        assert_eq!(report.final_state.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_admits_each_branch() {
        let tools = standard_tools();
        let transcript_tool = tools[1].1.clone();
        let caps = BudgetCaps {
            max_tool_calls: 3,
            ..Default::default()
        };
        let orch = orchestrator(registry(&tools), caps);

        let planner = ScriptedPlanner::new(vec![
            (
                TurnType::Enrichment,
                calls(["en", "de", "fr", "es", "it"].into_iter().map(transcript).collect()),
            ),
            (
                TurnType::Finalization,
                PlannedTurn {
                    updates: vec![StateUpdate::Hypothesis(Hypothesis::new("partial view", 0.3))],
                    ..Default::default()
                },
            ),
        ]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(transcript_tool.calls(), 3);
        assert_eq!(report.sessions[0].usage.tool_calls, 3);
        assert!(matches!(
            report.outcome(),
            Some(SessionOutcome::BudgetExhausted { .. })
        ));
        assert_eq!(
            report.final_state.hypothesis.as_ref().unwrap().statement,
            "partial view"
        );
    }

    #[tokio::test]
    async fn test_fanout_width_bounds_concurrency() {
        let mut tools = standard_tools();
        let slow = ScriptedTool::slow(json!({"text": "t"}), Duration::from_millis(30));
        replace(&mut tools, AnalyticTool::Transcript, slow.clone());
        let caps = BudgetCaps {
            max_fanouts: 2,
            ..Default::default()
        };
        let orch = orchestrator(registry(&tools), caps);

        let planner = ScriptedPlanner::new(vec![(
            TurnType::Enrichment,
            calls(["en", "de", "fr", "es"].into_iter().map(transcript).collect()),
        )]);
        orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(slow.calls(), 4);
        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_recoverable_failure_is_retried() {
        let mut tools = standard_tools();
        let flaky = ScriptedTool::flaky(json!({"text": "t"}), 1);
        replace(&mut tools, AnalyticTool::Transcript, flaky.clone());
        let orch = orchestrator(registry(&tools), BudgetCaps::default());

        let planner = ScriptedPlanner::new(vec![(TurnType::Enrichment, calls(vec![transcript("en")]))]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(flaky.calls(), 2);
        let state = &report.final_state;
        assert_eq!(state.tool_calls.len(), 2);
        assert!(!state.tool_calls[0].is_success());
        assert!(state.tool_calls[1].is_success());
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].recoverable);
        assert!(report.outcome().unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_without_budget() {
        let tools = standard_tools();
        let neighbors = tools[5].1.clone();
        let orch = orchestrator(registry(&tools), BudgetCaps::default());

        let planner = ScriptedPlanner::new(vec![(
            TurnType::Lookup,
            calls(vec![
                PlannedCall::new("semantic_neighbors", json!({"video_id": "vid-1"})),
                PlannedCall::new("render_thumbnail", json!({})),
            ]),
        )]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(neighbors.calls(), 0);
        assert_eq!(report.sessions[0].usage.tool_calls, 0);
        let state = &report.final_state;
        assert_eq!(state.tool_calls.len(), 2);
        assert!(state.tool_calls.iter().all(|c| !c.is_success()));
        assert_eq!(state.nonrecoverable_errors(), 2);
    }

    #[tokio::test]
    async fn test_budget_pressure_switches_to_small_model() {
        let tools = standard_tools();
        let orch = orchestrator(registry(&tools), BudgetCaps::default())
            .with_classic_planner(Arc::new(ClassicPipeline::standard()));

        // Exactly 80% routes to the small tier without tripping the fallback.
        let planner = ScriptedPlanner::new(vec![
            (
                TurnType::HypothesisGeneration,
                PlannedTurn {
                    tokens_used: 80_000,
                    ..Default::default()
                },
            ),
            (TurnType::Validation, calls(vec![])),
        ]);
        let report = orch
            .analyze("vid-1", favorable(), Some(planner.clone()))
            .await
            .unwrap();

        let models = planner.models.lock().unwrap().clone();
        assert_eq!(models, vec!["gpt-5".to_string(), "gpt-5-nano".to_string()]);
        let state = &report.final_state;
        assert_eq!(state.current_model, "gpt-5-nano");
        assert_eq!(state.model_switch_history.len(), 1);
        assert_eq!(state.model_switch_history[0].from, "gpt-5");
        assert!(report.sessions[0].usage.costs.by_tool.contains_key("gpt-5"));
    }

    #[tokio::test]
    async fn test_lost_state_restarts_in_classic() {
        let sessions = SessionManager::new();
        let mut registry = ToolRegistry::new();
        for (tool, handler) in standard_tools() {
            if tool == AnalyticTool::VideoContext {
                let sabotage = Arc::new(SabotageTool {
                    sessions: sessions.clone(),
                    fired: AtomicBool::new(false),
                });
                registry.register(tool.definition(sabotage));
            } else {
                registry.register(tool.definition(handler));
            }
        }
        let orch = orchestrator(Arc::new(registry), BudgetCaps::default()).with_sessions(sessions);

        let planner = ScriptedPlanner::new(vec![
            (
                TurnType::Lookup,
                calls(vec![PlannedCall::new("video_context", json!({"video_id": "vid-1"}))]),
            ),
            (TurnType::HypothesisGeneration, calls(vec![])),
        ]);
        let report = orch.analyze("vid-1", favorable(), Some(planner)).await.unwrap();

        assert_eq!(report.sessions.len(), 2);
        match &report.sessions[0].outcome {
            SessionOutcome::FellBack { reason } => assert!(reason.contains("state lost")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(report.outcome().unwrap().is_completed());
        assert!(report.final_state.hypothesis.is_some());
    }
}
