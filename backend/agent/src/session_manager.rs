//! Owner of every live `SessionState`.
//!
//! Besides the live state each session keeps a checkpoint (the last state
//! that passed its invariant checks) and append-only journals of errors and
//! tool calls. Those survive loss of the live state and feed
//! `recover_session`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tubelens_core::{
    AnalysisMode, BudgetCaps, DiscoveredPattern, Hypothesis, LensError, ModelSwitch,
    SearchResults, SessionError, SessionState, ToolCall, ValidationResults, VideoContext,
};

use crate::compaction::{CompactionReport, KEEP_PATTERNS, KEEP_TOOL_CALLS, compact_for_model_switch};

/// Model a session starts on when none is given.
pub const DEFAULT_INITIAL_MODEL: &str = "gpt-5";

/// Parameters for `create_session`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub budget_caps: BudgetCaps,
    pub mode: AnalysisMode,
    /// Originating session when this one is a fallback target.
    pub fallback_from: Option<String>,
    pub initial_model: String,
}

impl SessionConfig {
    pub fn new(mode: AnalysisMode, budget_caps: BudgetCaps) -> Self {
        Self {
            budget_caps,
            mode,
            fallback_from: None,
            initial_model: DEFAULT_INITIAL_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.initial_model = model.into();
        self
    }

    pub fn fallback_from(mut self, session_id: impl Into<String>) -> Self {
        self.fallback_from = Some(session_id.into());
        self
    }
}

/// Outcome of `recover_session`.
#[derive(Debug, Clone)]
pub struct RecoveredSession {
    pub state: SessionState,
    /// Nothing usable survived (no hypothesis, no video context); the caller
    /// should start over in classic mode instead of retrying agentic mode.
    pub restart_in_classic: bool,
}

struct SessionEntry {
    live: Option<SessionState>,
    corruption: Option<String>,
    checkpoint: Option<SessionState>,
    error_journal: Vec<SessionError>,
    call_journal: Vec<ToolCall>,
    video_id: String,
    config: SessionConfig,
}

/// Cloneable handle; clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    keep_tool_calls: usize,
    keep_patterns: usize,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_compaction(KEEP_TOOL_CALLS, KEEP_PATTERNS)
    }

    pub fn with_compaction(keep_tool_calls: usize, keep_patterns: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            keep_tool_calls,
            keep_patterns,
        }
    }

    /// Start a session for `video_id` and return its id.
    ///
    /// A fallback session copies the origin's video context, hypothesis,
    /// search results, validation results, and discovered patterns.
    pub async fn create_session(
        &self,
        video_id: &str,
        config: SessionConfig,
    ) -> Result<String, LensError> {
        if video_id.trim().is_empty() {
            return Err(LensError::InvalidState("video id is empty".to_string()));
        }
        config.budget_caps.validate()?;

        let session_id = Uuid::new_v4().to_string();
        let mut state = SessionState::new(
            &session_id,
            video_id,
            config.mode,
            &config.initial_model,
            config.budget_caps.clone(),
        );

        let mut sessions = self.sessions.write().await;

        if let Some(origin_id) = &config.fallback_from {
            let origin = sessions
                .get(origin_id)
                .ok_or_else(|| LensError::SessionNotFound(origin_id.clone()))?;
            let source = origin
                .live
                .as_ref()
                .or(origin.checkpoint.as_ref())
                .ok_or_else(|| LensError::SessionCorrupted(origin_id.clone()))?;
            if source.video_id != video_id {
                warn!(
                    origin = %origin_id,
                    origin_video = %source.video_id,
                    video_id = %video_id,
                    "Fallback session targets a different video"
                );
            }
            state.video_context = source.video_context.clone();
            state.hypothesis = source.hypothesis.clone();
            state.search_results = source.search_results.clone();
            state.validation_results = source.validation_results.clone();
            state.discovered_patterns = source.discovered_patterns.clone();
            state.fallback_from = Some(origin_id.clone());
        }

        info!(
            session_id = %session_id,
            video_id = %video_id,
            mode = %config.mode,
            model = %config.initial_model,
            fallback_from = ?config.fallback_from,
            "Session created"
        );

        sessions.insert(
            session_id.clone(),
            SessionEntry {
                checkpoint: Some(state.clone()),
                live: Some(state),
                corruption: None,
                error_journal: Vec::new(),
                call_journal: Vec::new(),
                video_id: video_id.to_string(),
                config,
            },
        );
        Ok(session_id)
    }

    pub async fn get_state(&self, session_id: &str) -> Result<SessionState, LensError> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| LensError::SessionNotFound(session_id.to_string()))?;
        entry.live.clone().ok_or_else(|| corrupted(session_id, entry))
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a session and return its last known state.
    pub async fn end_session(&self, session_id: &str) -> Result<SessionState, LensError> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| LensError::SessionNotFound(session_id.to_string()))?;
        info!(session_id = %session_id, "Session ended");
        entry
            .live
            .or(entry.checkpoint)
            .ok_or_else(|| LensError::SessionCorrupted(session_id.to_string()))
    }

    pub async fn update_video_context(
        &self,
        session_id: &str,
        context: VideoContext,
    ) -> Result<(), LensError> {
        self.mutate(session_id, |state| {
            state.video_context = Some(context);
            Ok(())
        })
        .await
    }

    pub async fn update_hypothesis(
        &self,
        session_id: &str,
        hypothesis: Hypothesis,
    ) -> Result<(), LensError> {
        if !(0.0..=1.0).contains(&hypothesis.confidence) {
            return Err(LensError::InvalidState(format!(
                "hypothesis confidence {} outside [0, 1]",
                hypothesis.confidence
            )));
        }
        self.mutate(session_id, |state| {
            state.hypothesis = Some(hypothesis);
            Ok(())
        })
        .await
    }

    pub async fn update_search_results(
        &self,
        session_id: &str,
        results: SearchResults,
    ) -> Result<(), LensError> {
        self.mutate(session_id, |state| {
            state.search_results = Some(results);
            Ok(())
        })
        .await
    }

    pub async fn update_validation_results(
        &self,
        session_id: &str,
        results: ValidationResults,
    ) -> Result<(), LensError> {
        self.mutate(session_id, |state| {
            state.validation_results = Some(results);
            Ok(())
        })
        .await
    }

    /// Append newly discovered patterns.
    pub async fn record_patterns(
        &self,
        session_id: &str,
        patterns: Vec<DiscoveredPattern>,
    ) -> Result<(), LensError> {
        self.mutate(session_id, |state| {
            state.discovered_patterns.extend(patterns);
            Ok(())
        })
        .await
    }

    /// Append a tool call. Budget admission is the caller's job.
    pub async fn record_tool_call(&self, session_id: &str, call: ToolCall) -> Result<(), LensError> {
        self.journal(session_id, |entry| entry.call_journal.push(call.clone()))
            .await?;
        self.mutate(session_id, |state| {
            debug!(
                session_id = %state.session_id,
                tool = %call.tool_name,
                status = ?call.status,
                cached = call.cached,
                "Recorded tool call"
            );
            state.tool_calls.push(call);
            Ok(())
        })
        .await
    }

    /// Append an error. Errors are journaled even when the live state is lost.
    pub async fn record_error(&self, session_id: &str, err: SessionError) -> Result<(), LensError> {
        self.journal(session_id, |entry| entry.error_journal.push(err.clone()))
            .await?;
        self.mutate(session_id, |state| {
            warn!(
                session_id = %state.session_id,
                recoverable = err.recoverable,
                context = %err.context,
                error = %err.error,
                "Recorded session error"
            );
            state.errors.push(err);
            Ok(())
        })
        .await
    }

    pub async fn nonrecoverable_error_count(&self, session_id: &str) -> Result<usize, LensError> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| LensError::SessionNotFound(session_id.to_string()))?;
        Ok(entry.error_journal.iter().filter(|e| !e.recoverable).count())
    }

    /// Record a model switch and compact the state.
    ///
    /// Runs under the session's write lock, so compaction has finished
    /// before any caller can dispatch under the new model.
    pub async fn switch_model(
        &self,
        session_id: &str,
        from: &str,
        to: &str,
    ) -> Result<CompactionReport, LensError> {
        let keep_tool_calls = self.keep_tool_calls;
        let keep_patterns = self.keep_patterns;
        self.mutate(session_id, |state| {
            if state.current_model != from {
                warn!(
                    session_id = %state.session_id,
                    current = %state.current_model,
                    from = %from,
                    "Model switch source does not match current model"
                );
            }
            state.model_switch_history.push(ModelSwitch {
                from: from.to_string(),
                to: to.to_string(),
                timestamp: Utc::now(),
            });
            state.current_model = to.to_string();
            let report = compact_for_model_switch(state, keep_tool_calls, keep_patterns);
            info!(
                session_id = %state.session_id,
                from = %from,
                to = %to,
                dropped_tool_calls = report.dropped_tool_calls(),
                dropped_patterns = report.dropped_patterns(),
                "Switched model"
            );
            Ok(report)
        })
        .await
    }

    /// Mark the live state as lost. Journals and checkpoint are kept.
    pub async fn invalidate(&self, session_id: &str, reason: &str) -> Result<(), LensError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| LensError::SessionNotFound(session_id.to_string()))?;
        error!(session_id = %session_id, reason = %reason, "Session state invalidated");
        entry.live = None;
        entry.corruption = Some(reason.to_string());
        Ok(())
    }

    /// Best-effort reconstruction of a session's state.
    ///
    /// A healthy live state is returned as is. Otherwise the last checkpoint
    /// (or a blank state) is restored, the full error journal is reapplied,
    /// and the most recent journaled tool calls are restored.
    pub async fn recover_session(&self, session_id: &str) -> Result<RecoveredSession, LensError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| LensError::SessionNotFound(session_id.to_string()))?;

        if let Some(live) = &entry.live {
            if live.check_invariants().is_ok() {
                return Ok(RecoveredSession {
                    restart_in_classic: live.hypothesis.is_none() && live.video_context.is_none(),
                    state: live.clone(),
                });
            }
        }

        let mut state = match &entry.checkpoint {
            Some(checkpoint) => checkpoint.clone(),
            None => {
                let mut blank = SessionState::new(
                    session_id,
                    &entry.video_id,
                    entry.config.mode,
                    &entry.config.initial_model,
                    entry.config.budget_caps.clone(),
                );
                blank.fallback_from = entry.config.fallback_from.clone();
                blank
            }
        };
        state.errors = entry.error_journal.clone();
        let tail_start = entry.call_journal.len().saturating_sub(self.keep_tool_calls);
        state.tool_calls = entry.call_journal[tail_start..].to_vec();

        if let Err(reason) = state.check_invariants() {
            return Err(LensError::RecoveryFailed(format!(
                "{}: reconstructed state invalid: {}",
                session_id, reason
            )));
        }

        let restart_in_classic = state.hypothesis.is_none() && state.video_context.is_none();
        info!(
            session_id = %session_id,
            errors = state.errors.len(),
            tool_calls = state.tool_calls.len(),
            has_hypothesis = state.hypothesis.is_some(),
            restart_in_classic,
            "Session recovered"
        );

        entry.live = Some(state.clone());
        entry.checkpoint = Some(state.clone());
        entry.corruption = None;
        Ok(RecoveredSession {
            state,
            restart_in_classic,
        })
    }

    /// Apply `f` to the live state, then re-check invariants. A failed check
    /// drops the live state so later reads go through recovery.
    async fn mutate<R, F>(&self, session_id: &str, f: F) -> Result<R, LensError>
    where
        F: FnOnce(&mut SessionState) -> Result<R, LensError>,
    {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| LensError::SessionNotFound(session_id.to_string()))?;
        let Some(state) = entry.live.as_mut() else {
            return Err(corrupted(session_id, entry));
        };

        let output = f(state)?;

        match state.check_invariants() {
            Ok(()) => {
                entry.checkpoint = Some(state.clone());
                Ok(output)
            }
            Err(reason) => {
                error!(session_id = %session_id, reason = %reason, "Session invariant violated");
                entry.live = None;
                entry.corruption = Some(reason.clone());
                Err(LensError::SessionCorrupted(format!("{}: {}", session_id, reason)))
            }
        }
    }

    async fn journal<F>(&self, session_id: &str, f: F) -> Result<(), LensError>
    where
        F: FnOnce(&mut SessionEntry),
    {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| LensError::SessionNotFound(session_id.to_string()))?;
        f(entry);
        Ok(())
    }
}

fn corrupted(session_id: &str, entry: &SessionEntry) -> LensError {
    LensError::SessionCorrupted(format!(
        "{}: {}",
        session_id,
        entry.corruption.as_deref().unwrap_or("live state missing")
    ))
}
