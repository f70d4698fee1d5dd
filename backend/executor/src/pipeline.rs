//! Turn planning: the contract between the orchestration loop and whatever
//! decides what to do next, plus the deterministic classic pipeline.
//!
//! A planner never touches the session directly. It returns a `PlannedTurn`:
//! tool calls to dispatch (each optionally bound to a state field through a
//! `ResultBinding`) and direct state updates. Data flows between stages only
//! through the session state, so wiring is explicit in the stage table.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use tubelens_core::{
    DiscoveredPattern, Hypothesis, SearchResults, SessionState, TurnType, ValidatedPattern,
    ValidationResults, VideoContext,
};
use tubelens_tools::analytics::{ClusterResult, EnvelopeResult, NeighborResult, PatternVerdict};
use tubelens_tools::AnalyticTool;

// ---------------------------------------------------------------------------
// Planner contract
// ---------------------------------------------------------------------------

/// A direct write to one session field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateUpdate {
    VideoContext(VideoContext),
    Hypothesis(Hypothesis),
    SearchResults(SearchResults),
    ValidationResults(ValidationResults),
    Patterns(Vec<DiscoveredPattern>),
}

/// Where a successful tool result lands in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultBinding {
    /// Result is a `VideoContext`.
    VideoContext,
    /// `EnvelopeResult`; the percentile becomes the context score.
    Envelope,
    /// `NeighborResult` into `search_results.semantic_neighbors`.
    SemanticNeighbors,
    /// `NeighborResult` into `search_results.competitive_successes`.
    CompetitiveSuccesses,
    /// `ClusterResult` appended to the discovered patterns.
    Patterns,
    /// `PatternVerdict` folded into the validation results.
    PatternVerdict,
}

impl ResultBinding {
    /// The bound field is already populated, so a call feeding it is redundant.
    pub fn already_bound(&self, state: &SessionState) -> bool {
        match self {
            ResultBinding::VideoContext => state.video_context.is_some(),
            ResultBinding::Envelope => state
                .video_context
                .as_ref()
                .is_some_and(|c| c.score.is_some()),
            ResultBinding::SemanticNeighbors => state
                .search_results
                .as_ref()
                .is_some_and(|s| !s.semantic_neighbors.is_empty()),
            ResultBinding::CompetitiveSuccesses => state
                .search_results
                .as_ref()
                .is_some_and(|s| !s.competitive_successes.is_empty()),
            ResultBinding::Patterns => !state.discovered_patterns.is_empty(),
            ResultBinding::PatternVerdict => false,
        }
    }

    /// Turn a tool result into the state update it implies, read against the
    /// current state. Candidate lists are cut to `candidate_limit`.
    pub fn to_update(
        &self,
        result: &Value,
        state: &SessionState,
        candidate_limit: usize,
    ) -> Result<StateUpdate> {
        match self {
            ResultBinding::VideoContext => {
                let context: VideoContext = serde_json::from_value(result.clone())
                    .context("video context result has unexpected shape")?;
                Ok(StateUpdate::VideoContext(context))
            }
            ResultBinding::Envelope => {
                let envelope: EnvelopeResult = serde_json::from_value(result.clone())
                    .context("envelope result has unexpected shape")?;
                let mut context = state.video_context.clone().unwrap_or_default();
                context.score = Some(envelope.percentile);
                Ok(StateUpdate::VideoContext(context))
            }
            ResultBinding::SemanticNeighbors | ResultBinding::CompetitiveSuccesses => {
                let neighbors: NeighborResult = serde_json::from_value(result.clone())
                    .context("neighbor result has unexpected shape")?;
                let mut search = state.search_results.clone().unwrap_or_default();
                let mut ids = neighbors.video_ids;
                ids.truncate(candidate_limit);
                let found = if neighbors.total_candidates > 0 {
                    neighbors.total_candidates
                } else {
                    ids.len() as u64
                };
                search.total_candidates = search.total_candidates.saturating_add(found);
                if *self == ResultBinding::SemanticNeighbors {
                    search.semantic_neighbors = ids;
                } else {
                    search.competitive_successes = ids;
                }
                Ok(StateUpdate::SearchResults(search))
            }
            ResultBinding::Patterns => {
                let clusters: ClusterResult = serde_json::from_value(result.clone())
                    .context("cluster result has unexpected shape")?;
                Ok(StateUpdate::Patterns(clusters.patterns))
            }
            ResultBinding::PatternVerdict => {
                let verdict: PatternVerdict = serde_json::from_value(result.clone())
                    .context("pattern verdict has unexpected shape")?;
                let mut validation = state.validation_results.clone().unwrap_or_default();
                validation.total_validations = validation.total_validations.saturating_add(1);
                if verdict.supported {
                    match validation
                        .validated_patterns
                        .iter_mut()
                        .find(|p| p.pattern == verdict.pattern)
                    {
                        Some(existing) => {
                            existing.validations += 1;
                            existing.confidence = verdict.confidence;
                        }
                        None => validation.validated_patterns.push(ValidatedPattern {
                            pattern: verdict.pattern,
                            confidence: verdict.confidence,
                            validations: 1,
                        }),
                    }
                }
                Ok(StateUpdate::ValidationResults(validation))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedCall {
    pub tool: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<ResultBinding>,
}

impl PlannedCall {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        Self {
            tool: tool.into(),
            params,
            binding: None,
        }
    }

    pub fn bind(mut self, binding: ResultBinding) -> Self {
        self.binding = Some(binding);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlannedTurn {
    pub calls: Vec<PlannedCall>,
    pub updates: Vec<StateUpdate>,
    /// LLM tokens the planner spent producing this turn.
    pub tokens_used: u64,
}

/// Decides what each turn of a session does.
#[async_trait]
pub trait TurnPlanner: Send + Sync {
    fn name(&self) -> &str;

    /// Kind of the next turn, or `None` once the analysis is complete.
    async fn next_turn_type(&self, state: &SessionState) -> Result<Option<TurnType>>;

    async fn plan_turn(
        &self,
        state: &SessionState,
        turn: TurnType,
        model: &str,
    ) -> Result<PlannedTurn>;

    /// Release per-session bookkeeping once a session stops running.
    async fn session_finished(&self, _session_id: &str) {}
}

// ---------------------------------------------------------------------------
// Classic pipeline
// ---------------------------------------------------------------------------

/// How a stage parameter is filled from the session state.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSource {
    VideoId,
    /// `video_context.channel`
    Channel,
    /// `video_context.niche`
    Niche,
    /// The session's `max_candidates` cap.
    CandidateLimit,
    Literal(Value),
    /// One call per top discovered pattern, up to `max_validations`.
    EachPattern,
}

impl ParamSource {
    /// Candidate values; `None` when the state cannot supply one yet.
    fn resolve(&self, state: &SessionState) -> Option<Vec<Value>> {
        let context = state.video_context.as_ref();
        match self {
            ParamSource::VideoId => Some(vec![Value::from(state.video_id.clone())]),
            ParamSource::Channel => context?.channel.clone().map(|c| vec![Value::from(c)]),
            ParamSource::Niche => context?.niche.clone().map(|n| vec![Value::from(n)]),
            ParamSource::CandidateLimit => {
                Some(vec![Value::from(state.budget_caps.max_candidates)])
            }
            ParamSource::Literal(value) => Some(vec![value.clone()]),
            ParamSource::EachPattern => {
                let mut patterns: Vec<&DiscoveredPattern> =
                    state.discovered_patterns.iter().collect();
                patterns.sort_by(|a, b| b.score.total_cmp(&a.score));
                Some(
                    patterns
                        .into_iter()
                        .take(state.budget_caps.max_validations as usize)
                        .map(|p| Value::from(p.pattern.clone()))
                        .collect(),
                )
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageCall {
    pub tool: AnalyticTool,
    pub params: Vec<(String, ParamSource)>,
    pub binding: Option<ResultBinding>,
}

impl StageCall {
    pub fn new(tool: AnalyticTool) -> Self {
        Self {
            tool,
            params: Vec::new(),
            binding: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, source: ParamSource) -> Self {
        self.params.push((name.into(), source));
        self
    }

    pub fn bind(mut self, binding: ResultBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Expand into concrete calls. Skipped entirely when the bound field is
    /// already populated or a parameter cannot be resolved.
    fn expand(&self, state: &SessionState) -> Vec<PlannedCall> {
        if self.binding.is_some_and(|b| b.already_bound(state)) {
            debug!(tool = %self.tool, "Stage call already satisfied");
            return Vec::new();
        }

        let mut param_sets = vec![Map::new()];
        for (name, source) in &self.params {
            let Some(values) = source.resolve(state) else {
                debug!(tool = %self.tool, param = %name, "Stage call missing input; skipped");
                return Vec::new();
            };
            param_sets = param_sets
                .into_iter()
                .flat_map(|set| {
                    values.iter().map(move |value| {
                        let mut set = set.clone();
                        set.insert(name.clone(), value.clone());
                        set
                    })
                })
                .collect();
        }

        param_sets
            .into_iter()
            .map(|params| PlannedCall {
                tool: self.tool.name().to_string(),
                params: Value::Object(params),
                binding: self.binding,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub turn: TurnType,
    pub calls: Vec<StageCall>,
}

/// Deterministic, non-LLM analysis over the standard engines.
///
/// Progress is tracked per session id, so one pipeline can serve many
/// concurrent sessions.
pub struct ClassicPipeline {
    stages: Vec<Stage>,
    progress: Mutex<HashMap<String, usize>>,
}

impl ClassicPipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            progress: Mutex::new(HashMap::new()),
        }
    }

    /// Context → enrichment → search → validation → finalization.
    pub fn standard() -> Self {
        use ParamSource::{CandidateLimit, Channel, EachPattern, Niche, VideoId};

        Self::new(vec![
            Stage {
                turn: TurnType::Lookup,
                calls: vec![StageCall::new(AnalyticTool::VideoContext)
                    .param("video_id", VideoId)
                    .bind(ResultBinding::VideoContext)],
            },
            Stage {
                turn: TurnType::Enrichment,
                calls: vec![
                    StageCall::new(AnalyticTool::Transcript).param("video_id", VideoId),
                    StageCall::new(AnalyticTool::ChannelBaseline).param("channel_id", Channel),
                    StageCall::new(AnalyticTool::PerformanceEnvelope)
                        .param("video_id", VideoId)
                        .bind(ResultBinding::Envelope),
                    StageCall::new(AnalyticTool::TopicClusters)
                        .param("video_id", VideoId)
                        .bind(ResultBinding::Patterns),
                ],
            },
            Stage {
                turn: TurnType::Lookup,
                calls: vec![
                    StageCall::new(AnalyticTool::SemanticNeighbors)
                        .param("video_id", VideoId)
                        .param("limit", CandidateLimit)
                        .bind(ResultBinding::SemanticNeighbors),
                    StageCall::new(AnalyticTool::CompetitiveSuccesses)
                        .param("niche", Niche)
                        .param("limit", CandidateLimit)
                        .bind(ResultBinding::CompetitiveSuccesses),
                ],
            },
            Stage {
                turn: TurnType::Validation,
                calls: vec![StageCall::new(AnalyticTool::ValidatePattern)
                    .param("video_id", VideoId)
                    .param("pattern", EachPattern)
                    .bind(ResultBinding::PatternVerdict)],
            },
            Stage {
                turn: TurnType::Finalization,
                calls: Vec::new(),
            },
        ])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

impl Default for ClassicPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

#[async_trait]
impl TurnPlanner for ClassicPipeline {
    fn name(&self) -> &str {
        "classic"
    }

    async fn next_turn_type(&self, state: &SessionState) -> Result<Option<TurnType>> {
        let progress = self.progress.lock().await;
        let index = progress.get(&state.session_id).copied().unwrap_or(0);
        Ok(self.stages.get(index).map(|stage| stage.turn))
    }

    /// Plans the current stage. A finalization request skips any remaining
    /// stages, which is how a session cut short by its budget still ends with
    /// a hypothesis.
    async fn plan_turn(
        &self,
        state: &SessionState,
        turn: TurnType,
        _model: &str,
    ) -> Result<PlannedTurn> {
        let index = {
            let mut progress = self.progress.lock().await;
            let index = progress.entry(state.session_id.clone()).or_insert(0);
            let current = *index;
            *index = if turn == TurnType::Finalization {
                self.stages.len()
            } else {
                current + 1
            };
            current
        };

        if turn == TurnType::Finalization {
            return Ok(PlannedTurn {
                updates: derive_hypothesis(state)
                    .map(StateUpdate::Hypothesis)
                    .into_iter()
                    .collect(),
                ..Default::default()
            });
        }

        let Some(stage) = self.stages.get(index) else {
            return Ok(PlannedTurn::default());
        };
        if stage.turn != turn {
            debug!(expected = %stage.turn, requested = %turn, "Classic stage turn mismatch");
        }
        Ok(PlannedTurn {
            calls: stage.calls.iter().flat_map(|c| c.expand(state)).collect(),
            ..Default::default()
        })
    }

    async fn session_finished(&self, session_id: &str) {
        self.progress.lock().await.remove(session_id);
    }
}

/// Best explanation the accumulated evidence supports.
///
/// Prefers the most confident validated pattern, then the top discovered
/// pattern at half its score. An existing hypothesis is kept when neither is
/// available.
pub fn derive_hypothesis(state: &SessionState) -> Option<Hypothesis> {
    let percentile = state
        .video_context
        .as_ref()
        .and_then(|c| c.score)
        .map(|p| format!("performance percentile {:.0}", p));

    let validated = state.validation_results.as_ref().and_then(|v| {
        v.validated_patterns
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    });

    let mut hypothesis = if let Some(best) = validated {
        let mut h = Hypothesis::new(
            format!("Performance is driven by {}", best.pattern),
            best.confidence.clamp(0.0, 1.0),
        );
        for p in &state.validation_results.as_ref()?.validated_patterns {
            h = h.with_evidence(format!(
                "validated: {} ({} checks, confidence {:.2})",
                p.pattern, p.validations, p.confidence
            ));
        }
        h
    } else if let Some(top) = state
        .discovered_patterns
        .iter()
        .filter(|p| p.score.is_finite())
        .max_by(|a, b| a.score.total_cmp(&b.score))
    {
        Hypothesis::new(
            format!("Performance may be driven by {}", top.pattern),
            (top.score * 0.5).clamp(0.0, 1.0),
        )
        .with_evidence(format!("unvalidated cluster score {:.2}", top.score))
    } else if state.hypothesis.is_some() {
        return None;
    } else {
        Hypothesis::new("Insufficient signal to explain performance", 0.0)
    };

    if let Some(evidence) = percentile {
        hypothesis = hypothesis.with_evidence(evidence);
    }
    Some(hypothesis)
}
