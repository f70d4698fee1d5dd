//! The standard analytic engines and their call contracts.
//!
//! The engines themselves live outside this workspace. Each variant here pins
//! down the tool name, the typed params it accepts, the result shape the
//! orchestrator reads back, and the scheduling metadata it is registered with.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tubelens_core::{DiscoveredPattern, Tool};

use crate::registry::{ToolCategory, ToolDefinition};
use crate::schema::{ParamKind, ParamSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticTool {
    /// Title, channel, format, niche, and score for a video.
    VideoContext,
    Transcript,
    ChannelBaseline,
    /// Percentile of the video within its channel's performance envelope.
    PerformanceEnvelope,
    TopicClusters,
    SemanticNeighbors,
    CompetitiveSuccesses,
    ValidatePattern,
}

impl AnalyticTool {
    pub const ALL: [AnalyticTool; 8] = [
        AnalyticTool::VideoContext,
        AnalyticTool::Transcript,
        AnalyticTool::ChannelBaseline,
        AnalyticTool::PerformanceEnvelope,
        AnalyticTool::TopicClusters,
        AnalyticTool::SemanticNeighbors,
        AnalyticTool::CompetitiveSuccesses,
        AnalyticTool::ValidatePattern,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnalyticTool::VideoContext => "video_context",
            AnalyticTool::Transcript => "transcript",
            AnalyticTool::ChannelBaseline => "channel_baseline",
            AnalyticTool::PerformanceEnvelope => "performance_envelope",
            AnalyticTool::TopicClusters => "topic_clusters",
            AnalyticTool::SemanticNeighbors => "semantic_neighbors",
            AnalyticTool::CompetitiveSuccesses => "competitive_successes",
            AnalyticTool::ValidatePattern => "validate_pattern",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn schema(&self) -> ParamSchema {
        match self {
            AnalyticTool::VideoContext
            | AnalyticTool::PerformanceEnvelope
            | AnalyticTool::TopicClusters => {
                ParamSchema::new().required("video_id", ParamKind::String)
            }
            AnalyticTool::Transcript => ParamSchema::new()
                .required("video_id", ParamKind::String)
                .optional("language", ParamKind::String),
            AnalyticTool::ChannelBaseline => ParamSchema::new()
                .required("channel_id", ParamKind::String)
                .optional("window_days", ParamKind::Integer),
            AnalyticTool::SemanticNeighbors => ParamSchema::new()
                .required("video_id", ParamKind::String)
                .required("limit", ParamKind::Integer),
            AnalyticTool::CompetitiveSuccesses => ParamSchema::new()
                .required("niche", ParamKind::String)
                .required("limit", ParamKind::Integer),
            AnalyticTool::ValidatePattern => ParamSchema::new()
                .required("video_id", ParamKind::String)
                .required("pattern", ParamKind::String),
        }
    }

    pub fn category(&self) -> ToolCategory {
        match self {
            AnalyticTool::VideoContext | AnalyticTool::Transcript => ToolCategory::Context,
            AnalyticTool::ChannelBaseline | AnalyticTool::PerformanceEnvelope => {
                ToolCategory::Scoring
            }
            AnalyticTool::TopicClusters => ToolCategory::Clustering,
            AnalyticTool::SemanticNeighbors | AnalyticTool::CompetitiveSuccesses => {
                ToolCategory::Search
            }
            AnalyticTool::ValidatePattern => ToolCategory::Validation,
        }
    }

    /// Pattern validation reads the evolving hypothesis, so it runs alone.
    pub fn parallel_safe(&self) -> bool {
        !matches!(self, AnalyticTool::ValidatePattern)
    }

    pub fn cacheable(&self) -> bool {
        !matches!(self, AnalyticTool::ValidatePattern)
    }

    /// Default `(tokens, cost)` admission estimate.
    pub fn estimate(&self) -> (u64, f64) {
        match self {
            AnalyticTool::VideoContext => (200, 0.0005),
            AnalyticTool::Transcript => (4_000, 0.002),
            AnalyticTool::ChannelBaseline => (500, 0.001),
            AnalyticTool::PerformanceEnvelope => (500, 0.001),
            AnalyticTool::TopicClusters => (3_000, 0.004),
            AnalyticTool::SemanticNeighbors => (1_500, 0.002),
            AnalyticTool::CompetitiveSuccesses => (1_500, 0.002),
            AnalyticTool::ValidatePattern => (2_000, 0.003),
        }
    }

    /// Build a registry definition backed by `handler`.
    pub fn definition(&self, handler: Arc<dyn Tool>) -> ToolDefinition {
        let (tokens, cost) = self.estimate();
        let mut definition = ToolDefinition::new(handler, self.schema())
            .category(self.category())
            .parallel_safe(self.parallel_safe())
            .estimate(tokens, cost)
            .cacheable(self.cacheable());
        definition.name = self.name().to_string();
        definition
    }
}

impl fmt::Display for AnalyticTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// Typed params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub video_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBaselineParams {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborParams {
    pub video_id: String,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitiveParams {
    pub niche: String,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatePatternParams {
    pub video_id: String,
    pub pattern: String,
}

// ---------------------------------------------------------------------------
// Result shapes read back by the orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeResult {
    /// 0-100 position within the channel's envelope.
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborResult {
    pub video_ids: Vec<String>,
    #[serde(default)]
    pub total_candidates: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResult {
    pub patterns: Vec<DiscoveredPattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternVerdict {
    pub pattern: String,
    pub confidence: f64,
    pub supported: bool,
}
