//! `tubelens analyze` and `tubelens select-mode`.

use anyhow::Result;
use clap::Args;

use tubelens_config::TubeLensConfig;
use tubelens_core::SessionState;
use tubelens_executor::{AnalysisReport, SessionOutcome};
use tubelens_planner::{ModeDecision, ModeSelector, SelectionFactors};

use crate::runtime;
use crate::terminal_output::{
    note_info, note_success, note_warn, paint, render_table, Column, DIM, GREEN, RED, YELLOW,
};

/// What is known about the video before analysis starts.
#[derive(Debug, Clone, Args)]
pub struct FactorArgs {
    /// The video has a high traffic-per-subscriber score
    #[arg(long)]
    pub high_tps: bool,
    /// The channel has established patterns
    #[arg(long)]
    pub channel_patterns: bool,
    /// Competitive data is available for the niche
    #[arg(long)]
    pub competitive_data: bool,
    /// Semantic clusters exist for the video
    #[arg(long)]
    pub semantic_clusters: bool,
    /// Earlier agentic failures for this video
    #[arg(long, default_value_t = 0)]
    pub previous_failures: u32,
    /// LLM quota is exhausted; forces classic mode
    #[arg(long)]
    pub no_quota: bool,
}

impl FactorArgs {
    pub fn to_factors(&self) -> SelectionFactors {
        SelectionFactors {
            video_has_high_tps: self.high_tps,
            channel_has_patterns: self.channel_patterns,
            has_competitive_data: self.competitive_data,
            has_semantic_clusters: self.semantic_clusters,
            previous_failures: self.previous_failures,
            quota_available: !self.no_quota,
        }
    }
}

pub async fn analyze(
    config: &TubeLensConfig,
    video_id: &str,
    factors: &FactorArgs,
    json: bool,
) -> Result<()> {
    let orchestrator = runtime::build_orchestrator(config)?;
    let planner = runtime::agentic_planner(config)?;
    let report = orchestrator
        .analyze(video_id, factors.to_factors(), planner)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

pub fn select_mode(config: &TubeLensConfig, factors: &FactorArgs, json: bool) -> Result<()> {
    let decision = ModeSelector::new(config.selector_config()).select_mode(&factors.to_factors());
    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        print_decision(&decision);
    }
    Ok(())
}

fn print_decision(decision: &ModeDecision) {
    note_info(&format!(
        "Mode: {} (confidence {:.2})",
        decision.mode, decision.confidence
    ));
    println!("  {}", decision.reason);
    if decision.fallback_recommended {
        note_warn("Low confidence; prepare for fallback to classic");
    }
}

fn outcome_label(outcome: &SessionOutcome) -> String {
    match outcome {
        SessionOutcome::Completed => paint(GREEN, "completed"),
        SessionOutcome::BudgetExhausted { reason } => {
            paint(YELLOW, &format!("budget exhausted ({reason})"))
        }
        SessionOutcome::DeadlineReached => paint(YELLOW, "deadline reached"),
        SessionOutcome::FellBack { reason } => paint(RED, &format!("fell back ({reason})")),
    }
}

fn print_report(report: &AnalysisReport) {
    print_decision(&report.decision);
    println!();

    let columns = [
        Column::left("Session"),
        Column::left("Mode"),
        Column::left("Outcome"),
        Column::right("Turns"),
        Column::right("Tool calls"),
        Column::right("Tokens"),
        Column::right("Cost"),
        Column::right("Elapsed"),
    ];
    let rows: Vec<Vec<String>> = report
        .sessions
        .iter()
        .map(|s| {
            vec![
                s.session_id.chars().take(8).collect(),
                s.mode.to_string(),
                outcome_label(&s.outcome),
                s.turns.to_string(),
                s.usage.tool_calls.to_string(),
                s.usage.tokens.to_string(),
                format!("${:.4}", s.usage.costs.total),
                format!("{}ms", s.usage.elapsed_ms),
            ]
        })
        .collect();
    print!("{}", render_table(&columns, &rows));
    println!();

    print_findings(&report.final_state);
}

fn print_findings(state: &SessionState) {
    match &state.hypothesis {
        Some(h) => {
            note_success(&format!("{} (confidence {:.2})", h.statement, h.confidence));
            for evidence in &h.supporting_evidence {
                println!("  {}", paint(DIM, &format!("- {evidence}")));
            }
        }
        None => note_warn("No hypothesis was produced"),
    }

    if let Some(validation) = &state.validation_results {
        if !validation.validated_patterns.is_empty() {
            println!();
            let columns = [
                Column::left("Pattern"),
                Column::right("Confidence"),
                Column::right("Checks"),
            ];
            let rows: Vec<Vec<String>> = validation
                .validated_patterns
                .iter()
                .map(|p| {
                    vec![
                        p.pattern.clone(),
                        format!("{:.2}", p.confidence),
                        p.validations.to_string(),
                    ]
                })
                .collect();
            print!("{}", render_table(&columns, &rows));
        }
    }

    let failed = state.tool_calls.iter().filter(|c| !c.is_success()).count();
    if failed > 0 || !state.errors.is_empty() {
        note_warn(&format!(
            "{} failed tool calls, {} recorded errors ({} non-recoverable)",
            failed,
            state.errors.len(),
            state.nonrecoverable_errors()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tubelens_core::AnalysisMode;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        factors: FactorArgs,
    }

    #[test]
    fn flags_map_to_factors() {
        let h = Harness::parse_from(["t", "--high-tps", "--semantic-clusters", "--previous-failures", "2"]);
        let f = h.factors.to_factors();
        assert!(f.video_has_high_tps);
        assert!(f.has_semantic_clusters);
        assert!(!f.channel_has_patterns);
        assert_eq!(f.previous_failures, 2);
        assert!(f.quota_available);
    }

    #[test]
    fn no_quota_selects_classic() {
        let h = Harness::parse_from(["t", "--high-tps", "--channel-patterns", "--no-quota"]);
        let decision = ModeSelector::default().select_mode(&h.factors.to_factors());
        assert_eq!(decision.mode, AnalysisMode::Classic);
    }
}
