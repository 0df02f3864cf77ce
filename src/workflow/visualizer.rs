//! Text renderings of workflow execution
//!
//! ASCII flow for terminals, Mermaid for dashboards, and a per-stage
//! timeline bar chart. Purely presentational.

use std::time::Duration;

use crate::workflow::stage::WorkflowStage;

/// Renders workflow execution state as text
pub struct WorkflowVisualizer;

impl WorkflowVisualizer {
    /// ASCII execution flow with completed/current markers
    #[must_use]
    pub fn ascii_flow(
        stages: &[WorkflowStage],
        current: Option<WorkflowStage>,
        completed: &[WorkflowStage],
    ) -> String {
        let mut lines = Vec::new();
        lines.push(format!("┌{}┐", "─".repeat(60)));
        lines.push(format!("│{:^60}│", "WORKFLOW EXECUTION FLOW"));
        lines.push(format!("└{}┘", "─".repeat(60)));
        lines.push(String::new());

        for (i, stage) in stages.iter().enumerate() {
            let (marker, status) = if completed.contains(stage) {
                ("●", "✓")
            } else if Some(*stage) == current {
                ("◉", "→")
            } else {
                ("○", " ")
            };

            let label = stage.as_str().to_uppercase().replace('_', " ");
            lines.push(format!("  {marker} [{status}] {}. {label}", i + 1));

            if i < stages.len() - 1 {
                lines.push("      │".to_owned());
                lines.push("      ↓".to_owned());
            }
        }

        lines.join("\n")
    }

    /// Mermaid flowchart with completed and failed stage styling
    #[must_use]
    pub fn mermaid_diagram(
        stages: &[WorkflowStage],
        completed: &[WorkflowStage],
        failed: Option<WorkflowStage>,
    ) -> String {
        let mut lines = vec!["graph TD".to_owned()];
        lines.push("    Start([Start]) --> Stage1".to_owned());

        for (i, stage) in stages.iter().enumerate() {
            let stage_id = format!("Stage{}", i + 1);
            let title = title_case(stage.as_str());

            if completed.contains(stage) {
                lines.push(format!("    {stage_id}[✓ {title}]"));
                lines.push(format!("    style {stage_id} fill:#90EE90"));
            } else if Some(*stage) == failed {
                lines.push(format!("    {stage_id}[✗ {title}]"));
                lines.push(format!("    style {stage_id} fill:#FFB6C6"));
            } else {
                lines.push(format!("    {stage_id}[{title}]"));
            }

            if i < stages.len() - 1 {
                lines.push(format!("    {stage_id} --> Stage{}", i + 2));
            }
        }

        lines.push(format!("    Stage{} --> End([End])", stages.len()));
        lines.join("\n")
    }

    /// Bar-chart timeline of per-stage durations
    #[must_use]
    pub fn timeline<'a>(durations: impl IntoIterator<Item = (&'a str, Duration)>) -> String {
        let entries: Vec<(&str, Duration)> = durations.into_iter().collect();
        let total: Duration = entries.iter().map(|(_, d)| *d).sum();

        let mut lines = Vec::new();
        lines.push(format!("┌{}┐", "─".repeat(70)));
        lines.push(format!("│{:^70}│", "EXECUTION TIMELINE"));
        lines.push(format!("└{}┘", "─".repeat(70)));
        lines.push(String::new());

        for (stage, duration) in &entries {
            let percentage = if total > Duration::ZERO {
                duration.as_secs_f64() / total.as_secs_f64() * 100.0
            } else {
                0.0
            };
            let filled = (percentage / 2.0) as usize;
            let bar = format!("{}{}", "█".repeat(filled), "░".repeat(50 - filled.min(50)));
            lines.push(format!(
                "{stage:25} │{bar}│ {:.2}s ({percentage:.1}%)",
                duration.as_secs_f64()
            ));
        }

        lines.push(String::new());
        lines.push(format!(
            "{:25} │{}│ {:.2}s (100%)",
            "TOTAL TIME",
            "█".repeat(50),
            total.as_secs_f64()
        ));

        lines.join("\n")
    }
}

fn title_case(label: &str) -> String {
    label
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
