//! Plain-text rendering of reports.

use std::fmt::Write;

use pgforge_core::capability::{CapabilitySet, GapKind, RequirementGap};
use pgforge_core::executor::{BlockReason, RollbackSummary, StepReport, StepState};
use pgforge_core::plan::MigrationPlan;
use pgforge_core::{Failure, OrchestrationReport, StatusReport};

pub fn orchestration(report: &OrchestrationReport) -> String {
    let mut out = String::new();
    capabilities(&mut out, &report.capabilities);
    if let Some(backend) = report.backend {
        let _ = writeln!(out, "backend: {backend}");
    }

    steps(&mut out, &report.steps);
    let _ = writeln!(
        out,
        "summary: {} applied, {} already applied, {} blocked in {:.2?}",
        report.applied, report.already_applied, report.blocked, report.duration
    );

    if let Some(failure) = &report.failure {
        self::failure(&mut out, failure);
    }
    if report.cancelled {
        out.push_str("cancelled before completion\n");
    }
    out
}

pub fn status(report: &StatusReport) -> String {
    let mut out = String::new();
    capabilities(&mut out, &report.capabilities);
    let _ = writeln!(out, "backend: {}", report.backend);
    for gap in &report.gaps {
        requirement_gap(&mut out, gap);
    }
    steps(&mut out, &report.steps);
    out
}

pub fn rollback(summary: &RollbackSummary) -> String {
    let mut out = String::new();
    if summary.reverted.is_empty() {
        out.push_str("nothing to revert\n");
    }
    for id in &summary.reverted {
        let _ = writeln!(out, "  reverted  {id:>3}");
    }

    if let Some(error) = &summary.halted {
        failure(&mut out, &Failure::from(error));
    }
    if summary.cancelled {
        out.push_str("cancelled before completion\n");
    }
    out
}

pub fn plan(plan: &MigrationPlan) -> String {
    let mut out = String::new();
    for step in plan {
        let _ = write!(out, "{:>3}  {}", step.id, step.description);

        let mut notes = Vec::new();
        if !step.requires.is_empty() {
            let names: Vec<&str> = step.requires.iter().map(|c| c.as_str()).collect();
            notes.push(format!("requires {}", names.join(", ")));
        }
        if !step.after.is_empty() {
            let ids: Vec<String> = step.after.iter().map(ToString::to_string).collect();
            notes.push(format!("after {}", ids.join(", ")));
        }
        if !step.is_reversible() {
            notes.push("irreversible".to_owned());
        }
        if !step.atomic {
            notes.push("non-atomic".to_owned());
        }

        if !notes.is_empty() {
            let _ = write!(out, " ({})", notes.join("; "));
        }
        out.push('\n');
    }
    out
}

fn capabilities(out: &mut String, capabilities: &CapabilitySet) {
    if capabilities.is_empty() {
        out.push_str("capabilities: none\n");
        return;
    }

    let list: Vec<String> = capabilities.iter().map(ToString::to_string).collect();
    let _ = writeln!(out, "capabilities: {}", list.join(", "));
}

fn requirement_gap(out: &mut String, gap: &RequirementGap) {
    let _ = match &gap.gap {
        GapKind::Missing => writeln!(
            out,
            "unmet: {} >= {} is not installed",
            gap.capability, gap.required
        ),
        GapKind::UnderVersioned { found } => writeln!(
            out,
            "unmet: {} >= {} has version {found}",
            gap.capability, gap.required
        ),
    };
}

fn steps(out: &mut String, steps: &[StepReport]) {
    for step in steps {
        let _ = write!(out, "  {:<16} {:>3}  {}", label(&step.state), step.id, step.description);
        match &step.state {
            StepState::Blocked(reason) => {
                let _ = write!(out, " ({})", block_reason(reason));
            }
            StepState::Failed { message } => {
                let _ = write!(out, ": {message}");
            }
            _ => {}
        }
        out.push('\n');
    }
}

fn label(state: &StepState) -> &'static str {
    match state {
        StepState::Pending => "pending",
        StepState::Eligible => "eligible",
        StepState::Applied => "applied",
        StepState::AlreadyApplied => "already applied",
        StepState::Blocked(_) => "blocked",
        StepState::Failed { .. } => "failed",
    }
}

fn block_reason(reason: &BlockReason) -> String {
    let mut parts = Vec::new();
    if !reason.capabilities.is_empty() {
        let names: Vec<&str> = reason.capabilities.iter().map(|c| c.as_str()).collect();
        parts.push(format!("missing {}", names.join(", ")));
    }
    if !reason.predecessors.is_empty() {
        let ids: Vec<String> = reason.predecessors.iter().map(ToString::to_string).collect();
        parts.push(format!("waiting on step {}", ids.join(", ")));
    }
    parts.join("; ")
}

fn failure(out: &mut String, failure: &Failure) {
    let _ = write!(out, "error [{}]", failure.kind.as_ref());
    if let Some(step) = failure.step {
        let _ = write!(out, " at step {step}");
    }
    if let Some(capability) = &failure.capability {
        let _ = write!(out, " for {capability}");
    }
    let _ = write!(out, ": {}", failure.message);
    if failure.retryable {
        out.push_str(" (retryable)");
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use pgforge_core::capability::CapabilityName;
    use pgforge_core::plan::{MigrationStep, StepId};

    use super::*;

    #[test]
    fn plan_lists_dependencies() {
        let migration = MigrationPlan::new(vec![
            MigrationStep::new(1, "documents", "CREATE TABLE documents ()")
                .with_reverse("DROP TABLE documents"),
            MigrationStep::new(2, "embedding", "ALTER TABLE documents ADD COLUMN embedding vector(3)")
                .requires(CapabilityName::vector())
                .after(1),
        ])
        .unwrap();

        let text = plan(&migration);
        assert!(text.contains("1  documents\n"));
        assert!(text.contains("2  embedding (requires vector; after 1; irreversible)\n"));
    }

    #[test]
    fn blocked_steps_explain_why() {
        let report = OrchestrationReport {
            steps: vec![StepReport {
                id: StepId::new(3),
                description: "hypertable".into(),
                state: StepState::Blocked(BlockReason {
                    capabilities: vec![CapabilityName::time_series()],
                    predecessors: vec![StepId::new(2)],
                }),
                duration: None,
            }],
            blocked: 1,
            ..OrchestrationReport::default()
        };

        let text = orchestration(&report);
        assert!(text.contains("capabilities: none"));
        assert!(text.contains("(missing timescaledb; waiting on step 2)"));
        assert!(text.contains("0 applied, 0 already applied, 1 blocked"));
    }
}
