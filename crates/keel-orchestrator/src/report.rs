//! Markdown status projection
//!
//! Rendered from a checkpointed state and written for humans. Nothing ever
//! reads the file back.

use keel_core::fail_open::fail_open;
use keel_core::{KeelError, Phase, WorkflowState};
use std::fmt::Write;
use std::path::Path;

/// Maximum error log entries shown
const RECENT_ERRORS: usize = 5;

pub fn render_status(state: &WorkflowState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Keel: {}\n", state.feature);
    let _ = writeln!(out, "- **Run**: {}", state.run_id);
    let _ = writeln!(out, "- **Phase**: {}", state.phase);
    let _ = writeln!(out, "- **Checkpoint**: #{}", state.sequence);
    if let Some(decision) = state.last_decision {
        let _ = writeln!(out, "- **Last decision**: {}", decision);
    }
    if let Some(reason) = &state.abort_reason {
        let _ = writeln!(out, "- **Aborted**: {}", reason);
    }

    let _ = writeln!(out, "\n## Phases\n");
    let _ = writeln!(out, "| Phase | Status | Iteration |");
    let _ = writeln!(out, "|---|---|---|");
    for phase in Phase::PIPELINE {
        let _ = writeln!(
            out,
            "| {} | {} | {} |",
            phase,
            state.status_of(phase),
            state.iteration(phase)
        );
    }

    if !state.tasks.is_empty() {
        let _ = writeln!(
            out,
            "\n## Tasks ({}/{} completed)\n",
            state.completed_task_ids.len(),
            state.tasks.len()
        );
        for task in &state.tasks {
            let mark = if task.is_complete() { "x" } else { " " };
            let _ = write!(out, "- [{}] `{}` {} ({})", mark, task.id, task.title, task.status);
            if !task.dependencies.is_empty() {
                let _ = write!(out, " after {}", task.dependencies.join(", "));
            }
            let _ = writeln!(out);
        }
    }

    if let Some(escalation) = &state.escalation {
        let _ = writeln!(out, "\n## Awaiting decision\n");
        let _ = writeln!(out, "- **Phase**: {}", escalation.phase);
        if let Some(task) = &escalation.task_id {
            let _ = writeln!(out, "- **Task**: {}", task);
        }
        let _ = writeln!(out, "- **Cause**: {}", escalation.root_cause);
        let _ = writeln!(out, "- **Prior attempts**: {}", escalation.prior_attempts);
        for remedy in &escalation.attempted_remedies {
            let _ = writeln!(out, "- **Tried**: {}", remedy);
        }
        if let Some(question) = &escalation.clarification_question {
            let _ = writeln!(out, "- **Question**: {}", question);
        }
        let _ = writeln!(out, "- **Options**: {}", escalation.options().join(" | "));
    }

    if !state.error_log.is_empty() {
        let _ = writeln!(out, "\n## Recent errors\n");
        for entry in state.error_log.iter().rev().take(RECENT_ERRORS) {
            let _ = writeln!(
                out,
                "- {} {} [{}] {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.phase,
                entry.context.kind,
                entry.context.message
            );
        }
    }
    out
}

/// Write the projection, logging and ignoring failures
pub async fn write_status(path: &Path, state: &WorkflowState) {
    fail_open("status_report", || async {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, render_status(state)).await?;
        Ok::<(), KeelError>(())
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{EscalationRequest, Task};
    use tempfile::TempDir;

    #[test]
    fn test_render_includes_escalation_menu() {
        let mut state = WorkflowState::new("login").with_tasks(vec![
            Task::new("A", "schema"),
            Task::new("B", "api").with_dependencies(["A"]),
        ]);
        state.phase = Phase::HumanEscalation;
        state.escalation = Some(
            EscalationRequest::new(Phase::Implementation, "worker timed out")
                .with_task("B")
                .with_prior_attempts(4),
        );

        let text = render_status(&state);
        assert!(text.contains("# Keel: login"));
        assert!(text.contains("| IMPLEMENTATION | pending | 0 |"));
        assert!(text.contains("`B` api (pending) after A"));
        assert!(text.contains("retry | skip | continue | abort"));
    }

    #[tokio::test]
    async fn test_write_status_is_fail_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status/status.md");
        let state = WorkflowState::new("x");
        write_status(&path, &state).await;
        assert!(path.exists());

        // A directory where the file should be is logged, not raised
        let blocked = dir.path().join("status");
        write_status(&blocked, &state).await;
    }
}
