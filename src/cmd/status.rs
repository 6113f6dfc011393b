use anyhow::{Context, Result};
use console::style;

use crate::orchestrator::Orchestrator;

pub async fn execute(orchestrator: &Orchestrator, task_id: &str) -> Result<()> {
    let id = task_id.to_string();
    let task = orchestrator
        .db()
        .call(move |db| db.get_task(&id))
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("{} {}", style("Task").bold(), task.id);
    println!("  title:    {}", task.title);
    println!("  status:   {}", task.status.as_str());
    println!("  priority: {}", task.priority.as_str());
    println!(
        "  spend:    ${:.4} ({} in / {} out tokens)",
        task.total_cost_usd, task.total_usage.input_tokens, task.total_usage.output_tokens
    );
    if !task.continuations.is_empty() {
        let unprocessed = task.continuations.iter().filter(|c| !c.processed).count();
        println!(
            "  continuations: {} ({} pending)",
            task.continuations.len(),
            unprocessed
        );
    }
    println!("  phases:");
    for (phase, state) in &task.phase_states {
        let label = match state {
            crate::model::task::PhaseState::Pending => style("pending").dim(),
            crate::model::task::PhaseState::InProgress { .. } => style("in_progress").yellow(),
            crate::model::task::PhaseState::Completed { .. } => style("completed").green(),
            crate::model::task::PhaseState::Failed { .. } => style("failed").red(),
        };
        println!("    {phase}: {label}");
    }
    Ok(())
}
