use anyhow::Result;
use console::style;

use crate::orchestrator::Orchestrator;

pub async fn execute(orchestrator: &Orchestrator, task_id: &str) -> Result<()> {
    let report = orchestrator.run(task_id).await?;

    if report.paused_for_approval {
        println!(
            "{} after {}/{} phases; approve with: conductor approve {}",
            style("Paused").yellow().bold(),
            report.completed_phases,
            report.total_phases,
            task_id
        );
    } else if report.success {
        println!(
            "{} {}/{} phases in {:.1}s",
            style("Completed").green().bold(),
            report.completed_phases,
            report.total_phases,
            report.duration_ms as f64 / 1000.0
        );
    } else {
        println!(
            "{} after {}/{} phases: {}",
            style("Failed").red().bold(),
            report.completed_phases,
            report.total_phases,
            report.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }
    Ok(())
}
