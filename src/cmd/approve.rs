use anyhow::Result;
use console::style;

use crate::orchestrator::Orchestrator;

pub async fn execute(orchestrator: &Orchestrator, task_id: &str) -> Result<()> {
    orchestrator.approve(task_id).await?;
    println!(
        "{} approval recorded; resume with: conductor run {}",
        style("Approved").green().bold(),
        task_id
    );
    Ok(())
}
