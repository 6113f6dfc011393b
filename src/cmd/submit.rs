use anyhow::Result;
use console::style;

use crate::model::task::Priority;
use crate::orchestrator::Orchestrator;

pub async fn execute(
    orchestrator: &Orchestrator,
    title: &str,
    description: &str,
    priority: Priority,
    repositories: Vec<String>,
) -> Result<()> {
    let task = orchestrator
        .submit(title, description, priority, repositories)
        .await?;
    println!(
        "{} task {} ({})",
        style("Created").green().bold(),
        style(&task.id).cyan(),
        task.title
    );
    println!("Run it with: conductor run {}", task.id);
    Ok(())
}
