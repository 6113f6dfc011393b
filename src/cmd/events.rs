use anyhow::Result;
use console::style;

use crate::orchestrator::Orchestrator;

pub async fn execute(orchestrator: &Orchestrator, task_id: &str) -> Result<()> {
    let events = orchestrator.events().replay(task_id).await?;
    if events.is_empty() {
        println!("No events for task {task_id}");
        return Ok(());
    }
    for event in events {
        println!(
            "{} {} {}{}",
            style(event.created_at.to_rfc3339()).dim(),
            style(event.kind.as_str()).cyan(),
            if event.agent.is_empty() {
                String::new()
            } else {
                format!("[{}] ", event.agent)
            },
            event.payload
        );
    }
    Ok(())
}
