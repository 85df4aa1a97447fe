use anyhow::Result;
use owo_colors::OwoColorize;
use stagecal_core::Reconciler;

use crate::render::Render;

pub fn run(reconciler: &Reconciler, limit: usize) -> Result<()> {
    let runs = reconciler.list_runs(limit)?;
    if runs.is_empty() {
        println!("{}", "No runs yet.".dimmed());
        return Ok(());
    }

    for run in &runs {
        println!("{}", run.render());
        if !run.message.is_empty() {
            println!("   {}", run.message.dimmed());
        }
    }
    Ok(())
}
