use anyhow::Result;
use owo_colors::OwoColorize;
use stagecal_core::Reconciler;

use crate::render::Render;

pub fn run(reconciler: &Reconciler, run_id: Option<&str>, limit: usize, verbose: bool) -> Result<()> {
    let records = reconciler.list_audit(run_id, limit)?;
    if records.is_empty() {
        println!("{}", "No audit records.".dimmed());
        return Ok(());
    }

    for record in &records {
        println!("{}", record.render());
        if verbose && record.details.as_object().is_some_and(|d| !d.is_empty()) {
            println!("       {}", record.details.to_string().dimmed());
        }
    }
    Ok(())
}
