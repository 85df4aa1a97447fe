use anyhow::Result;
use owo_colors::OwoColorize;
use stagecal_core::Reconciler;

pub async fn run(reconciler: &Reconciler, audit_id: i64) -> Result<()> {
    let restored = reconciler.undo(audit_id).await?;
    println!(
        "{} {} {}",
        "Restored".green(),
        restored.summary,
        restored.uid.dimmed()
    );
    Ok(())
}
