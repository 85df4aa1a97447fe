use anyhow::Result;
use owo_colors::OwoColorize;
use stagecal_core::Reconciler;

pub async fn run(reconciler: &Reconciler, uid: &str, text: &str) -> Result<()> {
    let event = reconciler.reinstruct(uid, text).await?;
    let verb = if text.trim().is_empty() {
        "Cleared intent on"
    } else {
        "Instructed"
    };
    println!("{} {} {}", verb.green(), event.summary, event.uid.dimmed());
    Ok(())
}
