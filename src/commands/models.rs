use anyhow::Result;
use owo_colors::OwoColorize;
use stagecal_core::Reconciler;

use super::create_spinner;

pub async fn run(reconciler: &Reconciler) -> Result<()> {
    let spinner = create_spinner("Fetching models".to_string());
    let result = reconciler.list_models().await;
    spinner.finish_and_clear();

    let configured = &reconciler.config().inference.model;
    for model in result? {
        if &model == configured {
            println!("{} {}", model.green(), "(configured)".dimmed());
        } else {
            println!("{model}");
        }
    }
    Ok(())
}
