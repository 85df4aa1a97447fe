use anyhow::Result;
use stagecal_core::Reconciler;

use super::create_spinner;
use crate::render::Render;

pub async fn run(reconciler: &Reconciler) -> Result<()> {
    let spinner = create_spinner("Discovering calendars".to_string());
    let result = reconciler.calendar_roles().await;
    spinner.finish_and_clear();

    for calendar in &result?.calendars {
        println!("{}", calendar.render());
    }
    Ok(())
}
