use anyhow::Result;
use stagecal_core::{Reconciler, RunStatus, Trigger, Window};

use crate::render::Render;

pub async fn run(reconciler: &Reconciler, from: Option<String>, to: Option<String>, json: bool) -> Result<()> {
    let trigger = match (from, to) {
        (Some(from), Some(to)) => {
            let tz = reconciler.config().sync.tz()?;
            Trigger::ManualWindow(Window::from_args(&from, &to, tz)?)
        }
        _ => Trigger::Manual,
    };

    let summary = reconciler.trigger(trigger).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.render());
    }
    if summary.status == RunStatus::Failed {
        anyhow::bail!("Run {} failed: {}", summary.run_id, summary.message);
    }
    Ok(())
}
