//! Fixing-agent model listing — `codemedic models`.

use anyhow::Result;
use codemedic::config::MedicConfig;
use codemedic::fix::list_models;

pub async fn cmd_models(config: &MedicConfig) -> Result<()> {
    let models = list_models(&config.agent.cmd).await;
    if models.is_empty() {
        println!("No models reported by '{} models'.", config.agent.cmd);
        return Ok(());
    }
    for model in models {
        println!("{model}");
    }
    Ok(())
}
