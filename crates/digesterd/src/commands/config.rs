//! Module for printing the effective configuration.

use super::*;

/// Function for the [`Commands::Config`] in the CLI.
pub fn show_config<I: UserInteraction>(interaction: &I, config: &Config, path: &Path) -> Result<()> {
  interaction.reply(ResponseContent::Info(&format!(
    "Configuration loaded from {}",
    style(path.display()).yellow()
  )))?;
  println!("{}", toml::to_string_pretty(&config.redacted())?);
  Ok(())
}
