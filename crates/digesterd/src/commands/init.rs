//! Module for writing a starter configuration.

use digester::config::EXAMPLE_CONFIG;

use super::*;

/// Options for [`Commands::Init`].
#[derive(Args, Clone)]
pub struct InitOptions {
  /// Where to write the configuration. Defaults to the platform config directory.
  #[arg(long)]
  pub path:  Option<PathBuf>,
  /// Overwrite an existing file without asking
  #[arg(long)]
  pub force: bool,
}

/// Function for the [`Commands::Init`] in the CLI.
pub async fn init<I: UserInteraction>(interaction: &I, options: InitOptions) -> Result<()> {
  let InitOptions { path, force } = options;
  let path = match path {
    Some(path) => path,
    None => {
      let default = Config::candidate_paths().pop().unwrap_or_else(|| PathBuf::from("digester.toml"));
      if !interaction.confirm(
        &format!("Write the example configuration to {}?", default.display()),
        true,
      )? {
        interaction.reply(ResponseContent::Info("Pass the intended location with --path"))?;
        return Ok(());
      }
      default
    },
  };

  if path.exists()
    && !force
    && !interaction
      .confirm(&format!("{} already exists. Overwrite it?", path.display()), false)?
  {
    interaction.reply(ResponseContent::Info(&format!(
      "Kept the existing configuration at {}; pass --force to overwrite it",
      path.display()
    )))?;
    return Ok(());
  }

  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    tokio::fs::create_dir_all(parent).await?;
  }
  tokio::fs::write(&path, EXAMPLE_CONFIG).await?;
  info!("Wrote example configuration to {}", path.display());
  interaction.reply(ResponseContent::Success(&format!(
    "Configuration written to {}",
    style(path.display()).yellow()
  )))?;
  interaction.reply(ResponseContent::List("Next steps", &[
    "export KIMI_API_KEY=... (and GMAIL_EMAIL / GMAIL_APP_PASSWORD for mail)".to_string(),
    "review the [[categories]] and [analysis] questions".to_string(),
    format!("digester --config {} run", path.display()),
  ]))
}
