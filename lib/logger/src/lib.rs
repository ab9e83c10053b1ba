use anyhow::Context;
use docksmith_client::entities::logger::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let level: tracing::Level = config.level.into();
  let registry =
    Registry::default().with(LevelFilter::from(level));

  match config.stdio {
    StdioLogMode::None => return Ok(()),
    StdioLogMode::Json => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    StdioLogMode::Standard if config.pretty => registry
      .with(tracing_subscriber::fmt::layer().pretty())
      .try_init(),
    StdioLogMode::Standard => registry
      .with(tracing_subscriber::fmt::layer())
      .try_init(),
  }
  .context("failed to init logger")
}
