#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;
use axum::Router;
use tower_http::{
  cors::{Any, CorsLayer},
  services::{ServeDir, ServeFile},
};

use crate::config::core_config;

mod api;
mod checker;
mod composefile;
mod config;
mod docker;
mod events;
mod orchestrator;
mod queue;
mod registry;
mod startup;
mod state;
mod version;

#[cfg(test)]
mod testutil;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging)?;

  info!("Docksmith version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{:?}", config.sanitized());

  let state = state::init_app_state().await;

  // Recovery before anything new is accepted.
  startup::on_startup(&state).await;

  // Background tasks
  checker::spawn_check_loop(state.clone(), config.check_interval);
  startup::spawn_event_gc_loop(state.clone());

  // First discovery as soon as the loop is up.
  checker::trigger(&state);

  // Static frontend with SPA index fallback.
  let static_dir = &config.static_dir;
  let index =
    ServeFile::new(static_dir.join("index.html"));
  let serve_frontend =
    ServeDir::new(static_dir).not_found_service(index);

  let app = Router::new()
    .merge(api::router())
    .fallback_service(serve_frontend)
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    )
    .into_make_service();

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;

  info!("Docksmith starting on http://{socket_addr}");
  axum_server::bind(socket_addr)
    .serve(app)
    .await
    .context("failed to start http server")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  // Exit-code contract: SIGINT/SIGTERM resolve to Ok, so the
  // process exits 0 on signal-driven shutdown; init/bind failures
  // propagate as Err and exit non-zero.
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = tokio::signal::ctrl_c() => {
      info!("SIGINT received, shutting down");
      Ok(())
    }
    _ = term_signal.recv() => {
      info!("SIGTERM received, shutting down");
      Ok(())
    }
  }
}
