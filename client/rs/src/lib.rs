//! Shared types for Docksmith, the compose-aware container update
//! manager. Entities here are used by the server, the persistence
//! layer, and (via typeshare) the web UI.

pub mod api;
pub mod entities;
pub mod error;
