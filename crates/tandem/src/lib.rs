pub mod app;
pub mod bootstrap;
pub mod config;
pub mod deps;
pub mod error;
pub mod launcher;
pub mod log_file;
pub mod log_view;
pub mod port_reclaim;
pub mod readiness;
pub mod run_state;
pub mod signals;
pub mod status;
pub mod supervisor;
pub mod templates;
