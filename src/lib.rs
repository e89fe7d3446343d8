//! mrreports -- scheduled delivery of parameterized reports by email.
//!
//! This crate provides the report catalog, encrypted credential storage,
//! the recurrence rule, and the executor that renders and mails each due
//! subscription exactly once even when several drivers run at the same time.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod domain;
pub mod report;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use config::{AppConfig, LoggingConfig, SettingsSource};
use delivery::{HttpMailer, HttpRenderer};
use scheduler::Executor;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if config.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}

/// Build an executor wired to the HTTP render and email services.
pub fn build_executor(config: &AppConfig, pool: storage::Pool) -> Result<Executor> {
    config.validate()?;
    let renderer = HttpRenderer::new(&config.render)?;
    let mailer = HttpMailer::new(&config.email, config)?;
    let settings: Arc<dyn SettingsSource> = Arc::new(config.clone());

    Ok(Executor::new(
        pool,
        Arc::new(renderer),
        Arc::new(mailer),
        settings,
        config.delivery.clone(),
        config.scheduler.clone(),
    ))
}
