#![cfg_attr(all(windows, not(debug_assertions)), windows_subsystem = "windows")]

mod app;
mod config;
mod export;
mod report;

use anyhow::{anyhow, Result};
use chrono::Utc;
use eframe::egui;
use input_tracker::{ActivityTracker, Database};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::app::ViewerApp;
use crate::config::Config;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_args()?;
    let db = Arc::new(Database::open(&config.db_path)?);
    prune_history(&config, &db);

    let mut tracker = ActivityTracker::new(config.tracker_config(&db)?, db.clone())?;
    tracker.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = Arc::clone(&shutdown);
    if let Err(err) = ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::SeqCst);
    }) {
        log::warn!("ctrlc handler registration warning: {err}");
    }

    log::info!(
        "FAM Input Tracker started | db={} | tracking={}",
        config.db_path.display(),
        tracker.is_running()
    );

    let app = ViewerApp::new(tracker, db, config.export_dir(), shutdown)?;
    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 620.0])
            .with_min_inner_size([640.0, 420.0]),
        ..Default::default()
    };
    eframe::run_native(
        "FAM Input Tracker",
        native_options,
        Box::new(move |_cc| Ok(Box::new(app))),
    )
    .map_err(|err| anyhow!("failed to start FAM Input Tracker: {err}"))?;

    log::info!("FAM Input Tracker stopped");
    Ok(())
}

fn prune_history(config: &Config, db: &Database) {
    let days = match config.retention_days(db) {
        Ok(days) => days,
        Err(err) => {
            log::warn!("could not read history setting: {err:#}");
            return;
        }
    };
    if days == 0 {
        return;
    }

    let cutoff = Utc::now().timestamp() - i64::from(days) * 86_400;
    match db.prune_before(cutoff) {
        Ok(0) => {}
        Ok(removed) => log::info!("pruned {removed} input events older than {days} days"),
        Err(err) => log::warn!("history pruning failed: {err:#}"),
    }
}
