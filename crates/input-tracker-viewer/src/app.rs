use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use eframe::egui::{self, Color32};
use input_tracker::{ActivityTracker, Database, InputKind, StoredActivity, SurfaceId};

use crate::export;
use crate::report::{self, format_duration, format_minute, HourTotal};

const AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const STATUS_REPAINT_INTERVAL: Duration = Duration::from_secs(1);
const INFO_MESSAGE_TTL: Duration = Duration::from_secs(4);
const RECENT_ROW_LIMIT: usize = 240;

struct ReloadRequest {
    request_id: u64,
}

struct ReloadPayload {
    rows: Vec<StoredActivity>,
    hourly: Vec<HourTotal>,
    total_secs: i64,
}

struct ReloadResult {
    request_id: u64,
    payload: std::result::Result<ReloadPayload, String>,
}

/// The viewer window is itself an input surface: every key press, click and
/// wheel turn inside it counts toward the tracked action.
pub struct ViewerApp {
    tracker: ActivityTracker,
    /// `None` once the window has been detached from the tracker.
    surface: Option<SurfaceId>,
    export_dir: PathBuf,
    rows: Vec<StoredActivity>,
    hourly: Vec<HourTotal>,
    total_secs: i64,
    reload_request_tx: mpsc::Sender<ReloadRequest>,
    reload_result_rx: mpsc::Receiver<ReloadResult>,
    next_reload_request_id: u64,
    pending_reload_request_id: Option<u64>,
    last_auto_refresh: Instant,
    info_message: Option<String>,
    info_expires_at: Option<Instant>,
    error: Option<String>,
    shutdown: Arc<AtomicBool>,
}

impl ViewerApp {
    pub fn new(
        tracker: ActivityTracker,
        db: Arc<Database>,
        export_dir: PathBuf,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let surface = tracker.new_surface_id();
        tracker.register_surface(&surface)?;

        let (reload_request_tx, reload_result_rx) = spawn_reload_worker(db);
        let mut app = Self {
            tracker,
            surface: Some(surface),
            export_dir,
            rows: Vec::new(),
            hourly: Vec::new(),
            total_secs: 0,
            reload_request_tx,
            reload_result_rx,
            next_reload_request_id: 0,
            pending_reload_request_id: None,
            last_auto_refresh: Instant::now(),
            info_message: None,
            info_expires_at: None,
            error: None,
            shutdown,
        };
        app.reload();
        Ok(app)
    }

    fn set_info_message(&mut self, message: impl Into<String>) {
        self.info_message = Some(message.into());
        self.info_expires_at = Some(Instant::now() + INFO_MESSAGE_TTL);
    }

    fn clear_info_message(&mut self) {
        self.info_message = None;
        self.info_expires_at = None;
    }

    fn detach_surface(&mut self) {
        let Some(surface) = self.surface.take() else {
            return;
        };
        if let Err(err) = self.tracker.unregister_surface(&surface) {
            log::warn!("could not unregister viewer surface: {err}");
        }
    }

    fn forward_input(&self, ctx: &egui::Context) {
        let Some(surface) = self.surface else {
            return;
        };
        let kinds: Vec<InputKind> = ctx.input(|input| {
            let mut kinds: Vec<InputKind> = input.events.iter().filter_map(classify_event).collect();
            if input.raw_scroll_delta != egui::Vec2::ZERO {
                kinds.push(InputKind::MouseWheel);
            }
            kinds
        });
        for kind in kinds {
            self.tracker.on_raw_input(surface, kind);
        }
    }

    fn reload(&mut self) {
        self.last_auto_refresh = Instant::now();
        self.next_reload_request_id = self.next_reload_request_id.wrapping_add(1);
        let request_id = self.next_reload_request_id;
        self.pending_reload_request_id = Some(request_id);

        if self
            .reload_request_tx
            .send(ReloadRequest { request_id })
            .is_err()
        {
            self.pending_reload_request_id = None;
            self.error = Some("reload worker unavailable".to_owned());
        }
    }

    fn drain_reload_results(&mut self) {
        while let Ok(result) = self.reload_result_rx.try_recv() {
            if Some(result.request_id) != self.pending_reload_request_id {
                continue;
            }
            self.pending_reload_request_id = None;

            match result.payload {
                Ok(payload) => {
                    self.rows = payload.rows;
                    self.hourly = payload.hourly;
                    self.total_secs = payload.total_secs;
                    self.error = None;
                }
                Err(err) => self.error = Some(err),
            }
        }
    }

    fn export(&mut self, extension: &str) {
        let result = export::export_path(&self.export_dir, extension).and_then(|path| {
            match extension {
                "json" => export::write_json(&path, &self.rows)?,
                _ => export::write_csv(&path, &self.rows)?,
            }
            Ok(path)
        });
        match result {
            Ok(path) => self.set_info_message(format!("exported to {}", path.display())),
            Err(err) => {
                log::error!("export failed: {err:#}");
                self.error = Some(format!("export failed: {err:#}"));
            }
        }
    }

    fn draw_status(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            if self.tracker.is_running() {
                ui.colored_label(Color32::from_rgb(46, 160, 67), "● tracking");
            } else if self.tracker.is_enabled() {
                ui.colored_label(Color32::from_rgb(210, 153, 34), "● stopped");
            } else {
                ui.colored_label(Color32::GRAY, "● disabled");
            }

            let config = self.tracker.config();
            ui.label(format!(
                "process {} | action {} | {}@{}",
                config.process_id, config.action_id, config.user_name, config.machine_name
            ));

            ui.separator();
            let current = self
                .tracker
                .current_bucket()
                .map(|bucket| bucket.active_seconds)
                .unwrap_or(0);
            ui.label(format!("this minute: {current}s"));
            ui.label(format!("today: {}", format_duration(self.total_secs)));

            ui.separator();
            if ui.button("Reload").clicked() {
                self.reload();
            }
            if ui.button("Export CSV").clicked() {
                self.export("csv");
            }
            if ui.button("Export JSON").clicked() {
                self.export("json");
            }
        });

        if let Some(message) = &self.info_message {
            ui.label(message.as_str());
        }
        if let Some(err) = &self.error {
            ui.colored_label(Color32::from_rgb(200, 60, 60), err.as_str());
        }
    }

    fn draw_hourly(&self, ui: &mut egui::Ui) {
        ui.heading("Today by hour");
        if self.hourly.is_empty() {
            ui.label("No activity recorded today.");
            return;
        }
        egui::Grid::new("hourly_totals")
            .striped(true)
            .num_columns(3)
            .show(ui, |ui| {
                ui.strong("Hour");
                ui.strong("Active");
                ui.strong("Minutes");
                ui.end_row();
                for slot in &self.hourly {
                    ui.label(format!("{:02}:00", slot.hour));
                    ui.label(format_duration(slot.active_seconds));
                    ui.label(slot.active_minutes.to_string());
                    ui.end_row();
                }
            });
    }

    fn draw_recent(&self, ui: &mut egui::Ui) {
        ui.heading("Recent minutes");
        egui::ScrollArea::vertical().show(ui, |ui| {
            egui::Grid::new("recent_minutes_grid")
                .striped(true)
                .num_columns(4)
                .show(ui, |ui| {
                    ui.strong("Minute");
                    ui.strong("Active seconds");
                    ui.strong("Process");
                    ui.strong("Action");
                    ui.end_row();
                    for row in self.rows.iter().rev().take(RECENT_ROW_LIMIT) {
                        ui.label(format_minute(row.minute_ts));
                        ui.label(row.active_seconds.to_string());
                        ui.label(row.process_id.to_string());
                        ui.label(row.action_id.to_string());
                        ui.end_row();
                    }
                });
        });
    }
}

impl Drop for ViewerApp {
    fn drop(&mut self) {
        self.detach_surface();
    }
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if self.shutdown.load(Ordering::Relaxed) {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        self.forward_input(ctx);
        ctx.request_repaint_after(STATUS_REPAINT_INTERVAL);

        if let Some(expires_at) = self.info_expires_at {
            if Instant::now() >= expires_at {
                self.clear_info_message();
            }
        }

        self.drain_reload_results();
        if self.last_auto_refresh.elapsed() >= AUTO_REFRESH_INTERVAL
            && self.pending_reload_request_id.is_none()
        {
            self.reload();
        }

        egui::TopBottomPanel::top("status").show(ctx, |ui| {
            self.draw_status(ui);
        });
        egui::CentralPanel::default().show(ctx, |ui| {
            self.draw_hourly(ui);
            ui.add_space(12.0);
            self.draw_recent(ui);
        });
    }
}

fn classify_event(event: &egui::Event) -> Option<InputKind> {
    match event {
        egui::Event::Key {
            pressed: true,
            repeat: false,
            ..
        } => Some(InputKind::KeyDown),
        egui::Event::Key { pressed: false, .. } => Some(InputKind::KeyUp),
        egui::Event::PointerButton { pressed: true, .. } => Some(InputKind::MouseButtonDown),
        egui::Event::PointerButton { pressed: false, .. } => Some(InputKind::MouseButtonUp),
        egui::Event::PointerMoved(_) => Some(InputKind::MouseMove),
        _ => None,
    }
}

fn spawn_reload_worker(db: Arc<Database>) -> (mpsc::Sender<ReloadRequest>, mpsc::Receiver<ReloadResult>) {
    let (request_tx, request_rx) = mpsc::channel::<ReloadRequest>();
    let (result_tx, result_rx) = mpsc::channel::<ReloadResult>();

    std::thread::spawn(move || {
        while let Ok(mut request) = request_rx.recv() {
            while let Ok(next_request) = request_rx.try_recv() {
                request = next_request;
            }

            let payload = load_today(&db).map_err(|err| format!("failed to load activity: {err:#}"));
            if result_tx
                .send(ReloadResult {
                    request_id: request.request_id,
                    payload,
                })
                .is_err()
            {
                break;
            }
        }
    });

    (request_tx, result_rx)
}

fn load_today(db: &Database) -> Result<ReloadPayload> {
    let today = Local::now().date_naive();
    let (start, end) = report::day_bounds(today)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve bounds for {today}"))?;
    let rows = db.load_activity(start, end)?;
    let hourly = report::hourly_totals(&rows);
    let total_secs = db.total_active_seconds(start, end)?;
    Ok(ReloadPayload {
        rows,
        hourly,
        total_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_tracker::{ActivityRecord, ActivityStore, TrackerConfig};

    fn idle_app() -> ViewerApp {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let tracker = ActivityTracker::new(TrackerConfig::new(4), db.clone()).unwrap();
        let export_dir = std::env::temp_dir();
        ViewerApp::new(tracker, db, export_dir, Arc::new(AtomicBool::new(false))).unwrap()
    }

    #[test]
    fn viewer_registers_and_detaches_its_surface() {
        let mut app = idle_app();
        assert_eq!(app.tracker.surface_count(), 1);

        app.detach_surface();
        assert_eq!(app.tracker.surface_count(), 0);
        assert!(app.surface.is_none());

        app.detach_surface();
        assert_eq!(app.tracker.surface_count(), 0);
    }

    #[test]
    fn dropping_the_viewer_releases_its_surface() {
        let app = idle_app();
        let surface = app.surface.unwrap();
        let notifier = app.tracker.notifier();
        assert!(notifier.is_registered(surface));

        drop(app);
        assert!(!notifier.is_registered(surface));
    }

    #[test]
    fn pointer_events_map_to_input_kinds() {
        let down = egui::Event::PointerButton {
            pos: egui::pos2(3.0, 4.0),
            button: egui::PointerButton::Primary,
            pressed: true,
            modifiers: egui::Modifiers::default(),
        };
        let up = egui::Event::PointerButton {
            pos: egui::pos2(3.0, 4.0),
            button: egui::PointerButton::Primary,
            pressed: false,
            modifiers: egui::Modifiers::default(),
        };
        assert_eq!(classify_event(&down), Some(InputKind::MouseButtonDown));
        assert_eq!(classify_event(&up), Some(InputKind::MouseButtonUp));
        assert_eq!(
            classify_event(&egui::Event::PointerMoved(egui::pos2(1.0, 1.0))),
            Some(InputKind::MouseMove)
        );
        assert_eq!(classify_event(&egui::Event::Copy), None);
    }

    #[test]
    fn today_loads_only_todays_minutes() {
        let db = Database::open_in_memory().unwrap();
        let now = chrono::Utc::now();
        let minute = now - chrono::Duration::seconds(now.timestamp().rem_euclid(60));
        db.record_activity(&ActivityRecord {
            minute,
            active_seconds: 25,
            process_id: 1,
            action_id: 2,
            machine_name: "WS".to_owned(),
            user_name: "op".to_owned(),
        })
        .unwrap();
        db.record_activity(&ActivityRecord {
            minute: minute - chrono::Duration::days(3),
            active_seconds: 40,
            process_id: 1,
            action_id: 2,
            machine_name: "WS".to_owned(),
            user_name: "op".to_owned(),
        })
        .unwrap();

        let payload = load_today(&db).unwrap();
        assert_eq!(payload.rows.len(), 1);
        assert_eq!(payload.total_secs, 25);
        assert_eq!(payload.hourly.len(), 1);
    }
}
