use anyhow::{bail, Context, Result};
use input_tracker::{Database, TrackerConfig};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub struct Config {
    pub db_path: PathBuf,
    pub action_id: i64,
    pub sample_interval: Duration,
    pub bucket_span: Duration,
    pub history_days: Option<u32>,
    pub disabled: bool,
}

impl Config {
    pub fn from_args() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut db_path = default_db_path();
        let mut action_id: i64 = 1;
        let mut sample_ms: u64 = 1000;
        let mut bucket_secs: u64 = 60;
        let mut history_days: Option<u32> = None;
        let mut disabled = false;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = args.next().context("missing value for --db")?;
                    db_path = PathBuf::from(value);
                }
                "--action-id" => {
                    let value = args.next().context("missing value for --action-id")?;
                    action_id = value
                        .parse::<i64>()
                        .with_context(|| format!("invalid --action-id value: {value}"))?;
                }
                "--sample-ms" => {
                    let value = args.next().context("missing value for --sample-ms")?;
                    sample_ms = value
                        .parse::<u64>()
                        .with_context(|| format!("invalid --sample-ms value: {value}"))?;
                }
                "--bucket-secs" => {
                    let value = args.next().context("missing value for --bucket-secs")?;
                    bucket_secs = value
                        .parse::<u64>()
                        .with_context(|| format!("invalid --bucket-secs value: {value}"))?;
                }
                "--history-days" => {
                    let value = args.next().context("missing value for --history-days")?;
                    history_days = Some(
                        value
                            .parse::<u32>()
                            .with_context(|| format!("invalid --history-days value: {value}"))?,
                    );
                }
                "--disable" => disabled = true,
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => bail!("unknown argument: {arg}"),
            }
        }

        if action_id <= 0 {
            bail!("--action-id must be greater than zero");
        }
        if sample_ms == 0 {
            bail!("--sample-ms must be greater than zero");
        }
        if bucket_secs == 0 {
            bail!("--bucket-secs must be greater than zero");
        }

        Ok(Self {
            db_path,
            action_id,
            sample_interval: Duration::from_millis(sample_ms),
            bucket_span: Duration::from_secs(bucket_secs),
            history_days,
            disabled,
        })
    }

    /// Reads the enable flag from the database once; `--disable` wins.
    pub fn tracker_config(&self, db: &Database) -> Result<TrackerConfig> {
        let mut config = TrackerConfig::new(self.action_id);
        config.enabled = !self.disabled && db.tracking_enabled()?;
        config.sample_interval = self.sample_interval;
        config.bucket_span = self.bucket_span;
        Ok(config)
    }

    pub fn retention_days(&self, db: &Database) -> Result<u32> {
        match self.history_days {
            Some(days) => Ok(days),
            None => db.history_days(),
        }
    }

    pub fn export_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(|parent| parent.join("exports"))
            .unwrap_or_else(|| PathBuf::from("exports"))
    }
}

fn default_db_path() -> PathBuf {
    if let Some(local) = env::var_os("LOCALAPPDATA") {
        return PathBuf::from(local)
            .join("FAMInputTracker")
            .join("activity.db");
    }
    PathBuf::from("data").join("activity.db")
}

fn print_help() {
    println!(
        "\
FAM Input Tracker

Usage:
  input-tracker-viewer [--db <path>] [--action-id <id>] [--sample-ms <ms>]
                       [--bucket-secs <s>] [--history-days <d>] [--disable]

Options:
  --db            SQLite file path (default: %LOCALAPPDATA%\\FAMInputTracker\\activity.db)
  --action-id     Action the recorded activity is attributed to (default: 1)
  --sample-ms     Sampling interval in milliseconds (default: 1000)
  --bucket-secs   Bucket length in seconds (default: 60)
  --history-days  Days of activity to keep (default: InputEventHistory setting, 30)
  --disable       Show recorded activity without tracking input
  -h, --help      Print this help"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_tracker::db::ENABLE_TRACKING_SETTING;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags() {
        let config = Config::parse(args(&[
            "--db",
            "x/activity.db",
            "--action-id",
            "12",
            "--sample-ms",
            "500",
            "--bucket-secs",
            "30",
            "--history-days",
            "3",
            "--disable",
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("x/activity.db"));
        assert_eq!(config.action_id, 12);
        assert_eq!(config.sample_interval, Duration::from_millis(500));
        assert_eq!(config.bucket_span, Duration::from_secs(30));
        assert_eq!(config.history_days, Some(3));
        assert!(config.disabled);
        assert_eq!(config.export_dir(), PathBuf::from("x").join("exports"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::parse(args(&["--action-id", "0"])).is_err());
        assert!(Config::parse(args(&["--sample-ms", "abc"])).is_err());
        assert!(Config::parse(args(&["--bucket-secs"])).is_err());
        assert!(Config::parse(args(&["--verbose"])).is_err());
    }

    #[test]
    fn database_setting_can_disable_tracking() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::parse(Vec::new()).unwrap();
        assert!(config.tracker_config(&db).unwrap().enabled);
        assert_eq!(config.retention_days(&db).unwrap(), 30);

        db.set_setting(ENABLE_TRACKING_SETTING, "false").unwrap();
        assert!(!config.tracker_config(&db).unwrap().enabled);
    }
}
