use anyhow::{Context, Result};
use input_tracker::StoredActivity;
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::report::{format_minute, local_datetime};

pub fn export_path(dir: &Path, extension: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export directory: {}", dir.display()))?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(dir.join(format!("input-activity-{stamp}.{extension}")))
}

pub fn write_csv(path: &Path, rows: &[StoredActivity]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create export file: {}", path.display()))?;
    writer
        .write_record([
            "Minute",
            "ActiveSeconds",
            "ProcessId",
            "ActionId",
            "Machine",
            "User",
        ])
        .context("failed to write CSV header")?;

    for row in rows {
        writer
            .write_record([
                format_minute(row.minute_ts),
                row.active_seconds.to_string(),
                row.process_id.to_string(),
                row.action_id.to_string(),
                row.machine_name.clone(),
                row.user_name.clone(),
            ])
            .context("failed to write CSV row")?;
    }
    writer.flush().context("failed to flush CSV writer")?;
    Ok(())
}

pub fn write_json(path: &Path, rows: &[StoredActivity]) -> Result<()> {
    let records: Vec<_> = rows
        .iter()
        .map(|row| {
            json!({
                "minute_ts": row.minute_ts,
                "minute_local": local_datetime(row.minute_ts).map(|dt| dt.to_rfc3339()),
                "active_seconds": row.active_seconds,
                "process_id": row.process_id,
                "action_id": row.action_id,
                "machine_name": row.machine_name,
                "user_name": row.user_name,
            })
        })
        .collect();
    let total: i64 = rows.iter().map(|row| i64::from(row.active_seconds)).sum();
    let document = json!({
        "total_active_seconds": total,
        "minutes": records,
    });

    let file = File::create(path)
        .with_context(|| format!("failed to create export file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &document).context("failed to write JSON export")?;
    writer.flush().context("failed to flush JSON writer")?;
    Ok(())
}
