//! Snapshot CSV writer
//!
//! File layout:
//!
//! ```text
//! # version=1,user_id=alice-52-2-0-12,buff_size=200,window_size=10,anomaly_threshold=2,cycle=41,baseline=0.096154,direction=high,ratio=2.341,p_value=1.2e-3
//! comp_time,event,arduino_time,adc,sipm,dead_time,temp,win_f,median_f
//! 2025-10-19 14:30:05.123,1021,5012345,412,38.21,1024,23.50,,0.096154
//! ...
//! ```
//!
//! One row per buffered event, oldest first. `win_f` is empty where the
//! window frequency is undefined. Files are written to a `.tmp` sibling and
//! renamed into place, so readers never see a truncated snapshot.

use super::disk;
use super::session::SessionLayout;
use super::PersistError;
use crate::config::defaults::SNAPSHOT_FORMAT_VERSION;
use crate::types::{BufferSnapshot, Classification, Decision};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: &str = "comp_time,event,arduino_time,adc,sipm,dead_time,temp,win_f,median_f";

/// Run-level values stamped into every snapshot's metadata line.
#[derive(Debug, Clone)]
pub struct SnapshotHeader {
    pub user_id: String,
    pub buff_size: usize,
    pub window_size: usize,
    pub anomaly_threshold: f64,
}

/// Writes buffer snapshots into the session's `anomaly/` and `all/` directories.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    session: SessionLayout,
    header: SnapshotHeader,
    min_free_mb: u64,
}

impl SnapshotWriter {
    pub fn new(session: SessionLayout, header: SnapshotHeader, min_free_mb: u64) -> Self {
        Self {
            session,
            header,
            min_free_mb,
        }
    }

    pub fn session(&self) -> &SessionLayout {
        &self.session
    }

    /// Persist one snapshot, returning the final file path.
    ///
    /// Blocking; run it on a blocking thread from async code.
    pub fn write(
        &self,
        snapshot: &BufferSnapshot,
        classification: Classification,
    ) -> Result<PathBuf, PersistError> {
        if snapshot.events.is_empty() {
            return Err(PersistError::EmptySnapshot);
        }

        if self.min_free_mb > 0 {
            if let Some(available_mb) = disk::available_mb(self.session.dir()) {
                if available_mb < self.min_free_mb {
                    return Err(PersistError::DiskFull {
                        available_mb,
                        required_mb: self.min_free_mb,
                    });
                }
            }
        }

        let dir = self.session.ensure_class_dir(classification)?;
        let path = unique_path(&dir, &file_stem(snapshot));
        let contents = render_csv(snapshot, &self.header);

        // Atomic write: temp file + rename
        let tmp_path = path.with_extension("csv.tmp");
        if let Err(e) = std::fs::write(&tmp_path, contents.as_bytes()) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(PersistError::io(&tmp_path, e));
        }
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(PersistError::io(&path, e));
        }

        Ok(path)
    }
}

/// `<YYYYmmdd-HHMMSS of newest event>-<cycle>`
fn file_stem(snapshot: &BufferSnapshot) -> String {
    let newest = snapshot.newest_timestamp().unwrap_or(snapshot.captured_at);
    format!("{}-{:08}", newest.format("%Y%m%d-%H%M%S"), snapshot.cycle)
}

fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.csv"));
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|n| dir.join(format!("{stem}-{n}.csv")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(String::new, |v| format!("{v:.precision$}"))
}

/// Render a snapshot as CSV text.
pub fn render_csv(snapshot: &BufferSnapshot, header: &SnapshotHeader) -> String {
    let (direction, ratio, p_value) = match &snapshot.decision {
        Decision::Evaluated(flag) => (
            flag.direction.map_or_else(|| "none".to_string(), |d| d.to_string()),
            format!("{:.4}", flag.ratio),
            flag.p_value.map_or_else(String::new, |p| format!("{p:.3e}")),
        ),
        Decision::Suppressed(_) => ("suppressed".to_string(), String::new(), String::new()),
    };

    let baseline = fmt_opt(snapshot.baseline, 6);
    let mut out = String::with_capacity(96 * (snapshot.events.len() + 2));

    let _ = writeln!(
        out,
        "# version={},user_id={},buff_size={},window_size={},anomaly_threshold={},cycle={},baseline={},direction={},ratio={},p_value={}",
        SNAPSHOT_FORMAT_VERSION,
        header.user_id,
        header.buff_size,
        header.window_size,
        header.anomaly_threshold,
        snapshot.cycle,
        baseline,
        direction,
        ratio,
        p_value,
    );
    if let Decision::Suppressed(reason) = &snapshot.decision {
        let _ = writeln!(out, "# suppressed: {reason}");
    }
    out.push_str(CSV_HEADER);
    out.push('\n');

    for (i, e) in snapshot.events.iter().enumerate() {
        let win_f = snapshot.window_frequencies.get(i).copied().flatten();
        let _ = writeln!(
            out,
            "{},{},{},{},{:.2},{},{:.2},{},{}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            e.detector_event,
            e.detector_time_ms,
            e.adc,
            e.sipm_mv,
            e.dead_time_ms,
            e.temperature_c,
            fmt_opt(win_f, 6),
            baseline,
        );
    }

    out
}
