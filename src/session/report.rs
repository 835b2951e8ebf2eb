// Offline timing report over recorded ledgers

use serde::Serialize;
use std::path::Path;

use super::storage::{read_ledger, scan_ledgers, LedgerError, LedgerFile};

/// Timing diagnostics for one chunk ledger
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkTiming {
    pub name: String,
    pub frames: usize,
    pub loss: i64,
    pub first_frame: Option<u64>,
    pub last_frame: Option<u64>,
    /// Frame indices absent between first and last recorded frame
    pub missing_frames: Vec<u64>,
    pub mean_delta_secs: Option<f64>,
    pub max_delta_secs: Option<f64>,
    pub estimated_fps: Option<f64>,
}

impl ChunkTiming {
    pub fn from_ledger(name: impl Into<String>, ledger: &LedgerFile) -> Self {
        let indices: Vec<u64> = ledger.frames.keys().copied().collect();
        let missing_frames = indices
            .windows(2)
            .flat_map(|pair| (pair[0] + 1)..pair[1])
            .collect();

        // Deltas between consecutive recorded frames
        let deltas: Vec<f64> = ledger
            .frames
            .values()
            .zip(ledger.frames.values().skip(1))
            .map(|(a, b)| b - a)
            .collect();
        let mean_delta_secs = if deltas.is_empty() {
            None
        } else {
            Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
        };
        let max_delta_secs = deltas.iter().copied().reduce(f64::max);

        Self {
            name: name.into(),
            frames: ledger.frames.len(),
            loss: ledger.loss,
            first_frame: indices.first().copied(),
            last_frame: indices.last().copied(),
            missing_frames,
            mean_delta_secs,
            max_delta_secs,
            estimated_fps: ledger.estimated_framerate(),
        }
    }
}

/// Read every ledger in `dir` and summarize it
pub fn timing_report(dir: &Path) -> Result<Vec<ChunkTiming>, LedgerError> {
    scan_ledgers(dir)?
        .iter()
        .map(|path| {
            let ledger = read_ledger(path)?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(ChunkTiming::from_ledger(name, &ledger))
        })
        .collect()
}

fn fmt_opt(value: Option<f64>, scale: f64, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v * scale))
        .unwrap_or_else(|| "-".to_string())
}

/// Human-readable table of a timing report
pub fn format_report(report: &[ChunkTiming]) -> String {
    let mut out = String::new();
    out.push_str("chunk     frames   loss  missing  mean dt (ms)  max dt (ms)  fps\n");
    for chunk in report {
        out.push_str(&format!(
            "{:<8} {:>7} {:>6} {:>8} {:>13} {:>12} {:>6}\n",
            chunk.name,
            chunk.frames,
            chunk.loss,
            chunk.missing_frames.len(),
            fmt_opt(chunk.mean_delta_secs, 1000.0, 2),
            fmt_opt(chunk.max_delta_secs, 1000.0, 2),
            fmt_opt(chunk.estimated_fps, 1.0, 2),
        ));
    }
    let total_frames: usize = report.iter().map(|c| c.frames).sum();
    let total_loss: i64 = report.iter().map(|c| c.loss).sum();
    out.push_str(&format!(
        "{} chunk(s), {} frame(s), total loss {}\n",
        report.len(),
        total_frames,
        total_loss
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::write_ledger;
    use std::collections::BTreeMap;

    #[test]
    fn timing_reports_gaps_and_deltas() {
        let frames = BTreeMap::from([(10, 0.0), (11, 0.1), (14, 0.4), (15, 0.6)]);
        let timing = ChunkTiming::from_ledger("000010", &LedgerFile::new(frames, 1));

        assert_eq!(timing.frames, 4);
        assert_eq!(timing.first_frame, Some(10));
        assert_eq!(timing.last_frame, Some(15));
        assert_eq!(timing.missing_frames, vec![12, 13]);
        let max = timing.max_delta_secs.unwrap();
        assert!((max - 0.3).abs() < 1e-9, "max delta {}", max);
        let mean = timing.mean_delta_secs.unwrap();
        assert!((mean - 0.2).abs() < 1e-9, "mean delta {}", mean);
    }

    #[test]
    fn single_frame_has_no_deltas() {
        let timing =
            ChunkTiming::from_ledger("000000", &LedgerFile::new(BTreeMap::from([(0, 1.0)]), 49));
        assert_eq!(timing.mean_delta_secs, None);
        assert_eq!(timing.max_delta_secs, None);
        assert_eq!(timing.estimated_fps, None);
        assert!(timing.missing_frames.is_empty());
    }

    #[test]
    fn report_covers_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_ledger(
            &tmp.path().join("000000.cbor"),
            &LedgerFile::new(BTreeMap::from([(0, 1.0), (1, 2.0)]), 48),
        )
        .unwrap();
        write_ledger(
            &tmp.path().join("000050.cbor"),
            &LedgerFile::new(BTreeMap::from([(50, 9.0)]), 49),
        )
        .unwrap();

        let report = timing_report(tmp.path()).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].name, "000000");
        assert_eq!(report[1].name, "000050");

        let table = format_report(&report);
        assert!(table.contains("2 chunk(s), 3 frame(s), total loss 97"));
    }
}
