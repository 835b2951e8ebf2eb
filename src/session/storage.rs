// Timestamp ledger files: one CBOR map per chunk

use serde_cbor::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Extension of ledger files, next to the chunk video of the same basename
pub const LEDGER_EXTENSION: &str = "cbor";

/// Reserved ledger key carrying the chunk's frame loss
pub const LOSS_KEY: &str = "loss";

/// Error type for ledger persistence
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to write ledger {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read ledger {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CBOR error in {path:?}: {source}")]
    Cbor {
        path: PathBuf,
        #[source]
        source: serde_cbor::Error,
    },

    #[error("malformed ledger {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Per-chunk frame timestamps plus the loss diagnostic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFile {
    /// Global frame index -> arrival time (seconds since the Unix epoch)
    pub frames: BTreeMap<u64, f64>,
    /// `expected_frames - frames recorded`, may be negative
    pub loss: i64,
}

impl LedgerFile {
    pub fn new(frames: BTreeMap<u64, f64>, loss: i64) -> Self {
        Self { frames, loss }
    }

    pub fn first_frame(&self) -> Option<(u64, f64)> {
        self.frames.iter().next().map(|(i, t)| (*i, *t))
    }

    pub fn last_frame(&self) -> Option<(u64, f64)> {
        self.frames.iter().next_back().map(|(i, t)| (*i, *t))
    }

    /// Frames over the span between earliest and latest arrival.
    ///
    /// None with fewer than two frames or a zero span.
    pub fn estimated_framerate(&self) -> Option<f64> {
        if self.frames.len() < 2 {
            return None;
        }
        let (t0, t1) = self.frames.values().fold((f64::MAX, f64::MIN), |(lo, hi), t| {
            (lo.min(*t), hi.max(*t))
        });
        let span = t1 - t0;
        if span <= 0.0 {
            return None;
        }
        Some(self.frames.len() as f64 / span)
    }

    fn to_value(&self) -> Value {
        let mut map: BTreeMap<Value, Value> = self
            .frames
            .iter()
            .map(|(index, t)| (Value::Integer(*index as i128), Value::Float(*t)))
            .collect();
        map.insert(
            Value::Text(LOSS_KEY.to_string()),
            Value::Integer(self.loss as i128),
        );
        Value::Map(map)
    }

    fn from_value(value: Value, path: &Path) -> Result<Self, LedgerError> {
        let malformed = |reason: String| LedgerError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let Value::Map(map) = value else {
            return Err(malformed("top level is not a map".into()));
        };

        let mut ledger = LedgerFile::default();
        let mut has_loss = false;
        for (key, value) in map {
            match (key, value) {
                (Value::Text(k), Value::Integer(loss)) if k == LOSS_KEY => {
                    ledger.loss = i64::try_from(loss)
                        .map_err(|_| malformed(format!("loss {} out of range", loss)))?;
                    has_loss = true;
                }
                (Value::Integer(index), Value::Float(t)) => {
                    let index = u64::try_from(index)
                        .map_err(|_| malformed(format!("frame index {} out of range", index)))?;
                    ledger.frames.insert(index, t);
                }
                (key, _) => {
                    return Err(malformed(format!("unexpected entry {:?}", key)));
                }
            }
        }

        if !has_loss {
            return Err(malformed(format!("missing \"{}\" entry", LOSS_KEY)));
        }
        Ok(ledger)
    }
}

/// Serialize and write a ledger with a single write call
pub fn write_ledger(path: &Path, ledger: &LedgerFile) -> Result<(), LedgerError> {
    let bytes = serde_cbor::to_vec(&ledger.to_value()).map_err(|source| LedgerError::Cbor {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, bytes).map_err(|source| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_ledger(path: &Path) -> Result<LedgerFile, LedgerError> {
    let bytes = std::fs::read(path).map_err(|source| LedgerError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_cbor::from_slice(&bytes).map_err(|source| LedgerError::Cbor {
        path: path.to_path_buf(),
        source,
    })?;
    LedgerFile::from_value(value, path)
}

/// Ledger files in `dir`, sorted by name (and therefore by first frame)
pub fn scan_ledgers(dir: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let read_err = |source| LedgerError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(LEDGER_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
