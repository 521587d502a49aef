//! Whole-state snapshots with atomic file replacement.
//!
//! The engine persists after every state transition, so a crash at any point
//! leaves either the previous snapshot or the new one on disk, never a torn
//! write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use keel_core::{ProtectedPosition, StrategyId, StrategyRunState};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Everything the engine needs to resume after a restart.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PersistedState {
    pub run_states: HashMap<StrategyId, StrategyRunState>,
}

impl PersistedState {
    /// Protective order sets currently believed to rest on the exchange.
    pub fn protected_orders(&self) -> impl Iterator<Item = &ProtectedPosition> {
        self.run_states
            .values()
            .filter_map(|state| state.protected.as_ref())
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("atomic replace failed: {0}")]
    Replace(String),
}

/// Blocking snapshot storage. Async callers wrap these in `spawn_blocking`.
pub trait StateRepository: Send + Sync {
    fn load(&self) -> Result<PersistedState, PersistError>;
    fn save(&self, state: &PersistedState) -> Result<(), PersistError>;
}

/// JSON snapshot file, replaced atomically via a sibling temp file + rename.
pub struct JsonStateRepository {
    path: PathBuf,
}

impl JsonStateRepository {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateRepository for JsonStateRepository {
    fn load(&self) -> Result<PersistedState, PersistError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot yet, starting fresh");
                return Ok(PersistedState::default());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut file = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut file, state)?;
        file.flush()?;
        // The rename is what makes the snapshot atomic; the temp file lives
        // in the same directory so it stays on one filesystem.
        file.persist(&self.path)
            .map_err(|err| PersistError::Replace(err.to_string()))?;
        debug!(path = %self.path.display(), strategies = state.run_states.len(), "snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{StrategyPhase, TransactionId};
    use rust_decimal_macros::dec;

    fn sample_state() -> PersistedState {
        let mut state = PersistedState::default();
        let id = StrategyId::from("btc-breakout");
        let mut run = StrategyRunState::new(id.clone(), "BTC-PERPETUAL".into());
        run.phase = StrategyPhase::PositionOpen;
        run.protected = Some(ProtectedPosition {
            transaction: TransactionId::generate(),
            entry_id: "e-1".into(),
            stop_id: "s-1".into(),
            target_id: "t-1".into(),
            quantity: dec!(0.2),
        });
        state.run_states.insert(id, run);
        state
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStateRepository::new(dir.path().join("state.json"));
        let state = sample_state();
        repo.save(&state).unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.run_states.len(), 1);
        let run = &loaded.run_states[&StrategyId::from("btc-breakout")];
        assert_eq!(run.phase, StrategyPhase::PositionOpen);
        assert_eq!(loaded.protected_orders().count(), 1);
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStateRepository::new(dir.path().join("nope/state.json"));
        let loaded = repo.load().unwrap();
        assert!(loaded.run_states.is_empty());
    }

    #[test]
    fn save_creates_parent_directories_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStateRepository::new(dir.path().join("nested/deeper/state.json"));
        repo.save(&sample_state()).unwrap();
        repo.save(&PersistedState::default()).unwrap();
        assert!(repo.load().unwrap().run_states.is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let repo = JsonStateRepository::new(path);
        assert!(repo.load().is_err());
    }
}
