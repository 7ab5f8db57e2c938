//! Snapshot and restore of the replicated state
//!
//! Snapshots bound log growth: the consensus module captures the full
//! state, truncates the log, and replays only later entries. Encoding is
//! JSON over ordered maps, so the same state always produces the same
//! bytes.

use super::machine::MachineState;
use crate::error::CoordinatorError;
use std::path::Path;
use tokio::fs;

/// Serialize the full state.
pub fn encode(state: &MachineState) -> Result<Vec<u8>, CoordinatorError> {
    Ok(serde_json::to_vec(state)?)
}

/// Rebuild state from an [`encode`]d snapshot.
pub fn decode(bytes: &[u8]) -> Result<MachineState, CoordinatorError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Persist a snapshot atomically.
pub async fn save(path: &Path, state: &MachineState) -> Result<(), CoordinatorError> {
    let bytes = encode(state)?;
    let staging = crate::storage::staging_path(path);
    fs::write(&staging, &bytes)
        .await
        .map_err(|e| CoordinatorError::storage(&staging, e))?;
    fs::rename(&staging, path)
        .await
        .map_err(|e| CoordinatorError::storage(path, e))
}

/// Load a previously saved snapshot.
pub async fn load(path: &Path) -> Result<MachineState, CoordinatorError> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| CoordinatorError::storage(path, e))?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::command::Command;
    use crate::state::types::{JobId, WorkerId};
    use std::path::PathBuf;

    fn populated_state() -> MachineState {
        let mut state = MachineState::new();
        state.apply(
            &Command::RegisterWorker {
                worker: WorkerId::from_string("worker-a".to_string()),
                addr: "127.0.0.1:9000".to_string(),
                observed_at_ms: 500,
            },
            1,
        );
        state.apply(
            &Command::SubmitJob {
                job_id: JobId::from_string("job-snap".to_string()),
                input_files: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
                reduce_count: 3,
                max_task_attempts: 5,
                submitted_at_ms: 1_000,
            },
            2,
        );
        state
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let state = populated_state();
        let restored = decode(&encode(&state).unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_snapshot_is_byte_stable() {
        let state = populated_state();
        let first = encode(&state).unwrap();
        let second = encode(&decode(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.snapshot.json");
        let state = populated_state();
        save(&path, &state).await.unwrap();
        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"{broken").is_err());
    }
}
