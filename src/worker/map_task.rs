//! Map task execution
//!
//! Reads the assigned input file, runs the user map function, partitions
//! the pairs by key hash, and publishes one sorted intermediate file per
//! partition. Each file appears atomically via rename, so a crash at any
//! point leaves either nothing or a complete file, and the failure
//! analyzer can classify the attempt from what is on disk.

use super::{partition_for_key, IntermediateHeader, TaskError};
use crate::error::CoordinatorError;
use crate::rpc::protocol::TaskAssignment;
use crate::storage::StorageLayout;
use crate::userfns::{KeyValue, MapFunction};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::watch;
use tracing::debug;

/// Execute one map task to completion or cancellation.
pub async fn run(
    layout: &StorageLayout,
    assignment: &TaskAssignment,
    map_fn: &dyn MapFunction,
    cancel: &watch::Receiver<bool>,
) -> Result<(), TaskError> {
    let input = assignment
        .input_path
        .as_ref()
        .ok_or_else(|| CoordinatorError::task_execution("map assignment carries no input path"))?;

    let contents = match fs::read_to_string(input).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TaskError::MissingInput {
                path: input.clone(),
            })
        }
        Err(e) => return Err(TaskError::io(input, e)),
    };

    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string());
    let pairs = map_fn.map(&file_name, &contents)?;

    let reduce_count = assignment.reduce_count.max(1);
    let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); reduce_count as usize];
    for pair in pairs {
        let partition = partition_for_key(&pair.key, reduce_count) as usize;
        buckets[partition].push(pair);
    }

    for (partition, mut bucket) in buckets.into_iter().enumerate() {
        if *cancel.borrow() {
            return Err(TaskError::Cancelled);
        }
        // Sorted runs let reducers merge all mapper outputs as streams.
        bucket.sort();
        let target = layout.intermediate(assignment.index, partition as u32);
        write_partition(layout, &target, assignment.attempt, &bucket).await?;
        debug!(
            "Map {} wrote {} records for partition {}",
            assignment.index,
            bucket.len(),
            partition
        );
    }
    Ok(())
}

async fn write_partition(
    layout: &StorageLayout,
    target: &std::path::Path,
    attempt: u32,
    records: &[KeyValue],
) -> Result<(), TaskError> {
    let header = IntermediateHeader {
        records: records.len() as u64,
    };
    let mut body = serde_json::to_string(&header).map_err(CoordinatorError::from)?;
    body.push('\n');
    for record in records {
        body.push_str(&serde_json::to_string(record).map_err(CoordinatorError::from)?);
        body.push('\n');
    }

    // Attempt-tagged staging name: two attempts racing on the same task
    // never interleave writes, and the last rename wins with identical
    // content because the user map is deterministic.
    let staging = PathBuf::from(format!("{}.{}.tmp", target.display(), attempt));
    fs::write(&staging, body)
        .await
        .map_err(|e| TaskError::io(&staging, e))?;
    layout.promote(&staging, target).await?;
    Ok(())
}
