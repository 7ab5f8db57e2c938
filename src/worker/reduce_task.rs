//! Reduce task execution
//!
//! Merges every mapper's sorted run for one partition as streams, feeds
//! each key group to the user reduce function, and appends results to a
//! partial output that is atomically promoted on completion. Every K key
//! groups the reducer flushes and checkpoints `{LastKey, ProcessedKeys,
//! PartialBytes}`; a replacement reducer truncates the partial back to the
//! checkpointed length and skips groups up to the checkpointed key, so
//! every key is emitted exactly once no matter where the predecessor died.

use super::{IntermediateHeader, TaskError};
use crate::rpc::protocol::TaskAssignment;
use crate::storage::{self, ReduceCheckpoint, StorageLayout};
use crate::userfns::{KeyValue, ReduceFunction};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::watch;
use tracing::{debug, info};

/// Execute one reduce task to completion or cancellation.
pub async fn run(
    layout: &StorageLayout,
    assignment: &TaskAssignment,
    reduce_fn: &dyn ReduceFunction,
    checkpoint_stride: usize,
    cancel: &watch::Receiver<bool>,
) -> Result<(), TaskError> {
    let partition = assignment.index;
    let partial_path = layout.partial_output(partition);
    let checkpoint_path = layout.checkpoint(partition);

    let resume = resume_point(assignment, &partial_path, &checkpoint_path).await?;
    let (mut out, mut written_bytes, mut processed, skip_until) = match resume {
        Some(checkpoint) => {
            info!(
                "Reduce {} resuming after key {:?} ({} keys done)",
                partition, checkpoint.last_key, checkpoint.processed_keys
            );
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&partial_path)
                .await
                .map_err(|e| TaskError::io(&partial_path, e))?;
            // Drop whatever was appended after the checkpoint was taken.
            file.set_len(checkpoint.partial_bytes)
                .await
                .map_err(|e| TaskError::io(&partial_path, e))?;
            file.seek(SeekFrom::Start(checkpoint.partial_bytes))
                .await
                .map_err(|e| TaskError::io(&partial_path, e))?;
            (
                BufWriter::new(file),
                checkpoint.partial_bytes,
                checkpoint.processed_keys,
                Some(checkpoint.last_key),
            )
        }
        None => {
            // Fresh start overwrites any stale partial from a previous
            // attempt.
            let file = File::create(&partial_path)
                .await
                .map_err(|e| TaskError::io(&partial_path, e))?;
            (BufWriter::new(file), 0u64, 0u64, None)
        }
    };

    let mut readers = Vec::with_capacity(assignment.map_count as usize);
    for map_index in 0..assignment.map_count {
        let path = layout.intermediate(map_index, partition);
        readers.push(RecordReader::open(&path).await?);
    }
    let mut merge = KeyGroupMerge::new(readers).await?;

    let mut since_checkpoint = 0usize;
    while let Some((key, values)) = merge.next_group().await? {
        if *cancel.borrow() {
            // Committed intermediates and the checkpoint survive an abort;
            // the unpromoted partial does not.
            drop(out);
            let _ = fs::remove_file(&partial_path).await;
            return Err(TaskError::Cancelled);
        }
        if skip_until
            .as_deref()
            .is_some_and(|limit| key.as_str() <= limit)
        {
            continue;
        }

        let value = reduce_fn.reduce(&key, &values)?;
        let line = format!("{key} {value}\n");
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| TaskError::io(&partial_path, e))?;
        written_bytes += line.len() as u64;
        processed += 1;
        since_checkpoint += 1;

        if since_checkpoint >= checkpoint_stride {
            out.flush()
                .await
                .map_err(|e| TaskError::io(&partial_path, e))?;
            let checkpoint = ReduceCheckpoint {
                last_key: key.clone(),
                processed_keys: processed,
                partial_bytes: written_bytes,
            };
            storage::store_checkpoint(layout, &checkpoint_path, &checkpoint).await?;
            debug!(
                "Reduce {} checkpointed at key {:?} ({} keys)",
                partition, key, processed
            );
            since_checkpoint = 0;
        }
    }

    out.flush()
        .await
        .map_err(|e| TaskError::io(&partial_path, e))?;
    drop(out);
    layout
        .promote(&partial_path, &layout.output(partition))
        .await?;
    match fs::remove_file(&checkpoint_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Stale checkpoint not removed: {}", e),
    }
    info!("Reduce {} finalized {} keys", partition, processed);
    Ok(())
}

/// Decide whether to resume. The checkpoint is only honored when the
/// assignment carries it and the partial still covers the checkpointed
/// prefix; otherwise the reducer restarts from the beginning, which is
/// always correct.
async fn resume_point(
    assignment: &TaskAssignment,
    partial_path: &Path,
    checkpoint_path: &Path,
) -> Result<Option<ReduceCheckpoint>, TaskError> {
    if assignment.checkpoint_path.is_none() {
        return Ok(None);
    }
    let Some(checkpoint) = storage::load_checkpoint(checkpoint_path).await? else {
        return Ok(None);
    };
    match fs::metadata(partial_path).await {
        Ok(meta) if meta.len() >= checkpoint.partial_bytes => Ok(Some(checkpoint)),
        _ => Ok(None),
    }
}

/// Streaming reader over one intermediate file.
struct RecordReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    remaining: u64,
}

impl RecordReader {
    async fn open(path: &Path) -> Result<Self, TaskError> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskError::MissingInput {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(TaskError::io(path, e)),
        };
        let mut lines = BufReader::new(file).lines();
        let header_line = lines
            .next_line()
            .await
            .map_err(|e| TaskError::io(path, e))?
            .ok_or_else(|| TaskError::CorruptIntermediate {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            })?;
        let header: IntermediateHeader =
            serde_json::from_str(&header_line).map_err(|e| TaskError::CorruptIntermediate {
                path: path.to_path_buf(),
                reason: format!("bad header: {e}"),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            lines,
            remaining: header.records,
        })
    }

    async fn next(&mut self) -> Result<Option<KeyValue>, TaskError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| TaskError::io(&self.path, e))?
            .ok_or_else(|| TaskError::CorruptIntermediate {
                path: self.path.clone(),
                reason: "record stream truncated".to_string(),
            })?;
        let record =
            serde_json::from_str(&line).map_err(|e| TaskError::CorruptIntermediate {
                path: self.path.clone(),
                reason: format!("bad record: {e}"),
            })?;
        self.remaining -= 1;
        Ok(Some(record))
    }
}

struct HeapEntry {
    key: String,
    value: String,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source && self.value == other.value
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.value.cmp(&other.value))
    }
}

/// K-way merge of sorted runs into ordered key groups, holding one record
/// per source in memory.
struct KeyGroupMerge {
    readers: Vec<RecordReader>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl KeyGroupMerge {
    async fn new(mut readers: Vec<RecordReader>) -> Result<Self, TaskError> {
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (source, reader) in readers.iter_mut().enumerate() {
            if let Some(record) = reader.next().await? {
                heap.push(Reverse(HeapEntry {
                    key: record.key,
                    value: record.value,
                    source,
                }));
            }
        }
        Ok(Self { readers, heap })
    }

    /// Next key with all its values, in ascending key order.
    async fn next_group(&mut self) -> Result<Option<(String, Vec<String>)>, TaskError> {
        let Some(Reverse(first)) = self.heap.pop() else {
            return Ok(None);
        };
        let key = first.key;
        let mut values = vec![first.value];
        self.refill(first.source).await?;

        loop {
            let matches = self
                .heap
                .peek()
                .map(|Reverse(top)| top.key == key)
                .unwrap_or(false);
            if !matches {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                values.push(entry.value);
                self.refill(entry.source).await?;
            }
        }
        Ok(Some((key, values)))
    }

    async fn refill(&mut self, source: usize) -> Result<(), TaskError> {
        if let Some(record) = self.readers[source].next().await? {
            self.heap.push(Reverse(HeapEntry {
                key: record.key,
                value: record.value,
                source,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskKind;
    use crate::userfns::{MapFunction, WordCount};
    use crate::worker::map_task;
    use tempfile::TempDir;

    fn reduce_assignment(map_count: u32, with_checkpoint: Option<PathBuf>) -> TaskAssignment {
        TaskAssignment {
            job_id: "job-1".to_string(),
            kind: TaskKind::Reduce,
            index: 0,
            attempt: 1,
            input_path: None,
            map_count,
            reduce_count: 1,
            checkpoint_path: with_checkpoint,
        }
    }

    async fn write_inputs(dir: &TempDir, layout: &StorageLayout, files: &[(&str, &str)]) {
        let (_tx, cancel) = watch::channel(false);
        for (map_index, (name, contents)) in files.iter().enumerate() {
            let input = dir.path().join(name);
            fs::write(&input, contents).await.unwrap();
            let assignment = TaskAssignment {
                job_id: "job-1".to_string(),
                kind: TaskKind::Map,
                index: map_index as u32,
                attempt: 1,
                input_path: Some(input),
                map_count: files.len() as u32,
                reduce_count: 1,
                checkpoint_path: None,
            };
            map_task::run(layout, &assignment, &WordCount, &cancel)
                .await
                .unwrap();
        }
    }

    fn parse_output(raw: &str) -> Vec<(String, String)> {
        raw.lines()
            .map(|line| {
                let (key, value) = line.rsplit_once(' ').unwrap();
                (key.to_string(), value.to_string())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reduce_merges_all_mappers() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        write_inputs(&dir, &layout, &[("a.txt", "b a b"), ("b.txt", "a c")]).await;
        let (_tx, cancel) = watch::channel(false);

        run(&layout, &reduce_assignment(2, None), &WordCount, 100, &cancel)
            .await
            .unwrap();

        let raw = fs::read_to_string(layout.output(0)).await.unwrap();
        let groups = parse_output(&raw);
        assert_eq!(
            groups,
            vec![
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "1".to_string()),
            ]
        );
        assert!(fs::metadata(layout.partial_output(0)).await.is_err());
        assert!(fs::metadata(layout.checkpoint(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_resume_emits_each_key_once() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let words: Vec<String> = ('a'..='z').map(|c| c.to_string()).collect();
        let contents = words.join(" ");
        write_inputs(&dir, &layout, &[("a.txt", contents.as_str())]).await;

        // Reference run without interference.
        let (_tx, cancel) = watch::channel(false);
        run(&layout, &reduce_assignment(1, None), &WordCount, 100, &cancel)
            .await
            .unwrap();
        let expected = fs::read_to_string(layout.output(0)).await.unwrap();
        fs::remove_file(layout.output(0)).await.unwrap();

        // Simulate a crash mid-processing: run with a stride of 5, then
        // cut the partial back to the state the checkpoint describes plus
        // a torn, unflushed tail.
        let (_tx, cancel) = watch::channel(false);
        run(&layout, &reduce_assignment(1, None), &WordCount, 5, &cancel)
            .await
            .unwrap();
        fs::remove_file(layout.output(0)).await.unwrap();

        // Reconstruct a crashed attempt: the checkpoint says 10 keys are
        // durable; the partial holds those plus half a torn line.
        let done: Vec<&String> = words.iter().take(10).collect();
        let mut partial = String::new();
        for key in &done {
            partial.push_str(&format!("{key} 1\n"));
        }
        let partial_bytes = partial.len() as u64;
        partial.push_str("k ");
        fs::write(layout.partial_output(0), &partial).await.unwrap();
        let checkpoint = ReduceCheckpoint {
            last_key: "j".to_string(),
            processed_keys: 10,
            partial_bytes,
        };
        storage::store_checkpoint(&layout, &layout.checkpoint(0), &checkpoint)
            .await
            .unwrap();

        let (_tx, cancel) = watch::channel(false);
        run(
            &layout,
            &reduce_assignment(1, Some(layout.checkpoint(0))),
            &WordCount,
            100,
            &cancel,
        )
        .await
        .unwrap();

        let resumed = fs::read_to_string(layout.output(0)).await.unwrap();
        assert_eq!(resumed, expected, "resumed output must match a clean run");
        assert!(fs::metadata(layout.checkpoint(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_restarts_from_scratch() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        write_inputs(&dir, &layout, &[("a.txt", "x y z")]).await;

        fs::write(layout.checkpoint(0), b"{garbage").await.unwrap();
        fs::write(layout.partial_output(0), b"stale junk\n")
            .await
            .unwrap();

        let (_tx, cancel) = watch::channel(false);
        run(
            &layout,
            &reduce_assignment(1, Some(layout.checkpoint(0))),
            &WordCount,
            100,
            &cancel,
        )
        .await
        .unwrap();

        let raw = fs::read_to_string(layout.output(0)).await.unwrap();
        let groups = parse_output(&raw);
        assert_eq!(groups.len(), 3);
        assert!(!raw.contains("stale junk"));
    }

    #[tokio::test]
    async fn test_zero_size_intermediate_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        write_inputs(&dir, &layout, &[("a.txt", "x y")]).await;
        // Truncation after the map completed.
        fs::write(layout.intermediate(0, 0), b"").await.unwrap();

        let (_tx, cancel) = watch::channel(false);
        let err = run(&layout, &reduce_assignment(1, None), &WordCount, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::CorruptIntermediate { .. }));
    }

    #[tokio::test]
    async fn test_missing_intermediate_is_reported() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_root().await.unwrap();

        let (_tx, cancel) = watch::channel(false);
        let err = run(&layout, &reduce_assignment(1, None), &WordCount, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::MissingInput { .. }));
    }

    #[tokio::test]
    async fn test_user_function_failure_aborts_the_task() {
        use crate::error::CoordinatorError;

        struct Refusing;
        impl ReduceFunction for Refusing {
            fn reduce(&self, _key: &str, _values: &[String]) -> Result<String, CoordinatorError> {
                Err(CoordinatorError::task_execution(
                    "reduce rejected the key group",
                ))
            }
        }

        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        write_inputs(&dir, &layout, &[("a.txt", "x y")]).await;

        let (_tx, cancel) = watch::channel(false);
        let err = run(&layout, &reduce_assignment(1, None), &Refusing, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::Coordinator(CoordinatorError::TaskExecution { .. })
        ));
        assert!(fs::metadata(layout.output(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_keeps_checkpoint_drops_partial() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        write_inputs(&dir, &layout, &[("a.txt", "x y z")]).await;
        let checkpoint = ReduceCheckpoint {
            last_key: "x".to_string(),
            processed_keys: 1,
            partial_bytes: 4,
        };
        storage::store_checkpoint(&layout, &layout.checkpoint(0), &checkpoint)
            .await
            .unwrap();

        let (tx, cancel) = watch::channel(false);
        tx.send(true).unwrap();
        let err = run(&layout, &reduce_assignment(1, None), &WordCount, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(fs::metadata(layout.partial_output(0)).await.is_err());
        assert!(fs::metadata(layout.checkpoint(0)).await.is_ok());
    }
}
