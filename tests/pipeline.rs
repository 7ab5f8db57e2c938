//! End-to-end pipeline coverage over the in-process stack

mod common;

use common::{collect_output_lines, wait_for_phase, TestCluster};
use gristmill::rpc::protocol::SubmitJobRequest;
use gristmill::rpc::CoordinatorApi;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_word_count_happy_path() {
    let cluster = TestCluster::start(1).await;
    let input = cluster.write_input("a.txt", "hello world hello").await;
    let client = cluster.client();
    let (shutdown, worker) = cluster.spawn_worker();

    let accepted = client
        .submit_job(SubmitJobRequest {
            input_files: vec![input],
            reduce_hint: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(accepted.reduce_count, 2);

    let status = wait_for_phase(&client, "done", DEADLINE).await;
    assert_eq!(status.map_completed, 1);
    assert_eq!(status.reduce_completed, 2);

    // The union across partitions is the full word count; the split
    // between the two outputs is whatever the key hash dictates.
    let lines = collect_output_lines(&cluster.layout(), 2).await;
    assert_eq!(lines, vec!["hello 2".to_string(), "world 1".to_string()]);
    for partition in 0..2 {
        assert!(
            tokio::fs::metadata(cluster.layout().output(partition))
                .await
                .is_ok(),
            "output {partition} must exist"
        );
    }

    let _ = shutdown.send(true);
    let _ = worker.await;
}

#[tokio::test]
async fn test_single_map_single_reduce() {
    let cluster = TestCluster::start(1).await;
    let input = cluster.write_input("a.txt", "one two two").await;
    let client = cluster.client();
    let (shutdown, worker) = cluster.spawn_worker();

    client
        .submit_job(SubmitJobRequest {
            input_files: vec![input],
            reduce_hint: Some(1),
        })
        .await
        .unwrap();
    wait_for_phase(&client, "done", DEADLINE).await;

    let lines = collect_output_lines(&cluster.layout(), 1).await;
    assert_eq!(lines, vec!["one 1".to_string(), "two 2".to_string()]);

    let _ = shutdown.send(true);
    let _ = worker.await;
}

#[tokio::test]
async fn test_many_maps_funnel_into_one_reducer() {
    let cluster = TestCluster::start(1).await;
    let mut inputs = Vec::new();
    for i in 0..5 {
        inputs.push(
            cluster
                .write_input(&format!("part-{i}.txt"), "common unique")
                .await,
        );
    }
    let client = cluster.client();
    let (shutdown, worker) = cluster.spawn_worker();

    client
        .submit_job(SubmitJobRequest {
            input_files: inputs,
            reduce_hint: Some(1),
        })
        .await
        .unwrap();
    let status = wait_for_phase(&client, "done", DEADLINE).await;
    assert_eq!(status.map_total, 5);
    assert_eq!(status.reduce_total, 1);

    let lines = collect_output_lines(&cluster.layout(), 1).await;
    assert_eq!(lines, vec!["common 5".to_string(), "unique 5".to_string()]);

    let _ = shutdown.send(true);
    let _ = worker.await;
}

#[tokio::test]
async fn test_dynamic_reducer_count_with_empty_worker_pool() {
    let cluster = TestCluster::start(1).await;
    let input = cluster.write_input("a.txt", "alpha beta gamma").await;
    let client = cluster.client();

    // No workers registered: the job is accepted anyway and the reducer
    // count falls back to the configured hint.
    let accepted = client
        .submit_job(SubmitJobRequest {
            input_files: vec![input],
            reduce_hint: None,
        })
        .await
        .unwrap();
    assert_eq!(accepted.reduce_count, cluster.config.worker_count_hint);

    let status = client.job_status().await.unwrap();
    assert_eq!(status.phase, "map");
    assert_eq!(status.reduce_total, cluster.config.worker_count_hint);
    assert_eq!(status.map_completed, 0);

    // Tasks sit idle until a worker shows up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.job_status().await.unwrap().map_completed, 0);

    let (shutdown, worker) = cluster.spawn_worker();
    wait_for_phase(&client, "done", DEADLINE).await;

    let lines = collect_output_lines(&cluster.layout(), accepted.reduce_count).await;
    assert_eq!(
        lines,
        vec![
            "alpha 1".to_string(),
            "beta 1".to_string(),
            "gamma 1".to_string(),
        ]
    );

    let _ = shutdown.send(true);
    let _ = worker.await;
}

#[tokio::test]
async fn test_concurrent_submission_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let input = cluster.write_input("a.txt", "word").await;
    let client = cluster.client();

    client
        .submit_job(SubmitJobRequest {
            input_files: vec![input.clone()],
            reduce_hint: Some(1),
        })
        .await
        .unwrap();
    let err = client
        .submit_job(SubmitJobRequest {
            input_files: vec![input],
            reduce_hint: Some(1),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("still active"));
}

#[tokio::test]
async fn test_worker_count_reflects_registrations() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client();

    let counts = client.worker_count().await.unwrap();
    assert_eq!(counts.total, 0);

    let (shutdown, worker) = cluster.spawn_worker();
    // Wait for the first heartbeat to register the worker.
    let started = std::time::Instant::now();
    loop {
        let counts = client.worker_count().await.unwrap();
        if counts.total == 1 {
            break;
        }
        assert!(started.elapsed() < DEADLINE, "worker never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = shutdown.send(true);
    let _ = worker.await;
}
