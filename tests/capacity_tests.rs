//! Admission, distribution and recovery behaviour with real worker
//! subprocesses.

mod test_harness;

use std::collections::HashSet;
use std::time::Duration;

use test_harness::{assert_eventually, test_config, Engine, ECHO_WORKER, SLOW_WORKER};
use tokio::task::LocalSet;
use tokio::time::timeout;

#[tokio::test]
async fn six_jobs_over_two_workers_complete_exactly_once() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let config = test_config(2, ECHO_WORKER);
            let engine = Engine::start(&config);
            for text in ["a", "b", "c", "d", "e", "f"] {
                engine.capacity.submit_input(text.to_string()).await;
                assert!(engine.capacity.outstanding() <= engine.capacity.size());
            }
            let lines = engine.finish().await;

            assert_eq!(lines.len(), 6, "every job appears exactly once: {lines:?}");
            let unique: HashSet<String> = lines.iter().cloned().collect();
            let expected: HashSet<String> =
                ["a", "b", "c", "d", "e", "f"].iter().map(|s| s.to_string()).collect();
            assert_eq!(unique, expected);
        })
        .await;
}

#[tokio::test]
async fn round_robin_gives_every_worker_one_job_before_any_gets_two() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let config = test_config(3, SLOW_WORKER);
            let engine = Engine::start(&config);
            for text in ["one", "two", "three", "four"] {
                engine.capacity.submit_input(text.to_string()).await;
            }

            // Workers hold each job for a while, so occupancy right after
            // submission reflects the dispatch order: w1 w2 w3 w1.
            let occupancy: Vec<usize> = engine
                .pool
                .links()
                .iter()
                .map(|link| link.fifo_len())
                .collect();
            assert_eq!(occupancy, vec![2, 1, 1]);

            let lines = engine.finish().await;
            assert_eq!(lines.len(), 4);
        })
        .await;
}

#[tokio::test]
async fn admission_suspends_once_capacity_is_reached() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut config = test_config(2, SLOW_WORKER);
            config.fifo_depth = 1;
            let engine = Engine::start(&config);
            assert_eq!(engine.capacity.size(), 2);

            engine.capacity.submit_input("a".to_string()).await;
            engine.capacity.submit_input("b".to_string()).await;
            assert_eq!(engine.capacity.outstanding(), 2);

            // The third submission has to wait for a completion; it is
            // abandoned here, so only the first two ever run.
            let waited = timeout(
                Duration::from_millis(100),
                engine.capacity.submit_input("c".to_string()),
            )
            .await;
            assert!(waited.is_err(), "admission should suspend at capacity");

            let lines = engine.finish().await;
            assert_eq!(
                lines.iter().cloned().collect::<HashSet<String>>(),
                HashSet::from(["a".to_string(), "b".to_string()])
            );
        })
        .await;
}

#[tokio::test]
async fn crashed_worker_has_its_queue_resent_without_duplicates() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("crashed-once");
            // First incarnation swallows a command and dies; every later one
            // echoes normally.
            let script = format!(
                "if [ ! -e {marker} ]; then touch {marker}; read line; exit 1; \
                 else while read line; do echo \"$line\"; done; fi",
                marker = marker.display()
            );
            let config = test_config(1, &script);
            let engine = Engine::start(&config);
            let link = engine.pool.links()[0].clone();

            engine.capacity.submit_input("precious".to_string()).await;
            let lines = engine.finish().await;

            assert_eq!(lines, vec!["precious".to_string()]);
            assert!(link.resends() >= 1, "the crash must have forced a resend");
        })
        .await;
}

#[tokio::test]
async fn all_done_waits_for_input_close_and_stays_latched() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let config = test_config(1, ECHO_WORKER);
            let engine = Engine::start(&config);
            let capacity = engine.capacity.clone();
            assert!(!capacity.all_done(), "nothing submitted, input still open");

            capacity.submit_input("x".to_string()).await;
            assert_eventually(Duration::from_secs(10), "job completion", || {
                capacity.outstanding() == 0
            })
            .await;
            assert!(
                !capacity.all_done(),
                "zero outstanding is not done while input is open"
            );

            let lines = engine.finish().await;
            assert_eq!(lines, vec!["x".to_string()]);
            assert!(capacity.all_done(), "latched after input close and drain");
            assert!(capacity.all_done(), "and it stays latched");
        })
        .await;
}

#[tokio::test]
async fn unmatched_result_lines_are_discarded() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // This worker answers every command with noise first, then the
            // echo; the noise must never complete anything.
            let script = "while read line; do echo \"not-what-you-sent\"; echo \"$line\"; done";
            let config = test_config(1, script);
            let engine = Engine::start(&config);
            engine.capacity.submit_input("real".to_string()).await;
            let lines = engine.finish().await;
            assert_eq!(lines, vec!["real".to_string()]);
        })
        .await;
}
