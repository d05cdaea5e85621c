//! End-to-end flow: tokens through iteration, dispatch, retry and an
//! asynchronous activity, observed through the monitor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_core::activity::{Activity, ActivityCallback, DataMap};
use weft_core::dispatch::{DispatchOutput, DispatchStack, DispatchUp};
use weft_core::iteration::{IterationStrategy, IterationStrategyStack};
use weft_core::monitor::{MonitorMessage, MonitorObserver};
use weft_core::processor::Processor;
use weft_observe::tracing_setup::init_test_tracing;
use weft_types::config::EngineConfig;
use weft_types::error::ObserverError;
use weft_types::job::{DataRef, OwningProcess};

/// Replies from a spawned task; the first call for every input set fails.
#[derive(Default)]
struct Remote {
    seen: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl Activity for Remote {
    fn name(&self) -> &str {
        "remote"
    }

    fn invoke(&self, inputs: DataMap, callback: ActivityCallback) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key: Vec<&str> = inputs.values().map(DataRef::as_str).collect();
        let key = key.join("+");
        let first_try = self.seen.lock().unwrap().insert(key.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if first_try {
                callback.fail("connection reset", None);
            } else {
                let mut outputs = DataMap::new();
                outputs.insert("out".to_string(), DataRef::new(key));
                callback.receive_result(outputs, vec![]);
            }
        });
    }
}

#[derive(Default)]
struct Kinds(Mutex<Vec<&'static str>>);

impl MonitorObserver for Kinds {
    fn notify(&self, message: &MonitorMessage) -> Result<(), ObserverError> {
        let kind = match message {
            MonitorMessage::Register { .. } => "register",
            MonitorMessage::AddProperties { .. } => "add_properties",
            MonitorMessage::Deregister { .. } => "deregister",
        };
        self.0.lock().unwrap().push(kind);
        Ok(())
    }
}

const CONFIG: &str = r#"
[parallelize]
maxJobs = 2

[retry]
maxRetries = 1
initialDelay = 5
maxDelay = 20
"#;

async fn collect_until_final(rx: &mut DispatchOutput) -> Vec<DispatchUp> {
    let mut out = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for dispatch output")
            .expect("dispatch output closed");
        let done = matches!(&message, DispatchUp::ResultCompletion(c) if c.is_final());
        out.push(message);
        if done {
            return out;
        }
    }
}

fn result_values(out: &[DispatchUp]) -> Vec<(Vec<usize>, String)> {
    let mut values: Vec<(Vec<usize>, String)> = out
        .iter()
        .filter_map(|m| match m {
            DispatchUp::Result(r) => Some((r.index.clone(), r.data["out"].to_string())),
            _ => None,
        })
        .collect();
    values.sort();
    values
}

#[tokio::test]
async fn cross_product_runs_every_combination_with_retries() {
    init_test_tracing();
    let config = EngineConfig::from_toml_str(CONFIG).unwrap();
    let (dispatch, mut rx) = DispatchStack::standard(&config).unwrap();
    let monitor = dispatch.monitor().unwrap().clone();
    let kinds = Arc::new(Kinds::default());
    monitor.subscribe(kinds.clone());

    let remote = Arc::new(Remote::default());
    let processor = Processor::new(
        "p1",
        IterationStrategyStack::single(IterationStrategy::cross_product([("x", 0), ("y", 0)])),
        dispatch,
        vec![remote.clone() as Arc<dyn Activity>],
    );
    let process = OwningProcess::new(["df0", "p1"]);

    for i in 0..2 {
        processor
            .receive_data("x", &process, &[i], DataRef::new(format!("x{i}")))
            .unwrap();
        processor
            .receive_data("y", &process, &[i], DataRef::new(format!("y{i}")))
            .unwrap();
    }
    processor.receive_completion("x", &process, &[]).unwrap();
    processor.receive_completion("y", &process, &[]).unwrap();

    let out = collect_until_final(&mut rx).await;

    assert!(out.iter().all(|m| !matches!(m, DispatchUp::Error(_))));
    assert_eq!(
        result_values(&out),
        vec![
            (vec![0, 0], "x0+y0".to_string()),
            (vec![0, 1], "x0+y1".to_string()),
            (vec![1, 0], "x1+y0".to_string()),
            (vec![1, 1], "x1+y1".to_string()),
        ]
    );
    assert_eq!(remote.calls.load(Ordering::SeqCst), 8);
    assert_eq!(*kinds.0.lock().unwrap(), vec!["register", "deregister"]);
    assert!(monitor.live_nodes().is_empty());
}

#[tokio::test]
async fn staged_iteration_feeds_dot_output_into_cross() {
    init_test_tracing();
    let config = EngineConfig::from_toml_str("[retry]\nmaxRetries = 1\ninitialDelay = 1\nmaxDelay = 1\n").unwrap();
    let (dispatch, mut rx) = DispatchStack::standard(&config).unwrap();

    let mut iteration =
        IterationStrategyStack::single(IterationStrategy::dot_product([("x", 0), ("y", 0)]));
    iteration.push_stage(IterationStrategy::cross_product([("x", 0), ("y", 0)]));

    let processor = Processor::new(
        "p2",
        iteration,
        dispatch,
        vec![Arc::new(Remote::default()) as Arc<dyn Activity>],
    );
    let process = OwningProcess::new(["df0", "p2"]);

    let depths = [("x".to_string(), 1), ("y".to_string(), 1)].into_iter().collect();
    assert_eq!(processor.iteration_depth(&depths).unwrap(), 2);

    for i in 0..2 {
        processor
            .receive_data("x", &process, &[i], DataRef::new(format!("x{i}")))
            .unwrap();
        processor
            .receive_data("y", &process, &[i], DataRef::new(format!("y{i}")))
            .unwrap();
    }
    processor.receive_completion("x", &process, &[]).unwrap();
    processor.receive_completion("y", &process, &[]).unwrap();

    let out = collect_until_final(&mut rx).await;
    assert_eq!(
        result_values(&out),
        vec![
            (vec![0, 0], "x0+y0".to_string()),
            (vec![0, 1], "x0+y1".to_string()),
            (vec![1, 0], "x1+y0".to_string()),
            (vec![1, 1], "x1+y1".to_string()),
        ]
    );
}

/// Answers on the calling thread with its inputs joined.
struct Concat;

impl Activity for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn invoke(&self, inputs: DataMap, callback: ActivityCallback) {
        let joined: Vec<&str> = inputs.values().map(DataRef::as_str).collect();
        let mut outputs = DataMap::new();
        outputs.insert("out".to_string(), DataRef::new(joined.join("+")));
        callback.receive_result(outputs, vec![]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ports_close_every_process_once() {
    init_test_tracing();
    const ROUNDS: usize = 100;
    const TOKENS: usize = 4;

    let (dispatch, mut rx) = DispatchStack::standard(&EngineConfig::default()).unwrap();
    let monitor = dispatch.monitor().unwrap().clone();
    let kinds = Arc::new(Kinds::default());
    monitor.subscribe(kinds.clone());

    let processor = Arc::new(Processor::new(
        "p3",
        IterationStrategyStack::single(IterationStrategy::dot_product([("a", 0), ("b", 0)])),
        dispatch.clone(),
        vec![Arc::new(Concat) as Arc<dyn Activity>],
    ));

    for round in 0..ROUNDS {
        let process = OwningProcess::new(["df0".to_string(), "p3".to_string(), round.to_string()]);
        let feeders: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|port| {
                let processor = Arc::clone(&processor);
                let process = process.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..TOKENS {
                        processor
                            .receive_data(port, &process, &[i], DataRef::new(format!("{port}{i}")))
                            .unwrap();
                    }
                    processor.receive_completion(port, &process, &[]).unwrap();
                })
            })
            .collect();
        for feeder in feeders {
            feeder.await.unwrap();
        }

        let out = collect_until_final(&mut rx).await;
        assert_eq!(result_values(&out).len(), TOKENS, "round {round}");
        assert!(dispatch.is_finished(&process));
        assert_eq!(dispatch.live_processes(), 0, "round {round}");
    }

    assert!(monitor.live_nodes().is_empty());
    let kinds = kinds.0.lock().unwrap();
    assert_eq!(kinds.iter().filter(|k| **k == "register").count(), ROUNDS);
    assert_eq!(kinds.iter().filter(|k| **k == "deregister").count(), ROUNDS);
}
