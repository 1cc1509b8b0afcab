//! Result log integration tests

use std::sync::{Arc, Barrier};
use std::thread;

use prunelab::collaborator::{AttackReport, EvaluationReport, TransferReport};
use prunelab::config::ExperimentConfig;
use prunelab::experiment::{ExperimentState, ResultLogger, ResultRecord, COLUMNS, NULL_SENTINEL};
use prunelab::path_codec::PathCodec;
use serde_json::{json, Map, Value};

fn params(name: &str) -> Map<String, Value> {
    json!({
        "name": name,
        "experiment_number": 0,
        "dataset": "CIFAR10",
        "model_type": "VGG",
        "prune_method": "L1",
        "prune_compression": 4,
        "resume": true,
        "skip_train": false,
        "save_one_checkpoint": true,
        "already_pruned": false,
        "already_quantized": false,
    })
    .as_object()
    .unwrap()
    .clone()
}

fn read_rows(logger: &ResultLogger) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(logger.path())
        .unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

#[test]
fn test_header_written_once() {
    let dir = tempfile::tempdir().unwrap();
    let logger = ResultLogger::new(dir.path().join("experiment_0").join("experiment_0_logs.csv"));

    logger.append(&params("a"), None, None, None).unwrap();
    logger.append(&params("b"), None, None, None).unwrap();

    let rows = read_rows(&logger);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], COLUMNS);
    assert_eq!(rows[1][1], "a");
    assert_eq!(rows[2][1], "b");
}

#[test]
fn test_schema_is_stable_across_outcomes() {
    let evaluation = EvaluationReport {
        top1: Some(0.9),
        flops: Some(1.5e6),
        ..EvaluationReport::default()
    };
    let attack = AttackReport {
        adv_acc1: Some(0.2),
        extra: json!({"runtime": 3}).as_object().unwrap().clone(),
        ..AttackReport::default()
    };
    let transfer = TransferReport {
        source_successes: 0,
        both_successes: 0,
    };

    let bare = ResultRecord::new(&params("x"), None, None, None);
    let full = ResultRecord::new(
        &params("x"),
        Some(&evaluation),
        Some(&attack),
        Some(&transfer),
    );

    assert_eq!(bare.cells().len(), COLUMNS.len());
    assert_eq!(full.cells().len(), COLUMNS.len());
    assert_eq!(bare.get("top1"), Some(&Value::Null));
    assert_eq!(full.get("top1"), Some(&json!(0.9)));
    assert_eq!(full.get("transfer_source_successes"), Some(&json!(0)));
    // Nothing fooled the source model, so there is no ratio.
    assert_eq!(full.get("transfer_success_ratio"), Some(&Value::Null));
    assert!(full.get("runtime").is_none());

    // Run flags are part of the row whatever the outcome.
    for record in [&bare, &full] {
        assert_eq!(record.get("resume"), Some(&json!(true)));
        assert_eq!(record.get("skip_train"), Some(&json!(false)));
        assert_eq!(record.get("save_one_checkpoint"), Some(&json!(true)));
        assert_eq!(record.get("already_pruned"), Some(&json!(false)));
        assert_eq!(record.get("already_quantized"), Some(&json!(false)));
    }
}

#[test]
fn test_every_config_field_has_a_column() {
    let dir = tempfile::tempdir().unwrap();
    let codec = PathCodec::new(dir.path());
    let config = ExperimentConfig::builder(0, "CIFAR10", "VGG")
        .prune("L1", 4)
        .finetune_epochs(2)
        .attack("pgd")
        .skip_train(true)
        .save_one_checkpoint(true)
        .seed(Some(7))
        .build()
        .unwrap();
    let state = ExperimentState::resolve(config, &codec).unwrap();

    let params = state.params();
    let missing: Vec<&String> = params
        .keys()
        .filter(|key| key.as_str() != "model_dir" && !COLUMNS.contains(&key.as_str()))
        .collect();
    assert!(missing.is_empty(), "params without a column: {missing:?}");

    let record = ResultRecord::new(&params, None, None, None);
    assert_eq!(record.get("skip_train"), Some(&json!(true)));
    assert_eq!(record.get("save_one_checkpoint"), Some(&json!(true)));
    assert_eq!(record.get("resume"), Some(&json!(false)));
}

#[test]
fn test_null_cells_use_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let logger = ResultLogger::new(dir.path().join("logs.csv"));
    logger.append(&Map::new(), None, None, None).unwrap();

    let rows = read_rows(&logger);
    let index = COLUMNS.iter().position(|c| *c == "top5").unwrap();
    assert_eq!(rows[1][index], NULL_SENTINEL);
}

#[test]
fn test_cells_with_commas_are_quoted() {
    let dir = tempfile::tempdir().unwrap();
    let logger = ResultLogger::new(dir.path().join("logs.csv"));
    let mut params = params("quoted");
    params.insert("attack_kwargs".to_string(), json!({"eps": 0.1, "norm": "inf"}));
    logger.append(&params, None, None, None).unwrap();

    let rows = read_rows(&logger);
    assert_eq!(rows[1].len(), COLUMNS.len());
    let index = COLUMNS.iter().position(|c| *c == "attack_kwargs").unwrap();
    assert_eq!(rows[1][index], r#"{"eps":0.1,"norm":"inf"}"#);
}

#[test]
fn test_concurrent_writers_share_one_header() {
    let dir = tempfile::tempdir().unwrap();
    let logger = Arc::new(ResultLogger::new(dir.path().join("logs.csv")));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let logger = Arc::clone(&logger);
            thread::spawn(move || {
                logger
                    .append(&params(&format!("run{i}")), None, None, None)
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let rows = read_rows(&logger);
    assert_eq!(rows.len(), 9);
    let headers = rows.iter().filter(|r| r[0] == "timestamp").count();
    assert_eq!(headers, 1);
    assert!(rows.iter().all(|r| r.len() == COLUMNS.len()));
}

#[test]
fn test_racing_first_writers_never_precede_header() {
    const ROUNDS: usize = 200;
    const WRITERS: usize = 8;

    let dir = tempfile::tempdir().unwrap();
    let header = COLUMNS.join(",");

    for round in 0..ROUNDS {
        let logger = Arc::new(ResultLogger::new(
            dir.path().join(format!("experiment_{round}_logs.csv")),
        ));
        let barrier = Arc::new(Barrier::new(WRITERS));

        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let logger = Arc::clone(&logger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    logger
                        .append(&params(&format!("run{i}")), None, None, None)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        assert_eq!(contents.lines().next(), Some(header.as_str()), "round {round}");
        let rows = read_rows(&logger);
        assert_eq!(rows.len(), WRITERS + 1, "round {round}");
        assert_eq!(rows.iter().filter(|r| r[0] == "timestamp").count(), 1);
    }

    // Staged copies never outlive a write.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "leftover staged files: {leftovers:?}");
}
