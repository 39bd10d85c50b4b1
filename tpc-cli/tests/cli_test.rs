use std::fs;
use std::path::Path;
use std::sync::Arc;

use insta_cmd::assert_cmd_snapshot;
use tpc_log::{Log, LogConfig, RecordType, WriteMode};
use tpc_transaction::journal::Journal;
use tpc_transaction::record::CoordinatorRecord;
use tpc_transaction::{GlobalTid, Outcome};

mod common;

/// Writes one finished and one unfinished transaction to `coordinator`.
fn write_log(dir: &Path) {
    let log = Arc::new(Log::open(&LogConfig::with_base_dir(dir), "coordinator").unwrap());
    let journal = Journal::new(log.clone());
    let done = GlobalTid::generate();
    let pending = GlobalTid::generate();
    for record in [
        CoordinatorRecord::Decided {
            global_tid: done.clone(),
            outcome: Outcome::Committed,
            participants: vec!["db".to_string()],
        },
        CoordinatorRecord::Decided {
            global_tid: pending.clone(),
            outcome: Outcome::RolledBack,
            participants: vec!["db".to_string(), "queue".to_string()],
        },
        CoordinatorRecord::Completed {
            global_tid: done.clone(),
            heuristic: None,
        },
    ] {
        journal
            .write(&record, RecordType::Normal, WriteMode::Buffered)
            .unwrap();
    }
    log.write_restart(b"\x01\x02").unwrap();
    log.close(false).unwrap();
}

#[test]
fn test_cli_help() {
    let mut cmd = common::run_cli();
    assert_cmd_snapshot!(cmd.arg("--help"));
}

#[test]
fn test_dump() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path());
    let _guard = common::setup(dir.path());
    let mut cmd = common::run_cli();
    assert_cmd_snapshot!(cmd.arg("dump").arg(dir.path()));
}

#[test]
fn test_dump_descending() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path());
    let _guard = common::setup(dir.path());
    let mut cmd = common::run_cli();
    assert_cmd_snapshot!(
        cmd.args(["dump", "--descending"])
            .arg(dir.path())
            .arg("coordinator")
    );
}

#[test]
fn test_in_doubt() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path());
    let _guard = common::setup(dir.path());
    let mut cmd = common::run_cli();
    assert_cmd_snapshot!(cmd.arg("in-doubt").arg(dir.path()));
}

#[test]
fn test_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path());
    let _guard = common::setup(dir.path());
    let mut cmd = common::run_cli();
    assert_cmd_snapshot!(cmd.arg("restart").arg(dir.path()));
}

#[test]
fn test_inspecting_leaves_log_untouched() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path());
    let control = dir.path().join("coordinator").join("control");
    let before = fs::read(&control).unwrap();

    for command in ["dump", "restart", "in-doubt"] {
        let output = common::run_cli()
            .arg(command)
            .arg(dir.path())
            .output()
            .unwrap();
        assert!(output.status.success(), "{command}");
    }
    assert_eq!(fs::read(&control).unwrap(), before);
    assert!(!dir.path().join("coordinator").join("control.tmp").exists());
}

#[test]
fn test_missing_log_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = common::run_cli()
        .args(["dump", "--verbose"])
        .arg(dir.path())
        .arg("absent")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!dir.path().join("absent").exists());
}
