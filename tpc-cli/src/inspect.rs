use std::io::Write;
use std::sync::Arc;

use miette::{IntoDiagnostic, Result};
use tpc_log::{Log, LogEntry, LogRecord, Lsn, RecordType};
use tpc_transaction::journal::Journal;
use tpc_transaction::record::CoordinatorRecord;
use tpc_transaction::recovery;

fn type_name(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Normal => "normal",
        RecordType::KeypointStart => "keypoint-start",
        RecordType::KeypointEnd => "keypoint-end",
        RecordType::Rewrite => "rewrite",
        RecordType::Link => "link",
    }
}

fn describe(entry: &LogEntry) -> String {
    if !matches!(entry.record_type, RecordType::Normal | RecordType::Rewrite) {
        return String::new();
    }
    match CoordinatorRecord::from_bytes(&entry.data) {
        Ok(CoordinatorRecord::Prepared {
            global_tid,
            participants,
        }) => format!("prepared {global_tid} [{}]", participants.join(", ")),
        Ok(CoordinatorRecord::Decided {
            global_tid,
            outcome,
            participants,
        }) => format!("{outcome} {global_tid} [{}]", participants.join(", ")),
        Ok(CoordinatorRecord::Completed {
            global_tid,
            heuristic: Some(kind),
        }) => format!("completed {global_tid} heuristic {kind}"),
        Ok(CoordinatorRecord::Completed { global_tid, .. }) => format!("completed {global_tid}"),
        Err(_) => format!("{} bytes", entry.data.len()),
    }
}

pub fn dump(log: &Log, descending: bool, out: &mut impl Write) -> Result<()> {
    let control = log.control();
    writeln!(
        out,
        "log {}: tail {} head {} next {}",
        log.name(),
        control.tail,
        control.head,
        control.next
    )
    .into_diagnostic()?;

    let (start, end) = if descending {
        (Lsn::HEAD, Lsn::TAIL)
    } else {
        (Lsn::TAIL, Lsn::HEAD)
    };
    let mut count = 0usize;
    for entry in log.entries(start, end).into_diagnostic()? {
        let entry = entry.into_diagnostic()?;
        writeln!(
            out,
            "{:<12} {:<15} {}",
            entry.lsn.to_string(),
            type_name(entry.record_type),
            describe(&entry)
        )
        .into_diagnostic()?;
        count += 1;
    }
    writeln!(out, "{count} records").into_diagnostic()
}

pub fn restart(log: &Log, out: &mut impl Write) -> Result<()> {
    match log.read_restart().into_diagnostic()? {
        None => writeln!(out, "no restart data"),
        Some(data) => {
            let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
            writeln!(out, "{} bytes: {hex}", data.len())
        }
    }
    .into_diagnostic()
}

pub fn in_doubt(log: Log, out: &mut impl Write) -> Result<()> {
    let journal = Journal::new(Arc::new(log));
    let transactions = recovery::scan(&journal).into_diagnostic()?;
    if transactions.is_empty() {
        return writeln!(out, "no transactions to recover").into_diagnostic();
    }
    for transaction in transactions {
        let state = match transaction.decision {
            Some(outcome) => outcome.to_string(),
            None => "in_doubt".to_string(),
        };
        writeln!(
            out,
            "{} {state} [{}]",
            transaction.global_tid,
            transaction.participants.join(", ")
        )
        .into_diagnostic()?;
    }
    Ok(())
}
