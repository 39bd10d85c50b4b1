use std::fs;
use std::sync::Arc;

use temp_dir::TempDir;
use tpc_transaction::xa::{TMENDRSCAN, TMNOFLAGS, TMSTARTRSCAN};
use tpc_transaction::{
    HeuristicKind, HeuristicOutcome, ParticipantError, Status, TransactionService, Vote,
    XaError, XaVote, Xid,
};

mod common;

use common::{Call, MockParticipant, service_config, start_service, start_with};

const FORMAT_ID: i32 = 0x4a54_4131;

fn xid(n: u8) -> Xid {
    Xid::new(FORMAT_ID, format!("gtrid-{n}"), vec![n])
}

/// Imports `xid`, enlists `participants` and ends the work association.
fn import_with(service: &TransactionService, xid: &Xid, participants: &[Arc<MockParticipant>]) {
    let local_tid = service.xa().import(xid, None).unwrap();
    let coordinator = service.coordinator(local_tid).unwrap();
    assert!(coordinator.is_subordinate());
    for p in participants {
        coordinator.register_resource(p.clone()).unwrap();
    }
    service.xa().release(xid).unwrap();
}

#[test]
fn test_two_phase_commit_of_imported_branch() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let xa = service.xa();
    let p1 = MockParticipant::new("p1").shared();
    let p2 = MockParticipant::new("p2").shared();
    let xid = xid(1);
    import_with(&service, &xid, &[p1.clone(), p2.clone()]);

    assert_eq!(xa.prepare(&xid).unwrap(), XaVote::Ok);
    assert_eq!(xa.recover(TMSTARTRSCAN).unwrap(), vec![xid.clone()]);
    assert!(xa.recover(TMNOFLAGS).unwrap().is_empty());
    assert!(xa.recover(TMENDRSCAN).unwrap().is_empty());

    xa.commit(&xid, false).unwrap();
    for p in [&p1, &p2] {
        assert_eq!(p.calls(), vec![Call::Prepare, Call::Commit]);
    }
    assert!(xa.recover(TMSTARTRSCAN).unwrap().is_empty());
    assert!(service.table().is_empty());
}

#[test]
fn test_one_phase_commit_of_imported_branch() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let p1 = MockParticipant::new("p1").shared();
    let xid = xid(2);
    import_with(&service, &xid, &[p1.clone()]);

    service.xa().commit(&xid, true).unwrap();
    assert_eq!(p1.calls(), vec![Call::CommitOnePhase]);
    assert!(service.table().is_empty());
}

#[test]
fn test_prepare_read_only_finishes_branch() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let p1 = MockParticipant::new("p1").voting(Vote::ReadOnly).shared();
    let xid = xid(3);
    import_with(&service, &xid, &[p1.clone()]);

    assert_eq!(service.xa().prepare(&xid).unwrap(), XaVote::ReadOnly);
    assert!(service.table().is_empty());
    let err = service.xa().commit(&xid, false).unwrap_err();
    assert_eq!(err.code(), XaError::XAER_NOTA);
}

#[test]
fn test_prepare_rollback_vote() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let p1 = MockParticipant::new("p1").shared();
    let p2 = MockParticipant::new("p2").voting(Vote::Rollback).shared();
    let xid = xid(4);
    import_with(&service, &xid, &[p1.clone(), p2.clone()]);

    let err = service.xa().prepare(&xid).unwrap_err();
    assert_eq!(err.code(), XaError::XA_RBROLLBACK);
    assert_eq!(p1.calls(), vec![Call::Prepare, Call::Rollback]);
    assert_eq!(p2.calls(), vec![Call::Prepare, Call::Rollback]);
    assert!(service.table().is_empty());
}

#[test]
fn test_rollback_after_prepare() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let p1 = MockParticipant::new("p1").shared();
    let p2 = MockParticipant::new("p2").shared();
    let xid = xid(5);
    import_with(&service, &xid, &[p1.clone(), p2.clone()]);

    service.xa().prepare(&xid).unwrap();
    service.xa().rollback(&xid).unwrap();
    for p in [&p1, &p2] {
        assert_eq!(p.calls(), vec![Call::Prepare, Call::Rollback]);
    }
}

#[test]
fn test_protocol_errors() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let xa = service.xa();
    let xid = xid(6);

    assert_eq!(xa.prepare(&xid).unwrap_err().code(), XaError::XAER_NOTA);
    assert_eq!(xa.release(&xid).unwrap_err().code(), XaError::XAER_PROTO);
    assert_eq!(
        xa.prepare(&Xid::new(0, "gtrid", "")).unwrap_err().code(),
        XaError::XAER_NOTA
    );
    assert_eq!(
        xa.recover(0x4000).unwrap_err().code(),
        XaError::XAER_INVAL
    );

    let local_tid = xa.import(&xid, None).unwrap();
    let coordinator = service.coordinator(local_tid).unwrap();
    coordinator
        .register_resource(MockParticipant::new("p1").shared())
        .unwrap();
    coordinator
        .register_resource(MockParticipant::new("p2").shared())
        .unwrap();
    // Work is still associated with the branch.
    assert_eq!(xa.prepare(&xid).unwrap_err().code(), XaError::XAER_PROTO);
    xa.release(&xid).unwrap();

    // Two phase commit of a branch that was never prepared.
    assert_eq!(
        xa.commit(&xid, false).unwrap_err().code(),
        XaError::XAER_PROTO
    );
    assert_eq!(coordinator.status(), Status::Active);
}

#[test]
fn test_heuristic_outcome_until_forget() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let xa = service.xa();
    let p1 = MockParticipant::new("p1").shared();
    let p2 = MockParticipant::new("p2")
        .failing_commit(ParticipantError::Heuristic(HeuristicKind::Rollback))
        .shared();
    let xid = xid(7);
    import_with(&service, &xid, &[p1.clone(), p2.clone()]);

    xa.prepare(&xid).unwrap();
    let err = xa.commit(&xid, false).unwrap_err();
    assert_eq!(err.code(), XaError::XA_HEURMIX);
    assert_eq!(xa.heuristic(&xid), Some(HeuristicOutcome::Mixed));

    xa.forget(&xid).unwrap();
    assert_eq!(xa.heuristic(&xid), None);
    assert_eq!(xa.forget(&xid).unwrap_err().code(), XaError::XAER_NOTA);
}

#[test]
fn test_forget_requires_heuristic_outcome() {
    let dir = TempDir::new().unwrap();
    let service = start_service(service_config(dir.path()));
    let xid = xid(8);
    import_with(&service, &xid, &[MockParticipant::new("p1").shared()]);

    assert_eq!(
        service.xa().forget(&xid).unwrap_err().code(),
        XaError::XAER_PROTO
    );
}

#[test]
fn test_prepared_branch_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = service_config(dir.path());
    let xid = xid(9);
    let handle = {
        let service = start_service(config.clone());
        let local_tid = service.xa().import(&xid, None).unwrap();
        let coordinator = service.coordinator(local_tid).unwrap();
        let handle = coordinator
            .register_resource(MockParticipant::new("p1").shared())
            .unwrap();
        coordinator
            .register_resource(MockParticipant::new("p2").shared())
            .unwrap();
        service.xa().release(&xid).unwrap();
        assert_eq!(service.xa().prepare(&xid).unwrap(), XaVote::Ok);
        service.shutdown(true).unwrap();
        handle
    };

    let p1 = MockParticipant::new("p1").shared();
    let p2 = MockParticipant::new("p2").shared();
    let service = start_with(config, &[p1.clone(), p2.clone()]);
    // Nothing is decided yet: resync leaves the branch alone.
    assert!(p1.calls().is_empty());
    assert_eq!(service.replay_completion(&handle).unwrap(), Status::Unknown);
    assert_eq!(service.xa().recover(TMSTARTRSCAN).unwrap(), vec![xid.clone()]);

    service.xa().commit(&xid, false).unwrap();
    assert_eq!(p1.calls(), vec![Call::Commit]);
    assert_eq!(p2.calls(), vec![Call::Commit]);
    assert!(service.in_doubt().is_empty());
    assert!(service.xa().recover(TMSTARTRSCAN).unwrap().is_empty());
}

#[test]
fn test_unlogged_commit_decision_is_not_acted_on() {
    let dir = TempDir::new().unwrap();
    let config = service_config(dir.path());
    let service = start_service(config.clone());
    let xa = service.xa();
    let p1 = MockParticipant::new("p1").shared();
    let p2 = MockParticipant::new("p2").shared();
    let xid = xid(10);
    import_with(&service, &xid, &[p1.clone(), p2.clone()]);
    assert_eq!(xa.prepare(&xid).unwrap(), XaVote::Ok);

    let blocker = config.log.base_dir.join(&config.log_name).join("control.tmp");
    fs::create_dir(&blocker).unwrap();
    let err = xa.commit(&xid, false).unwrap_err();
    fs::remove_dir(&blocker).unwrap();
    assert_eq!(err.code(), XaError::XAER_RMERR);

    // A retry finds the branch still undecided and cannot log a decision.
    let err = xa.commit(&xid, false).unwrap_err();
    assert_eq!(err.code(), XaError::XAER_RMERR);
    for p in [&p1, &p2] {
        assert_eq!(p.calls(), vec![Call::Prepare]);
    }
    assert_eq!(xa.recover(TMSTARTRSCAN).unwrap(), vec![xid]);
}
