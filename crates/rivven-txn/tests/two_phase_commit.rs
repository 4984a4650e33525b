//! End-to-end commit and abort through the coordinator

mod common;

use common::{init_tracing, tp, Harness};
use rivven_txn::{
    EndTxnReply, ParticipantOp, ParticipantTxState, ProducerIdentity, TxErrc, TxSeq, TxStatus,
};
use std::time::Duration;

#[tokio::test]
async fn test_commit_across_partitions_and_group() {
    init_tracing();
    let h = Harness::new();

    let (pid, tx_seq) = h.init("t1").await;
    assert_eq!(pid, ProducerIdentity::new(1, 0));
    assert_eq!(tx_seq, TxSeq(0));

    assert!(h.add("t1", pid, vec![tp(0), tp(1)]).await.all_ok());
    assert_eq!(h.add_group("t1", pid, "g1").await.error_code, TxErrc::None);
    assert_eq!(h.record("t1").status, TxStatus::Ongoing);

    let reply = h.end("t1", pid, tx_seq, true).await;
    assert_eq!(reply, EndTxnReply::ok(ProducerIdentity::new(1, 1), TxSeq(1)));
    h.settle().await;

    let record = h.record("t1");
    assert_eq!(record.status, TxStatus::Ready);
    assert_eq!(record.pid, ProducerIdentity::new(1, 1));
    assert_eq!(record.tx_seq, TxSeq(1));
    assert!(record.partitions.is_empty());
    assert!(record.groups.is_empty());
    assert_eq!(record.outcome_of(&pid, tx_seq).map(|o| o.committed), Some(true));

    for partition in [tp(0), tp(1)] {
        assert_eq!(
            h.partitions.state_of(&partition, pid, tx_seq),
            Some(ParticipantTxState::Committed)
        );
    }
    assert_eq!(
        h.groups.state_of(&common::group("g1"), pid, tx_seq),
        Some(ParticipantTxState::Committed)
    );

    let stats = h.coordinator.stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.aborted, 0);
}

#[tokio::test]
async fn test_next_transaction_uses_returned_identity() {
    init_tracing();
    let h = Harness::new();
    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0)]).await.all_ok());
    let reply = h.end("t1", pid, tx_seq, true).await;
    let (next_pid, next_seq) = (reply.pid.unwrap(), reply.tx_seq.unwrap());
    h.settle().await;

    assert!(h.add("t1", next_pid, vec![tp(0)]).await.all_ok());
    let reply = h.end("t1", next_pid, next_seq, true).await;
    assert_eq!(reply, EndTxnReply::ok(ProducerIdentity::new(1, 2), TxSeq(2)));
    h.settle().await;

    assert_eq!(
        h.partitions.state_of(&tp(0), next_pid, next_seq),
        Some(ParticipantTxState::Committed)
    );
    assert_eq!(h.coordinator.stats().committed, 2);
}

#[tokio::test]
async fn test_abort() {
    init_tracing();
    let h = Harness::new();
    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0), tp(2)]).await.all_ok());

    let reply = h.end("t1", pid, tx_seq, false).await;
    assert_eq!(reply, EndTxnReply::ok(ProducerIdentity::new(1, 1), TxSeq(1)));
    h.settle().await;

    let record = h.record("t1");
    assert_eq!(record.status, TxStatus::Ready);
    assert_eq!(record.outcome_of(&pid, tx_seq).map(|o| o.committed), Some(false));
    assert_eq!(
        h.partitions.state_of(&tp(2), pid, tx_seq),
        Some(ParticipantTxState::Aborted)
    );
    assert_eq!(h.partitions.calls(ParticipantOp::Prepare, &tp(0)), 0);
    assert_eq!(h.coordinator.stats().aborted, 1);
}

#[tokio::test]
async fn test_prepare_rejection_aborts() {
    init_tracing();
    let h = Harness::new();
    h.partitions.reject_prepare(tp(1));

    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0), tp(1)]).await.all_ok());

    let reply = h.end("t1", pid, tx_seq, true).await;
    assert_eq!(reply.error_code, TxErrc::RequestRejected);
    h.settle().await;

    let record = h.record("t1");
    assert_eq!(record.status, TxStatus::Ready);
    assert_eq!(record.pid.epoch, 1);
    assert_eq!(record.outcome_of(&pid, tx_seq).map(|o| o.committed), Some(false));
    assert_eq!(
        h.partitions.state_of(&tp(0), pid, tx_seq),
        Some(ParticipantTxState::Aborted)
    );
    assert_eq!(h.partitions.calls(ParticipantOp::Commit, &tp(0)), 0);

    // a participant asking later learns the outcome
    assert_eq!(h.try_abort(pid, tx_seq).await, rivven_txn::TryAbortReply::aborted());
}

#[tokio::test]
async fn test_commit_fan_out_retried_after_decision() {
    init_tracing();
    let h = Harness::new();
    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0), tp(1)]).await.all_ok());
    h.partitions.fail_next(ParticipantOp::Commit, tp(0), 5);

    let reply = h.end("t1", pid, tx_seq, true).await;
    assert!(reply.error_code.is_ok());
    h.settle().await;

    assert_eq!(h.record("t1").status, TxStatus::Ready);
    assert_eq!(h.partitions.calls(ParticipantOp::Commit, &tp(0)), 6);
    // the healthy participant is not re-driven
    assert_eq!(h.partitions.calls(ParticipantOp::Commit, &tp(1)), 1);
    assert_eq!(
        h.partitions.state_of(&tp(0), pid, tx_seq),
        Some(ParticipantTxState::Committed)
    );
}

#[tokio::test]
async fn test_prepare_failure_left_for_rollforward() {
    init_tracing();
    let h = Harness::new();
    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0)]).await.all_ok());
    h.partitions.fail_next(ParticipantOp::Prepare, tp(0), 1);

    let reply = h.end("t1", pid, tx_seq, true).await;
    assert_eq!(reply.error_code, TxErrc::UnknownServerError);
    h.settle().await;
    assert_eq!(h.record("t1").status, TxStatus::Preparing);

    // undecided: the participant must ask again, the coordinator finishes it
    assert!(h.try_abort(pid, tx_seq).await.is_pending());
    h.settle().await;

    let record = h.record("t1");
    assert_eq!(record.status, TxStatus::Ready);
    assert_eq!(record.outcome_of(&pid, tx_seq).map(|o| o.committed), Some(true));
    assert_eq!(h.try_abort(pid, tx_seq).await, rivven_txn::TryAbortReply::committed());
}

#[tokio::test]
async fn test_duplicate_end_answered_from_outcome() {
    init_tracing();
    let h = Harness::new();
    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0)]).await.all_ok());
    let first = h.end("t1", pid, tx_seq, true).await;
    h.settle().await;

    assert_eq!(h.end("t1", pid, tx_seq, true).await, first);
    assert_eq!(
        h.end("t1", pid, tx_seq, false).await.error_code,
        TxErrc::RequestRejected
    );
    assert_eq!(h.partitions.calls(ParticipantOp::Commit, &tp(0)), 1);
}

#[tokio::test]
async fn test_add_partitions_idempotent() {
    init_tracing();
    let h = Harness::new();
    let (pid, _) = h.init("t1").await;

    assert!(h.add("t1", pid, vec![tp(0), tp(0)]).await.all_ok());
    assert!(h.add("t1", pid, vec![tp(0), tp(1)]).await.all_ok());

    let record = h.record("t1");
    assert_eq!(record.partitions.len(), 2);
    assert_eq!(h.partitions.calls(ParticipantOp::Begin, &tp(0)), 1);
    assert_eq!(h.coordinator.stats().started, 1);
}

#[tokio::test]
async fn test_concurrent_add_partitions_begin_once() {
    init_tracing();
    let h = Harness::new();
    let (pid, _) = h.init("t1").await;
    h.partitions.set_delay(Some(Duration::from_millis(2)));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .add_partitions(rivven_txn::AddPartitionsRequest {
                        transactional_id: "t1".into(),
                        pid,
                        partitions: vec![tp(0), tp(1), tp(2)],
                    })
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().all_ok());
    }

    assert_eq!(h.record("t1").partitions.len(), 3);
    for p in 0..3 {
        assert_eq!(h.partitions.calls(ParticipantOp::Begin, &tp(p)), 1);
    }
}

#[tokio::test]
async fn test_try_abort_during_commit_is_pending() {
    init_tracing();
    let h = Harness::new();
    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0)]).await.all_ok());
    h.partitions.set_delay(Some(Duration::from_millis(100)));

    let end = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .end_transaction(rivven_txn::EndTxnRequest {
                    transactional_id: "t1".into(),
                    pid,
                    tx_seq,
                    committed: true,
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(h.record("t1").status, TxStatus::Preparing);
    assert!(h.try_abort(pid, tx_seq).await.is_pending());

    assert!(end.await.unwrap().error_code.is_ok());
    h.settle().await;
    assert_eq!(h.try_abort(pid, tx_seq).await, rivven_txn::TryAbortReply::committed());
}

#[tokio::test]
async fn test_try_abort_kills_ongoing() {
    init_tracing();
    let h = Harness::new();
    let (pid, tx_seq) = h.init("t1").await;
    assert!(h.add("t1", pid, vec![tp(0), tp(1)]).await.all_ok());

    assert_eq!(h.try_abort(pid, tx_seq).await, rivven_txn::TryAbortReply::aborted());
    h.settle().await;

    let record = h.record("t1");
    assert_eq!(record.status, TxStatus::Ready);
    assert_eq!(
        h.partitions.state_of(&tp(1), pid, tx_seq),
        Some(ParticipantTxState::Aborted)
    );

    // the producer learns its transaction is gone
    let reply = h.end("t1", pid, tx_seq, true).await;
    assert_eq!(reply.error_code, TxErrc::RequestRejected);
}

#[tokio::test]
async fn test_try_abort_unknown_producer() {
    init_tracing();
    let h = Harness::new();
    let reply = h.try_abort(ProducerIdentity::new(42, 0), TxSeq(0)).await;
    assert_eq!(reply, rivven_txn::TryAbortReply::aborted());
}
