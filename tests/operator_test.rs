mod common;

use common::{Fault, Harness, new_payment};
use escrow_engine::domain::escrow::EscrowStatus;
use escrow_engine::domain::event::{EventKind, Step};
use escrow_engine::domain::payment::{FlowType, Party, PaymentStatus};
use escrow_engine::domain::ports::LedgerStore;
use escrow_engine::error::EngineError;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_dispute_before_escrow_stops_all_automation() {
    let h = Harness::new();
    let payment = h
        .funded_payment(new_payment(dec!(1000), dec!(50), 60, FlowType::Standard))
        .await;

    h.engine.raise_dispute(payment.id, "duplicate charge").await.unwrap();

    assert_eq!(
        h.engine.payment(payment.id).await.unwrap().status,
        PaymentStatus::Disputed
    );
    h.engine.advance_custody(payment.id).await.unwrap();
    h.engine.pay_immediate(payment.id).await.unwrap();
    assert_eq!(h.rail.calls("withdraw"), 0);
    assert_eq!(h.rail.calls("redeem"), 0);

    let events = h.engine.events(payment.id).await.unwrap();
    let dispute = events
        .iter()
        .find(|e| matches!(e.kind, EventKind::Disputed { .. }))
        .unwrap();
    assert!(!dispute.automatic);
}

#[tokio::test]
async fn test_dispute_freezes_funded_escrow() {
    let h = Harness::new();
    let payment = h
        .funded_payment(new_payment(dec!(1000), dec!(100), 60, FlowType::Standard))
        .await;
    h.engine.advance_custody(payment.id).await.unwrap();

    h.engine.raise_dispute(payment.id, "goods damaged").await.unwrap();

    let escrow_id = h.engine.payment(payment.id).await.unwrap().escrow_id.unwrap();
    assert_eq!(
        h.engine.escrow(escrow_id).await.unwrap().status,
        EscrowStatus::Disputed
    );
    let err = h.engine.raise_dispute(payment.id, "again").await.unwrap_err();
    assert!(matches!(err, EngineError::Terminal(_)));
}

#[tokio::test]
async fn test_dispute_rejected_while_paying_out_without_escrow() {
    let h = Harness::new();
    let payment = h
        .funded_payment(new_payment(dec!(1000), dec!(0), 60, FlowType::Standard))
        .await;
    h.rail.fail_next("payout", Fault::Unavailable);
    h.engine.pay_immediate(payment.id).await.unwrap_err();
    assert_eq!(
        h.engine.payment(payment.id).await.unwrap().status,
        PaymentStatus::Processing
    );

    let err = h.engine.raise_dispute(payment.id, "late").await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationError(_)));
}

#[tokio::test]
async fn test_dispute_rejected_while_release_is_claimed() {
    let h = Harness::new();
    let payment = h
        .funded_payment(new_payment(dec!(1000), dec!(100), 60, FlowType::Standard))
        .await;
    h.engine.advance_custody(payment.id).await.unwrap();
    let step = Step::EscrowRelease;
    h.store
        .claim_step(payment.id, step, &step.reference(payment.id), h.clock_now())
        .await
        .unwrap();

    let err = h.engine.raise_dispute(payment.id, "race").await.unwrap_err();
    assert!(matches!(err, EngineError::InFlight(_)));
    assert_eq!(
        h.engine.payment(payment.id).await.unwrap().status,
        PaymentStatus::Escrowed
    );
}

#[tokio::test]
async fn test_cancel_only_unmatched_pending_payments() {
    let h = Harness::new();
    let pending = h
        .engine
        .register_payment(new_payment(dec!(100), dec!(0), 60, FlowType::Standard))
        .await
        .unwrap();
    let funded = h
        .funded_payment(new_payment(dec!(200), dec!(0), 60, FlowType::Standard))
        .await;

    h.engine.cancel(pending.id, "buyer withdrew").await.unwrap();
    assert_eq!(
        h.engine.payment(pending.id).await.unwrap().status,
        PaymentStatus::Cancelled
    );

    let err = h.engine.cancel(funded.id, "too late").await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationError(_)));
    assert_eq!(
        h.engine.payment(funded.id).await.unwrap().status,
        PaymentStatus::Funded
    );
}

#[tokio::test]
async fn test_cancelled_payment_is_never_matched() {
    let h = Harness::new();
    let payment = h
        .deposited_payment(new_payment(dec!(100), dec!(0), 60, FlowType::Standard))
        .await;
    h.engine.cancel(payment.id, "duplicate order").await.unwrap();

    assert_eq!(
        h.engine.work_items(escrow_engine::application::scheduler::Job::DepositDetection)
            .await
            .unwrap(),
        vec![]
    );
    h.engine.match_deposit(payment.id).await.unwrap();
    assert!(h.engine.payment(payment.id).await.unwrap().dedup_reference.is_none());
}

#[tokio::test]
async fn test_approval_is_recorded_once() {
    let h = Harness::new();
    let payment = h
        .funded_payment(new_payment(dec!(100), dec!(100), 60, FlowType::DualApproval))
        .await;

    h.engine.approve(payment.id, Party::Payer).await.unwrap();
    let approved = h.engine.approve(payment.id, Party::Payer).await.unwrap();
    assert!(approved.payer_approved);
    assert!(!approved.beneficiary_approved);

    let approvals = h
        .engine
        .events(payment.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.kind, EventKind::Approved { .. }))
        .count();
    assert_eq!(approvals, 1);
}

#[tokio::test]
async fn test_clearing_absent_hold_is_a_no_op() {
    let h = Harness::new();
    let payment = h
        .funded_payment(new_payment(dec!(100), dec!(0), 60, FlowType::Standard))
        .await;

    h.engine.clear_hold(payment.id).await.unwrap();
    assert!(h
        .engine
        .events(payment.id)
        .await
        .unwrap()
        .iter()
        .all(|e| e.kind != EventKind::HoldCleared));
}

#[tokio::test]
async fn test_unknown_payment_is_not_found() {
    let h = Harness::new();
    let err = h
        .engine
        .payment(escrow_engine::domain::payment::PaymentId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
