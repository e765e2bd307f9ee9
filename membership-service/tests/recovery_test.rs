mod common;

use common::*;
use membership_service::engine::RecoveryRequest;
use membership_service::error::MembershipError;
use membership_service::models::remote::Period;
use membership_service::models::{TransactionKind, TransactionStatus};
use membership_service::services::GatewayError;

fn february() -> Period {
    Period {
        start: utc(2024, 2, 1),
        end: utc(2024, 3, 1),
    }
}

/// Membership whose February renewal charge was declined.
async fn failed_renewal(h: &TestHarness) -> membership_service::models::Membership {
    let membership = h.seed_membership(SeedMembership::default()).await;
    let invoice = open_invoice("in_feb", "sub_seed", utc(2024, 2, 1), 10000, february());
    h.engine.process_payment_failed(&invoice).await.unwrap();
    h.gateway.add_open_invoice(invoice);
    membership
}

fn simulation() -> RecoveryRequest {
    RecoveryRequest {
        is_simulation: true,
        terminal_id: None,
        recovered_by: Some("emp_1".to_string()),
    }
}

fn at_reader(terminal_id: &str) -> RecoveryRequest {
    RecoveryRequest {
        is_simulation: false,
        terminal_id: Some(terminal_id.to_string()),
        recovered_by: Some("emp_1".to_string()),
    }
}

#[tokio::test]
async fn simulated_recovery_settles_invoice_and_saves_card() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;

    let outcome = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap();

    assert_eq!(outcome.invoice_id, "in_feb");
    assert_eq!(outcome.amount, amount("100.00"));
    assert!(outcome.payment_method_updated);
    assert!(outcome.warning.is_none());
    assert_eq!(outcome.next_billing_date, utc(2024, 3, 1));

    assert_eq!(h.gateway.call_count("create_payment_method"), 1);
    assert_eq!(h.gateway.call_count("attach_payment_method"), 1);
    assert_eq!(h.gateway.call_count("create_payment_intent"), 1);
    assert_eq!(h.gateway.call_count("process_terminal_payment"), 0);

    let updates = h.gateway.updates();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].1.default_payment_method.is_some());

    let paid = h.gateway.paid_invoices();
    assert_eq!(paid.len(), 1);
    assert_eq!(paid[0].0, "in_feb");
    assert!(paid[0].1.paid_out_of_band);

    let transactions = h.ledger.all();
    let recovery = transactions
        .iter()
        .find(|t| t.kind() == TransactionKind::MembershipRecovery)
        .expect("recovery recorded");
    assert_eq!(recovery.id, outcome.transaction_id);
    assert_eq!(recovery.status, TransactionStatus::Succeeded);
    assert_eq!(recovery.payment_intent_id.as_deref(), Some(outcome.payment_intent_id.as_str()));

    let failure = transactions
        .iter()
        .find(|t| t.kind() == TransactionKind::RenewalFailure)
        .expect("failure recorded");
    assert_eq!(failure.recovered_by.as_deref(), Some(recovery.id.as_str()));

    let stored = h.stored(&membership.id);
    assert_eq!(stored.last_billing_date, utc(2024, 2, 1));
    assert_eq!(stored.next_billing_date, utc(2024, 3, 1));
    assert_eq!(h.receipts.send_count(), 1);
}

#[tokio::test]
async fn card_present_recovery_never_saves_card() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;

    let outcome = h
        .engine
        .recover_payment(&membership.id, at_reader("tmr_front_desk"))
        .await
        .unwrap();

    assert!(!outcome.payment_method_updated);
    let warning = outcome.warning.expect("warning for unsaved card");
    assert!(warning.contains("card_present"));
    assert_eq!(h.gateway.call_count("process_terminal_payment"), 1);
    assert_eq!(h.gateway.call_count("create_payment_method"), 0);
    assert!(h
        .gateway
        .updates()
        .iter()
        .all(|(_, u)| u.default_payment_method.is_none()));
    assert_eq!(h.gateway.paid_invoices().len(), 1);
}

#[tokio::test]
async fn reusable_reader_method_becomes_default() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;
    h.gateway.set_terminal_method_kind("card");

    let outcome = h
        .engine
        .recover_payment(&membership.id, at_reader("tmr_front_desk"))
        .await
        .unwrap();

    assert!(outcome.payment_method_updated);
    assert!(outcome.warning.is_none());
}

#[tokio::test]
async fn in_person_recovery_requires_terminal() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;

    for request in [
        RecoveryRequest::default(),
        at_reader("   "),
    ] {
        let err = h
            .engine
            .recover_payment(&membership.id, request)
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::Validation(_)));
    }
    assert_eq!(h.gateway.call_count("list_open_invoices"), 0);
}

#[tokio::test]
async fn recovery_without_open_invoice_fails() {
    let h = TestHarness::new();
    let membership = h.seed_membership(SeedMembership::default()).await;

    let err = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap_err();

    assert!(matches!(err, MembershipError::NoOutstandingInvoice(ref s) if s == "sub_seed"));
    assert_eq!(h.gateway.call_count("create_payment_intent"), 0);
}

#[tokio::test]
async fn recovery_rejects_invoice_with_nothing_due() {
    let h = TestHarness::new();
    let membership = h.seed_membership(SeedMembership::default()).await;
    h.gateway
        .add_open_invoice(open_invoice("in_zero", "sub_seed", utc(2024, 2, 1), 0, february()));

    let err = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap_err();

    assert!(matches!(err, MembershipError::Validation(_)));
    assert_eq!(h.gateway.call_count("create_payment_method"), 0);
}

#[tokio::test]
async fn unsuccessful_charge_leaves_invoice_open() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;
    h.gateway.set_intent_status("requires_payment_method");

    let err = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap_err();

    match err {
        MembershipError::ExternalGateway(e) => {
            assert_eq!(e.code.as_deref(), Some("payment_not_succeeded"));
            assert_eq!(e.kind.as_deref(), Some("payment_error"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.gateway.paid_invoices().is_empty());
    assert!(h
        .ledger
        .all()
        .iter()
        .all(|t| t.kind() != TransactionKind::MembershipRecovery));
    assert_eq!(h.stored(&membership.id), membership);
}

#[tokio::test]
async fn reader_charge_still_processing_is_not_settled() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;
    h.gateway.set_intent_status("processing");

    let err = h
        .engine
        .recover_payment(&membership.id, at_reader("tmr_front_desk"))
        .await
        .unwrap_err();

    match err {
        MembershipError::ExternalGateway(e) => {
            assert_eq!(e.code.as_deref(), Some("payment_not_succeeded"));
            assert!(e.message.contains("processing"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.gateway.paid_invoices().is_empty());
    assert_eq!(h.stored(&membership.id).next_billing_date, utc(2024, 2, 1));
}

#[tokio::test]
async fn declined_card_surfaces_processor_code() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;
    h.gateway.fail(
        "create_payment_intent",
        GatewayError::new("Your card was declined.")
            .with_code("card_declined")
            .with_kind("card_error"),
    );

    let err = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MembershipError::ExternalGateway(ref e) if e.code.as_deref() == Some("card_declined")
    ));
}

#[tokio::test]
async fn latest_open_invoice_is_recovered() {
    let h = TestHarness::new();
    let membership = h.seed_membership(SeedMembership::default()).await;
    h.gateway.add_open_invoice(open_invoice(
        "in_jan",
        "sub_seed",
        utc(2024, 1, 1),
        10000,
        Period {
            start: utc(2024, 1, 1),
            end: utc(2024, 2, 1),
        },
    ));
    h.gateway
        .add_open_invoice(open_invoice("in_feb", "sub_seed", utc(2024, 2, 1), 10000, february()));

    let outcome = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap();

    assert_eq!(outcome.invoice_id, "in_feb");
    assert_eq!(h.stored(&membership.id).next_billing_date, utc(2024, 3, 1));
}

#[tokio::test]
async fn card_not_saved_is_a_warning() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;
    h.gateway
        .fail("update_subscription", GatewayError::new("Processor unavailable"));

    let outcome = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap();

    assert!(!outcome.payment_method_updated);
    assert!(outcome.warning.is_some());
    assert_eq!(h.gateway.paid_invoices().len(), 1);
}

#[tokio::test]
async fn settlement_failure_records_nothing() {
    let h = TestHarness::new();
    let membership = failed_renewal(&h).await;
    h.gateway
        .fail("pay_invoice", GatewayError::new("Invoice is already paid"));

    let err = h
        .engine
        .recover_payment(&membership.id, simulation())
        .await
        .unwrap_err();

    assert!(matches!(err, MembershipError::ExternalGateway(_)));
    assert!(h
        .ledger
        .all()
        .iter()
        .all(|t| t.kind() != TransactionKind::MembershipRecovery));
    assert_eq!(h.stored(&membership.id).next_billing_date, utc(2024, 2, 1));
}
