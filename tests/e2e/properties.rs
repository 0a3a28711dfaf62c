//! Invariants of the purchase, payment and sweep paths.

use super::harness::{
    BALANCE_NETWORK, CAPABILITY, CHEAP_RESOURCE, EVM_NETWORK, GROUP, RESOURCE, SLOW_CALL,
};
use super::{SettleScript, TestHarness};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{TimeDelta, Utc};
use rolegate::payment::PaymentPhase;
use rolegate::{
    AccessRequest, Error, GateEvent, GrantKey, InvoiceDetails, InvoiceRequest, PaymentProof,
    Store,
};
use std::collections::BTreeSet;
use std::time::Duration;

fn key(subject: &str) -> GrantKey {
    GrantKey {
        subject: subject.into(),
        group: GROUP.into(),
        capability: CAPABILITY.into(),
    }
}

#[tokio::test]
async fn test_disallowed_duration_rejected_before_balance() {
    let harness = TestHarness::setup().await.expect("setup");
    // No account and no ledger: only the duration check can answer.
    harness.evm.set_balance(None);

    for duration in [1, 3_600, 43_199, 172_800] {
        let result = harness
            .engine()
            .quote(&TestHarness::request("alice", EVM_NETWORK, duration))
            .await;
        assert!(
            matches!(result, Err(Error::BadRequest(_))),
            "duration {duration}: {result:?}"
        );
    }
    assert_eq!(harness.facilitator.verify_count(), 0);
}

#[tokio::test]
async fn test_zero_price_is_rejected() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");

    // 1 unit per day for a minute rounds down to zero.
    let request = AccessRequest {
        resource: CHEAP_RESOURCE.into(),
        duration: 60,
        ..TestHarness::request("alice", EVM_NETWORK, 60)
    };
    let proof = harness.proof(EVM_NETWORK);
    let result = harness.engine().request_access(&request, Some(&proof)).await;
    assert!(matches!(result, Err(Error::BadRequest(_))));
    assert!(harness.engine().gateway().ledger().is_empty());

    // A full day prices at one unit and is sold.
    let request = AccessRequest {
        duration: 86_400,
        ..request
    };
    let quote = harness.engine().quote(&request).await.expect("quote");
    assert_eq!(quote.price, 1);
}

#[tokio::test]
async fn test_settlement_fulfils_outstanding_invoice() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    let invoice = harness
        .gate
        .invoices()
        .create_invoice(&InvoiceRequest {
            subject: "alice".into(),
            group: GROUP.into(),
            resource: RESOURCE.into(),
            duration: 86_400,
        })
        .await
        .expect("invoice");

    let proof = harness.proof(EVM_NETWORK);
    let outcome = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        )
        .await
        .expect("access");

    assert_eq!(
        outcome.fulfilled_invoice.map(|i| i.token),
        Some(invoice.token.clone())
    );
    let store = harness.gate.store();
    assert!(store.invoice(&key("alice")).await.expect("read").is_none());
    assert!(store.invoice_by_token(&invoice.token).await.expect("read").is_none());
    assert_eq!(
        store.expired_grants(Utc::now() + TimeDelta::days(2)).await.expect("read").len(),
        1
    );
}

#[tokio::test]
async fn test_invoice_resolves_to_its_parameters() {
    let harness = TestHarness::setup().await.expect("setup");
    let request = InvoiceRequest {
        subject: "bob".into(),
        group: GROUP.into(),
        resource: RESOURCE.into(),
        duration: 43_200,
    };
    let invoice = harness
        .gate
        .invoices()
        .create_invoice(&request)
        .await
        .expect("invoice");
    let details = harness
        .gate
        .invoices()
        .resolve_invoice(&invoice.token)
        .await
        .expect("resolve");
    assert_eq!(
        details,
        InvoiceDetails {
            subject: request.subject,
            group: request.group,
            resource: request.resource,
            duration: request.duration,
        }
    );
}

#[tokio::test]
async fn test_failed_detach_keeps_grant() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    let proof = harness.proof(EVM_NETWORK);
    let outcome = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        )
        .await
        .expect("access");
    let later = outcome.grant.expires_at + TimeDelta::seconds(1);

    harness.authority.set_fail_detach(true);
    let report = harness.gate.sweeper().sweep_at(later).await;
    assert_eq!(report.failed, 1);
    assert!(harness.authority.holds("alice", CAPABILITY));
    assert!(harness
        .gate
        .store()
        .grant(&key("alice"))
        .await
        .expect("read")
        .is_some());

    harness.authority.set_fail_detach(false);
    let report = harness.gate.sweeper().sweep_at(later).await;
    assert_eq!(report.revoked, 1);
    assert!(!harness.authority.holds("alice", CAPABILITY));
}

#[tokio::test]
async fn test_departed_member_grant_is_kept() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("bob", EVM_NETWORK).await.expect("provision");
    let proof = harness.proof(EVM_NETWORK);
    let outcome = harness
        .engine()
        .request_access(
            &TestHarness::request("bob", EVM_NETWORK, 43_200),
            Some(&proof),
        )
        .await
        .expect("access");

    harness.authority.remove_member("bob");
    let report = harness
        .gate
        .sweeper()
        .sweep_at(outcome.grant.expires_at + TimeDelta::seconds(1))
        .await;
    assert_eq!(report.skipped, 1);
    assert_eq!(harness.authority.detach_count(), 0);
    assert!(harness
        .gate
        .store()
        .grant(&key("bob"))
        .await
        .expect("read")
        .is_some());
}

#[tokio::test]
async fn test_proof_cannot_be_replayed() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    let request = TestHarness::request("alice", EVM_NETWORK, 43_200);
    let proof = harness.proof(EVM_NETWORK);

    harness
        .engine()
        .request_access(&request, Some(&proof))
        .await
        .expect("first");
    let replay = harness.engine().request_access(&request, Some(&proof)).await;

    assert!(matches!(replay, Err(Error::VerificationRejected { .. })));
    assert_eq!(harness.facilitator.verify_count(), 1);
    assert_eq!(harness.facilitator.settle_count(), 1);
}

#[tokio::test]
async fn test_rejected_proof_fails_identically() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness
        .facilitator
        .reject_with(Some("insufficient_funds"));
    let request = TestHarness::request("alice", EVM_NETWORK, 43_200);
    let proof = harness.proof(EVM_NETWORK);

    let reasons: Vec<String> = futures::future::join_all(
        (0..2).map(|_| harness.engine().request_access(&request, Some(&proof))),
    )
    .await
    .into_iter()
    .map(|result| match result {
        Err(Error::VerificationRejected { reason, .. }) => reason,
        other => format!("unexpected: {other:?}"),
    })
    .collect();

    // Concurrent copies race the ledger; resubmitting afterwards always
    // reports the original reason.
    assert!(reasons.iter().any(|r| r == "insufficient_funds"));
    harness.facilitator.reject_with(None);
    match harness.engine().request_access(&request, Some(&proof)).await {
        Err(Error::VerificationRejected { reason, .. }) => {
            assert_eq!(reason, "insufficient_funds");
        }
        other => panic!("expected a sticky rejection, got {other:?}"),
    }
    assert_eq!(harness.facilitator.verify_count(), 1);
}

#[tokio::test]
async fn test_reencoded_rejected_proof_fails_identically() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness
        .facilitator
        .reject_with(Some("insufficient_funds"));
    let request = TestHarness::request("alice", EVM_NETWORK, 43_200);
    let proof = harness.proof(EVM_NETWORK);

    let first = harness.engine().request_access(&request, Some(&proof)).await;
    assert!(matches!(first, Err(Error::VerificationRejected { .. })));

    // Same authorization, different bytes on the wire.
    let json = STANDARD.decode(&proof).expect("base64");
    let mut padded = b" ".to_vec();
    padded.extend_from_slice(&json);
    let reencoded = STANDARD.encode(padded);
    assert_ne!(reencoded, proof);

    harness.facilitator.reject_with(None);
    match harness.engine().request_access(&request, Some(&reencoded)).await {
        Err(Error::VerificationRejected { reason, .. }) => {
            assert_eq!(reason, "insufficient_funds");
        }
        other => panic!("expected a sticky rejection, got {other:?}"),
    }
    assert_eq!(harness.facilitator.verify_count(), 1);
    assert_eq!(harness.facilitator.settle_count(), 0);
}

#[tokio::test]
async fn test_dropped_caller_still_commits_settled_grant() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness
        .facilitator
        .settle_with(SettleScript::Slow(Duration::from_millis(300)));
    let proof = harness.proof(EVM_NETWORK);

    // The caller goes away while settle is in flight.
    let dropped = tokio::time::timeout(
        Duration::from_millis(100),
        harness.engine().request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        ),
    )
    .await;
    assert!(dropped.is_err());

    tokio::time::timeout(SLOW_CALL, async {
        while !harness.authority.holds("alice", CAPABILITY) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("grant completes without the caller");

    let grant = harness
        .gate
        .store()
        .grant(&key("alice"))
        .await
        .expect("read")
        .expect("grant");
    assert_eq!(grant.key, key("alice"));
    let digest = PaymentProof::decode(&proof).expect("decode").digest();
    assert_eq!(
        harness.engine().gateway().ledger().phase(&digest),
        Some(PaymentPhase::Settled)
    );
    assert_eq!(harness.facilitator.settle_count(), 1);
}

#[tokio::test]
async fn test_dropped_caller_hung_settle_is_reported() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness.facilitator.settle_with(SettleScript::Hang);
    let mut events = harness.gate.subscribe_events();
    let proof = harness.proof(EVM_NETWORK);

    let dropped = tokio::time::timeout(
        Duration::from_millis(100),
        harness.engine().request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        ),
    )
    .await;
    assert!(dropped.is_err());

    let event = tokio::time::timeout(SLOW_CALL, async {
        loop {
            match events.recv().await {
                Ok(event @ GateEvent::SettlementAmbiguous { .. }) => break event,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("ambiguous settlement reported");
    assert!(matches!(
        event,
        GateEvent::SettlementAmbiguous { ref key, .. } if key.subject == "alice"
    ));

    let digest = PaymentProof::decode(&proof).expect("decode").digest();
    assert_eq!(
        harness.engine().gateway().ledger().phase(&digest),
        Some(PaymentPhase::SettleFailed { ambiguous: true })
    );
    assert!(harness
        .gate
        .store()
        .grant(&key("alice"))
        .await
        .expect("read")
        .is_none());
}

#[tokio::test]
async fn test_settle_timeout_is_ambiguous() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness.facilitator.settle_with(SettleScript::Hang);
    let mut events = harness.gate.subscribe_events();

    let proof = harness.proof(EVM_NETWORK);
    let result = tokio::time::timeout(
        SLOW_CALL,
        harness.engine().request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        ),
    )
    .await
    .expect("bounded by the settle timeout");

    assert!(matches!(result, Err(Error::SettlementAmbiguous { .. })));
    assert!(harness
        .gate
        .store()
        .grant(&key("alice"))
        .await
        .expect("read")
        .is_none());
    assert!(matches!(
        events.try_recv(),
        Ok(GateEvent::SettlementAmbiguous { .. })
    ));

    // Never retried, even with the same proof.
    harness
        .facilitator
        .settle_with(SettleScript::Success("0xlate".into()));
    let retry = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        )
        .await;
    assert!(matches!(retry, Err(Error::VerificationRejected { .. })));
    assert_eq!(harness.facilitator.settle_count(), 1);
}

#[tokio::test]
async fn test_settle_failure_writes_nothing() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness
        .facilitator
        .settle_with(SettleScript::Failure("nonce_used".into()));

    let proof = harness.proof(EVM_NETWORK);
    let result = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        )
        .await;
    assert!(matches!(
        result,
        Err(Error::SettlementFailed { ref reason, .. }) if reason == "nonce_used"
    ));
    assert!(!harness.authority.holds("alice", CAPABILITY));
    assert!(harness
        .gate
        .store()
        .grant(&key("alice"))
        .await
        .expect("read")
        .is_none());
}

#[tokio::test]
async fn test_attach_failure_defers_to_sweeper() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness.authority.set_fail_attach(true);

    let proof = harness.proof(EVM_NETWORK);
    let outcome = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&proof),
        )
        .await
        .expect("paid access is recorded");
    assert!(!outcome.grant.attached);
    assert!(!harness.authority.holds("alice", CAPABILITY));

    harness.authority.set_fail_attach(false);
    let report = harness.gate.sweeper().sweep_at(Utc::now()).await;
    assert_eq!(report.reattached, 1);
    assert!(harness.authority.holds("alice", CAPABILITY));
    let grant = harness
        .gate
        .store()
        .grant(&key("alice"))
        .await
        .expect("read")
        .expect("grant");
    assert!(grant.attached);
}

#[tokio::test]
async fn test_balance_only_network() {
    let harness = TestHarness::setup().await.expect("setup");
    harness
        .provision("alice", BALANCE_NETWORK)
        .await
        .expect("provision");

    let outcome = harness
        .engine()
        .request_access(&TestHarness::request("alice", BALANCE_NETWORK, 86_400), None)
        .await
        .expect("access");
    assert!(outcome.settlement.is_none());
    assert_eq!(harness.facilitator.verify_count(), 0);
    assert!(harness.authority.holds("alice", CAPABILITY));

    harness.account_model.set_balance(None);
    let result = harness
        .engine()
        .request_access(&TestHarness::request("alice", BALANCE_NETWORK, 86_400), None)
        .await;
    assert!(matches!(
        result,
        Err(Error::InsufficientBalance {
            available: None,
            ..
        })
    ));
}

#[tokio::test]
async fn test_missing_proof_requires_payment() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    let result = harness
        .engine()
        .request_access(&TestHarness::request("alice", EVM_NETWORK, 43_200), None)
        .await;
    assert!(matches!(result, Err(Error::PaymentRequired)));

    let result = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some("%%% not base64 %%%"),
        )
        .await;
    assert!(matches!(result, Err(Error::MalformedProof(_))));
}

#[tokio::test]
async fn test_renewal_overwrites_expiry() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");

    let first_proof = harness.proof(EVM_NETWORK);
    let first = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 43_200),
            Some(&first_proof),
        )
        .await
        .expect("first");
    let second_proof = harness.proof(EVM_NETWORK);
    let second = harness
        .engine()
        .request_access(
            &TestHarness::request("alice", EVM_NETWORK, 86_400),
            Some(&second_proof),
        )
        .await
        .expect("second");

    assert!(second.grant.expires_at > first.grant.expires_at);
    let grants = harness
        .gate
        .store()
        .expired_grants(Utc::now() + TimeDelta::days(3))
        .await
        .expect("read");
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].expires_at, second.grant.expires_at);
}

#[tokio::test]
async fn test_concurrent_provisioning_converges() {
    let harness = TestHarness::setup().await.expect("setup");
    let accounts = harness.engine().accounts();

    let results = futures::future::join_all(
        (0..8).map(|_| accounts.ensure_account("carol", EVM_NETWORK)),
    )
    .await;
    let addresses: BTreeSet<String> = results
        .into_iter()
        .map(|r| r.expect("account").keys.public_address)
        .collect();
    assert_eq!(addresses.len(), 1);
}

#[tokio::test]
async fn test_unknown_subject_and_network() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("mallory", EVM_NETWORK).await.expect("provision");
    let result = harness
        .engine()
        .quote(&TestHarness::request("mallory", EVM_NETWORK, 43_200))
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let result = harness
        .engine()
        .quote(&TestHarness::request("alice", "ethereum-mainnet", 43_200))
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let result = harness
        .engine()
        .quote(&TestHarness::request("alice", EVM_NETWORK, 43_200))
        .await;
    assert!(
        matches!(result, Err(Error::NotFound(ref m)) if m.contains("account")),
        "no account yet: {result:?}"
    );
}
