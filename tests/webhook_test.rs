mod common;

use common::{Harness, payment_request, paypal_header, stripe_header, wait_until};
use payment_pipeline::domain::payment::{PaymentStatus, ProviderType};
use payment_pipeline::error::codes;
use payment_pipeline::messaging::topology::PAYMENT_STATUS_EXCHANGE;
use payment_pipeline::provider::stripe::StripeCharge;
use rust_decimal_macros::dec;
use serde_json::json;

fn stripe_event(event_type: &str, charge_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": event_type,
        "data": { "object": {
            "id": charge_id,
            "paid": event_type == "charge.succeeded",
            "status": "succeeded",
            "amount": 10000,
            "amount_refunded": 0,
            "currency": "usd",
            "receipt_url": "https://pay.example/receipt",
            "payment_method": "pm_card_visa"
        }}
    }))
    .unwrap()
}

fn status_publishes(h: &Harness) -> usize {
    h.broker
        .published()
        .iter()
        .filter(|e| e.exchange == PAYMENT_STATUS_EXCHANGE)
        .count()
}

async fn pending_stripe_payment(h: &Harness) {
    h.stripe.script(Ok(StripeCharge {
        id: "ch_pending".into(),
        status: "pending".into(),
        amount: 10_000,
        currency: "usd".into(),
        ..Default::default()
    }));
    h.service
        .submit_payment(&h.cancel, payment_request("O1", dec!(100.00)), &ProviderType::STRIPE)
        .await
        .unwrap();
    assert!(wait_until(|| async { h.payment("O1").await.is_some() }).await);
}

#[tokio::test]
async fn test_stripe_success_webhook_completes_payment() {
    let h = Harness::new().await;
    h.start().await;
    pending_stripe_payment(&h).await;

    let payload = stripe_event("charge.succeeded", "ch_pending");
    let event = h
        .service
        .handle_webhook(&h.cancel, &ProviderType::STRIPE, &payload, &stripe_header(&payload))
        .await
        .unwrap();

    assert_eq!(event.status, PaymentStatus::Completed);
    assert_eq!(event.amount, Some(dec!(100.00)));
    assert_eq!(event.currency.as_deref(), Some("USD"));
    assert!(
        wait_until(|| async {
            h.payment("O1").await.map(|p| p.status) == Some(PaymentStatus::Completed)
        })
        .await
    );
    assert_eq!(status_publishes(&h), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_repeated_webhook_publishes_once_applied() {
    let h = Harness::new().await;
    h.start().await;
    pending_stripe_payment(&h).await;

    let payload = stripe_event("charge.succeeded", "ch_pending");
    h.service
        .handle_webhook(&h.cancel, &ProviderType::STRIPE, &payload, &stripe_header(&payload))
        .await
        .unwrap();
    assert!(
        wait_until(|| async {
            h.payment("O1").await.map(|p| p.status) == Some(PaymentStatus::Completed)
        })
        .await
    );

    h.service
        .handle_webhook(&h.cancel, &ProviderType::STRIPE, &payload, &stripe_header(&payload))
        .await
        .unwrap();
    assert_eq!(status_publishes(&h), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_tampered_webhook_is_rejected() {
    let h = Harness::new().await;
    let payload = stripe_event("charge.succeeded", "ch_1");
    let header = stripe_header(b"{}");

    let err = h
        .service
        .handle_webhook(&h.cancel, &ProviderType::STRIPE, &payload, &header)
        .await
        .unwrap_err();

    assert_eq!(err.code, codes::INVALID_SIGNATURE);
    assert!(!err.is_retryable());
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_event_without_status_is_ignored() {
    let h = Harness::new().await;
    let payload = stripe_event("customer.created", "cus_1");

    let event = h
        .service
        .handle_webhook(&h.cancel, &ProviderType::STRIPE, &payload, &stripe_header(&payload))
        .await
        .unwrap();

    assert_eq!(event.status, PaymentStatus::Unknown);
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_webhook_for_unknown_transaction() {
    let h = Harness::new().await;
    let payload = stripe_event("charge.failed", "ch_unknown");

    let err = h
        .service
        .handle_webhook(&h.cancel, &ProviderType::STRIPE, &payload, &stripe_header(&payload))
        .await
        .unwrap_err();

    assert_eq!(err.code, codes::PAYMENT_NOT_FOUND);
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_unsupported_provider() {
    let h = Harness::new().await;
    let err = h
        .service
        .handle_webhook(&h.cancel, &ProviderType::new("adyen"), b"{}", "sig")
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::UNSUPPORTED_PROVIDER);
}

#[tokio::test]
async fn test_paypal_refund_webhook() {
    let h = Harness::new().await;
    h.start().await;

    let payment = h
        .service
        .submit_payment(&h.cancel, payment_request("P1", dec!(25.00)), &ProviderType::PAYPAL)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    let capture_id = payment.transaction_id.clone().unwrap();
    assert!(wait_until(|| async { h.payment("P1").await.is_some() }).await);

    let payload = serde_json::to_vec(&json!({
        "id": "WH-1",
        "event_type": "PAYMENT.CAPTURE.REFUNDED",
        "resource_type": "capture",
        "resource": {
            "id": capture_id,
            "status": "REFUNDED",
            "amount": { "currency_code": "USD", "value": "25.00" }
        }
    }))
    .unwrap();

    let event = h
        .service
        .handle_webhook(&h.cancel, &ProviderType::PAYPAL, &payload, &paypal_header(&payload))
        .await
        .unwrap();
    assert_eq!(event.status, PaymentStatus::Refunded);
    assert_eq!(event.amount, Some(dec!(25.00)));

    assert!(
        wait_until(|| async {
            h.payment("P1").await.map(|p| p.status) == Some(PaymentStatus::Refunded)
        })
        .await
    );

    h.shutdown().await;
}
