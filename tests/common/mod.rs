#![allow(dead_code)]

use async_trait::async_trait;
use payment_pipeline::application::{PaymentOrchestrator, PaymentService};
use payment_pipeline::domain::payment::{Amount, Currency, Payment, ProviderType};
use payment_pipeline::domain::ports::{NotifierRef, PaymentStore};
use payment_pipeline::infrastructure::in_memory::{
    InMemoryMetrics, InMemoryPaymentStore, RecordingNotifier,
};
use payment_pipeline::infrastructure::in_memory_broker::InMemoryBroker;
use payment_pipeline::infrastructure::notifier::LogNotificationSink;
use payment_pipeline::messaging::{MessageChannel, Topology};
use payment_pipeline::provider::paypal::{PayPalCapture, PayPalMoney, PayPalOrder, PayPalOrderRequest};
use payment_pipeline::provider::signature::{paypal_signature, stripe_signature};
use payment_pipeline::provider::stripe::{StripeCharge, StripeChargeRequest};
use payment_pipeline::provider::{
    GatewayError, GatewayResult, PayPalApi, PayPalProvider, PaymentRequest, ProviderConfig,
    ProviderRegistry, StripeApi, StripeProvider,
};
use payment_pipeline::retry::RetryStrategy;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Stripe gateway double. Charges succeed unless a result was scripted.
#[derive(Default)]
pub struct FakeStripe {
    charges: Mutex<HashMap<String, StripeCharge>>,
    scripted: Mutex<VecDeque<GatewayResult<StripeCharge>>>,
    refunds: Mutex<Vec<(String, i64)>>,
    idempotency_keys: Mutex<Vec<String>>,
    charge_calls: AtomicU32,
}

impl FakeStripe {
    /// Queues the result of the next `create_charge` call.
    pub fn script(&self, result: GatewayResult<StripeCharge>) {
        self.scripted.lock().unwrap().push_back(result);
    }

    pub fn set_charge(&self, charge: StripeCharge) {
        self.charges.lock().unwrap().insert(charge.id.clone(), charge);
    }

    pub fn charge_calls(&self) -> u32 {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn refunds(&self) -> Vec<(String, i64)> {
        self.refunds.lock().unwrap().clone()
    }

    /// Idempotency keys of every `create_charge` call, in order.
    pub fn idempotency_keys(&self) -> Vec<String> {
        self.idempotency_keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl StripeApi for FakeStripe {
    async fn create_charge(&self, request: &StripeChargeRequest) -> GatewayResult<StripeCharge> {
        let n = self.charge_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.idempotency_keys
            .lock()
            .unwrap()
            .push(request.idempotency_key.clone());
        let scripted = self.scripted.lock().unwrap().pop_front();
        let charge = match scripted {
            Some(result) => result?,
            None => StripeCharge {
                id: format!("ch_{n}"),
                paid: true,
                status: "succeeded".into(),
                amount: request.amount,
                currency: request.currency.clone(),
                ..Default::default()
            },
        };
        self.set_charge(charge.clone());
        Ok(charge)
    }

    async fn create_refund(&self, charge_id: &str, amount: i64) -> GatewayResult<()> {
        let mut charges = self.charges.lock().unwrap();
        let charge = charges
            .get_mut(charge_id)
            .ok_or_else(|| GatewayError::Declined(format!("No such charge: {charge_id}")))?;
        charge.refunded = true;
        charge.amount_refunded = amount;
        self.refunds.lock().unwrap().push((charge_id.to_string(), amount));
        Ok(())
    }

    async fn retrieve_charge(&self, charge_id: &str) -> GatewayResult<StripeCharge> {
        self.charges
            .lock()
            .unwrap()
            .get(charge_id)
            .cloned()
            .ok_or_else(|| GatewayError::Declined(format!("No such charge: {charge_id}")))
    }
}

/// PayPal gateway double capturing every order immediately.
#[derive(Default)]
pub struct FakePayPal {
    captures: Mutex<HashMap<String, PayPalCapture>>,
}

#[async_trait]
impl PayPalApi for FakePayPal {
    async fn create_order(&self, request: &PayPalOrderRequest) -> GatewayResult<PayPalOrder> {
        Ok(PayPalOrder {
            id: format!("order-{}", request.reference_id),
            status: "CREATED".into(),
        })
    }

    async fn capture_order(&self, order_id: &str, _request_id: &str) -> GatewayResult<PayPalCapture> {
        let capture = PayPalCapture {
            id: format!("cap-{order_id}"),
            status: "COMPLETED".into(),
            ..Default::default()
        };
        self.captures
            .lock()
            .unwrap()
            .insert(capture.id.clone(), capture.clone());
        Ok(capture)
    }

    async fn refund_capture(&self, _capture_id: &str, _amount: &PayPalMoney) -> GatewayResult<()> {
        Ok(())
    }

    async fn get_capture(&self, capture_id: &str) -> GatewayResult<PayPalCapture> {
        self.captures
            .lock()
            .unwrap()
            .get(capture_id)
            .cloned()
            .ok_or_else(|| GatewayError::Transport("capture lookup timed out".into()))
    }
}

pub fn stripe_config() -> ProviderConfig {
    ProviderConfig::new()
        .with(ProviderConfig::SECRET_KEY, "sk_test")
        .with(ProviderConfig::WEBHOOK_SECRET, WEBHOOK_SECRET)
        .with(ProviderConfig::TEST_MODE, "true")
}

pub fn paypal_config() -> ProviderConfig {
    stripe_config().with(ProviderConfig::CLIENT_ID, "client-1")
}

/// A fully wired pipeline running on the in-process broker.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub metrics: Arc<InMemoryMetrics>,
    pub store: Arc<InMemoryPaymentStore>,
    pub notifier: RecordingNotifier,
    pub channel: Arc<MessageChannel>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub service: PaymentService,
    pub stripe: Arc<FakeStripe>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub async fn new() -> Self {
        let broker = InMemoryBroker::new();
        Topology::payment_pipeline().declare(&broker).await.unwrap();

        let metrics = Arc::new(InMemoryMetrics::new());
        let store = Arc::new(InMemoryPaymentStore::new());
        let notifier = RecordingNotifier::new();
        let cancel = CancellationToken::new();
        let retry = RetryStrategy::immediate(3);

        let channel = Arc::new(MessageChannel::new(
            Arc::new(broker.clone()),
            metrics.clone(),
        ));
        let notifier_ref: NotifierRef = Arc::new(notifier.clone());
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            store.clone(),
            notifier_ref,
            channel.clone(),
            retry.clone(),
            cancel.clone(),
        ));

        let stripe = Arc::new(FakeStripe::default());
        let registry = ProviderRegistry::builder()
            .register(
                ProviderType::STRIPE,
                StripeProvider::new(stripe.clone()),
                &stripe_config(),
            )
            .unwrap()
            .register(
                ProviderType::PAYPAL,
                PayPalProvider::new(Arc::new(FakePayPal::default())),
                &paypal_config(),
            )
            .unwrap()
            .build();
        let service = PaymentService::new(
            Arc::new(registry),
            store.clone(),
            orchestrator.clone(),
            retry,
        );

        Self {
            broker,
            metrics,
            store,
            notifier,
            channel,
            orchestrator,
            service,
            stripe,
            cancel,
        }
    }

    /// Starts the payment, status and notification consumers.
    pub async fn start(&self) {
        self.orchestrator
            .start_consumers(Arc::new(LogNotificationSink))
            .await
            .unwrap();
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.channel.close().await.unwrap();
    }

    pub async fn payment(&self, order_id: &str) -> Option<Payment> {
        self.store.find_by_order_id(order_id).await.unwrap()
    }
}

pub fn payment_request(order_id: &str, amount: Decimal) -> PaymentRequest {
    PaymentRequest {
        order_id: order_id.to_string(),
        amount: Amount::new(amount).unwrap(),
        currency: Currency::new("USD").unwrap(),
        customer_id: "cust-1".into(),
        customer_email: "buyer@example.com".into(),
        description: format!("Order {order_id}"),
        metadata: Default::default(),
    }
}

pub fn stripe_header(payload: &[u8]) -> String {
    let now = chrono::Utc::now().timestamp();
    let signature = stripe_signature(WEBHOOK_SECRET, now, payload).unwrap();
    format!("t={now},v1={signature}")
}

pub fn paypal_header(payload: &[u8]) -> String {
    paypal_signature(WEBHOOK_SECRET, payload).unwrap()
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
