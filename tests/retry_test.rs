use payment_pipeline::error::{PaymentError, codes};
use payment_pipeline::retry::{RetryStrategy, with_retry};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[test]
fn test_backoff_bounds_hold_for_random_strategies() {
    let mut rng = rand::thread_rng();

    for _ in 0..1_000 {
        let strategy = RetryStrategy {
            max_attempts: rng.gen_range(0..10),
            initial_interval: Duration::from_millis(rng.gen_range(0..5_000)),
            max_interval: Duration::from_millis(rng.gen_range(0..60_000)),
            multiplier: rng.gen_range(0.0..10.0),
        };
        let attempt = rng.gen_range(1..50);

        let first = strategy.next_interval(0);
        let later = strategy.next_interval(attempt);
        assert!(first <= strategy.max_interval);
        assert!(later <= strategy.max_interval);
        assert_eq!(first, strategy.initial_interval.min(strategy.max_interval));
        // Later attempts all wait the same, never compounding.
        assert_eq!(later, strategy.next_interval(1));
    }
}

#[tokio::test]
async fn test_pre_cancelled_token_makes_no_attempt() {
    let token = CancellationToken::new();
    token.cancel();
    let calls = AtomicU32::new(0);

    let result: Result<(), PaymentError> = with_retry(&token, &RetryStrategy::immediate(3), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    })
    .await;

    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_non_retryable_error_is_attempted_once() {
    let token = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let result: Result<(), PaymentError> = with_retry(&token, &RetryStrategy::immediate(5), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(PaymentError::validation(codes::INVALID_AMOUNT, "Amount must be positive")) }
    })
    .await;

    assert_eq!(result.unwrap_err().code, codes::INVALID_AMOUNT);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_budget_returns_last_error() {
    let token = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let result: Result<(), PaymentError> = with_retry(&token, &RetryStrategy::immediate(4), || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            Err(PaymentError::messaging(
                codes::PUBLISH_ERROR,
                format!("attempt {n} failed"),
            ))
        }
    })
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.message, "attempt 4 failed");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_backoff_waits_between_attempts() {
    let token = CancellationToken::new();
    let strategy = RetryStrategy {
        max_attempts: 2,
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(50),
        multiplier: 1.0,
    };
    let calls = AtomicU32::new(0);

    let started = std::time::Instant::now();
    let result: Result<u32, PaymentError> = with_retry(&token, &strategy, || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 1 {
                Err(PaymentError::database(codes::DB_ERROR, "connection reset"))
            } else {
                Ok(n)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 2);
    assert!(started.elapsed() >= Duration::from_millis(50));
}
