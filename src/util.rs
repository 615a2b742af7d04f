use anyhow::anyhow;
use sentry_core::TransactionContext;
use sentry_core::protocol::SpanStatus;
use std::any::Any;

/// Turn the opaque payload of a caught panic into a printable error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

/// Run `callback` inside a Sentry performance transaction named after the job
/// type, recording whether it succeeded.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: AsyncFnOnce() -> Result<R, E>,
{
    let tx_ctx = TransactionContext::new(transaction_name, "queue.process");
    let transaction = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    transaction.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    transaction.finish();

    result
}
