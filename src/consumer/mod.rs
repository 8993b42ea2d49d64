//! Bus consumers
//!
//! - [`handler`] - [`MessageHandler`] trait and [`Delivery`]
//! - [`middleware`] - [`Idempotent`] and [`HandshakeAck`] wrappers
//! - [`withdraw`] - withdraw saga on `wallet.withdraw`
//! - [`payment`] / [`billing`] - upstream triggers crediting and charging wallets

pub mod billing;
pub mod handler;
pub mod middleware;
pub mod payment;
pub mod withdraw;

use sqlx::PgPool;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::ConsumerConfig;
use crate::ledger::AssetLedger;

pub use billing::UsageBilledHandler;
pub use handler::{ConsumerError, Delivery, MessageHandler};
pub use middleware::{HandshakeAck, Idempotent, KeyFn, data_field_key};
pub use payment::PaymentCompletedHandler;
pub use withdraw::WithdrawSaga;

/// Subscribe the saga and the upstream triggers with their guards
pub fn register_default_consumers(
    bus: &Arc<MessageBus>,
    pool: PgPool,
    ledger: Arc<AssetLedger>,
    config: &ConsumerConfig,
) {
    let cache = bus.cache().clone();

    // wallet.withdraw: HandshakeAck ─▶ Idempotent ─▶ WithdrawSaga
    let saga = Arc::new(WithdrawSaga::new(pool.clone(), ledger.clone(), bus.clone()));
    let saga = Arc::new(Idempotent::new(
        saga,
        cache.clone(),
        data_field_key("withdraw", "withdrawId"),
        config.dedupe_ttl(),
    ));
    bus.subscribe(
        withdraw::WITHDRAW_TOPIC,
        Arc::new(HandshakeAck::new(saga, bus.clone(), config.handshake_ttl())),
    );

    // payment: Idempotent ─▶ PaymentCompletedHandler
    let payment = Arc::new(PaymentCompletedHandler::new(
        pool.clone(),
        ledger.clone(),
        bus.clone(),
    ));
    bus.subscribe(
        payment::PAYMENT_TOPIC,
        Arc::new(Idempotent::new(
            payment,
            cache.clone(),
            data_field_key("payment", "orderId"),
            config.dedupe_ttl(),
        )),
    );

    // billing: Idempotent ─▶ UsageBilledHandler
    let billing = Arc::new(UsageBilledHandler::new(pool, ledger));
    bus.subscribe(
        billing::BILLING_TOPIC,
        Arc::new(Idempotent::new(
            billing,
            cache,
            data_field_key("usage", "usageId"),
            config.dedupe_ttl(),
        )),
    );
}
