//! Payment completion → deposit

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use super::handler::{ConsumerError, Delivery, MessageHandler};
use super::withdraw::EVENTS_TOPIC;
use crate::bus::{MessageBus, PublishOptions};
use crate::ledger::{AssetLedger, TxOptions};

pub const PAYMENT_TOPIC: &str = "payment";
pub const PAYMENT_COMPLETED: &str = "PAYMENT_COMPLETED";
pub const DEPOSIT_COMPLETED: &str = "DEPOSIT_COMPLETED";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    pub order_id: String,
    pub user_id: i64,
    pub asset_code: String,
    pub amount: String,
}

/// Credits a paid order. The journal key `payment:{orderId}` makes
/// redelivery a no-op.
pub struct PaymentCompletedHandler {
    pool: PgPool,
    ledger: Arc<AssetLedger>,
    bus: Arc<MessageBus>,
}

impl PaymentCompletedHandler {
    pub fn new(pool: PgPool, ledger: Arc<AssetLedger>, bus: Arc<MessageBus>) -> Self {
        Self { pool, ledger, bus }
    }
}

#[async_trait]
impl MessageHandler for PaymentCompletedHandler {
    fn name(&self) -> &str {
        "payment_completed"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        if delivery.msg_type() != PAYMENT_COMPLETED {
            return Ok(None);
        }
        let payment: PaymentCompleted = delivery.envelope.decode()?;
        let unique_id = format!("payment:{}", payment.order_id);

        let mut tx = self.pool.begin().await?;
        let wallet_id = self.ledger.create_user_wallet(&mut tx, payment.user_id).await?;
        let asset = self.ledger.asset_by_code(&mut tx, &payment.asset_code).await?;
        let transaction_id = self
            .ledger
            .deposit(
                &mut tx,
                wallet_id,
                asset.asset_type_id,
                &payment.amount,
                true,
                TxOptions::with_unique_id(unique_id.clone())
                    .reason("payment completed")
                    .metadata(json!({ "orderId": payment.order_id })),
            )
            .await?;
        self.bus
            .emit(
                &mut tx,
                EVENTS_TOPIC,
                DEPOSIT_COMPLETED,
                json!({
                    "orderId": payment.order_id,
                    "userId": payment.user_id,
                    "walletId": wallet_id,
                    "assetTypeId": asset.asset_type_id,
                    "amount": payment.amount,
                    "transactionId": transaction_id,
                }),
                &PublishOptions::dedupe(unique_id),
            )
            .await?;
        tx.commit().await?;

        info!(
            order_id = %payment.order_id,
            user_id = payment.user_id,
            transaction_id,
            "Payment credited"
        );
        Ok(Some(json!({ "ok": true, "transactionId": transaction_id })))
    }
}
