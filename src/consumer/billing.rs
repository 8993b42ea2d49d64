//! Usage billing → consumption

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use super::handler::{ConsumerError, Delivery, MessageHandler};
use crate::ledger::{AssetLedger, TxOptions};

pub const BILLING_TOPIC: &str = "billing";
pub const USAGE_BILLED: &str = "USAGE_BILLED";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBilled {
    pub usage_id: String,
    pub user_id: i64,
    pub asset_code: String,
    pub amount: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct UsageBilledHandler {
    pool: PgPool,
    ledger: Arc<AssetLedger>,
}

impl UsageBilledHandler {
    pub fn new(pool: PgPool, ledger: Arc<AssetLedger>) -> Self {
        Self { pool, ledger }
    }
}

#[async_trait]
impl MessageHandler for UsageBilledHandler {
    fn name(&self) -> &str {
        "usage_billed"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        if delivery.msg_type() != USAGE_BILLED {
            return Ok(None);
        }
        let usage: UsageBilled = delivery.envelope.decode()?;

        let mut tx = self.pool.begin().await?;
        let asset = self.ledger.asset_by_code(&mut tx, &usage.asset_code).await?;
        let mut options = TxOptions::with_unique_id(format!("usage:{}", usage.usage_id))
            .metadata(json!({ "usageId": usage.usage_id }));
        if let Some(description) = &usage.description {
            options = options.reason(description.clone());
        }
        let transaction_id = self
            .ledger
            .consume(
                &mut tx,
                usage.user_id,
                asset.asset_type_id,
                &usage.amount,
                options,
            )
            .await?;
        tx.commit().await?;

        info!(usage_id = %usage.usage_id, user_id = usage.user_id, transaction_id, "Usage billed");
        Ok(Some(json!({ "ok": true, "transactionId": transaction_id })))
    }
}
