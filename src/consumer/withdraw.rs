//! Withdraw Saga
//!
//! Driven by message type on topic `wallet.withdraw`. Hold state is explicit
//! (`wallet_holds_tb`), so every step reads where the withdrawal actually is.
//!
//! ```text
//! REQUESTED ──▶ HELD ──┬─ APPROVED / CALLBACK ok ─▶ FINALIZED ─ CALLBACK fail ─▶ REFUNDED
//!                      └─ REJECTED / CALLBACK fail ─▶ RELEASED
//! ```
//!
//! Outgoing events go to `wallet.events` through the outbox, on the same
//! transaction as the ledger change.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::handler::{ConsumerError, Delivery, MessageHandler};
use crate::bus::{MessageBus, PublishOptions};
use crate::ledger::{AssetLedger, Hold, HoldRequest, HoldStatus, LedgerError, WalletId};
use crate::money::format_amount;

pub const WITHDRAW_TOPIC: &str = "wallet.withdraw";
pub const EVENTS_TOPIC: &str = "wallet.events";

pub const WITHDRAW_REQUESTED: &str = "WITHDRAW_REQUESTED";
pub const WITHDRAW_APPROVED: &str = "WITHDRAW_APPROVED";
pub const WITHDRAW_REJECTED: &str = "WITHDRAW_REJECTED";
pub const WITHDRAW_CALLBACK_RECEIVED: &str = "WITHDRAW_CALLBACK_RECEIVED";

pub const TRANSACTION_COMPLETED: &str = "TRANSACTION_COMPLETED";
pub const HOLD_RELEASED: &str = "HOLD_RELEASED";
pub const WITHDRAW_REVERTED: &str = "WITHDRAW_REVERTED";

pub fn hold_key(withdraw_id: &str) -> String {
    format!("withdraw:{}", withdraw_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequested {
    pub withdraw_id: String,
    pub wallet_id: WalletId,
    pub asset_code: String,
    pub amount: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawDecision {
    pub withdraw_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawCallback {
    pub withdraw_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct WithdrawSaga {
    pool: PgPool,
    ledger: Arc<AssetLedger>,
    bus: Arc<MessageBus>,
}

impl WithdrawSaga {
    pub fn new(pool: PgPool, ledger: Arc<AssetLedger>, bus: Arc<MessageBus>) -> Self {
        Self { pool, ledger, bus }
    }

    async fn emit(
        &self,
        conn: &mut PgConnection,
        delivery: &Delivery,
        msg_type: &str,
        dedupe: String,
        data: Value,
    ) -> Result<(), ConsumerError> {
        let mut opts = PublishOptions::dedupe(dedupe);
        if let Some(cid) = delivery.envelope.correlation_id() {
            opts = opts.correlation(cid);
        }
        self.bus
            .emit(conn, EVENTS_TOPIC, msg_type, data, &opts)
            .await?;
        Ok(())
    }

    async fn on_requested(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        let req: WithdrawRequested = delivery.envelope.decode()?;
        let mut tx = self.pool.begin().await?;

        let asset = self.ledger.asset_by_code(&mut tx, &req.asset_code).await?;
        let hold = self
            .ledger
            .place_hold(
                &mut tx,
                &HoldRequest {
                    hold_key: hold_key(&req.withdraw_id),
                    wallet_id: req.wallet_id,
                    asset_type_id: asset.asset_type_id,
                    amount: req.amount.clone(),
                    reason: req.reason.clone(),
                },
            )
            .await?;
        tx.commit().await?;

        info!(withdraw_id = %req.withdraw_id, hold_id = hold.hold_id, "Withdraw hold placed");
        Ok(Some(json!({ "ok": true, "holdId": hold.hold_id })))
    }

    async fn on_approved(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        let msg: WithdrawDecision = delivery.envelope.decode()?;
        let key = hold_key(&msg.withdraw_id);
        let mut tx = self.pool.begin().await?;

        // the completion event committed together with the first finalize
        let current = self.ledger.get_hold(&mut tx, &key).await?;
        if current.status == HoldStatus::Finalized {
            debug!(withdraw_id = %msg.withdraw_id, "Withdraw already finalized");
            return Ok(Some(json!({ "ok": true, "holdId": current.hold_id })));
        }

        let hold = match self.ledger.finalize_hold(&mut tx, &key).await {
            Ok(hold) => hold,
            Err(e @ LedgerError::InvalidHoldTransition { .. }) => {
                return Ok(Some(conflict(&msg.withdraw_id, &e)));
            }
            Err(e) => return Err(e.into()),
        };
        self.emit(
            &mut tx,
            delivery,
            TRANSACTION_COMPLETED,
            format!("{}:completed", key),
            hold_event(&msg.withdraw_id, &hold),
        )
        .await?;
        tx.commit().await?;

        info!(withdraw_id = %msg.withdraw_id, amount = %hold.amount, "Withdraw finalized");
        Ok(Some(json!({ "ok": true, "holdId": hold.hold_id })))
    }

    async fn on_rejected(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        let msg: WithdrawDecision = delivery.envelope.decode()?;
        let key = hold_key(&msg.withdraw_id);
        let mut tx = self.pool.begin().await?;

        let current = self.ledger.get_hold(&mut tx, &key).await?;
        if current.status == HoldStatus::Released {
            debug!(withdraw_id = %msg.withdraw_id, "Withdraw hold already released");
            return Ok(Some(json!({ "ok": true, "holdId": current.hold_id })));
        }

        let hold = match self.ledger.release_hold(&mut tx, &key).await {
            Ok(hold) => hold,
            Err(e @ LedgerError::InvalidHoldTransition { .. }) => {
                return Ok(Some(conflict(&msg.withdraw_id, &e)));
            }
            Err(e) => return Err(e.into()),
        };
        self.emit(
            &mut tx,
            delivery,
            HOLD_RELEASED,
            format!("{}:released", key),
            hold_event(&msg.withdraw_id, &hold),
        )
        .await?;
        tx.commit().await?;

        info!(withdraw_id = %msg.withdraw_id, amount = %hold.amount, "Withdraw hold released");
        Ok(Some(json!({ "ok": true, "holdId": hold.hold_id })))
    }

    async fn on_callback(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        let msg: WithdrawCallback = delivery.envelope.decode()?;
        let key = hold_key(&msg.withdraw_id);

        let current = {
            let mut conn = self.pool.acquire().await?;
            self.ledger.get_hold(&mut conn, &key).await?
        };

        if msg.success {
            return match current.status {
                HoldStatus::Held | HoldStatus::Finalized => self.on_approved(delivery).await,
                HoldStatus::Released | HoldStatus::Refunded => {
                    warn!(
                        withdraw_id = %msg.withdraw_id,
                        status = %current.status,
                        "Success callback for a reverted withdrawal"
                    );
                    Ok(Some(json!({ "ok": false, "status": current.status.as_str() })))
                }
            };
        }

        match current.status {
            HoldStatus::Held => {
                let mut tx = self.pool.begin().await?;
                let hold = self.ledger.release_hold(&mut tx, &key).await?;
                self.emit(
                    &mut tx,
                    delivery,
                    WITHDRAW_REVERTED,
                    format!("{}:reverted", key),
                    reverted_event(&msg, &hold, "unfreeze"),
                )
                .await?;
                tx.commit().await?;
                info!(withdraw_id = %msg.withdraw_id, "Failed withdraw reverted by unfreeze");
                Ok(Some(json!({ "ok": true, "reverted": true, "via": "unfreeze" })))
            }
            HoldStatus::Finalized => self.refund(delivery, &msg, &key).await,
            HoldStatus::Released | HoldStatus::Refunded => {
                debug!(withdraw_id = %msg.withdraw_id, status = %current.status, "Withdrawal already reverted");
                Ok(Some(json!({ "ok": true, "reverted": true })))
            }
        }
    }

    /// Compensate a finalized withdrawal. A failed refund ends the saga with a
    /// `reverted: false` event rather than redelivery.
    async fn refund(
        &self,
        delivery: &Delivery,
        msg: &WithdrawCallback,
        key: &str,
    ) -> Result<Option<Value>, ConsumerError> {
        let mut tx = self.pool.begin().await?;
        match self.ledger.refund_hold(&mut tx, key).await {
            Ok(hold) => {
                self.emit(
                    &mut tx,
                    delivery,
                    WITHDRAW_REVERTED,
                    format!("{}:reverted", key),
                    reverted_event(msg, &hold, "refund"),
                )
                .await?;
                tx.commit().await?;
                info!(withdraw_id = %msg.withdraw_id, amount = %hold.amount, "Failed withdraw refunded");
                Ok(Some(json!({ "ok": true, "reverted": true, "via": "refund" })))
            }
            Err(e) => {
                tx.rollback().await?;
                error!(
                    withdraw_id = %msg.withdraw_id,
                    error = %e,
                    "Refund of failed withdrawal failed, manual action required"
                );

                let mut tx = self.pool.begin().await?;
                self.emit(
                    &mut tx,
                    delivery,
                    WITHDRAW_REVERTED,
                    format!("{}:revert-failed", key),
                    json!({
                        "withdrawId": msg.withdraw_id,
                        "reverted": false,
                        "error": e.to_string(),
                        "callbackError": msg.error,
                    }),
                )
                .await?;
                tx.commit().await?;
                Ok(Some(json!({ "ok": false, "reverted": false, "error": e.to_string() })))
            }
        }
    }
}

fn hold_event(withdraw_id: &str, hold: &Hold) -> Value {
    json!({
        "withdrawId": withdraw_id,
        "holdId": hold.hold_id,
        "walletId": hold.wallet_id,
        "assetTypeId": hold.asset_type_id,
        "amount": format_amount(hold.amount),
        "transactionId": hold.last_transaction_id,
    })
}

fn reverted_event(msg: &WithdrawCallback, hold: &Hold, via: &str) -> Value {
    let mut event = hold_event(&msg.withdraw_id, hold);
    event["reverted"] = json!(true);
    event["via"] = json!(via);
    event["callbackError"] = json!(msg.error);
    event
}

/// A decision that arrived after the hold moved elsewhere is final, not retryable
fn conflict(withdraw_id: &str, e: &LedgerError) -> Value {
    warn!(withdraw_id = %withdraw_id, error = %e, "Withdraw decision conflicts with hold state");
    json!({ "ok": false, "error": e.to_string(), "code": e.code() })
}

#[async_trait]
impl MessageHandler for WithdrawSaga {
    fn name(&self) -> &str {
        "withdraw_saga"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        match delivery.msg_type() {
            WITHDRAW_REQUESTED => self.on_requested(delivery).await,
            WITHDRAW_APPROVED => self.on_approved(delivery).await,
            WITHDRAW_REJECTED => self.on_rejected(delivery).await,
            WITHDRAW_CALLBACK_RECEIVED => self.on_callback(delivery).await,
            other => {
                debug!(msg_type = %other, "Ignoring withdraw message");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Envelope, InMemoryQueue, MemoryCache};
    use crate::config::{BusConfig, LedgerConfig};
    use crate::db::test_pool;
    use crate::ledger::{SystemWallet, TransferCommand, TxOptions, TxType, WalletAsset};
    use crate::outbox::{Outbox, OutboxStatus};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::time::Duration;
    use uuid::Uuid;

    struct Saga {
        pool: PgPool,
        ledger: Arc<AssetLedger>,
        saga: WithdrawSaga,
        wallet: WalletId,
        score: i32,
        asset_code: String,
    }

    impl Saga {
        async fn new(funded: &str) -> Option<Self> {
            Self::with_asset(funded, "SCORE").await
        }

        /// A private asset keeps the system wallet rows for it out of reach of
        /// concurrently running tests
        async fn isolated(funded: &str) -> Option<Self> {
            let pool = test_pool().await?;
            let code = format!("T{}", &Uuid::new_v4().simple().to_string()[..12]);
            sqlx::query("INSERT INTO asset_types_tb (code, name, sort_order) VALUES ($1, $1, 99)")
                .bind(&code)
                .execute(&pool)
                .await
                .ok()?;
            Self::with_asset(funded, &code).await
        }

        async fn with_asset(funded: &str, asset_code: &str) -> Option<Self> {
            let pool = test_pool().await?;
            let ledger = Arc::new(AssetLedger::new(LedgerConfig::default()));
            let queue = Arc::new(InMemoryQueue::new(3, Duration::from_secs(60), 10));
            let bus = Arc::new(MessageBus::new(
                queue,
                Arc::new(MemoryCache::new()),
                BusConfig::default(),
            ));
            bus.attach_outbox(Arc::new(Outbox::new(10)));

            let mut tx = pool.begin().await.ok()?;
            let score = ledger.asset_by_code(&mut tx, asset_code).await.ok()?.asset_type_id;
            let user_id = (Uuid::new_v4().as_u128() >> 65) as i64;
            let wallet = ledger.create_user_wallet(&mut tx, user_id).await.ok()?;
            ledger
                .deposit(&mut tx, wallet, score, funded, true, TxOptions::default())
                .await
                .ok()?;
            tx.commit().await.ok()?;

            let saga = WithdrawSaga::new(pool.clone(), ledger.clone(), bus);
            Some(Self {
                pool,
                ledger,
                saga,
                wallet,
                score,
                asset_code: asset_code.to_string(),
            })
        }

        async fn send(&self, msg_type: &str, data: Value) -> Option<Value> {
            let delivery = Delivery::new(Envelope::new(WITHDRAW_TOPIC, msg_type, data, None), "j");
            self.saga.handle(&delivery).await.unwrap()
        }

        async fn balance(&self) -> WalletAsset {
            let mut conn = self.pool.acquire().await.unwrap();
            self.ledger
                .balance_of(&mut conn, self.wallet, self.score)
                .await
                .unwrap()
        }

        async fn hold_status(&self, withdraw_id: &str) -> HoldStatus {
            let mut conn = self.pool.acquire().await.unwrap();
            self.ledger
                .get_hold(&mut conn, &hold_key(withdraw_id))
                .await
                .unwrap()
                .status
        }

        async fn events(&self, withdraw_id: &str) -> Vec<(String, Value)> {
            sqlx::query_as::<_, (String, Value, i16)>(
                r#"SELECT msg_type, payload, status FROM outbox_messages_tb
                   WHERE topic = $1 AND payload->'data'->>'withdrawId' = $2
                   ORDER BY id"#,
            )
            .bind(EVENTS_TOPIC)
            .bind(withdraw_id)
            .fetch_all(&self.pool)
            .await
            .unwrap()
            .into_iter()
            .map(|(t, p, s)| {
                assert_eq!(OutboxStatus::from_id(s), Some(OutboxStatus::Pending));
                (t, p["data"].clone())
            })
            .collect()
        }

        fn request(&self, withdraw_id: &str, amount: &str) -> Value {
            json!({
                "withdrawId": withdraw_id,
                "walletId": self.wallet,
                "assetCode": self.asset_code,
                "amount": amount,
            })
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn withdraw_id() -> String {
        format!("w-{}", Uuid::new_v4())
    }

    macro_rules! saga_or_skip {
        ($funded:expr) => {
            match Saga::new($funded).await {
                Some(s) => s,
                None => {
                    println!("Skipping test - database not available");
                    return;
                }
            }
        };
    }

    #[tokio::test]
    async fn test_requested_then_approved_conserves_value() {
        let s = saga_or_skip!("100");
        let id = withdraw_id();

        let placed = s.send(WITHDRAW_REQUESTED, s.request(&id, "30")).await.unwrap();
        assert_eq!(placed["ok"], true);
        assert!(placed["holdId"].is_i64());
        let held = s.balance().await;
        assert_eq!(held.balance, dec("70"));
        assert_eq!(held.frozen_balance, dec("30"));

        // replayed request is a no-op
        s.send(WITHDRAW_REQUESTED, s.request(&id, "30")).await;
        assert_eq!(s.balance().await.frozen_balance, dec("30"));

        s.send(WITHDRAW_APPROVED, json!({ "withdrawId": id })).await;
        let after = s.balance().await;
        assert_eq!(after.balance, dec("70"));
        assert_eq!(after.frozen_balance, dec("0"));
        assert_eq!(s.hold_status(&id).await, HoldStatus::Finalized);

        // replayed approval changes nothing and emits nothing
        s.send(WITHDRAW_APPROVED, json!({ "withdrawId": id })).await;
        assert_eq!(s.balance().await.total(), dec("70"));

        let events = s.events(&id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, TRANSACTION_COMPLETED);
        assert_eq!(events[0].1["amount"], "30.000000");
    }

    #[tokio::test]
    async fn test_requested_then_rejected_restores_balance() {
        let s = saga_or_skip!("100");
        let id = withdraw_id();

        s.send(WITHDRAW_REQUESTED, s.request(&id, "40")).await;
        s.send(WITHDRAW_REJECTED, json!({ "withdrawId": id })).await;

        let after = s.balance().await;
        assert_eq!(after.balance, dec("100"));
        assert_eq!(after.frozen_balance, dec("0"));
        assert_eq!(s.hold_status(&id).await, HoldStatus::Released);
        assert_eq!(s.events(&id).await[0].0, HOLD_RELEASED);

        // approval after rejection is a terminal conflict, not a retry
        let late = s.send(WITHDRAW_APPROVED, json!({ "withdrawId": id })).await.unwrap();
        assert_eq!(late["ok"], false);
        assert_eq!(s.balance().await.balance, dec("100"));
    }

    #[tokio::test]
    async fn test_failed_callback_on_held_unfreezes() {
        let s = saga_or_skip!("50");
        let id = withdraw_id();

        s.send(WITHDRAW_REQUESTED, s.request(&id, "20")).await;
        let result = s
            .send(
                WITHDRAW_CALLBACK_RECEIVED,
                json!({ "withdrawId": id, "success": false, "error": "bank down" }),
            )
            .await
            .unwrap();

        assert_eq!(result["via"], "unfreeze");
        assert_eq!(s.balance().await.balance, dec("50"));
        let events = s.events(&id).await;
        assert_eq!(events[0].0, WITHDRAW_REVERTED);
        assert_eq!(events[0].1["reverted"], true);
        assert_eq!(events[0].1["via"], "unfreeze");
    }

    #[tokio::test]
    async fn test_failed_callback_on_finalized_refunds() {
        let s = saga_or_skip!("50");
        let id = withdraw_id();

        s.send(WITHDRAW_REQUESTED, s.request(&id, "20")).await;
        s.send(WITHDRAW_APPROVED, json!({ "withdrawId": id })).await;
        assert_eq!(s.balance().await.balance, dec("30"));

        let result = s
            .send(
                WITHDRAW_CALLBACK_RECEIVED,
                json!({ "withdrawId": id, "success": false }),
            )
            .await
            .unwrap();

        assert_eq!(result["via"], "refund");
        assert_eq!(s.balance().await.balance, dec("50"));
        assert_eq!(s.hold_status(&id).await, HoldStatus::Refunded);
        let via: Vec<_> = s
            .events(&id)
            .await
            .into_iter()
            .filter(|(t, _)| t == WITHDRAW_REVERTED)
            .map(|(_, d)| d["via"].clone())
            .collect();
        assert_eq!(via, vec![json!("refund")]);
    }

    #[tokio::test]
    async fn test_success_callback_finalizes_held() {
        let s = saga_or_skip!("10");
        let id = withdraw_id();

        s.send(WITHDRAW_REQUESTED, s.request(&id, "10")).await;
        s.send(
            WITHDRAW_CALLBACK_RECEIVED,
            json!({ "withdrawId": id, "success": true }),
        )
        .await;

        assert_eq!(s.hold_status(&id).await, HoldStatus::Finalized);
        assert_eq!(s.balance().await.total(), dec("0"));
        assert_eq!(s.events(&id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_success_callback_after_approval_emits_once() {
        let s = saga_or_skip!("10");
        let id = withdraw_id();

        s.send(WITHDRAW_REQUESTED, s.request(&id, "10")).await;
        s.send(WITHDRAW_APPROVED, json!({ "withdrawId": id })).await;
        let result = s
            .send(
                WITHDRAW_CALLBACK_RECEIVED,
                json!({ "withdrawId": id, "success": true }),
            )
            .await
            .unwrap();

        assert_eq!(result["ok"], true);
        assert_eq!(s.hold_status(&id).await, HoldStatus::Finalized);
        let events = s.events(&id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, TRANSACTION_COMPLETED);
    }

    #[tokio::test]
    async fn test_refund_failure_ends_with_unreverted_event() {
        let s = match Saga::isolated("50").await {
            Some(s) => s,
            None => {
                println!("Skipping test - database not available");
                return;
            }
        };
        let id = withdraw_id();

        s.send(WITHDRAW_REQUESTED, s.request(&id, "20")).await;
        s.send(WITHDRAW_APPROVED, json!({ "withdrawId": id })).await;

        // settle the withdrawn funds out of SYSTEM_WITHDRAW so the refund cannot be covered
        let mut tx = s.pool.begin().await.unwrap();
        s.ledger
            .transfer(
                &mut tx,
                TransferCommand::new(
                    SystemWallet::Withdraw.id(),
                    SystemWallet::Revenue.id(),
                    s.score,
                    "20",
                    TxType::Transfer,
                ),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let result = s
            .send(
                WITHDRAW_CALLBACK_RECEIVED,
                json!({ "withdrawId": id, "success": false, "error": "chain rejected" }),
            )
            .await
            .unwrap();

        assert_eq!(result["ok"], false);
        assert_eq!(result["reverted"], false);
        assert_eq!(s.hold_status(&id).await, HoldStatus::Finalized);
        assert_eq!(s.balance().await.balance, dec("30"));

        let events = s.events(&id).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, TRANSACTION_COMPLETED);
        assert_eq!(events[1].0, WITHDRAW_REVERTED);
        assert_eq!(events[1].1["reverted"], false);
        assert_eq!(events[1].1["callbackError"], "chain rejected");
        assert!(events[1].1["error"].is_string());
    }

    #[tokio::test]
    async fn test_request_over_balance_fails_without_hold() {
        let s = saga_or_skip!("5");
        let id = withdraw_id();

        let delivery = Delivery::new(
            Envelope::new(WITHDRAW_TOPIC, WITHDRAW_REQUESTED, s.request(&id, "6"), None),
            "j",
        );
        let err = s.saga.handle(&delivery).await.unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::Ledger(LedgerError::InsufficientBalance { .. })
        ));

        let mut conn = s.pool.acquire().await.unwrap();
        assert!(matches!(
            s.ledger.get_hold(&mut conn, &hold_key(&id)).await,
            Err(LedgerError::HoldNotFound(_))
        ));
    }
}
