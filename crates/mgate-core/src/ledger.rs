use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use mgate_common::Usage;
use mgate_storage::GatewayStore;
use tracing::debug;

use crate::error::RelayError;
use mgate_common::ErrorKind;

/// Where a request's money lives: the token's own pool, or the owning
/// user's when the token shares quota.
#[derive(Debug, Clone, Copy)]
pub struct QuotaAccount {
    pub token_id: i64,
    pub user_id: i64,
    pub shared: bool,
    pub unlimited: bool,
}

/// The store-side contract: a conditional decrement that only succeeds while
/// the balance covers the amount, and an unconditional credit. The relational
/// implementation is a single filtered UPDATE, so no lock is held across IO
/// and multiple gateway instances compose.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn try_debit(&self, account: &QuotaAccount, amount: i64) -> Result<bool, RelayError>;
    async fn credit(&self, account: &QuotaAccount, amount: i64) -> Result<(), RelayError>;
}

#[async_trait]
impl<T: QuotaStore + ?Sized> QuotaStore for std::sync::Arc<T> {
    async fn try_debit(&self, account: &QuotaAccount, amount: i64) -> Result<bool, RelayError> {
        (**self).try_debit(account, amount).await
    }

    async fn credit(&self, account: &QuotaAccount, amount: i64) -> Result<(), RelayError> {
        (**self).credit(account, amount).await
    }
}

#[async_trait]
impl QuotaStore for GatewayStore {
    async fn try_debit(&self, account: &QuotaAccount, amount: i64) -> Result<bool, RelayError> {
        let result = if account.shared {
            self.try_debit_user(account.user_id, amount).await
        } else {
            self.try_debit_token(account.token_id, amount).await
        };
        result.map_err(|err| RelayError::internal(format!("quota debit failed: {err}")))
    }

    async fn credit(&self, account: &QuotaAccount, amount: i64) -> Result<(), RelayError> {
        let result = if account.shared {
            self.credit_user(account.user_id, amount).await
        } else {
            self.credit_token(account.token_id, amount).await
        };
        result.map_err(|err| RelayError::internal(format!("quota credit failed: {err}")))
    }
}

/// In-memory store for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    balances: Mutex<HashMap<i64, i64>>,
}

impl MemoryQuotaStore {
    pub fn with_balance(token_id: i64, balance: i64) -> Self {
        let store = Self::default();
        store.balances.lock().unwrap().insert(token_id, balance);
        store
    }

    pub fn balance(&self, token_id: i64) -> i64 {
        *self.balances.lock().unwrap().get(&token_id).unwrap_or(&0)
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn try_debit(&self, account: &QuotaAccount, amount: i64) -> Result<bool, RelayError> {
        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry(account.token_id).or_insert(0);
        if *balance < amount {
            return Ok(false);
        }
        *balance -= amount;
        Ok(true)
    }

    async fn credit(&self, account: &QuotaAccount, amount: i64) -> Result<(), RelayError> {
        let mut balances = self.balances.lock().unwrap();
        *balances.entry(account.token_id).or_insert(0) += amount;
        Ok(())
    }
}

/// Per-model pricing in micro-units per token. Cached prompt tokens bill at
/// a percentage of the prompt rate; reasoning tokens bill at a percentage of
/// the completion rate on top of the completion count.
#[derive(Debug, Clone, Copy)]
pub struct Price {
    pub prompt: i64,
    pub completion: i64,
}

#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, Price>,
    default_price: Price,
    pub cached_percent: i64,
    pub reasoning_percent: i64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            prices: HashMap::new(),
            default_price: Price {
                prompt: 2,
                completion: 6,
            },
            cached_percent: 25,
            reasoning_percent: 0,
        }
    }
}

impl PriceTable {
    pub fn insert(&mut self, model: impl Into<String>, price: Price) {
        self.prices.insert(model.into(), price);
    }

    pub fn price(&self, model: &str) -> Price {
        self.prices.get(model).copied().unwrap_or(self.default_price)
    }

    /// Pre-charge estimate: full prompt at prompt rate plus the output
    /// ceiling at completion rate.
    pub fn estimate(&self, model: &str, prompt_tokens: i64, max_output_hint: i64) -> i64 {
        let price = self.price(model);
        price.prompt * prompt_tokens.max(0) + price.completion * max_output_hint.max(0)
    }

    /// Actual cost from settled usage, multipliers applied.
    pub fn cost(&self, model: &str, usage: &Usage) -> i64 {
        let price = self.price(model);
        let cached = usage.cached_tokens.clamp(0, usage.prompt_tokens);
        let uncached_prompt = usage.prompt_tokens - cached;
        let mut cost = price.prompt * uncached_prompt;
        cost += price.prompt * cached * self.cached_percent / 100;
        cost += price.completion * usage.completion_tokens.max(0);
        cost += price.completion * usage.reasoning_tokens.max(0) * self.reasoning_percent / 100;
        cost += price.completion * usage.image_tokens.max(0);
        cost.max(0)
    }
}

/// Evidence of a held pre-charge, consumed exactly once by settle or refund.
#[derive(Debug, Clone)]
pub struct PreCharge {
    pub request_id: String,
    pub account: QuotaAccount,
    pub amount: i64,
}

/// The pre-charge / settle / refund protocol. For any request id at most one
/// of settle or refund takes effect; later calls are no-ops, which makes the
/// controller's error paths free to call refund defensively.
pub struct Ledger<S> {
    store: S,
    prices: PriceTable,
    finished: Mutex<HashSet<String>>,
}

impl<S: QuotaStore> Ledger<S> {
    pub fn new(store: S, prices: PriceTable) -> Self {
        Self {
            store,
            prices,
            finished: Mutex::new(HashSet::new()),
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub async fn pre_charge(
        &self,
        request_id: &str,
        account: QuotaAccount,
        model: &str,
        prompt_tokens: i64,
        max_output_hint: i64,
    ) -> Result<PreCharge, RelayError> {
        let amount = if account.unlimited {
            0
        } else {
            self.prices.estimate(model, prompt_tokens, max_output_hint)
        };
        if amount > 0 && !self.store.try_debit(&account, amount).await? {
            return Err(RelayError::new(
                ErrorKind::InsufficientQuota,
                "insufficient quota for request",
            ));
        }
        debug!(event = "pre_charge", request_id, amount);
        Ok(PreCharge {
            request_id: request_id.to_string(),
            account,
            amount,
        })
    }

    /// Settle against actual usage: refund the overshoot or debit the
    /// shortfall. Returns the amount actually debited for the request.
    pub async fn settle(
        &self,
        pre_charge: &PreCharge,
        model: &str,
        usage: &Usage,
    ) -> Result<i64, RelayError> {
        if !self.mark_finished(&pre_charge.request_id) {
            return Ok(0);
        }
        let actual = if pre_charge.account.unlimited {
            0
        } else {
            self.prices.cost(model, usage)
        };
        let delta = pre_charge.amount - actual;
        if delta > 0 {
            self.store.credit(&pre_charge.account, delta).await?;
        } else if delta < 0 {
            // Shortfall: debit unconditionally; the response was already
            // delivered, so the account may go negative rather than the
            // gateway eating the cost.
            self.store.credit(&pre_charge.account, delta).await?;
        }
        debug!(
            event = "settle",
            request_id = %pre_charge.request_id,
            pre_charge = pre_charge.amount,
            actual
        );
        Ok(actual)
    }

    /// Whole-request failure before any delivery: return the hold in full.
    pub async fn refund(&self, pre_charge: &PreCharge) -> Result<(), RelayError> {
        if !self.mark_finished(&pre_charge.request_id) {
            return Ok(());
        }
        if pre_charge.amount > 0 {
            self.store
                .credit(&pre_charge.account, pre_charge.amount)
                .await?;
        }
        debug!(event = "refund", request_id = %pre_charge.request_id, amount = pre_charge.amount);
        Ok(())
    }

    fn mark_finished(&self, request_id: &str) -> bool {
        let mut finished = match self.finished.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        finished.insert(request_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> QuotaAccount {
        QuotaAccount {
            token_id: 1,
            user_id: 10,
            shared: false,
            unlimited: false,
        }
    }

    fn ledger(balance: i64) -> Ledger<MemoryQuotaStore> {
        Ledger::new(
            MemoryQuotaStore::with_balance(1, balance),
            PriceTable::default(),
        )
    }

    fn usage(prompt: i64, completion: i64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            ..Usage::default()
        }
        .with_totals()
    }

    #[tokio::test]
    async fn quota_conservation_over_settles() {
        let ledger = ledger(100_000);
        let mut total_cost = 0;
        for request in 0..5 {
            let id = format!("req-{request}");
            let hold = ledger
                .pre_charge(&id, account(), "m", 100, 200)
                .await
                .unwrap();
            total_cost += ledger.settle(&hold, "m", &usage(100, 50)).await.unwrap();
        }
        let remaining = ledger.store.balance(1);
        assert_eq!(100_000 - remaining, total_cost);
    }

    #[tokio::test]
    async fn insufficient_quota_denied_without_side_effects() {
        let ledger = ledger(10);
        let err = ledger
            .pre_charge("req-1", account(), "m", 100, 200)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientQuota);
        assert_eq!(ledger.store.balance(1), 10);
    }

    #[tokio::test]
    async fn refund_restores_hold() {
        let ledger = ledger(10_000);
        let hold = ledger
            .pre_charge("req-1", account(), "m", 100, 200)
            .await
            .unwrap();
        assert!(ledger.store.balance(1) < 10_000);
        ledger.refund(&hold).await.unwrap();
        assert_eq!(ledger.store.balance(1), 10_000);
    }

    #[tokio::test]
    async fn settle_then_refund_is_noop() {
        let ledger = ledger(10_000);
        let hold = ledger
            .pre_charge("req-1", account(), "m", 10, 10)
            .await
            .unwrap();
        let cost = ledger.settle(&hold, "m", &usage(10, 5)).await.unwrap();
        assert!(cost > 0);
        let after_settle = ledger.store.balance(1);
        // Retries of either operation change nothing.
        ledger.refund(&hold).await.unwrap();
        assert_eq!(ledger.store.balance(1), after_settle);
        let again = ledger.settle(&hold, "m", &usage(10, 5)).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(ledger.store.balance(1), after_settle);
    }

    #[tokio::test]
    async fn shortfall_debits_past_hold() {
        let ledger = ledger(100_000);
        let hold = ledger
            .pre_charge("req-1", account(), "m", 10, 10)
            .await
            .unwrap();
        // Actual usage far beyond the estimate.
        let cost = ledger.settle(&hold, "m", &usage(10, 10_000)).await.unwrap();
        assert!(cost > hold.amount);
        assert_eq!(ledger.store.balance(1), 100_000 - cost);
    }

    #[tokio::test]
    async fn unlimited_account_never_touches_store() {
        let ledger = ledger(50);
        let account = QuotaAccount {
            unlimited: true,
            ..account()
        };
        let hold = ledger
            .pre_charge("req-1", account, "m", 1_000, 1_000)
            .await
            .unwrap();
        assert_eq!(hold.amount, 0);
        ledger.settle(&hold, "m", &usage(1_000, 1_000)).await.unwrap();
        assert_eq!(ledger.store.balance(1), 50);
    }

    #[test]
    fn cached_tokens_bill_discounted() {
        let prices = PriceTable::default();
        let full = prices.cost(
            "m",
            &Usage {
                prompt_tokens: 100,
                completion_tokens: 0,
                ..Usage::default()
            },
        );
        let cached = prices.cost(
            "m",
            &Usage {
                prompt_tokens: 100,
                cached_tokens: 100,
                completion_tokens: 0,
                ..Usage::default()
            },
        );
        assert_eq!(cached * 4, full);
    }
}
