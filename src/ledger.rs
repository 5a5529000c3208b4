//! Credit accounting service.
//!
//! Every balance change goes through [`AccountStore`], whose debit is a
//! single conditional update, so concurrent turns from one user can never
//! overdraw. The service adds validation, reconciliation, refunds and the
//! monthly allowance on top.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::config::CreditsConfig;
use crate::error::LedgerError;
use crate::migrate::IDEMPOTENT_REF_TYPES;
use crate::models::{LedgerEntry, Plan, UsageRecord, User};
use crate::store::AccountStore;

pub const REASON_MONTHLY: &str = "monthly_allowance";
pub const REASON_CHAT: &str = "chat";
pub const REASON_RECONCILE_DEBIT: &str = "chat_reconcile";
pub const REASON_RECONCILE_CREDIT: &str = "chat_reconcile_refund";
pub const REF_CHAT_TURN: &str = "chat_turn";

const MONTHLY_WINDOW_DAYS: i64 = 30;

/// Result of settling a pre-debit against the real cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Exact,
    /// Further debit of this many credits.
    Charged(i64),
    /// Partial refund of this many credits.
    Refunded(i64),
    /// Adjustment could not be applied. The answer stands.
    Failed { delta: i64, reason: String },
}

pub struct CreditLedger {
    store: Arc<dyn AccountStore>,
    config: CreditsConfig,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn AccountStore>, config: CreditsConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CreditsConfig {
        &self.config
    }

    pub fn monthly_allowance(&self, plan: Plan) -> i64 {
        match plan {
            Plan::Free => self.config.free_monthly,
            Plan::Plus => self.config.plus_monthly,
            Plan::Pro => self.config.pro_monthly,
        }
    }

    /// Atomic conditional debit. Nothing is written when the balance is short.
    pub async fn debit(
        &self,
        user_id: &str,
        cost: i64,
        reason: &str,
        ref_type: Option<&str>,
        ref_id: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        if cost <= 0 {
            return Err(LedgerError::InvalidAmount(cost));
        }
        match self
            .store
            .debit(user_id, cost, reason, ref_type, ref_id)
            .await?
        {
            Some(entry) => {
                tracing::debug!(user_id, cost, balance = entry.balance_after, reason, "debited credits");
                Ok(entry)
            }
            None => {
                if self.store.get_user(user_id).await?.is_none() {
                    return Err(LedgerError::UserNotFound(user_id.to_string()));
                }
                Err(LedgerError::InsufficientCredits { required: cost })
            }
        }
    }

    /// Unconditional credit. `Ok(None)` means the external reference was
    /// already applied.
    pub async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        ref_type: Option<&str>,
        ref_id: Option<&str>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if self.store.get_user(user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(user_id.to_string()));
        }
        let entry = self
            .store
            .credit(user_id, amount, reason, ref_type, ref_id)
            .await?;
        if entry.is_none() {
            tracing::info!(user_id, ?ref_type, ?ref_id, "credit already applied; skipping");
        }
        Ok(entry)
    }

    /// Exact refund of a pre-debit: the balance is restored and the entry
    /// removed from the ledger.
    pub async fn refund(&self, entry_id: &str) -> Result<(), LedgerError> {
        if self.store.revert_entry(entry_id).await? {
            tracing::info!(entry_id, "refunded pre-debit");
            Ok(())
        } else {
            Err(LedgerError::EntryNotFound(entry_id.to_string()))
        }
    }

    /// Apply `actual - estimated` against the pre-debit. Never fails the
    /// caller; problems come back as [`Reconciliation::Failed`].
    pub async fn reconcile(
        &self,
        user_id: &str,
        pre_debit_id: &str,
        estimated: i64,
        actual: i64,
    ) -> Reconciliation {
        let delta = actual - estimated;
        let outcome = if delta > 0 {
            self.debit(
                user_id,
                delta,
                REASON_RECONCILE_DEBIT,
                Some(REF_CHAT_TURN),
                Some(pre_debit_id),
            )
            .await
            .map(|_| Reconciliation::Charged(delta))
        } else if delta < 0 {
            self.credit(
                user_id,
                -delta,
                REASON_RECONCILE_CREDIT,
                Some(REF_CHAT_TURN),
                Some(pre_debit_id),
            )
            .await
            .map(|_| Reconciliation::Refunded(-delta))
        } else {
            Ok(Reconciliation::Exact)
        };

        match outcome {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    pre_debit_id,
                    estimated,
                    actual,
                    error = %e,
                    "credit reconciliation failed"
                );
                Reconciliation::Failed {
                    delta,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Credit for an external event (plan change, payment, invoice, monthly
    /// cycle). Replays of the same reference are no-ops; returns whether
    /// credits were applied.
    pub async fn grant_external(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        ref_type: &str,
        ref_id: &str,
    ) -> Result<bool, LedgerError> {
        if !IDEMPOTENT_REF_TYPES.contains(&ref_type) {
            return Err(LedgerError::UnknownRefType(ref_type.to_string()));
        }
        let entry = self
            .credit(user_id, amount, reason, Some(ref_type), Some(ref_id))
            .await?;
        Ok(entry.is_some())
    }

    pub async fn ensure_monthly_credits(&self, user_id: &str) -> Result<i64, LedgerError> {
        self.ensure_monthly_credits_at(user_id, Utc::now()).await
    }

    /// Grant the plan allowance if the last grant is at least 30 days old.
    /// The period is claimed with a conditional update in the same
    /// transaction as the credit, so concurrent callers grant at most once.
    /// A `monthly_allowance` entry already inside the window claims the
    /// period without crediting. Returns the credits granted.
    pub async fn ensure_monthly_credits_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;

        let window = Duration::days(MONTHLY_WINDOW_DAYS);
        let due_before = now - window;
        if user
            .monthly_credits_granted_at
            .is_some_and(|last| last > due_before)
        {
            return Ok(0);
        }

        let allowance = if self
            .store
            .has_entry_since(user_id, REASON_MONTHLY, due_before)
            .await?
        {
            0
        } else {
            self.monthly_allowance(user.plan).max(0)
        };

        let claimed = self
            .store
            .claim_monthly_grant(user_id, now, due_before, allowance, REASON_MONTHLY)
            .await?;
        if !claimed || allowance == 0 {
            return Ok(0);
        }
        tracing::info!(user_id, allowance, plan = user.plan.as_str(), "granted monthly credits");
        Ok(allowance)
    }

    pub async fn user(&self, user_id: &str) -> Result<User, LedgerError> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        self.store
            .get_user(user_id)
            .await?
            .map(|u| u.credits_balance)
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
    }

    pub async fn ledger(&self, user_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.store.ledger(user_id).await?)
    }

    pub async fn record_usage(&self, usage: &UsageRecord) -> Result<(), LedgerError> {
        Ok(self.store.record_usage(usage).await?)
    }
}
