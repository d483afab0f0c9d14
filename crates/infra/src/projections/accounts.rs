use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use campus_billing::{AccountEvent, DEFAULT_OPENING_BALANCE};
use campus_catalog::CourseId;
use campus_core::{AggregateId, UserId};
use campus_events::EventEnvelope;

use crate::read_model::ReadModelStore;

/// Queryable account read model (balance + entitlements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountReadModel {
    pub user: UserId,
    pub balance: u64,
    pub entitlements: Vec<EntitlementView>,
}

impl AccountReadModel {
    pub fn has_active_entitlement(&self, course_id: CourseId) -> bool {
        self.entitlements
            .iter()
            .any(|e| e.course_id == course_id && e.valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementView {
    pub course_id: CourseId,
    pub cost: u64,
    pub purchased_at: DateTime<Utc>,
    pub valid: bool,
}

#[derive(Debug, Error)]
pub enum AccountProjectionError {
    #[error("failed to deserialize account event: {0}")]
    Deserialize(String),

    #[error("stream mismatch: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Account balances projection (the "admin balances" listing, plus the
/// per-user view behind available-course filtering).
#[derive(Debug)]
pub struct AccountBalancesProjection<S>
where
    S: ReadModelStore<UserId, AccountReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> AccountBalancesProjection<S>
where
    S: ReadModelStore<UserId, AccountReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => *cursors.get(&aggregate_id).unwrap_or(&0),
            Err(_) => 0,
        }
    }

    fn update_cursor(&self, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(aggregate_id, sequence_number);
        }
    }

    pub fn get(&self, user: &UserId) -> Option<AccountReadModel> {
        self.store.get(user)
    }

    pub fn list(&self) -> Vec<AccountReadModel> {
        let mut items = self.store.list();
        items.sort_by_key(|a| a.balance);
        items
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), AccountProjectionError> {
        if envelope.aggregate_type() != "billing.account" {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let last = self.cursor(aggregate_id);
        if seq == 0 {
            return Err(AccountProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 && last != 0 {
            return Err(AccountProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let ev: AccountEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| AccountProjectionError::Deserialize(e.to_string()))?;

        let user = match &ev {
            AccountEvent::AccountOpened(e) => e.user,
            AccountEvent::CoursePurchased(e) => e.user,
            AccountEvent::EntitlementRevoked(e) => e.user,
            AccountEvent::PurchaseReversed(e) => e.user,
        };

        if AggregateId::from(user) != aggregate_id {
            return Err(AccountProjectionError::StreamMismatch(
                "event user does not match envelope aggregate_id".to_string(),
            ));
        }

        let mut rm = self.store.get(&user).unwrap_or(AccountReadModel {
            user,
            balance: DEFAULT_OPENING_BALANCE,
            entitlements: Vec::new(),
        });

        match ev {
            AccountEvent::AccountOpened(e) => {
                rm.balance = e.opening_balance.amount();
            }
            AccountEvent::CoursePurchased(e) => {
                rm.balance = rm.balance.saturating_sub(e.cost.amount());
                rm.entitlements.retain(|ent| ent.course_id != e.course_id);
                rm.entitlements.push(EntitlementView {
                    course_id: e.course_id,
                    cost: e.cost.amount(),
                    purchased_at: e.occurred_at,
                    valid: true,
                });
            }
            AccountEvent::EntitlementRevoked(e) => {
                for ent in rm.entitlements.iter_mut() {
                    if ent.course_id == e.course_id {
                        ent.valid = false;
                    }
                }
            }
            AccountEvent::PurchaseReversed(e) => {
                rm.balance = rm.balance.saturating_add(e.refund.amount());
                rm.entitlements.retain(|ent| ent.course_id != e.course_id);
            }
        }

        self.store.upsert(user, rm);
        self.update_cursor(aggregate_id, seq);
        Ok(())
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), AccountProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        self.store.clear();
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
