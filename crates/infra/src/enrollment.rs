//! Enrollment pipeline: purchase and revocation as one business operation.
//!
//! A purchase touches two streams:
//!
//! 1. the student's **account** stream — balance debit + entitlement creation
//!    commit as one atomic append;
//! 2. the course's **roster** stream — the new student is placed into a group.
//!
//! Each append is serialized by optimistic concurrency, and the service
//! bridges the two with bounded retries plus a compensating reversal: if the
//! seat cannot be assigned, the purchase is reversed and the whole operation
//! fails. Callers observe all-or-nothing behavior without a cross-stream
//! transaction.
//!
//! Group placement is an explicit synchronous call on the purchase path, not
//! a persistence-layer side effect, so its failure mode is visible here.

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;

use campus_billing::{
    AccountId, Credits, PurchaseCourse, ReversePurchase, RevokeEntitlement, StudentAccount,
    StudentAccountCommand,
};
use campus_catalog::{Course, CourseId};
use campus_core::{AggregateId, UserId};
use campus_events::{EventBus, EventEnvelope};
use campus_groups::{AssignStudent, RemoveStudent, Roster, RosterCommand, RosterEvent, RosterId};

use crate::command_dispatcher::{rehydrate, CommandDispatcher, DispatchError};
use crate::event_store::EventStore;

/// Upper bound on optimistic-concurrency retries per stream.
const MAX_DISPATCH_ATTEMPTS: usize = 5;

/// Typed purchase failure, mapped to the HTTP contract by the API layer.
#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("course not found")]
    CourseNotFound,

    #[error("course already purchased")]
    AlreadyPurchased,

    #[error("insufficient funds: balance {balance}, cost {cost}")]
    InsufficientFunds { balance: u64, cost: u64 },

    #[error("purchase conflicted with concurrent requests")]
    Conflict,

    #[error("group assignment failed: {0}")]
    Assignment(String),

    #[error("event store failure: {0}")]
    Store(String),
}

/// Typed revocation failure.
#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("no active entitlement for this course")]
    EntitlementNotFound,

    #[error("revocation conflicted with concurrent requests")]
    Conflict,

    #[error("event store failure: {0}")]
    Store(String),
}

/// Outcome of a successful purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    pub course_id: CourseId,
    pub cost: Credits,
    pub balance_after: Credits,
    pub group_no: u32,
}

/// Outcome of a successful revocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationReceipt {
    pub course_id: CourseId,
    /// Group the student was removed from; `None` if they held no seat.
    pub released_group: Option<u32>,
}

/// Orchestrates purchase and revocation across the account and roster streams.
pub struct EnrollmentService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
}

impl<S, B> EnrollmentService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
        }
    }

    /// Purchase a course for a user.
    ///
    /// Preconditions are checked against rehydrated aggregate state (not a
    /// projection), so the cost and the entitlement check are authoritative.
    /// The account append re-validates inside the aggregate; losing a race
    /// reloads and re-checks, which is what turns a concurrent double-spend
    /// into a typed failure instead of a negative balance.
    pub fn purchase(&self, user: UserId, course_id: CourseId) -> Result<PurchaseReceipt, PurchaseError> {
        let course = rehydrate::<Course, _>(self.dispatcher.store(), course_id.0, |id| {
            Course::empty(CourseId::new(id))
        })
        .map_err(|e| PurchaseError::Store(format!("{e:?}")))?;

        // An archived course is gone as far as buyers are concerned.
        if !course.is_purchasable() {
            return Err(PurchaseError::CourseNotFound);
        }
        let cost = Credits::new(course.cost());

        let account_agg = AggregateId::from(user);
        let mut attempt = 0;
        let balance_after = loop {
            attempt += 1;

            let account = rehydrate::<StudentAccount, _>(self.dispatcher.store(), account_agg, |id| {
                StudentAccount::empty(AccountId::new(id))
            })
            .map_err(|e| PurchaseError::Store(format!("{e:?}")))?;

            if account.has_active_entitlement(course_id) {
                return Err(PurchaseError::AlreadyPurchased);
            }

            let available = account.available_balance();
            if !available.covers(cost) {
                return Err(PurchaseError::InsufficientFunds {
                    balance: available.amount(),
                    cost: cost.amount(),
                });
            }

            let cmd = StudentAccountCommand::PurchaseCourse(PurchaseCourse {
                user,
                course_id,
                cost,
                occurred_at: Utc::now(),
            });

            match self.dispatcher.dispatch::<StudentAccount>(
                account_agg,
                "billing.account",
                cmd,
                |id| StudentAccount::empty(AccountId::new(id)),
            ) {
                Ok(_) => break available.saturating_debit(cost),
                // A lost race or a state change under our feet: reload and
                // re-check, so the caller gets the precise typed failure.
                Err(DispatchError::Concurrency(msg) | DispatchError::InvariantViolation(msg))
                    if attempt < MAX_DISPATCH_ATTEMPTS =>
                {
                    tracing::debug!(%user, %course_id, attempt, "purchase append lost a race: {msg}");
                    continue;
                }
                Err(DispatchError::Concurrency(_) | DispatchError::InvariantViolation(_)) => {
                    return Err(PurchaseError::Conflict);
                }
                Err(e) => return Err(PurchaseError::Store(format!("{e:?}"))),
            }
        };

        match self.assign_seat(user, course_id) {
            Ok(group_no) => Ok(PurchaseReceipt {
                course_id,
                cost,
                balance_after,
                group_no,
            }),
            Err(reason) => {
                tracing::warn!(%user, %course_id, "group assignment failed, reversing purchase: {reason}");
                self.reverse_purchase(user, course_id);
                Err(PurchaseError::Assignment(reason))
            }
        }
    }

    /// Revoke a user's entitlement and release their seat.
    ///
    /// Seat release is idempotent (removing an unassigned student is a
    /// no-op), so a failed request can simply be retried.
    pub fn revoke(&self, user: UserId, course_id: CourseId) -> Result<RevocationReceipt, RevocationError> {
        let account_agg = AggregateId::from(user);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let account = rehydrate::<StudentAccount, _>(self.dispatcher.store(), account_agg, |id| {
                StudentAccount::empty(AccountId::new(id))
            })
            .map_err(|e| RevocationError::Store(format!("{e:?}")))?;

            if !account.has_active_entitlement(course_id) {
                return Err(RevocationError::EntitlementNotFound);
            }

            let cmd = StudentAccountCommand::RevokeEntitlement(RevokeEntitlement {
                user,
                course_id,
                occurred_at: Utc::now(),
            });

            match self.dispatcher.dispatch::<StudentAccount>(
                account_agg,
                "billing.account",
                cmd,
                |id| StudentAccount::empty(AccountId::new(id)),
            ) {
                Ok(_) => break,
                Err(DispatchError::Concurrency(_)) if attempt < MAX_DISPATCH_ATTEMPTS => continue,
                Err(DispatchError::Concurrency(_)) => return Err(RevocationError::Conflict),
                Err(e) => return Err(RevocationError::Store(format!("{e:?}"))),
            }
        }

        let roster_agg = RosterId::for_course(course_id).0;
        let mut attempt = 0;
        let released_group = loop {
            attempt += 1;

            let roster = rehydrate::<Roster, _>(self.dispatcher.store(), roster_agg, |id| {
                Roster::empty(RosterId::new(id))
            })
            .map_err(|e| RevocationError::Store(format!("{e:?}")))?;

            let Some(group_no) = roster.group_of(user) else {
                break None;
            };

            let cmd = RosterCommand::RemoveStudent(RemoveStudent {
                course_id,
                user,
                occurred_at: Utc::now(),
            });

            match self
                .dispatcher
                .dispatch::<Roster>(roster_agg, "groups.roster", cmd, |id| {
                    Roster::empty(RosterId::new(id))
                }) {
                Ok(_) => break Some(group_no),
                Err(DispatchError::Concurrency(_)) if attempt < MAX_DISPATCH_ATTEMPTS => continue,
                Err(DispatchError::Concurrency(_)) => return Err(RevocationError::Conflict),
                Err(e) => return Err(RevocationError::Store(format!("{e:?}"))),
            }
        };

        Ok(RevocationReceipt {
            course_id,
            released_group,
        })
    }

    fn assign_seat(&self, user: UserId, course_id: CourseId) -> Result<u32, String> {
        let roster_agg = RosterId::for_course(course_id).0;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let roster = rehydrate::<Roster, _>(self.dispatcher.store(), roster_agg, |id| {
                Roster::empty(RosterId::new(id))
            })
            .map_err(|e| format!("{e:?}"))?;

            // Already placed (e.g. an earlier removal never went through).
            if let Some(group_no) = roster.group_of(user) {
                return Ok(group_no);
            }

            let cmd = RosterCommand::AssignStudent(AssignStudent {
                course_id,
                user,
                occurred_at: Utc::now(),
            });

            match self
                .dispatcher
                .dispatch::<Roster>(roster_agg, "groups.roster", cmd, |id| {
                    Roster::empty(RosterId::new(id))
                }) {
                Ok(committed) => {
                    for stored in &committed {
                        if let Ok(RosterEvent::StudentAssigned(e)) =
                            serde_json::from_value::<RosterEvent>(stored.payload.clone())
                        {
                            if e.user == user {
                                return Ok(e.group_no);
                            }
                        }
                    }
                    return Err("assignment committed without a placement event".to_string());
                }
                Err(DispatchError::Concurrency(_)) if attempt < MAX_DISPATCH_ATTEMPTS => continue,
                Err(e) => return Err(format!("{e:?}")),
            }
        }
    }

    /// Compensation: undo the debit + entitlement after a failed placement.
    ///
    /// Best effort with retries; a terminal failure is logged and leaves the
    /// account stream as the audit trail (the entitlement stays visible and a
    /// later revocation can clean it up).
    fn reverse_purchase(&self, user: UserId, course_id: CourseId) {
        let account_agg = AggregateId::from(user);

        for attempt in 1..=MAX_DISPATCH_ATTEMPTS {
            let cmd = StudentAccountCommand::ReversePurchase(ReversePurchase {
                user,
                course_id,
                occurred_at: Utc::now(),
            });

            match self.dispatcher.dispatch::<StudentAccount>(
                account_agg,
                "billing.account",
                cmd,
                |id| StudentAccount::empty(AccountId::new(id)),
            ) {
                Ok(_) => return,
                Err(DispatchError::Concurrency(_)) if attempt < MAX_DISPATCH_ATTEMPTS => continue,
                Err(e) => {
                    tracing::error!(%user, %course_id, "purchase reversal failed: {e:?}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use campus_catalog::{ArchiveCourse, CourseCommand, CreateCourse};
    use campus_core::AggregateRoot;
    use campus_events::InMemoryEventBus;

    use crate::event_store::InMemoryEventStore;

    type Store = Arc<InMemoryEventStore>;
    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    struct Fixture {
        service: EnrollmentService<Store, Bus>,
        admin: CommandDispatcher<Store, Bus>,
        store: Store,
    }

    fn fixture() -> Fixture {
        let store: Store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        Fixture {
            service: EnrollmentService::new(store.clone(), bus.clone()),
            admin: CommandDispatcher::new(store.clone(), bus),
            store,
        }
    }

    impl Fixture {
        fn create_course(&self, cost: u64) -> CourseId {
            let course_id = CourseId::new(AggregateId::new());
            let cmd = CourseCommand::CreateCourse(CreateCourse {
                course_id,
                creator: UserId::new(),
                name: format!("Course {course_id}"),
                cost,
                occurred_at: Utc::now(),
            });
            self.admin
                .dispatch::<Course>(course_id.0, "catalog.course", cmd, |id| {
                    Course::empty(CourseId::new(id))
                })
                .expect("course creation failed");
            course_id
        }

        fn archive_course(&self, course_id: CourseId) {
            let cmd = CourseCommand::ArchiveCourse(ArchiveCourse {
                course_id,
                occurred_at: Utc::now(),
            });
            self.admin
                .dispatch::<Course>(course_id.0, "catalog.course", cmd, |id| {
                    Course::empty(CourseId::new(id))
                })
                .expect("course archival failed");
        }

        fn account(&self, user: UserId) -> StudentAccount {
            rehydrate(&self.store, AggregateId::from(user), |id| {
                StudentAccount::empty(AccountId::new(id))
            })
            .unwrap()
        }

        fn roster(&self, course_id: CourseId) -> Roster {
            rehydrate(&self.store, RosterId::for_course(course_id).0, |id| {
                Roster::empty(RosterId::new(id))
            })
            .unwrap()
        }
    }

    #[test]
    fn purchase_debits_balance_and_creates_entitlement() {
        let fx = fixture();
        let course_id = fx.create_course(400);
        let user = UserId::new();

        let receipt = fx.service.purchase(user, course_id).unwrap();
        assert_eq!(receipt.cost, Credits::new(400));
        assert_eq!(receipt.balance_after, Credits::new(600));
        assert_eq!(receipt.group_no, 1);

        let account = fx.account(user);
        assert_eq!(account.available_balance(), Credits::new(600));
        assert!(account.has_active_entitlement(course_id));
        assert_eq!(account.entitlements().count(), 1);
    }

    #[test]
    fn first_purchase_creates_group_one_with_the_buyer() {
        let fx = fixture();
        let course_id = fx.create_course(100);
        let user = UserId::new();

        fx.service.purchase(user, course_id).unwrap();

        let roster = fx.roster(course_id);
        let groups: Vec<_> = roster.groups().collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_no, 1);
        assert_eq!(groups[0].student_count(), 1);
        assert!(groups[0].members.contains(&user));
    }

    #[test]
    fn second_buyer_gets_a_fresh_group_below_the_fanout_limit() {
        let fx = fixture();
        let course_id = fx.create_course(100);

        fx.service.purchase(UserId::new(), course_id).unwrap();
        let receipt = fx.service.purchase(UserId::new(), course_id).unwrap();

        assert_eq!(receipt.group_no, 2);
        assert_eq!(fx.roster(course_id).groups().count(), 2);
    }

    #[test]
    fn missing_course_is_reported_with_no_side_effects() {
        let fx = fixture();
        let user = UserId::new();

        let err = fx
            .service
            .purchase(user, CourseId::new(AggregateId::new()))
            .unwrap_err();
        assert!(matches!(err, PurchaseError::CourseNotFound));

        let account = fx.account(user);
        assert!(!account.is_open());
        assert_eq!(account.version(), 0);
    }

    #[test]
    fn archived_course_reads_as_missing() {
        let fx = fixture();
        let course_id = fx.create_course(100);
        fx.archive_course(course_id);

        let err = fx.service.purchase(UserId::new(), course_id).unwrap_err();
        assert!(matches!(err, PurchaseError::CourseNotFound));
    }

    #[test]
    fn insufficient_funds_leaves_no_trace() {
        let fx = fixture();
        let course_id = fx.create_course(1000);
        let cheap = fx.create_course(600);
        let user = UserId::new();

        // Burn most of the balance first.
        fx.service.purchase(user, cheap).unwrap();

        let err = fx.service.purchase(user, course_id).unwrap_err();
        match err {
            PurchaseError::InsufficientFunds { balance, cost } => {
                assert_eq!(balance, 400);
                assert_eq!(cost, 1000);
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }

        let account = fx.account(user);
        assert_eq!(account.available_balance(), Credits::new(400));
        assert!(!account.has_active_entitlement(course_id));

        // No seat was created for the failed purchase either.
        assert!(fx.roster(course_id).group_of(user).is_none());
    }

    #[test]
    fn exact_funds_scenario() {
        let fx = fixture();
        let course_id = fx.create_course(1000);
        let user = UserId::new();

        let receipt = fx.service.purchase(user, course_id).unwrap();
        assert_eq!(receipt.balance_after, Credits::zero());

        let err = fx.service.purchase(user, course_id).unwrap_err();
        assert!(matches!(err, PurchaseError::AlreadyPurchased));
        assert_eq!(fx.account(user).available_balance(), Credits::zero());
    }

    #[test]
    fn underfunded_scenario() {
        let fx = fixture();
        let burner = fx.create_course(500);
        let course_id = fx.create_course(1000);
        let user = UserId::new();

        fx.service.purchase(user, burner).unwrap();

        let err = fx.service.purchase(user, course_id).unwrap_err();
        assert!(matches!(
            err,
            PurchaseError::InsufficientFunds { balance: 500, cost: 1000 }
        ));
        assert_eq!(fx.account(user).available_balance(), Credits::new(500));
        assert_eq!(fx.account(user).entitlements().count(), 1);
    }

    #[test]
    fn revocation_releases_the_seat_and_keeps_the_balance() {
        let fx = fixture();
        let course_id = fx.create_course(300);
        let user = UserId::new();

        fx.service.purchase(user, course_id).unwrap();

        let receipt = fx.service.revoke(user, course_id).unwrap();
        assert_eq!(receipt.released_group, Some(1));

        let account = fx.account(user);
        assert!(!account.has_active_entitlement(course_id));
        assert_eq!(account.available_balance(), Credits::new(700));

        let roster = fx.roster(course_id);
        assert!(roster.group_of(user).is_none());
        assert_eq!(roster.group(1).unwrap().student_count(), 0);
    }

    #[test]
    fn revoking_without_entitlement_is_not_found() {
        let fx = fixture();
        let course_id = fx.create_course(300);

        let err = fx.service.revoke(UserId::new(), course_id).unwrap_err();
        assert!(matches!(err, RevocationError::EntitlementNotFound));
    }

    #[test]
    fn freed_seat_is_reused_by_the_next_buyer() {
        let fx = fixture();
        let course_id = fx.create_course(100);
        let first = UserId::new();

        fx.service.purchase(first, course_id).unwrap();
        fx.service.revoke(first, course_id).unwrap();

        let receipt = fx.service.purchase(UserId::new(), course_id).unwrap();
        assert_eq!(receipt.group_no, 1);
        assert_eq!(fx.roster(course_id).groups().count(), 1);
    }

    #[test]
    fn repurchase_after_revocation_succeeds() {
        let fx = fixture();
        let course_id = fx.create_course(100);
        let user = UserId::new();

        fx.service.purchase(user, course_id).unwrap();
        fx.service.revoke(user, course_id).unwrap();

        let receipt = fx.service.purchase(user, course_id).unwrap();
        assert_eq!(receipt.balance_after, Credits::new(800));
        assert!(fx.account(user).has_active_entitlement(course_id));
        assert_eq!(fx.roster(course_id).group_of(user), Some(1));
    }

    #[test]
    fn buyers_fan_out_then_pack_then_overflow() {
        let fx = fixture();
        let course_id = fx.create_course(0);

        // 100 buyers fill ten groups of ten.
        for _ in 0..100 {
            fx.service.purchase(UserId::new(), course_id).unwrap();
        }
        let roster = fx.roster(course_id);
        assert_eq!(roster.groups().count(), 10);
        assert!(roster.groups().all(|g| g.is_full()));

        // The 101st buyer opens group 11 instead of over-packing.
        let receipt = fx.service.purchase(UserId::new(), course_id).unwrap();
        assert_eq!(receipt.group_no, 11);
    }
}
