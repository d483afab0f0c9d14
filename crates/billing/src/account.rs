use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use campus_catalog::CourseId;
use campus_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId, ValueObject};
use campus_events::Event;

/// Opening balance credited to every account on first contact.
pub const DEFAULT_OPENING_BALANCE: u64 = 1000;

/// Credit amount (internal ledger units, not a payment-processor currency).
///
/// Arithmetic is saturating at zero, so a negative balance is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credits(u64);

impl Credits {
    pub const fn new(amount: u64) -> Self {
        Self(amount)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn amount(&self) -> u64 {
        self.0
    }

    pub fn saturating_debit(self, cost: Credits) -> Credits {
        Credits(self.0.saturating_sub(cost.0))
    }

    pub fn saturating_credit(self, amount: Credits) -> Credits {
        Credits(self.0.saturating_add(amount.0))
    }

    pub fn covers(&self, cost: Credits) -> bool {
        self.0 >= cost.0
    }
}

impl ValueObject for Credits {}

impl core::fmt::Display for Credits {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Account identifier.
///
/// The account stream id is the user's id, so there is exactly one account
/// stream per user and commands for one user serialize on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub AggregateId);

impl AccountId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn for_user(user: UserId) -> Self {
        Self(AggregateId::from(user))
    }
}

impl core::fmt::Display for AccountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A purchase entitlement held by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub course_id: CourseId,
    pub cost: Credits,
    pub purchased_at: DateTime<Utc>,
    pub valid: bool,
}

/// Aggregate root: StudentAccount (balance + entitlements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentAccount {
    id: AccountId,
    user: Option<UserId>,
    balance: Credits,
    entitlements: HashMap<CourseId, Entitlement>,
    version: u64,
    created: bool,
}

impl StudentAccount {
    /// Create an empty, not-yet-opened aggregate instance for rehydration.
    pub fn empty(id: AccountId) -> Self {
        Self {
            id,
            user: None,
            balance: Credits::zero(),
            entitlements: HashMap::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AccountId {
        self.id
    }

    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    pub fn is_open(&self) -> bool {
        self.created
    }

    /// Balance the next purchase would be checked against.
    ///
    /// A never-opened account carries the default opening balance: opening is
    /// implicit on first purchase.
    pub fn available_balance(&self) -> Credits {
        if self.created {
            self.balance
        } else {
            Credits::new(DEFAULT_OPENING_BALANCE)
        }
    }

    pub fn has_active_entitlement(&self, course_id: CourseId) -> bool {
        self.entitlements
            .get(&course_id)
            .map(|e| e.valid)
            .unwrap_or(false)
    }

    pub fn entitlement(&self, course_id: CourseId) -> Option<&Entitlement> {
        self.entitlements.get(&course_id)
    }

    pub fn entitlements(&self) -> impl Iterator<Item = &Entitlement> {
        self.entitlements.values()
    }
}

impl AggregateRoot for StudentAccount {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PurchaseCourse (debit + entitlement, atomically).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseCourse {
    pub user: UserId,
    pub course_id: CourseId,
    pub cost: Credits,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RevokeEntitlement (no refund; the seat is released separately).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeEntitlement {
    pub user: UserId,
    pub course_id: CourseId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReversePurchase (compensation when downstream placement fails).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversePurchase {
    pub user: UserId,
    pub course_id: CourseId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudentAccountCommand {
    PurchaseCourse(PurchaseCourse),
    RevokeEntitlement(RevokeEntitlement),
    ReversePurchase(ReversePurchase),
}

/// Event: AccountOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub user: UserId,
    pub opening_balance: Credits,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CoursePurchased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoursePurchased {
    pub user: UserId,
    pub course_id: CourseId,
    pub cost: Credits,
    pub occurred_at: DateTime<Utc>,
}

/// Event: EntitlementRevoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRevoked {
    pub user: UserId,
    pub course_id: CourseId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseReversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReversed {
    pub user: UserId,
    pub course_id: CourseId,
    pub refund: Credits,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    AccountOpened(AccountOpened),
    CoursePurchased(CoursePurchased),
    EntitlementRevoked(EntitlementRevoked),
    PurchaseReversed(PurchaseReversed),
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened(_) => "billing.account.opened",
            AccountEvent::CoursePurchased(_) => "billing.account.course_purchased",
            AccountEvent::EntitlementRevoked(_) => "billing.account.entitlement_revoked",
            AccountEvent::PurchaseReversed(_) => "billing.account.purchase_reversed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::AccountOpened(e) => e.occurred_at,
            AccountEvent::CoursePurchased(e) => e.occurred_at,
            AccountEvent::EntitlementRevoked(e) => e.occurred_at,
            AccountEvent::PurchaseReversed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StudentAccount {
    type Command = StudentAccountCommand;
    type Event = AccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::AccountOpened(e) => {
                self.user = Some(e.user);
                self.balance = e.opening_balance;
                self.created = true;
            }
            AccountEvent::CoursePurchased(e) => {
                self.balance = self.balance.saturating_debit(e.cost);
                self.entitlements.insert(
                    e.course_id,
                    Entitlement {
                        course_id: e.course_id,
                        cost: e.cost,
                        purchased_at: e.occurred_at,
                        valid: true,
                    },
                );
            }
            AccountEvent::EntitlementRevoked(e) => {
                if let Some(ent) = self.entitlements.get_mut(&e.course_id) {
                    ent.valid = false;
                }
            }
            AccountEvent::PurchaseReversed(e) => {
                self.balance = self.balance.saturating_credit(e.refund);
                self.entitlements.remove(&e.course_id);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StudentAccountCommand::PurchaseCourse(cmd) => self.handle_purchase(cmd),
            StudentAccountCommand::RevokeEntitlement(cmd) => self.handle_revoke(cmd),
            StudentAccountCommand::ReversePurchase(cmd) => self.handle_reverse(cmd),
        }
    }
}

impl StudentAccount {
    fn ensure_user(&self, user: UserId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.user != Some(user) {
            return Err(DomainError::invariant("account user mismatch"));
        }
        Ok(())
    }

    fn handle_purchase(&self, cmd: &PurchaseCourse) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_user(cmd.user)?;

        if self.has_active_entitlement(cmd.course_id) {
            return Err(DomainError::conflict("course already purchased"));
        }

        if !self.available_balance().covers(cmd.cost) {
            return Err(DomainError::invariant("insufficient funds"));
        }

        let mut events = Vec::with_capacity(2);

        // First contact opens the account with the default balance, in the
        // same atomic batch as the purchase.
        if !self.created {
            events.push(AccountEvent::AccountOpened(AccountOpened {
                user: cmd.user,
                opening_balance: Credits::new(DEFAULT_OPENING_BALANCE),
                occurred_at: cmd.occurred_at,
            }));
        }

        events.push(AccountEvent::CoursePurchased(CoursePurchased {
            user: cmd.user,
            course_id: cmd.course_id,
            cost: cmd.cost,
            occurred_at: cmd.occurred_at,
        }));

        Ok(events)
    }

    fn handle_revoke(&self, cmd: &RevokeEntitlement) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_user(cmd.user)?;

        if !self.has_active_entitlement(cmd.course_id) {
            return Err(DomainError::not_found());
        }

        Ok(vec![AccountEvent::EntitlementRevoked(EntitlementRevoked {
            user: cmd.user,
            course_id: cmd.course_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reverse(&self, cmd: &ReversePurchase) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_user(cmd.user)?;

        let Some(ent) = self.entitlements.get(&cmd.course_id) else {
            return Err(DomainError::not_found());
        };
        if !ent.valid {
            return Err(DomainError::conflict("entitlement already revoked"));
        }

        Ok(vec![AccountEvent::PurchaseReversed(PurchaseReversed {
            user: cmd.user,
            course_id: cmd.course_id,
            refund: ent.cost,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_events::execute;

    fn test_user() -> UserId {
        UserId::new()
    }

    fn test_course_id() -> CourseId {
        CourseId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn purchase_cmd(user: UserId, course_id: CourseId, cost: u64) -> StudentAccountCommand {
        StudentAccountCommand::PurchaseCourse(PurchaseCourse {
            user,
            course_id,
            cost: Credits::new(cost),
            occurred_at: test_time(),
        })
    }

    #[test]
    fn first_purchase_opens_account_and_debits_cost() {
        let user = test_user();
        let course_id = test_course_id();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        let events = execute(&mut account, &purchase_cmd(user, course_id, 400)).unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AccountEvent::AccountOpened(_)));
        assert!(matches!(events[1], AccountEvent::CoursePurchased(_)));

        assert!(account.is_open());
        assert_eq!(account.available_balance(), Credits::new(600));
        assert!(account.has_active_entitlement(course_id));
    }

    #[test]
    fn purchase_debits_exactly_the_cost() {
        let user = test_user();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        execute(&mut account, &purchase_cmd(user, test_course_id(), 250)).unwrap();
        execute(&mut account, &purchase_cmd(user, test_course_id(), 250)).unwrap();

        assert_eq!(account.available_balance(), Credits::new(500));
        assert_eq!(account.entitlements().count(), 2);
    }

    #[test]
    fn exact_balance_purchase_leaves_zero() {
        let user = test_user();
        let course_id = test_course_id();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        execute(
            &mut account,
            &purchase_cmd(user, course_id, DEFAULT_OPENING_BALANCE),
        )
        .unwrap();

        assert_eq!(account.available_balance(), Credits::zero());

        // Second attempt for the same course fails on the entitlement, not
        // on funds, and leaves no trace.
        let err = account
            .handle(&purchase_cmd(user, course_id, DEFAULT_OPENING_BALANCE))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(account.available_balance(), Credits::zero());
    }

    #[test]
    fn insufficient_funds_has_no_side_effects() {
        let user = test_user();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        execute(&mut account, &purchase_cmd(user, test_course_id(), 500)).unwrap();
        let before = account.clone();

        let err = account
            .handle(&purchase_cmd(user, test_course_id(), 1000))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(account, before);
    }

    #[test]
    fn repurchase_of_active_entitlement_is_rejected() {
        let user = test_user();
        let course_id = test_course_id();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        execute(&mut account, &purchase_cmd(user, course_id, 100)).unwrap();

        let err = account
            .handle(&purchase_cmd(user, course_id, 100))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn revoke_marks_entitlement_invalid_without_refund() {
        let user = test_user();
        let course_id = test_course_id();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        execute(&mut account, &purchase_cmd(user, course_id, 300)).unwrap();
        execute(
            &mut account,
            &StudentAccountCommand::RevokeEntitlement(RevokeEntitlement {
                user,
                course_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert!(!account.has_active_entitlement(course_id));
        assert_eq!(account.available_balance(), Credits::new(700));
        assert!(!account.entitlement(course_id).unwrap().valid);
    }

    #[test]
    fn revoke_without_active_entitlement_is_not_found() {
        let user = test_user();
        let mut account = StudentAccount::empty(AccountId::for_user(user));
        execute(&mut account, &purchase_cmd(user, test_course_id(), 100)).unwrap();

        let err = account
            .handle(&StudentAccountCommand::RevokeEntitlement(RevokeEntitlement {
                user,
                course_id: test_course_id(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[test]
    fn repurchase_after_revocation_is_allowed() {
        let user = test_user();
        let course_id = test_course_id();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        execute(&mut account, &purchase_cmd(user, course_id, 100)).unwrap();
        execute(
            &mut account,
            &StudentAccountCommand::RevokeEntitlement(RevokeEntitlement {
                user,
                course_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        execute(&mut account, &purchase_cmd(user, course_id, 100)).unwrap();
        assert!(account.has_active_entitlement(course_id));
        assert_eq!(account.available_balance(), Credits::new(800));
    }

    #[test]
    fn reverse_refunds_and_clears_the_entitlement() {
        let user = test_user();
        let course_id = test_course_id();
        let mut account = StudentAccount::empty(AccountId::for_user(user));

        execute(&mut account, &purchase_cmd(user, course_id, 450)).unwrap();
        execute(
            &mut account,
            &StudentAccountCommand::ReversePurchase(ReversePurchase {
                user,
                course_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(account.available_balance(), Credits::new(DEFAULT_OPENING_BALANCE));
        assert!(account.entitlement(course_id).is_none());
    }

    #[test]
    fn reverse_without_purchase_is_not_found() {
        let user = test_user();
        let account = StudentAccount::empty(AccountId::for_user(user));

        let err = account
            .handle(&StudentAccountCommand::ReversePurchase(ReversePurchase {
                user,
                course_id: test_course_id(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[test]
    fn commands_for_another_user_are_rejected() {
        let user = test_user();
        let mut account = StudentAccount::empty(AccountId::for_user(user));
        execute(&mut account, &purchase_cmd(user, test_course_id(), 100)).unwrap();

        let err = account
            .handle(&purchase_cmd(test_user(), test_course_id(), 100))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 512,
                ..ProptestConfig::default()
            })]

            /// Property: across any sequence of purchase attempts, the balance
            /// equals the opening balance minus the costs of the accepted
            /// purchases, and never underflows.
            #[test]
            fn balance_never_underflows(costs in prop::collection::vec(0u64..800, 1..20)) {
                let user = test_user();
                let mut account = StudentAccount::empty(AccountId::for_user(user));
                let mut expected = DEFAULT_OPENING_BALANCE;

                for cost in costs {
                    let cmd = purchase_cmd(user, test_course_id(), cost);
                    match execute(&mut account, &cmd) {
                        Ok(_) => {
                            prop_assert!(expected >= cost);
                            expected -= cost;
                        }
                        Err(DomainError::InvariantViolation(_)) => {
                            prop_assert!(expected < cost);
                        }
                        Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {e:?}"))),
                    }
                    prop_assert_eq!(account.available_balance().amount(), expected);
                }
            }

            /// Property: a purchase attempt either succeeds once or fails with
            /// no state change (same state + command = same outcome).
            #[test]
            fn handle_is_deterministic(cost in 0u64..2000) {
                let user = test_user();
                let course_id = test_course_id();
                let account = StudentAccount::empty(AccountId::for_user(user));
                let cmd = purchase_cmd(user, course_id, cost);

                let first = account.handle(&cmd);
                let second = account.handle(&cmd);
                prop_assert_eq!(first, second);
            }
        }
    }
}
