//! Billing domain module (event-sourced).
//!
//! One `StudentAccount` aggregate per user holds the credit balance and the
//! purchase entitlements. Debit and entitlement creation are a single atomic
//! append to the account's stream, which is what makes a purchase safe under
//! concurrent requests.
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod account;

pub use account::{
    AccountEvent, AccountId, AccountOpened, CoursePurchased, Credits, Entitlement,
    EntitlementRevoked, PurchaseCourse, PurchaseReversed, ReversePurchase, RevokeEntitlement,
    StudentAccount, StudentAccountCommand, DEFAULT_OPENING_BALANCE,
};
