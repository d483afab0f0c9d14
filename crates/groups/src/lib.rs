//! Study-group domain module (event-sourced).
//!
//! One `Roster` aggregate per course holds every group and membership for
//! that course. Because group selection and creation happen inside a single
//! aggregate, concurrent enrollments serialize on the roster stream instead
//! of racing on shared counters.
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod roster;

pub use roster::{
    AssignStudent, Group, GroupCreated, RemoveStudent, Roster, RosterCommand, RosterEvent,
    RosterId, StudentAssigned, StudentRemoved, GROUP_CAPACITY, GROUP_FANOUT_LIMIT,
};
