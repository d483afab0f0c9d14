use campus_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands represent **intent** - a request to perform an action on an
/// aggregate. They are transient (not persisted) and are transformed into
/// events (which are persisted). Commands are rejected if invalid; events
/// represent accepted changes.
///
/// Each command operates on exactly one aggregate, which is the transaction
/// boundary: commands for different aggregates can be processed concurrently,
/// commands for the same aggregate serialize on the stream version.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
