use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::PgPool;

use campus_catalog::CourseId;
use campus_core::{AggregateId, DomainError, UserId};
use campus_events::{EventBus, EventEnvelope, InMemoryEventBus};
use campus_infra::{
    command_dispatcher::{CommandDispatcher, DispatchError},
    enrollment::{
        EnrollmentService, PurchaseError, PurchaseReceipt, RevocationError, RevocationReceipt,
    },
    event_store::{InMemoryEventStore, PostgresEventStore, StoredEvent},
    projections::{
        AccountBalancesProjection, AccountReadModel, CourseCatalogProjection,
        CourseGroupsProjection, CourseGroupsReadModel, CourseReadModel,
    },
    read_model::InMemoryReadModelStore,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

type InMemoryDispatcher = CommandDispatcher<Arc<InMemoryEventStore>, Bus>;
type PersistentDispatcher = CommandDispatcher<Arc<PostgresEventStore>, Bus>;

type CatalogProjection =
    Arc<CourseCatalogProjection<Arc<InMemoryReadModelStore<CourseId, CourseReadModel>>>>;
type AccountsProjection =
    Arc<AccountBalancesProjection<Arc<InMemoryReadModelStore<UserId, AccountReadModel>>>>;
type GroupsProjection =
    Arc<CourseGroupsProjection<Arc<InMemoryReadModelStore<CourseId, CourseGroupsReadModel>>>>;

/// Application services behind the HTTP handlers.
///
/// The in-memory variant is the dev/test default; the persistent variant
/// keeps the event log in Postgres (`USE_PERSISTENT_STORES=true` +
/// `DATABASE_URL`). Read models stay in memory in both: they are disposable
/// and rebuildable from the log.
pub enum AppServices {
    InMemory {
        dispatcher: Arc<InMemoryDispatcher>,
        enrollment: Arc<EnrollmentService<Arc<InMemoryEventStore>, Bus>>,
        catalog_projection: CatalogProjection,
        accounts_projection: AccountsProjection,
        groups_projection: GroupsProjection,
    },
    Persistent {
        dispatcher: Arc<PersistentDispatcher>,
        enrollment: Arc<EnrollmentService<Arc<PostgresEventStore>, Bus>>,
        catalog_projection: CatalogProjection,
        accounts_projection: AccountsProjection,
        groups_projection: GroupsProjection,
    },
}

pub async fn build_services() -> AppServices {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        build_persistent_services().await
    } else {
        build_in_memory_services()
    }
}

struct ProjectionSet {
    catalog: CatalogProjection,
    accounts: AccountsProjection,
    groups: GroupsProjection,
}

fn build_projections() -> ProjectionSet {
    ProjectionSet {
        catalog: Arc::new(CourseCatalogProjection::new(Arc::new(
            InMemoryReadModelStore::new(),
        ))),
        accounts: Arc::new(AccountBalancesProjection::new(Arc::new(
            InMemoryReadModelStore::new(),
        ))),
        groups: Arc::new(CourseGroupsProjection::new(Arc::new(
            InMemoryReadModelStore::new(),
        ))),
    }
}

/// Background subscriber: bus -> projections.
fn spawn_projection_feed(bus: &Bus, projections: &ProjectionSet) {
    let sub = bus.subscribe();
    let catalog = projections.catalog.clone();
    let accounts = projections.accounts.clone();
    let groups = projections.groups.clone();

    tokio::task::spawn_blocking(move || loop {
        match sub.recv() {
            Ok(env) => {
                let apply_ok = match env.aggregate_type() {
                    "catalog.course" => catalog
                        .apply_envelope(&env)
                        .map_err(|e| e.to_string())
                        // The groups listing cascades on course archival.
                        .and_then(|_| groups.apply_envelope(&env).map_err(|e| e.to_string())),
                    "billing.account" => accounts.apply_envelope(&env).map_err(|e| e.to_string()),
                    "groups.roster" => groups.apply_envelope(&env).map_err(|e| e.to_string()),
                    _ => Ok(()),
                };

                if let Err(e) = apply_ok {
                    tracing::warn!("projection apply failed: {e}");
                }
            }
            Err(_) => break,
        }
    });
}

fn build_in_memory_services() -> AppServices {
    // In-memory infra wiring (dev/test): store + bus + projections.
    let store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let projections = build_projections();
    spawn_projection_feed(&bus, &projections);

    let dispatcher: Arc<InMemoryDispatcher> =
        Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));
    let enrollment = Arc::new(EnrollmentService::new(store, bus));

    AppServices::InMemory {
        dispatcher,
        enrollment,
        catalog_projection: projections.catalog,
        accounts_projection: projections.accounts,
        groups_projection: projections.groups,
    }
}

async fn build_persistent_services() -> AppServices {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");

    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to Postgres");

    let store = Arc::new(PostgresEventStore::new(pool));
    store
        .ensure_schema()
        .await
        .expect("Failed to prepare event store schema");

    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let projections = build_projections();
    spawn_projection_feed(&bus, &projections);

    let dispatcher: Arc<PersistentDispatcher> =
        Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));
    let enrollment = Arc::new(EnrollmentService::new(store, bus));

    AppServices::Persistent {
        dispatcher,
        enrollment,
        catalog_projection: projections.catalog,
        accounts_projection: projections.accounts,
        groups_projection: projections.groups,
    }
}

impl AppServices {
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: campus_core::Aggregate<Error = DomainError>,
        A::Event: campus_events::Event + serde::Serialize + serde::de::DeserializeOwned,
    {
        match self {
            AppServices::InMemory { dispatcher, .. } => {
                dispatcher.dispatch::<A>(aggregate_id, aggregate_type, command, make_aggregate)
            }
            AppServices::Persistent { dispatcher, .. } => {
                dispatcher.dispatch::<A>(aggregate_id, aggregate_type, command, make_aggregate)
            }
        }
    }

    pub fn purchase(&self, user: UserId, course_id: CourseId) -> Result<PurchaseReceipt, PurchaseError> {
        match self {
            AppServices::InMemory { enrollment, .. } => enrollment.purchase(user, course_id),
            AppServices::Persistent { enrollment, .. } => enrollment.purchase(user, course_id),
        }
    }

    pub fn revoke(&self, user: UserId, course_id: CourseId) -> Result<RevocationReceipt, RevocationError> {
        match self {
            AppServices::InMemory { enrollment, .. } => enrollment.revoke(user, course_id),
            AppServices::Persistent { enrollment, .. } => enrollment.revoke(user, course_id),
        }
    }

    pub fn course_get(&self, course_id: &CourseId) -> Option<CourseReadModel> {
        match self {
            AppServices::InMemory { catalog_projection, .. } => catalog_projection.get(course_id),
            AppServices::Persistent { catalog_projection, .. } => catalog_projection.get(course_id),
        }
    }

    pub fn courses_list(&self) -> Vec<CourseReadModel> {
        match self {
            AppServices::InMemory { catalog_projection, .. } => catalog_projection.list(),
            AppServices::Persistent { catalog_projection, .. } => catalog_projection.list(),
        }
    }

    pub fn account_get(&self, user: &UserId) -> Option<AccountReadModel> {
        match self {
            AppServices::InMemory { accounts_projection, .. } => accounts_projection.get(user),
            AppServices::Persistent { accounts_projection, .. } => accounts_projection.get(user),
        }
    }

    pub fn accounts_list(&self) -> Vec<AccountReadModel> {
        match self {
            AppServices::InMemory { accounts_projection, .. } => accounts_projection.list(),
            AppServices::Persistent { accounts_projection, .. } => accounts_projection.list(),
        }
    }

    pub fn course_groups(&self, course_id: &CourseId) -> Option<CourseGroupsReadModel> {
        match self {
            AppServices::InMemory { groups_projection, .. } => groups_projection.get(course_id),
            AppServices::Persistent { groups_projection, .. } => groups_projection.get(course_id),
        }
    }
}
