// Axum booking service guarded by a single PolicyEngine. Each route binds its
// resource and action once through a RouteGuard; instance data comes from an
// in-memory store standing in for the database.

use async_trait::async_trait;
use axum::{
    extract::{Extension, FromRequestParts, Path},
    http::{request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use greenroom::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// --------------------
// 1) Identity
// --------------------

/// The caller as described by the identity headers. A missing user id leaves
/// the subject empty and an unknown role leaves the role empty; the engine
/// denies both.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub DecisionContext);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|raw| raw.trim().to_string())
        };

        let subject_id = header("x-user-id").unwrap_or_default();
        let role = header("x-roles").unwrap_or_else(|| Role::Viewer.to_string());
        let organization_id = header("x-org-id");

        Ok(AuthenticatedUser(DecisionContext::from_claims(
            subject_id,
            organization_id,
            &role,
        )))
    }
}

// --------------------
// 2) Data access
// --------------------

#[derive(Debug, Clone)]
pub struct Booking {
    pub id: Uuid,
    pub client_id: String,
    pub creator_id: String,
    pub status: String,
}

impl Booking {
    fn resource_data(&self) -> ResourceData {
        ResourceData::new()
            .created_by(&self.client_id)
            .assigned_to(&self.creator_id)
            .status(&self.status)
    }
}

pub fn draft_booking_id() -> Uuid {
    Uuid::from_u128(0xaaaaaaaa_aaaa_aaaa_aaaa_aaaaaaaaaaaa)
}

pub fn completed_booking_id() -> Uuid {
    Uuid::from_u128(0xcccccccc_cccc_cccc_cccc_cccccccccccc)
}

#[derive(Debug, Default)]
pub struct BookingStore {
    bookings: HashMap<Uuid, Booking>,
}

impl BookingStore {
    pub fn seeded() -> Self {
        let bookings = [
            (draft_booking_id(), "DRAFT"),
            (completed_booking_id(), "COMPLETED"),
        ]
        .into_iter()
        .map(|(id, status)| {
            let booking = Booking {
                id,
                client_id: "client-1".to_string(),
                creator_id: "creator-1".to_string(),
                status: status.to_string(),
            };
            (id, booking)
        })
        .collect();

        Self { bookings }
    }
}

#[async_trait]
impl ResourceLoader for BookingStore {
    async fn load(&self, resource: Resource, instance_id: &str) -> Option<ResourceData> {
        if resource != Resource::Booking {
            return None;
        }
        let id = Uuid::parse_str(instance_id).ok()?;
        self.bookings.get(&id).map(Booking::resource_data)
    }
}

// --------------------
// 3) Shared state
// --------------------

#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: PolicyEngine,
    pub bookings: Arc<BookingStore>,
    pub view_booking: RouteGuard,
    pub edit_booking: RouteGuard,
}

pub fn build_state() -> AppState {
    let engine = PolicyEngine::new(PermissionCatalog::standard());

    AppState {
        view_booking: RouteGuard::new(engine.clone(), Resource::Booking, Action::Read),
        edit_booking: RouteGuard::new(engine.clone(), Resource::Booking, Action::Update),
        bookings: Arc::new(BookingStore::seeded()),
        engine,
    }
}

fn forbidden(denied: AccessDenied) -> axum::response::Response {
    (StatusCode::FORBIDDEN, denied.to_string()).into_response()
}

// ---------------------------------
// 4) Route handlers
// ---------------------------------

pub async fn view_booking_handler(
    Path(booking_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> impl IntoResponse {
    match state
        .view_booking
        .authorize_instance(user, &booking_id.to_string(), state.bookings.as_ref())
        .await
    {
        Ok(()) => (StatusCode::OK, format!("booking {booking_id}")).into_response(),
        Err(denied) => forbidden(denied),
    }
}

pub async fn edit_booking_handler(
    Path(booking_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> impl IntoResponse {
    match state
        .edit_booking
        .authorize_instance(user, &booking_id.to_string(), state.bookings.as_ref())
        .await
    {
        Ok(()) => (StatusCode::OK, "Booking updated").into_response(),
        Err(denied) => forbidden(denied),
    }
}

pub async fn assign_role_handler(
    Path(user_id): Path<String>,
    Extension(state): Extension<AppState>,
    AuthenticatedUser(assigner): AuthenticatedUser,
    headers: HeaderMap,
) -> impl IntoResponse {
    let requested = headers
        .get("x-new-role")
        .and_then(|value| value.to_str().ok())
        .map(str::parse::<Role>);

    let new_role = match requested {
        Some(Ok(role)) => role,
        Some(Err(err)) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        None => return (StatusCode::BAD_REQUEST, "missing x-new-role").into_response(),
    };

    let evaluation = RoleAssignmentGuard::new(&state.engine).evaluate(&assigner, &user_id, new_role);
    match evaluation {
        AccessEvaluation::Granted { .. } => {
            // Persisting the role is the host's job; drop verdicts from the old role.
            state.engine.invalidate_subject_cache(&user_id);
            (StatusCode::OK, format!("{user_id} is now {new_role}")).into_response()
        }
        AccessEvaluation::Denied { reason, .. } => {
            (StatusCode::FORBIDDEN, reason.to_string()).into_response()
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/bookings/{booking_id}",
            get(view_booking_handler).put(edit_booking_handler),
        )
        .route("/users/{user_id}/role", post(assign_role_handler))
        .layer(Extension(state))
}

// ----------------------------------------
// 5) The Axum App
// ----------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let app = build_router(build_state());

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await.unwrap();
    tracing::info!("Listening on http://0.0.0.0:8000");
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_feeds_conditions() {
        let store = BookingStore::seeded();
        let data = store
            .load(Resource::Booking, &draft_booking_id().to_string())
            .await
            .unwrap();

        assert_eq!(data.created_by.as_deref(), Some("client-1"));
        assert_eq!(data.status.as_deref(), Some("DRAFT"));
        assert!(store.load(Resource::Project, "anything").await.is_none());
        assert!(store.load(Resource::Booking, "not-a-uuid").await.is_none());
    }

    #[tokio::test]
    async fn test_client_reads_own_booking() {
        let state = build_state();
        let client = DecisionContext::new("client-1", Role::Client);

        let result = state
            .view_booking
            .authorize_instance(client, &draft_booking_id().to_string(), state.bookings.as_ref())
            .await;
        assert!(result.is_ok());
    }
}
