// Actix Web example plugging a Greenroom [`PolicyEngine`] into request
// handlers. The server exposes four routes:
//
// - `GET /projects/{id}` reads a project for members and managers.
// - `PUT /projects/{id}` edits a project.
// - `GET /analytics` returns the data scope the caller's analytics are filtered to.
// - `GET /me/permissions/{resource}` lists the actions the caller may take.
//
// Try it with curl:
//
// ```bash
// # A creator listed as a project member can read it
// curl -i http://127.0.0.1:8080/projects/p-1 \
//   -H "x-user-id: creator-1" \
//   -H "x-roles: creator"
//
// # Accountants see financial analytics
// curl -i http://127.0.0.1:8080/analytics \
//   -H "x-user-id: acc-1" \
//   -H "x-roles: accountant"
//
// # What may a viewer do with artists?
// curl -i http://127.0.0.1:8080/me/permissions/artist \
//   -H "x-user-id: v-1" \
//   -H "x-roles: viewer"
// ```
//
// The engine lives in Actix Web's `Data` extractor. Each handler builds a
// [`DecisionContext`] from the identity headers and evaluates the request
// before continuing.

use actix_web::{dev::Payload, web, App, FromRequest, HttpRequest, HttpResponse, HttpServer, Responder};
use greenroom::{
    AccessEvaluation, Action, DecisionContext, PermissionCatalog, PolicyEngine, Resource,
    ResourceData, Role,
};
use std::future::{ready, Ready};

// --------------------
// 1) Identity
// --------------------

#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub DecisionContext);

impl FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        };

        let subject_id = header("x-user-id").unwrap_or_default();
        let role = header("x-roles").unwrap_or_else(|| Role::Viewer.to_string());

        ready(Ok(AuthenticatedUser(DecisionContext::from_claims(
            subject_id,
            header("x-org-id"),
            &role,
        ))))
    }
}

// -------------------------------
// 2) Helpers for Mocked Resources
// -------------------------------

fn load_project(project_id: &str) -> Option<ResourceData> {
    match project_id {
        "p-1" => Some(
            ResourceData::new()
                .created_by("label-1")
                .assigned_to("manager-1")
                .member("creator-1")
                .member("client-1")
                .status("ACTIVE"),
        ),
        _ => None,
    }
}

fn respond(evaluation: AccessEvaluation, body: impl Into<String>) -> HttpResponse {
    match evaluation {
        AccessEvaluation::Granted { .. } => HttpResponse::Ok().body(body.into()),
        AccessEvaluation::Denied { reason, trace } => {
            HttpResponse::Forbidden().body(format!("Denied: {}\n{}", reason, trace.format()))
        }
    }
}

// -------------------------
// 3) Actix Web Handlers
// -------------------------

pub async fn view_project(
    path: web::Path<String>,
    AuthenticatedUser(user): AuthenticatedUser,
    engine: web::Data<PolicyEngine>,
) -> impl Responder {
    let project_id = path.into_inner();
    let mut context = user.for_instance(project_id.as_str());
    context.resource_data = load_project(&project_id);

    respond(
        engine.evaluate(&context, Resource::Project, Action::Read),
        format!("Here is project {project_id}"),
    )
}

pub async fn edit_project(
    path: web::Path<String>,
    AuthenticatedUser(user): AuthenticatedUser,
    engine: web::Data<PolicyEngine>,
) -> impl Responder {
    let project_id = path.into_inner();
    let mut context = user.for_instance(project_id.as_str());
    context.resource_data = load_project(&project_id);

    respond(
        engine.evaluate(&context, Resource::Project, Action::Update),
        "Project updated",
    )
}

pub async fn view_analytics(
    AuthenticatedUser(user): AuthenticatedUser,
    engine: web::Data<PolicyEngine>,
) -> impl Responder {
    match engine.data_scope(&user, Resource::Analytics, Action::Read) {
        Some(scope) => HttpResponse::Ok().body(scope.to_string()),
        None => HttpResponse::Forbidden().body("Denied: analytics are not available"),
    }
}

pub async fn list_permissions(
    path: web::Path<String>,
    AuthenticatedUser(user): AuthenticatedUser,
    engine: web::Data<PolicyEngine>,
) -> impl Responder {
    let resource = match path.parse::<Resource>() {
        Ok(resource) => resource,
        Err(err) => return HttpResponse::NotFound().body(err.to_string()),
    };

    let actions: Vec<&str> = engine
        .get_allowed_actions(&user, resource)
        .iter()
        .map(Action::as_str)
        .collect();
    HttpResponse::Ok().body(actions.join(","))
}

pub fn build_engine() -> PolicyEngine {
    PolicyEngine::new(PermissionCatalog::standard())
}

// -------------------------
// 4) Actix Web App Startup
// -------------------------

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let engine = web::Data::new(build_engine());

    tracing::info!("Greenroom with Actix Web running on http://127.0.0.1:8080");

    HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .route("/projects/{id}", web::get().to(view_project))
            .route("/projects/{id}", web::put().to(edit_project))
            .route("/analytics", web::get().to(view_analytics))
            .route("/me/permissions/{resource}", web::get().to(list_permissions))
    })
    .bind(("127.0.0.1", 8080))?
    .run()
    .await
}
