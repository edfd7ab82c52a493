use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt;
use uuid::Uuid;

mod axum_example {
    #![allow(dead_code)]
    include!(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/axum.rs"));
}

fn axum_app() -> Router {
    axum_example::build_router(axum_example::build_state())
}

fn request(method: &str, uri: String, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn view_booking_allows_assigned_creator() {
    let booking_id = axum_example::draft_booking_id();

    let response = axum_app()
        .oneshot(request(
            "GET",
            format!("/bookings/{booking_id}"),
            &[("x-user-id", "creator-1"), ("x-roles", "creator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn view_booking_denies_other_creator() {
    let booking_id = axum_example::draft_booking_id();

    let response = axum_app()
        .oneshot(request(
            "GET",
            format!("/bookings/{booking_id}"),
            &[("x-user-id", "creator-2"), ("x-roles", "creator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn view_booking_denies_missing_user_header() {
    let booking_id = axum_example::draft_booking_id();

    let response = axum_app()
        .oneshot(request(
            "GET",
            format!("/bookings/{booking_id}"),
            &[("x-roles", "super_admin")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn view_booking_denies_unknown_role() {
    let booking_id = axum_example::draft_booking_id();

    let response = axum_app()
        .oneshot(request(
            "GET",
            format!("/bookings/{booking_id}"),
            &[("x-user-id", "creator-1"), ("x-roles", "root")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn view_unknown_booking_denies_conditional_roles() {
    let response = axum_app()
        .oneshot(request(
            "GET",
            format!("/bookings/{}", Uuid::new_v4()),
            &[("x-user-id", "creator-1"), ("x-roles", "creator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn edit_draft_booking_allows_assigned_creator() {
    let booking_id = axum_example::draft_booking_id();

    let response = axum_app()
        .oneshot(request(
            "PUT",
            format!("/bookings/{booking_id}"),
            &[("x-user-id", "creator-1"), ("x-roles", "creator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn edit_completed_booking_is_denied() {
    let booking_id = axum_example::completed_booking_id();

    let response = axum_app()
        .oneshot(request(
            "PUT",
            format!("/bookings/{booking_id}"),
            &[("x-user-id", "creator-1"), ("x-roles", "creator")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn org_admin_cannot_grant_super_admin() {
    let response = axum_app()
        .oneshot(request(
            "POST",
            "/users/u7/role".to_string(),
            &[
                ("x-user-id", "admin-1"),
                ("x-roles", "org_admin"),
                ("x-new-role", "super_admin"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn super_admin_can_grant_super_admin() {
    let response = axum_app()
        .oneshot(request(
            "POST",
            "/users/u7/role".to_string(),
            &[
                ("x-user-id", "root"),
                ("x-roles", "super_admin"),
                ("x-new-role", "super_admin"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn client_cannot_assign_roles() {
    let response = axum_app()
        .oneshot(request(
            "POST",
            "/users/u7/role".to_string(),
            &[
                ("x-user-id", "client-1"),
                ("x-roles", "client"),
                ("x-new-role", "creator"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_new_role_is_rejected() {
    let response = axum_app()
        .oneshot(request(
            "POST",
            "/users/u7/role".to_string(),
            &[
                ("x-user-id", "root"),
                ("x-roles", "super_admin"),
                ("x-new-role", "overlord"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
