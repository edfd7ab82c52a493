use actix_web::{http::StatusCode, test, web, App};

mod actix_example {
    #![allow(dead_code)]
    include!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/demos/actix_web.rs"
    ));
}

macro_rules! init_actix_app {
    () => {{
        let engine = web::Data::new(actix_example::build_engine());
        test::init_service(
            App::new()
                .app_data(engine.clone())
                .route("/projects/{id}", web::get().to(actix_example::view_project))
                .route("/projects/{id}", web::put().to(actix_example::edit_project))
                .route("/analytics", web::get().to(actix_example::view_analytics))
                .route(
                    "/me/permissions/{resource}",
                    web::get().to(actix_example::list_permissions),
                ),
        )
    }};
}

#[actix_web::test]
async fn view_project_allows_member() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/projects/p-1")
        .insert_header(("x-user-id", "creator-1"))
        .insert_header(("x-roles", "creator"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn view_project_denies_non_member() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/projects/p-1")
        .insert_header(("x-user-id", "creator-2"))
        .insert_header(("x-roles", "creator"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let body = test::read_body(resp).await;
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.contains("condition:member DENIED"), "{body}");
}

#[actix_web::test]
async fn view_project_denies_viewer() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/projects/p-1")
        .insert_header(("x-user-id", "v-1"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn edit_project_allows_assigned_artist_manager() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::put()
        .uri("/projects/p-1")
        .insert_header(("x-user-id", "manager-1"))
        .insert_header(("x-roles", "artist_manager"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn edit_project_denies_client_member() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::put()
        .uri("/projects/p-1")
        .insert_header(("x-user-id", "client-1"))
        .insert_header(("x-roles", "client"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn edit_missing_project_denies_conditional_grant() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::put()
        .uri("/projects/p-404")
        .insert_header(("x-user-id", "creator-1"))
        .insert_header(("x-roles", "creator"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn analytics_reports_financial_scope_for_accountant() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/analytics")
        .insert_header(("x-user-id", "acc-1"))
        .insert_header(("x-roles", "accountant"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = test::read_body(resp).await;
    assert_eq!(body, "financial");
}

#[actix_web::test]
async fn analytics_denied_for_client() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/analytics")
        .insert_header(("x-user-id", "client-1"))
        .insert_header(("x-roles", "client"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn permissions_listing_for_viewer() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/me/permissions/artist")
        .insert_header(("x-user-id", "v-1"))
        .insert_header(("x-roles", "viewer"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = test::read_body(resp).await;
    assert_eq!(body, "read");
}

#[actix_web::test]
async fn permissions_listing_for_org_admin_invoices() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/me/permissions/invoice")
        .insert_header(("x-user-id", "admin-1"))
        .insert_header(("x-roles", "org_admin"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    let body = test::read_body(resp).await;
    assert_eq!(
        body,
        "create,read,update,delete,manage,approve,assign,export,bulk_operation"
    );
}

#[actix_web::test]
async fn permissions_listing_rejects_unknown_resource() {
    let app = init_actix_app!().await;

    let req = test::TestRequest::get()
        .uri("/me/permissions/playlist")
        .insert_header(("x-user-id", "v-1"))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
