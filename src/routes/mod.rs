use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{auth::AuthenticatedUser, state::AppState};

pub mod admin;
pub mod auth;
pub mod files;
pub mod health;
pub mod notifications;
pub mod requests;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        let allow_origin = AllowOrigin::list(headers);

        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let auth_routes = Router::new()
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me));

    let requests_routes = Router::new()
        .route(
            "/",
            get(requests::list_requests).post(requests::create_request),
        )
        .route(
            "/:id",
            get(requests::get_request)
                .patch(requests::update_request)
                .delete(requests::delete_request),
        )
        .route(
            "/:id/assign",
            put(requests::claim_request).delete(requests::release_request),
        )
        .route("/:id/status", put(requests::transition_status))
        .route(
            "/:id/files",
            get(files::list_files).post(files::initiate_upload),
        )
        .route("/:id/files/:file_id", delete(files::delete_file))
        .route("/:id/files/:file_id/download", get(files::download_file));

    let notifications_routes = Router::new()
        .route("/", get(notifications::list_notifications))
        .route("/read-all", put(notifications::mark_all_read))
        .route("/:id", delete(notifications::delete_notification))
        .route("/:id/read", put(notifications::mark_read));

    let admin_routes = Router::new()
        .route("/users", get(admin::list_users))
        .route("/users/:id", put(admin::update_user));

    let dashboard_routes = Router::new().route("/stats", get(requests::status_counts));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/requests", requests_routes)
        .nest("/api/notifications", notifications_routes)
        .nest("/api/admin", admin_routes)
        .nest("/api/dashboard", dashboard_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    Router::new()
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
}
