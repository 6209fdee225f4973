pub mod directory;
pub mod error;
pub mod identity;
pub mod links;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post, put},
};
use tracing::error;

use linkbio_db::Database;

use crate::directory::{DirectoryConfig, DirectoryService};
use crate::error::ApiError;
use crate::links::LinkService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub directory: DirectoryService,
    pub links: LinkService,
    pub jwt_secret: String,
    /// Where the QR code image is served; only shown to the profile owner.
    pub qr_code_url: String,
}

impl AppStateInner {
    pub fn new(
        db: Arc<Database>,
        directory: DirectoryConfig,
        jwt_secret: String,
        qr_code_url: String,
    ) -> Self {
        Self {
            directory: DirectoryService::new(db.clone(), directory),
            links: LinkService::new(db),
            jwt_secret,
            qr_code_url,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", get(directory::search_users))
        .route("/users/{user_id}/links", get(links::list_links).post(links::create_link))
        .route("/users/{user_id}/links/order", put(links::set_order))
        .route("/users/{user_id}/links/refresh", post(links::refresh))
        .route("/users/{user_id}/links/{link_id}", delete(links::delete_link))
        .route("/links/{link_id}/click", post(links::record_click))
        .layer(middleware::from_fn_with_state(state.clone(), identity::identify))
        .with_state(state)
}

/// Run blocking DB work off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("blocking task failed: {}", e))
    })?
}
