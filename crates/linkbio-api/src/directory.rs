use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use tracing::{debug, warn};
use uuid::Uuid;

use linkbio_db::Database;
use linkbio_db::models::{DirectoryRow, LinkRow};
use linkbio_types::api::SearchQuery;
use linkbio_types::models::UserSummary;

use crate::error::ApiError;
use crate::links::{link_from_row, order_links};
use crate::{AppState, blocking};

/// Most users a directory lookup returns.
pub const DIRECTORY_LIMIT: u32 = 10;

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// URL fragments that make a user "notable", matched case-sensitively
    /// against each of their links.
    pub notable_platforms: Vec<String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            notable_platforms: vec!["twitter.com".to_string(), "github.com".to_string()],
        }
    }
}

pub struct DirectoryService {
    db: Arc<Database>,
    config: DirectoryConfig,
}

impl DirectoryService {
    pub fn new(db: Arc<Database>, config: DirectoryConfig) -> Self {
        Self { db, config }
    }

    /// Leaderboard lookup.
    ///
    /// An empty `query` lists notable users; anything else matches name or
    /// username, ignoring case. Either way the users with the most answered
    /// questions come first, earlier sign-ups win ties, and at most
    /// [`DIRECTORY_LIMIT`] are returned.
    pub fn search(&self, query: &str) -> Result<Vec<UserSummary>, ApiError> {
        let rows = if query.is_empty() {
            self.db
                .notable_users(&self.config.notable_platforms, DIRECTORY_LIMIT)?
        } else {
            self.db.search_users(query, DIRECTORY_LIMIT)?
        };
        debug!("Directory lookup {:?} matched {} users", query, rows.len());

        let user_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut links_by_user: HashMap<String, Vec<LinkRow>> = HashMap::new();
        for link in self.db.get_links_for_users(&user_ids)? {
            links_by_user.entry(link.user_id.clone()).or_default().push(link);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let links = links_by_user.remove(&row.id).unwrap_or_default();
                summary_from_row(row, links)
            })
            .collect())
    }
}

fn summary_from_row(row: DirectoryRow, links: Vec<LinkRow>) -> UserSummary {
    UserSummary {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt user id '{}': {}", row.id, e);
            Uuid::default()
        }),
        links: order_links(links, &row.links_sort)
            .into_iter()
            .map(link_from_row)
            .collect(),
        name: row.name,
        username: row.username,
        answered_questions_count: row.answered_questions_count,
    }
}

pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let users = blocking(move || state.directory.search(&query.q)).await?;
    Ok(Json(users))
}
