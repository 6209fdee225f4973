use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use linkbio_db::Database;
use linkbio_db::models::{ClickUpdate, LinkRow};
use linkbio_types::api::{
    ClickResponse, CreateLinkRequest, LinkCollectionResponse, LinkOrderResponse, SetLinkOrderRequest,
};
use linkbio_types::models::Link;

use crate::error::ApiError;
use crate::identity::Viewer;
use crate::{AppState, blocking};

const MAX_URL_LEN: usize = 2048;
const MAX_DESCRIPTION_LEN: usize = 100;

/// Result of [`LinkService::record_click`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    Counted,
    /// Owners clicking their own links are not counted.
    OwnLink,
    NotFound,
}

/// Owns every user's ordered link list.
///
/// Listings are cached per owner; any write touching an owner's links drops
/// that owner's entry.
pub struct LinkService {
    db: Arc<Database>,
    cache: RwLock<HashMap<Uuid, Vec<Link>>>,
}

impl LinkService {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Links of `owner_id` in presentation order: first the stored order,
    /// skipping ids that no longer belong to the owner, then any remaining
    /// links oldest first. Unknown owners have no links.
    pub fn list_links(&self, owner_id: Uuid) -> Result<Vec<Link>, ApiError> {
        if let Some(links) = self.cached(owner_id)? {
            return Ok(links);
        }
        self.load(owner_id)
    }

    /// Drop whatever is cached for `owner_id` and read it again.
    pub fn refresh(&self, owner_id: Uuid) -> Result<Vec<Link>, ApiError> {
        self.invalidate(owner_id)?;
        self.load(owner_id)
    }

    pub fn create_link(&self, owner_id: Uuid, url: &str, description: &str) -> Result<Link, ApiError> {
        let url = url.trim();
        let description = description.trim();
        validate_link(url, description)?;

        let owner = owner_id.to_string();
        if self.db.get_user_by_id(&owner)?.is_none() {
            return Err(ApiError::NotFound);
        }

        let link_id = Uuid::new_v4().to_string();
        self.db.insert_link(&link_id, &owner, url, description)?;
        self.invalidate(owner_id)?;

        let row = self
            .db
            .get_link(&link_id)?
            .ok_or_else(|| anyhow::anyhow!("link {} vanished after insert", link_id))?;
        info!("User {} added link {}", owner_id, link_id);
        Ok(link_from_row(row))
    }

    /// Replace the stored order with `ordered_ids`, keeping only ids of
    /// links `owner_id` owns. Returns what was stored.
    pub fn set_order(&self, owner_id: Uuid, ordered_ids: &[Uuid]) -> Result<Vec<Uuid>, ApiError> {
        let requested: Vec<String> = ordered_ids.iter().map(Uuid::to_string).collect();

        let stored = self
            .db
            .set_links_sort(&owner_id.to_string(), &requested)?
            .ok_or(ApiError::NotFound)?;
        self.invalidate(owner_id)?;

        if stored.len() != requested.len() {
            debug!(
                "Dropped {} foreign, missing or repeated ids from {}'s link order",
                requested.len() - stored.len(),
                owner_id
            );
        }

        Ok(stored.iter().filter_map(|id| id.parse().ok()).collect())
    }

    /// Delete `link_id` if `owner_id` owns it. Anything else is a quiet
    /// no-op, so callers learn nothing about other users' links.
    pub fn delete_link(&self, owner_id: Uuid, link_id: Uuid) -> Result<(), ApiError> {
        let removed = self
            .db
            .delete_link(&owner_id.to_string(), &link_id.to_string())?;

        if removed {
            info!("User {} deleted link {}", owner_id, link_id);
            self.invalidate(owner_id)?;
        }
        Ok(())
    }

    pub fn record_click(&self, viewer: Option<Uuid>, link_id: Uuid) -> Result<ClickOutcome, ApiError> {
        let viewer = viewer.map(|id| id.to_string());
        let update = self
            .db
            .increment_clicks(&link_id.to_string(), viewer.as_deref())?;

        let outcome = match update {
            ClickUpdate::Missing => ClickOutcome::NotFound,
            ClickUpdate::OwnLink { .. } => ClickOutcome::OwnLink,
            ClickUpdate::Counted { owner_id } => {
                match owner_id.parse() {
                    Ok(owner_id) => self.invalidate(owner_id)?,
                    Err(e) => warn!("Corrupt user_id '{}' on link '{}': {}", owner_id, link_id, e),
                }
                ClickOutcome::Counted
            }
        };
        Ok(outcome)
    }

    /// The QR download link is for the profile owner only; guests never
    /// see it.
    pub fn can_view_download_affordance(viewer: Option<Uuid>, owner_id: Uuid) -> bool {
        viewer == Some(owner_id)
    }

    fn load(&self, owner_id: Uuid) -> Result<Vec<Link>, ApiError> {
        // Held across the read so an invalidation from a write that commits
        // meanwhile lands after our insert, never before it.
        let mut cache = self
            .cache
            .write()
            .map_err(|e| anyhow::anyhow!("Link cache lock poisoned: {}", e))?;

        let owner = owner_id.to_string();
        let Some(user) = self.db.get_user_by_id(&owner)? else {
            return Ok(vec![]);
        };

        let rows = self.db.get_links_for_user(&owner)?;
        let links: Vec<Link> = order_links(rows, &user.links_sort)
            .into_iter()
            .map(link_from_row)
            .collect();

        cache.insert(owner_id, links.clone());
        Ok(links)
    }

    fn cached(&self, owner_id: Uuid) -> Result<Option<Vec<Link>>, ApiError> {
        let cache = self
            .cache
            .read()
            .map_err(|e| anyhow::anyhow!("Link cache lock poisoned: {}", e))?;
        Ok(cache.get(&owner_id).cloned())
    }

    fn invalidate(&self, owner_id: Uuid) -> Result<(), ApiError> {
        self.cache
            .write()
            .map_err(|e| anyhow::anyhow!("Link cache lock poisoned: {}", e))?
            .remove(&owner_id);
        Ok(())
    }
}

fn validate_link(url: &str, description: &str) -> Result<(), ApiError> {
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ApiError::BadRequest("url must be http or https".into()));
    }
    if url.len() > MAX_URL_LEN {
        return Err(ApiError::BadRequest("url is too long".into()));
    }
    if description.is_empty() || description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ApiError::BadRequest(format!(
            "description must be 1 to {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

/// Sort `rows` by their position in `links_sort`. Rows missing from it keep
/// their incoming order after the sorted ones; ids in `links_sort` with no
/// matching row are ignored.
pub(crate) fn order_links(mut rows: Vec<LinkRow>, links_sort: &[String]) -> Vec<LinkRow> {
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(links_sort.len());
    for (i, id) in links_sort.iter().enumerate() {
        position.entry(id.as_str()).or_insert(i);
    }

    // Stable sort, so unsorted rows stay oldest first.
    rows.sort_by_key(|row| position.get(row.id.as_str()).copied().unwrap_or(usize::MAX));
    rows
}

pub(crate) fn link_from_row(row: LinkRow) -> Link {
    Link {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt link id '{}': {}", row.id, e);
            Uuid::default()
        }),
        user_id: row.user_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt user_id '{}' on link '{}': {}", row.user_id, row.id, e);
            Uuid::default()
        }),
        created_at: row
            .created_at
            .parse::<chrono::DateTime<chrono::Utc>>()
            .or_else(|_| {
                // SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS" without timezone.
                chrono::NaiveDateTime::parse_from_str(&row.created_at, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| ndt.and_utc())
            })
            .unwrap_or_else(|e| {
                warn!("Corrupt created_at '{}' on link '{}': {}", row.created_at, row.id, e);
                chrono::DateTime::default()
            }),
        url: row.url,
        description: row.description,
        clicks_count: row.clicks_count,
    }
}

// -- Handlers --

pub async fn list_links(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(viewer): Extension<Viewer>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let links = blocking(move || db.links.list_links(user_id)).await?;
    Ok(Json(collection_response(&state, viewer, user_id, links)))
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(viewer): Extension<Viewer>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let links = blocking(move || db.links.refresh(user_id)).await?;
    Ok(Json(collection_response(&state, viewer, user_id, links)))
}

pub async fn create_link(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(viewer): Extension<Viewer>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = viewer.require_owner(user_id)?;

    let link = blocking(move || state.links.create_link(owner_id, &req.url, &req.description)).await?;
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn set_order(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(viewer): Extension<Viewer>,
    Json(req): Json<SetLinkOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = viewer.require_owner(user_id)?;

    let links_sort = blocking(move || state.links.set_order(owner_id, &req.links_sort)).await?;
    Ok(Json(LinkOrderResponse { links_sort }))
}

pub async fn delete_link(
    State(state): State<AppState>,
    Path((user_id, link_id)): Path<(Uuid, Uuid)>,
    Extension(viewer): Extension<Viewer>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = viewer.require_owner(user_id)?;

    blocking(move || state.links.delete_link(owner_id, link_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn record_click(
    State(state): State<AppState>,
    Path(link_id): Path<Uuid>,
    Extension(viewer): Extension<Viewer>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = blocking(move || state.links.record_click(viewer.id(), link_id)).await?;

    match outcome {
        ClickOutcome::NotFound => Err(ApiError::NotFound),
        ClickOutcome::Counted => Ok(Json(ClickResponse { counted: true })),
        ClickOutcome::OwnLink => Ok(Json(ClickResponse { counted: false })),
    }
}

fn collection_response(
    state: &AppState,
    viewer: Viewer,
    owner_id: Uuid,
    links: Vec<Link>,
) -> LinkCollectionResponse {
    let qr_code_url = LinkService::can_view_download_affordance(viewer.id(), owner_id)
        .then(|| state.qr_code_url.clone());

    LinkCollectionResponse { links, qr_code_url }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    struct Fixture {
        db: Arc<Database>,
        service: LinkService,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            Self {
                service: LinkService::new(db.clone()),
                db,
            }
        }

        fn user(&self, username: &str) -> Uuid {
            let id = Uuid::new_v4();
            self.db.create_user(&id.to_string(), username, username).unwrap();
            id
        }

        fn link(&self, owner: Uuid, url: &str) -> Uuid {
            self.service.create_link(owner, url, "a link").unwrap().id
        }

        fn ids(&self, owner: Uuid) -> Vec<Uuid> {
            self.service.list_links(owner).unwrap().iter().map(|l| l.id).collect()
        }

        fn clicks(&self, link: Uuid) -> i64 {
            self.db.get_link(&link.to_string()).unwrap().unwrap().clicks_count
        }
    }

    fn row(id: &str) -> LinkRow {
        LinkRow {
            id: id.to_string(),
            user_id: "owner".to_string(),
            url: "https://example.com".to_string(),
            description: "x".to_string(),
            clicks_count: 0,
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn order_links_puts_unsorted_after_sorted() {
        let rows = vec![row("a"), row("b"), row("c"), row("d")];
        let sort = vec!["c".to_string(), "gone".to_string(), "a".to_string()];

        let ordered: Vec<String> = order_links(rows, &sort).into_iter().map(|r| r.id).collect();
        assert_eq!(ordered, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn link_from_row_parses_sqlite_timestamps() {
        let id = Uuid::new_v4();
        let mut r = row(&id.to_string());
        r.user_id = Uuid::nil().to_string();

        let link = link_from_row(r);
        assert_eq!(link.id, id);
        assert_eq!(link.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn lists_links_in_creation_order_without_stored_order() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let a = f.link(owner, "https://a.example");
        let b = f.link(owner, "https://b.example");

        assert_eq!(f.ids(owner), vec![a, b]);
    }

    #[test]
    fn unknown_owner_has_no_links() {
        let f = Fixture::new();
        assert!(f.service.list_links(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn set_order_keeps_only_own_links() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let other = f.user("other");
        let a = f.link(owner, "https://a.example");
        let b = f.link(owner, "https://b.example");
        let c = f.link(owner, "https://c.example");
        let foreign = f.link(other, "https://d.example");

        let stored = f
            .service
            .set_order(owner, &[c, a, b, Uuid::new_v4(), foreign])
            .unwrap();

        assert_eq!(stored, vec![c, a, b]);
        assert_eq!(f.ids(owner), vec![c, a, b]);
        assert_eq!(f.ids(other), vec![foreign]);
    }

    #[test]
    fn set_order_for_unknown_owner_is_not_found() {
        let f = Fixture::new();
        assert!(matches!(
            f.service.set_order(Uuid::new_v4(), &[]),
            Err(ApiError::NotFound)
        ));
    }

    #[test]
    fn links_added_after_ordering_come_last() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let a = f.link(owner, "https://a.example");
        let b = f.link(owner, "https://b.example");
        f.service.set_order(owner, &[b, a]).unwrap();

        let c = f.link(owner, "https://c.example");
        assert_eq!(f.ids(owner), vec![b, a, c]);
    }

    #[test]
    fn delete_link_removes_only_own_links() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let other = f.user("other");
        let a = f.link(owner, "https://a.example");
        let b = f.link(owner, "https://b.example");
        f.service.set_order(owner, &[b, a]).unwrap();

        // Someone else's delete is silently ignored.
        f.service.delete_link(other, a).unwrap();
        assert_eq!(f.ids(owner), vec![b, a]);

        f.service.delete_link(owner, b).unwrap();
        assert_eq!(f.ids(owner), vec![a]);

        // Deleting twice is fine, and the stale id in the stored order is skipped.
        f.service.delete_link(owner, b).unwrap();
        assert_eq!(f.ids(owner), vec![a]);
        let stored = f.db.get_user_by_id(&owner.to_string()).unwrap().unwrap().links_sort;
        assert_eq!(stored, vec![b.to_string(), a.to_string()]);
    }

    #[test]
    fn own_clicks_are_not_counted() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let link = f.link(owner, "https://a.example");

        assert_eq!(f.service.record_click(Some(owner), link).unwrap(), ClickOutcome::OwnLink);
        assert_eq!(f.clicks(link), 0);
    }

    #[test]
    fn clicks_from_others_are_counted() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let visitor = f.user("visitor");
        let link = f.link(owner, "https://a.example");

        // Prime the cache, then make sure the click shows up anyway.
        f.service.list_links(owner).unwrap();
        assert_eq!(f.service.record_click(Some(visitor), link).unwrap(), ClickOutcome::Counted);
        assert_eq!(f.service.record_click(None, link).unwrap(), ClickOutcome::Counted);

        assert_eq!(f.service.list_links(owner).unwrap()[0].clicks_count, 2);
    }

    #[test]
    fn click_on_deleted_link_is_not_found() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let link = f.link(owner, "https://a.example");
        f.service.delete_link(owner, link).unwrap();

        assert_eq!(f.service.record_click(None, link).unwrap(), ClickOutcome::NotFound);
    }

    #[test]
    fn concurrent_clicks_all_count() {
        let f = Arc::new(Fixture::new());
        let owner = f.user("owner");
        let visitor = f.user("visitor");
        let link = f.link(owner, "https://a.example");

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let f = f.clone();
                thread::spawn(move || {
                    f.service.record_click(Some(visitor), link).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(f.clicks(link), 25);
    }

    #[test]
    fn deleted_link_is_not_listed_while_readers_race() {
        let f = Arc::new(Fixture::new());
        let owner = f.user("owner");
        f.link(owner, "https://keep.example");

        for _ in 0..200 {
            let link = f.link(owner, "https://gone.example");
            let stop = Arc::new(AtomicBool::new(false));

            let reader = {
                let f = f.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        f.service.list_links(owner).unwrap();
                        f.service.invalidate(owner).unwrap();
                    }
                })
            };

            f.service.delete_link(owner, link).unwrap();
            stop.store(true, Ordering::Relaxed);
            reader.join().unwrap();

            assert!(!f.ids(owner).contains(&link));
        }
    }

    #[test]
    fn download_affordance_is_owner_only() {
        let owner = Uuid::new_v4();
        assert!(LinkService::can_view_download_affordance(Some(owner), owner));
        assert!(!LinkService::can_view_download_affordance(Some(Uuid::new_v4()), owner));
        assert!(!LinkService::can_view_download_affordance(None, owner));
    }

    #[test]
    fn refresh_picks_up_out_of_band_writes() {
        let f = Fixture::new();
        let owner = f.user("owner");
        let a = f.link(owner, "https://a.example");
        assert_eq!(f.ids(owner), vec![a]);

        // Written straight to the database, bypassing the cache.
        let b = Uuid::new_v4();
        f.db.insert_link(&b.to_string(), &owner.to_string(), "https://b.example", "b").unwrap();
        assert_eq!(f.ids(owner), vec![a]);

        let refreshed: Vec<Uuid> = f.service.refresh(owner).unwrap().iter().map(|l| l.id).collect();
        assert_eq!(refreshed, vec![a, b]);

        // Refreshing again changes nothing.
        assert_eq!(f.service.refresh(owner).unwrap().len(), 2);
    }

    #[test]
    fn create_link_validates_input() {
        let f = Fixture::new();
        let owner = f.user("owner");

        assert!(matches!(
            f.service.create_link(owner, "ftp://example.com", "files"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            f.service.create_link(owner, "https://example.com", "   "),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            f.service.create_link(Uuid::new_v4(), "https://example.com", "mine"),
            Err(ApiError::NotFound)
        ));

        let link = f.service.create_link(owner, " https://example.com ", " Home ").unwrap();
        assert_eq!(link.url, "https://example.com");
        assert_eq!(link.description, "Home");
        assert_eq!(link.clicks_count, 0);
        assert_eq!(link.user_id, owner);
    }
}
