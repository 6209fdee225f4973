//! Database row types — these map directly to SQLite rows.
//! Distinct from linkbio-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub username: String,
    /// Stored presentation order; empty when the owner never saved one.
    pub links_sort: Vec<String>,
    pub created_at: String,
}

pub struct LinkRow {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub description: String,
    pub clicks_count: i64,
    pub created_at: String,
}

/// A user as seen by the directory, with the answered-questions count
/// computed by the query.
pub struct DirectoryRow {
    pub id: String,
    pub name: String,
    pub username: String,
    pub links_sort: Vec<String>,
    pub answered_questions_count: i64,
}

/// What happened to a click-count update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickUpdate {
    /// No link with that id.
    Missing,
    /// The viewer owns the link; nothing was written.
    OwnLink { owner_id: String },
    Counted { owner_id: String },
}
