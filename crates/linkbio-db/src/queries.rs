use std::collections::HashSet;

use crate::Database;
use crate::models::{ClickUpdate, DirectoryRow, LinkRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, Row};
use tracing::warn;

const DIRECTORY_COLUMNS: &str = "u.id, u.name, u.username, u.links_sort,
    (SELECT COUNT(*) FROM questions q WHERE q.to_id = u.id AND q.answer IS NOT NULL)
        AS answered_questions_count";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, name: &str, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, username) VALUES (?1, ?2, ?3)",
                (id, name, username),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    /// Store a new presentation order for `user_id`.
    ///
    /// Ids that are not links currently owned by the user are dropped, as are
    /// repeats; the survivors keep their relative order. Returns the stored
    /// order, or `None` if the user does not exist.
    pub fn set_links_sort(&self, user_id: &str, requested: &[String]) -> Result<Option<Vec<String>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let exists = tx
                .query_row("SELECT 1 FROM users WHERE id = ?1", [user_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }

            let owned: HashSet<String> = {
                let mut stmt = tx.prepare("SELECT id FROM links WHERE user_id = ?1")?;
                stmt.query_map([user_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<HashSet<String>, _>>()?
            };

            let sorted = filter_owned(requested, &owned);
            tx.execute(
                "UPDATE users SET links_sort = ?1 WHERE id = ?2",
                (serde_json::to_string(&sorted)?, user_id),
            )?;
            tx.commit()?;

            Ok(Some(sorted))
        })
    }

    // -- Links --

    pub fn insert_link(&self, id: &str, user_id: &str, url: &str, description: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO links (id, user_id, url, description) VALUES (?1, ?2, ?3, ?4)",
                (id, user_id, url, description),
            )?;
            Ok(())
        })
    }

    pub fn get_link(&self, id: &str) -> Result<Option<LinkRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, url, description, clicks_count, created_at
                 FROM links WHERE id = ?1",
                [id],
                link_row,
            )
            .optional()
        })
    }

    /// All links owned by `user_id`, oldest first.
    pub fn get_links_for_user(&self, user_id: &str) -> Result<Vec<LinkRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, url, description, clicks_count, created_at
                 FROM links WHERE user_id = ?1
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt
                .query_map([user_id], link_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch links for a set of users, oldest first.
    pub fn get_links_for_users(&self, user_ids: &[String]) -> Result<Vec<LinkRow>> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=user_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, user_id, url, description, clicks_count, created_at
                 FROM links WHERE user_id IN ({})
                 ORDER BY rowid ASC",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(user_ids), link_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Delete a link if, and only if, `user_id` owns it. Returns whether a
    /// row was removed.
    pub fn delete_link(&self, user_id: &str, link_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM links WHERE id = ?1 AND user_id = ?2",
                (link_id, user_id),
            )?;
            Ok(removed > 0)
        })
    }

    /// Count a click on `link_id` unless `viewer_id` owns it.
    pub fn increment_clicks(&self, link_id: &str, viewer_id: Option<&str>) -> Result<ClickUpdate> {
        self.with_conn(|conn| {
            let owner: Option<String> = conn
                .query_row("SELECT user_id FROM links WHERE id = ?1", [link_id], |row| row.get(0))
                .optional()?;

            let Some(owner_id) = owner else {
                return Ok(ClickUpdate::Missing);
            };

            if viewer_id == Some(owner_id.as_str()) {
                return Ok(ClickUpdate::OwnLink { owner_id });
            }

            // Increment in SQL so concurrent clicks never read a stale count.
            let updated = conn.execute(
                "UPDATE links SET clicks_count = clicks_count + 1 WHERE id = ?1",
                [link_id],
            )?;
            if updated == 0 {
                return Ok(ClickUpdate::Missing);
            }

            Ok(ClickUpdate::Counted { owner_id })
        })
    }

    // -- Questions --

    pub fn insert_question(&self, id: &str, from_id: &str, to_id: &str, content: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO questions (id, from_id, to_id, content) VALUES (?1, ?2, ?3, ?4)",
                (id, from_id, to_id, content),
            )?;
            Ok(())
        })
    }

    pub fn answer_question(&self, id: &str, answer: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE questions SET answer = ?1 WHERE id = ?2",
                (answer, id),
            )?;
            Ok(updated > 0)
        })
    }

    // -- Directory --

    /// Users whose name or username contains `needle`, ignoring case.
    /// Ordered by answered questions (most first), then by sign-up order.
    pub fn search_users(&self, needle: &str, limit: u32) -> Result<Vec<DirectoryRow>> {
        let needle = needle.to_lowercase();

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {DIRECTORY_COLUMNS}
                 FROM users u
                 WHERE instr(unicode_lower(u.name), ?1) > 0
                    OR instr(unicode_lower(u.username), ?1) > 0
                 ORDER BY answered_questions_count DESC, u.rowid ASC
                 LIMIT ?2"
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![needle, limit], directory_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Users with at least one link whose URL contains any of `markers`
    /// (case-sensitive). Same ordering as [`Database::search_users`].
    pub fn notable_users(&self, markers: &[String], limit: u32) -> Result<Vec<DirectoryRow>> {
        if markers.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let matches: Vec<String> = (1..=markers.len())
                .map(|i| format!("instr(l.url, ?{}) > 0", i))
                .collect();
            let sql = format!(
                "SELECT {DIRECTORY_COLUMNS}
                 FROM users u
                 WHERE EXISTS (
                     SELECT 1 FROM links l WHERE l.user_id = u.id AND ({})
                 )
                 ORDER BY answered_questions_count DESC, u.rowid ASC
                 LIMIT ?{}",
                matches.join(" OR "),
                markers.len() + 1
            );

            let mut stmt = conn.prepare(&sql)?;
            let mut params: Vec<&dyn rusqlite::types::ToSql> = markers
                .iter()
                .map(|m| m as &dyn rusqlite::types::ToSql)
                .collect();
            params.push(&limit);

            let rows = stmt
                .query_map(params.as_slice(), directory_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

/// Keep the ids found in `owned`, first occurrence only, in request order.
fn filter_owned(requested: &[String], owned: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .filter(|id| owned.contains(*id) && seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn parse_links_sort(user_id: &str, raw: Option<String>) -> Vec<String> {
    let Some(raw) = raw else {
        return vec![];
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!("Corrupt links_sort on user '{}': {}", user_id, e);
        vec![]
    })
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, name, username, links_sort, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            let id: String = row.get(0)?;
            let links_sort = parse_links_sort(&id, row.get(3)?);
            Ok(UserRow {
                id,
                name: row.get(1)?,
                username: row.get(2)?,
                links_sort,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn link_row(row: &Row<'_>) -> rusqlite::Result<LinkRow> {
    Ok(LinkRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        url: row.get(2)?,
        description: row.get(3)?,
        clicks_count: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn directory_row(row: &Row<'_>) -> rusqlite::Result<DirectoryRow> {
    let id: String = row.get(0)?;
    let links_sort = parse_links_sort(&id, row.get(3)?);
    Ok(DirectoryRow {
        id,
        name: row.get(1)?,
        username: row.get(2)?,
        links_sort,
        answered_questions_count: row.get(4)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
