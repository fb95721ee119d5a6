//! SQLite FTS5 implementation of [`TextIndexStore`].
//!
//! One table pair per entity class:
//!
//! - `<class>_docs`: id, version, attributes (JSON), headline, body.
//! - `<class>_fts`: FTS5 over headline/body with the porter/unicode61 tokenizer,
//!   row ids kept equal to `<class>_docs.pk`.
//!
//! Text score is `-bm25` so higher is better. Structured filters are evaluated with
//! [`SearchFilters::matches`] on the stored attributes.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::types::{EntityClass, StructuredAttributes, TextDocument};
use crate::search::text_index::{SearchFilters, TextHit, TextIndexStore, TextStoreResult};

/// Database file name under the data directory.
pub const TEXT_DB_FILE: &str = "text_index.db";

/// Score reported for every hit of a filter-only search.
pub const FILTER_ONLY_SCORE: f32 = 1.0;

pub struct SqliteTextIndex {
    conn: Mutex<Connection>,
    docs_table: String,
    fts_table: String,
    name: String,
}

impl SqliteTextIndex {
    /// Open (creating if needed) the index for `class` in the database at `path`.
    pub fn open(path: &Path, class: EntityClass) -> TextStoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn, class)
    }

    pub fn open_in_memory(class: EntityClass) -> TextStoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, class)
    }

    fn with_connection(conn: Connection, class: EntityClass) -> TextStoreResult<Self> {
        let docs_table = format!("{}_docs", class.as_str());
        let fts_table = format!("{}_fts", class.as_str());
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {docs_table} (
                pk INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                version INTEGER NOT NULL,
                attributes TEXT NOT NULL,
                headline TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS {fts_table} USING fts5(
                headline,
                body,
                tokenize='porter unicode61'
            );"
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
            docs_table,
            fts_table,
            name: format!("sqlite-fts5:{class}"),
        })
    }

    fn search_text(
        &self,
        conn: &Connection,
        filters: &SearchFilters,
        match_expr: &str,
        top_k: usize,
    ) -> TextStoreResult<Vec<TextHit>> {
        let fts = &self.fts_table;
        let docs = &self.docs_table;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT d.id, d.attributes, bm25({fts})
             FROM {fts}
             JOIN {docs} d ON {fts}.rowid = d.pk
             WHERE {fts} MATCH ?1
             ORDER BY bm25({fts}), d.id"
        ))?;
        let rows = stmt.query_map(params![match_expr], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, attrs_json, bm25) = row?;
            let attrs: StructuredAttributes = serde_json::from_str(&attrs_json)?;
            if !filters.matches(&attrs) {
                continue;
            }
            hits.push(TextHit {
                id,
                score: -bm25 as f32,
            });
            if hits.len() >= top_k {
                break;
            }
        }
        Ok(hits)
    }

    fn search_filters_only(
        &self,
        conn: &Connection,
        filters: &SearchFilters,
        top_k: usize,
    ) -> TextStoreResult<Vec<TextHit>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, attributes FROM {} ORDER BY id",
            self.docs_table
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, attrs_json) = row?;
            let attrs: StructuredAttributes = serde_json::from_str(&attrs_json)?;
            if filters.matches(&attrs) {
                hits.push(TextHit {
                    id,
                    score: FILTER_ONLY_SCORE,
                });
                if hits.len() >= top_k {
                    break;
                }
            }
        }
        Ok(hits)
    }

    fn existing_pk(&self, conn: &Connection, id: &str) -> TextStoreResult<Option<i64>> {
        Ok(conn
            .query_row(
                &format!("SELECT pk FROM {} WHERE id = ?1", self.docs_table),
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl TextIndexStore for SqliteTextIndex {
    fn search(
        &self,
        filters: &SearchFilters,
        query_text: Option<&str>,
        top_k: usize,
    ) -> TextStoreResult<Vec<TextHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        match query_text.and_then(fts_match_expression) {
            Some(expr) => self.search_text(&conn, filters, &expr, top_k),
            None => self.search_filters_only(&conn, filters, top_k),
        }
    }

    fn upsert(
        &self,
        id: &str,
        version: u64,
        document: &TextDocument,
        attributes: &StructuredAttributes,
    ) -> TextStoreResult<()> {
        let attrs_json = serde_json::to_string(attributes)?;
        let version = i64::try_from(version).unwrap_or(i64::MAX);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let pk = match self.existing_pk(&tx, id)? {
            Some(pk) => {
                tx.execute(
                    &format!("DELETE FROM {} WHERE rowid = ?1", self.fts_table),
                    params![pk],
                )?;
                tx.execute(
                    &format!(
                        "UPDATE {} SET version = ?2, attributes = ?3, headline = ?4, body = ?5
                         WHERE pk = ?1",
                        self.docs_table
                    ),
                    params![pk, version, attrs_json, document.headline, document.body],
                )?;
                pk
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (id, version, attributes, headline, body)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        self.docs_table
                    ),
                    params![id, version, attrs_json, document.headline, document.body],
                )?;
                tx.last_insert_rowid()
            }
        };
        tx.execute(
            &format!(
                "INSERT INTO {} (rowid, headline, body) VALUES (?1, ?2, ?3)",
                self.fts_table
            ),
            params![pk, document.headline, document.body],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: &str) -> TextStoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(pk) = self.existing_pk(&tx, id)? {
            tx.execute(
                &format!("DELETE FROM {} WHERE rowid = ?1", self.fts_table),
                params![pk],
            )?;
            tx.execute(
                &format!("DELETE FROM {} WHERE pk = ?1", self.docs_table),
                params![pk],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn len(&self) -> TextStoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.docs_table),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build an FTS5 MATCH expression from free text: alphanumeric tokens, each quoted,
/// OR-ed together. Returns `None` when the text has no tokens.
pub fn fts_match_expression(text: &str) -> Option<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    tokens.dedup();
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attrs(skills: &[&str], location: &str) -> StructuredAttributes {
        StructuredAttributes {
            skills: skills.iter().map(|s| s.to_string()).collect(),
            location: Some(location.to_string()),
            ..Default::default()
        }
    }

    fn seeded() -> SqliteTextIndex {
        let index = SqliteTextIndex::open_in_memory(EntityClass::Posting).unwrap();
        index
            .upsert(
                "p1",
                1,
                &TextDocument::new("Senior Rust engineer", "Rust services, Rust tooling"),
                &attrs(&["rust"], "paris, france"),
            )
            .unwrap();
        index
            .upsert(
                "p2",
                1,
                &TextDocument::new("Backend developer", "Go and some Rust"),
                &attrs(&["go", "rust"], "lyon, france"),
            )
            .unwrap();
        index
            .upsert(
                "p3",
                1,
                &TextDocument::new("Data analyst", "SQL dashboards"),
                &attrs(&["sql"], "paris, france"),
            )
            .unwrap();
        index
    }

    #[test]
    fn match_expression_quotes_tokens() {
        assert_eq!(
            fts_match_expression("rust OR NEAR(\"x\""),
            Some("\"rust\" OR \"or\" OR \"near\" OR \"x\"".to_string())
        );
        assert_eq!(fts_match_expression("  -- "), None);
    }

    #[test]
    fn bm25_ranks_denser_matches_higher() {
        let index = seeded();
        let hits = index
            .search(&SearchFilters::default(), Some("rust"), 10)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn filters_apply_to_text_matches() {
        let index = seeded();
        let filters = SearchFilters {
            location: Some("lyon".into()),
            ..Default::default()
        };
        let hits = index.search(&filters, Some("rust"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p2");
    }

    #[test]
    fn filter_only_search_orders_by_id() {
        let index = seeded();
        let filters = SearchFilters {
            location: Some("paris".into()),
            ..Default::default()
        };
        let hits = index.search(&filters, None, 10).unwrap();
        assert_eq!(
            hits,
            vec![
                TextHit {
                    id: "p1".into(),
                    score: FILTER_ONLY_SCORE
                },
                TextHit {
                    id: "p3".into(),
                    score: FILTER_ONLY_SCORE
                },
            ]
        );
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let index = seeded();
        index
            .upsert(
                "p1",
                2,
                &TextDocument::new("Accountant", "Ledgers"),
                &attrs(&["excel"], "paris, france"),
            )
            .unwrap();
        assert_eq!(index.len().unwrap(), 3);
        let hits = index
            .search(&SearchFilters::default(), Some("rust"), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p2");

        index.delete("p2").unwrap();
        index.delete("missing").unwrap();
        assert_eq!(index.len().unwrap(), 2);
        assert!(
            index
                .search(&SearchFilters::default(), Some("rust"), 10)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn top_k_truncates() {
        let index = seeded();
        assert_eq!(index.search(&SearchFilters::default(), None, 2).unwrap().len(), 2);
        assert!(index.search(&SearchFilters::default(), None, 0).unwrap().is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TEXT_DB_FILE);
        {
            let index = SqliteTextIndex::open(&path, EntityClass::Candidate).unwrap();
            index
                .upsert(
                    "c1",
                    4,
                    &TextDocument::new("Platform engineer", "Kubernetes"),
                    &StructuredAttributes::default(),
                )
                .unwrap();
        }
        let index = SqliteTextIndex::open(&path, EntityClass::Candidate).unwrap();
        let hits = index
            .search(&SearchFilters::default(), Some("kubernetes"), 5)
            .unwrap();
        assert_eq!(hits[0].id, "c1");
        assert_eq!(index.name(), "sqlite-fts5:candidate");
    }
}
