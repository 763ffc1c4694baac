use std::path::Path;

use anyhow::{anyhow, Context, Result};
use identity_core::{
    Contact, ContactFilter, ContactId, ContactOrder, ContactPredicate, ContactStore,
    IdentityError, Link, LinkPrecedence, NewContact,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  linked_id INTEGER,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  ),
  FOREIGN KEY (linked_id) REFERENCES contacts(id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, link_precedence, linked_id, created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// A secondary whose `linked_id` does not name a primary contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkViolation {
    pub contact_id: ContactId,
    pub linked_id: ContactId,
    pub target_precedence: Option<LinkPrecedence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub link_violations: Vec<LinkViolation>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.link_violations.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.apply_migration_1()?;
            tracing::info!(version = 1, "applied contact schema migration");
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to create contacts table")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Load contacts matching any predicate of `filter`.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn find_contacts(
        &self,
        filter: &ContactFilter,
        order: ContactOrder,
    ) -> Result<Vec<Contact>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        for predicate in &filter.any_of {
            match predicate {
                ContactPredicate::EmailEq(email) => {
                    clauses.push("email = ?".to_string());
                    values.push(Value::Text(email.clone()));
                }
                ContactPredicate::PhoneEq(phone_number) => {
                    clauses.push("phone_number = ?".to_string());
                    values.push(Value::Text(phone_number.clone()));
                }
                ContactPredicate::EmailIn(emails) => {
                    push_in_clause(&mut clauses, &mut values, "email", emails.as_slice())?;
                }
                ContactPredicate::PhoneIn(phone_numbers) => {
                    push_in_clause(
                        &mut clauses,
                        &mut values,
                        "phone_number",
                        phone_numbers.as_slice(),
                    )?;
                }
                ContactPredicate::IdIn(ids) => {
                    let ids = ids.iter().map(|id| id.0).collect::<Vec<_>>();
                    push_in_clause(&mut clauses, &mut values, "id", &ids)?;
                }
                ContactPredicate::LinkedIdIn(ids) => {
                    let ids = ids.iter().map(|id| id.0).collect::<Vec<_>>();
                    push_in_clause(&mut clauses, &mut values, "linked_id", &ids)?;
                }
            }
        }

        if clauses.is_empty() {
            return Ok(Vec::new());
        }

        // RFC3339 text does not sort chronologically when fractional digits vary,
        // so created_at ordering is applied after decoding.
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE {} ORDER BY id ASC",
            clauses.join(" OR ")
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare contact query")?;
        let mut rows =
            stmt.query(params_from_iter(values.iter())).context("failed to query contacts")?;

        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(decode_contact(row)?);
        }
        order.sort(&mut contacts);
        Ok(contacts)
    }

    /// Load one contact by id.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn get_contact(&self, id: ContactId) -> Result<Option<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_contact(row)?)),
            None => Ok(None),
        }
    }

    /// Insert one contact, letting `SQLite` assign its id.
    ///
    /// # Errors
    /// Returns an error when the insert violates a table constraint or fails.
    pub fn insert_contact(&mut self, contact: &NewContact) -> Result<Contact> {
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;
        self.conn
            .execute(
                "INSERT INTO contacts(
                    email, phone_number, link_precedence, linked_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.link.precedence().as_str(),
                    contact.link.linked_id().map(|id| id.0),
                    stamp,
                    stamp,
                ],
            )
            .context("failed to insert contact")?;

        Ok(Contact {
            id: ContactId(self.conn.last_insert_rowid()),
            email: contact.email.clone(),
            phone_number: contact.phone_number.clone(),
            link: contact.link,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rewrite precedence and `linked_id` of one contact. Identity fields are never touched.
    ///
    /// # Errors
    /// Returns an error when the contact does not exist or the update fails.
    pub fn update_link(&mut self, id: ContactId, link: Link) -> Result<Contact> {
        let changed = self
            .conn
            .execute(
                "UPDATE contacts SET link_precedence = ?1, linked_id = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    link.precedence().as_str(),
                    link.linked_id().map(|linked_id| linked_id.0),
                    now_rfc3339()?,
                    id.0,
                ],
            )
            .with_context(|| format!("failed to relink contact {id}"))?;
        if changed == 0 {
            return Err(anyhow!("contact {id} does not exist"));
        }

        self.get_contact(id)?.ok_or_else(|| anyhow!("contact {id} vanished after relink"))
    }

    /// Run quick-check, foreign-key-check, link-shape, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let link_violations = self.link_violations()?;
        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            link_violations,
            schema_status,
        })
    }

    fn link_violations(&self) -> Result<Vec<LinkViolation>> {
        if !table_exists(&self.conn, "contacts")? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.linked_id, p.link_precedence
                 FROM contacts c
                 LEFT JOIN contacts p ON p.id = c.linked_id
                 WHERE c.link_precedence = 'secondary'
                   AND (p.id IS NULL OR p.link_precedence <> 'primary')
                 ORDER BY c.id ASC",
            )
            .context("failed to prepare link violation query")?;
        let mut rows = stmt.query([])?;

        let mut violations = Vec::new();
        while let Some(row) = rows.next()? {
            let target_raw: Option<String> = row.get(2)?;
            let target_precedence = match target_raw {
                Some(raw) => Some(
                    LinkPrecedence::parse(&raw)
                        .ok_or_else(|| anyhow!("unknown link_precedence: {raw}"))?,
                ),
                None => None,
            };
            violations.push(LinkViolation {
                contact_id: ContactId(row.get(0)?),
                linked_id: ContactId(row.get(1)?),
                target_precedence,
            });
        }
        Ok(violations)
    }
}

impl ContactStore for SqliteStore {
    fn find_many(
        &self,
        filter: &ContactFilter,
        order: ContactOrder,
    ) -> Result<Vec<Contact>, IdentityError> {
        self.find_contacts(filter, order).map_err(store_error)
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, IdentityError> {
        self.insert_contact(&contact).map_err(store_error)
    }

    fn relink(&mut self, id: ContactId, link: Link) -> Result<Contact, IdentityError> {
        self.update_link(id, link).map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> IdentityError {
    IdentityError::Store(format!("{err:#}"))
}

// The whole list binds as one JSON array parameter, so a component of any size
// stays under SQLite's bound-variable limit.
fn push_in_clause<T: Serialize>(
    clauses: &mut Vec<String>,
    values: &mut Vec<Value>,
    column: &str,
    list: &[T],
) -> Result<()> {
    if list.is_empty() {
        return Ok(());
    }
    let encoded = serde_json::to_string(list)
        .with_context(|| format!("failed to encode {column} lookup values"))?;
    values.push(Value::Text(encoded));
    clauses.push(format!("{column} IN (SELECT value FROM json_each(?))"));
    Ok(())
}

fn decode_contact(row: &Row<'_>) -> Result<Contact> {
    let precedence_raw: String = row.get(3)?;
    let precedence = LinkPrecedence::parse(&precedence_raw)
        .ok_or_else(|| anyhow!("unknown link_precedence: {precedence_raw}"))?;
    let linked_id = row.get::<_, Option<i64>>(4)?.map(ContactId);

    Ok(Contact {
        id: ContactId(row.get(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        link: Link::from_parts(precedence, linked_id)?,
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
    })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use identity_core::{identify, IdentifyRequest};
    use ulid::Ulid;

    use super::*;

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn insert_raw(
        conn: &Connection,
        email: Option<&str>,
        phone_number: Option<&str>,
        link_precedence: &str,
        linked_id: Option<i64>,
        created_at: &str,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO contacts(
                email, phone_number, link_precedence, linked_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![email, phone_number, link_precedence, linked_id, created_at],
        )
    }

    fn request(email: Option<&str>, phone_number: Option<&str>) -> IdentifyRequest {
        IdentifyRequest {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }

    fn remove_sqlite_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.to_path_buf()
            } else {
                PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn schema_status_reports_pending_then_current() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn table_checks_enforce_link_shape_and_identity() -> Result<()> {
        let store = migrated_memory_store()?;
        let ts = "2024-01-01T00:00:00Z";

        assert!(insert_raw(&store.conn, Some("a@x.com"), None, "primary", None, ts).is_ok());
        assert!(insert_raw(&store.conn, Some("b@x.com"), None, "secondary", None, ts).is_err());
        assert!(insert_raw(&store.conn, Some("c@x.com"), None, "primary", Some(1), ts).is_err());
        assert!(insert_raw(&store.conn, None, None, "primary", None, ts).is_err());
        assert!(insert_raw(&store.conn, Some("d@x.com"), None, "tertiary", None, ts).is_err());
        assert!(insert_raw(&store.conn, Some("e@x.com"), None, "secondary", Some(999), ts).is_err());
        Ok(())
    }

    #[test]
    fn insert_and_find_round_trip() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let primary = store.insert_contact(&NewContact {
            email: Some("a@x.com".to_string()),
            phone_number: None,
            link: Link::Primary,
        })?;
        let secondary = store.insert_contact(&NewContact {
            email: None,
            phone_number: Some("555".to_string()),
            link: Link::Secondary { linked_id: primary.id },
        })?;
        assert_eq!(primary.id, ContactId(1));
        assert_eq!(secondary.id, ContactId(2));

        let by_phone = store.find_contacts(
            &ContactFilter::any_of(vec![ContactPredicate::PhoneEq("555".to_string())]),
            ContactOrder::CreatedAt,
        )?;
        assert_eq!(by_phone, vec![secondary.clone()]);

        let by_id = store.find_contacts(
            &ContactFilter::any_of(vec![ContactPredicate::IdIn(vec![secondary.id, primary.id])]),
            ContactOrder::Id,
        )?;
        assert_eq!(by_id, vec![primary, secondary]);
        Ok(())
    }

    #[test]
    fn in_predicates_are_combined_with_or_and_empty_lists_are_ignored() -> Result<()> {
        let store = migrated_memory_store()?;
        let ts = "2024-01-01T00:00:00Z";
        insert_raw(&store.conn, Some("a@x.com"), Some("111"), "primary", None, ts)?;
        insert_raw(&store.conn, Some("b@x.com"), Some("222"), "primary", None, ts)?;
        insert_raw(&store.conn, Some("c@x.com"), Some("333"), "primary", None, ts)?;

        let found = store.find_contacts(
            &ContactFilter::any_of(vec![
                ContactPredicate::EmailIn(vec!["a@x.com".to_string()]),
                ContactPredicate::PhoneIn(vec!["333".to_string(), "999".to_string()]),
                ContactPredicate::IdIn(vec![]),
            ]),
            ContactOrder::Id,
        )?;
        assert_eq!(found.iter().map(|c| c.id.0).collect::<Vec<_>>(), vec![1, 3]);

        insert_raw(&store.conn, Some("d@x.com"), None, "secondary", Some(2), ts)?;
        let children = store.find_contacts(
            &ContactFilter::any_of(vec![ContactPredicate::LinkedIdIn(vec![ContactId(2)])]),
            ContactOrder::Id,
        )?;
        assert_eq!(children.iter().map(|c| c.id.0).collect::<Vec<_>>(), vec![4]);

        let nothing = store.find_contacts(
            &ContactFilter::any_of(vec![ContactPredicate::EmailIn(vec![])]),
            ContactOrder::Id,
        )?;
        assert!(nothing.is_empty());
        Ok(())
    }

    #[test]
    fn created_at_order_is_chronological_across_fraction_widths() -> Result<()> {
        let store = migrated_memory_store()?;
        insert_raw(&store.conn, Some("a@x.com"), None, "primary", None, "2024-01-01T00:00:00.5Z")?;
        insert_raw(&store.conn, Some("a@x.com"), None, "primary", None, "2024-01-01T00:00:00Z")?;

        let found = store.find_contacts(
            &ContactFilter::any_of(vec![ContactPredicate::EmailEq("a@x.com".to_string())]),
            ContactOrder::CreatedAt,
        )?;
        assert_eq!(found.iter().map(|c| c.id.0).collect::<Vec<_>>(), vec![2, 1]);
        Ok(())
    }

    #[test]
    fn update_link_rewrites_only_link_columns() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let ts = "2024-01-01T00:00:00Z";
        insert_raw(&store.conn, Some("a@x.com"), None, "primary", None, ts)?;
        insert_raw(&store.conn, None, Some("555"), "primary", None, "2024-01-02T00:00:00Z")?;

        let demoted = store.update_link(ContactId(2), Link::Secondary { linked_id: ContactId(1) })?;
        assert_eq!(demoted.link, Link::Secondary { linked_id: ContactId(1) });
        assert_eq!(demoted.phone_number.as_deref(), Some("555"));
        assert_eq!(demoted.email, None);
        assert_eq!(demoted.created_at, parse_rfc3339("2024-01-02T00:00:00Z")?);
        assert!(demoted.updated_at > demoted.created_at);

        let missing = store.update_link(ContactId(42), Link::Primary);
        assert!(missing.is_err());
        Ok(())
    }

    #[test]
    fn trait_errors_surface_as_store_errors() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let result = ContactStore::relink(&mut store, ContactId(7), Link::Primary);
        match result {
            Err(IdentityError::Store(message)) => assert!(message.contains("contact 7")),
            other => panic!("expected store error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn identify_merges_groups_through_sqlite() -> Result<()> {
        let mut store = migrated_memory_store()?;
        insert_raw(&store.conn, Some("e1@x.com"), None, "primary", None, "2024-01-01T00:00:00Z")?;
        insert_raw(&store.conn, None, Some("p1"), "primary", None, "2024-01-02T00:00:00Z")?;
        insert_raw(&store.conn, Some("e2@x.com"), Some("p1"), "secondary", Some(2), "2024-01-03T00:00:00Z")?;

        let response = identify(&mut store, &request(Some("e1@x.com"), Some("p1")))?;
        assert_eq!(response.contact.primary_contact_id, ContactId(1));
        assert_eq!(response.contact.secondary_contact_ids, vec![ContactId(2), ContactId(3)]);
        assert_eq!(response.contact.emails, vec!["e1@x.com".to_string(), "e2@x.com".to_string()]);

        for id in [2, 3] {
            let contact = store
                .get_contact(ContactId(id))?
                .ok_or_else(|| anyhow!("contact {id} missing"))?;
            assert_eq!(contact.link, Link::Secondary { linked_id: ContactId(1) });
        }
        assert!(store.integrity_check()?.is_clean());
        Ok(())
    }

    #[test]
    fn integrity_check_flags_chained_secondaries() -> Result<()> {
        let store = migrated_memory_store()?;
        let ts = "2024-01-01T00:00:00Z";
        insert_raw(&store.conn, Some("a@x.com"), None, "primary", None, ts)?;
        insert_raw(&store.conn, Some("a@x.com"), Some("1"), "secondary", Some(1), ts)?;
        insert_raw(&store.conn, None, Some("1"), "secondary", Some(2), ts)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(
            report.link_violations,
            vec![LinkViolation {
                contact_id: ContactId(3),
                linked_id: ContactId(2),
                target_precedence: Some(LinkPrecedence::Secondary),
            }]
        );
        assert!(!report.is_clean());
        Ok(())
    }

    #[test]
    fn identify_handles_components_beyond_bound_variable_limit() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let ts = "2024-01-01T00:00:00Z";
        store.conn.execute_batch("BEGIN")?;
        insert_raw(&store.conn, None, Some("p"), "primary", None, ts)?;
        for _ in 0..33_000 {
            insert_raw(&store.conn, None, Some("p"), "secondary", Some(1), ts)?;
        }
        store.conn.execute_batch("COMMIT")?;

        let view = identify(&mut store, &request(None, Some("p")))?;
        assert_eq!(view.contact.primary_contact_id, ContactId(1));
        assert_eq!(view.contact.phone_numbers, vec!["p".to_string()]);
        assert_eq!(view.contact.secondary_contact_ids.len(), 33_000);
        assert_eq!(view.contact.secondary_contact_ids.first(), Some(&ContactId(2)));

        let linked = store.find_contacts(
            &ContactFilter::any_of(vec![ContactPredicate::IdIn(
                (1..=33_001).map(ContactId).collect(),
            )]),
            ContactOrder::Id,
        )?;
        assert_eq!(linked.len(), 33_001);
        Ok(())
    }

    // Two racing first-time submissions leave two primaries; the next request merges them.
    #[test]
    fn racing_first_submissions_merge_on_next_request() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("identity-race-{}.sqlite3", Ulid::new()));
        let mut first = SqliteStore::open(&db_path)?;
        first.migrate()?;
        let mut second = SqliteStore::open(&db_path)?;

        let fragment = request(Some("race@x.com"), None);
        let a = identify(&mut first, &fragment)?;
        let b = identify(&mut second, &fragment)?;
        assert_eq!(a.contact.primary_contact_id, ContactId(1));
        assert_eq!(b.contact.primary_contact_id, ContactId(1));

        // Simulate the lost race directly: a second primary with the same email.
        insert_raw(&first.conn, Some("race@x.com"), None, "primary", None, &now_rfc3339()?)?;
        let merged = identify(&mut second, &fragment)?;
        assert_eq!(merged.contact.primary_contact_id, ContactId(1));
        assert_eq!(merged.contact.secondary_contact_ids, vec![ContactId(2)]);
        assert!(first.integrity_check()?.is_clean());

        drop(first);
        drop(second);
        remove_sqlite_files(&db_path)
    }
}
