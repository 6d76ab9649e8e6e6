use std::collections::BTreeMap;
use std::path::Path;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use chrono::{DateTime, TimeDelta, Utc};
use shared::protocol::NOTIFY_METHOD;
use shared::types::{
    AuthorizationView, ChangeAction, ChangeNotification, Friend, NamePort, PendingNotification,
    RecordKey, ServiceRecord,
};
use crate::engine;
use crate::error::{Error, Result};
use crate::store::digest::{self, RecordState};

/// Filter for polling the notification queue
#[derive(Debug, Clone, Default)]
pub struct UndeliveredFilter {
    /// Only entries enqueued from this origin address
    pub origin: Option<String>,
    /// At most this many entries, oldest first
    pub limit: Option<usize>,
}

/// A store mutation that must be announced to the advertisement daemon
struct Change {
    action: ChangeAction,
    record: RecordKey,
    friend_id: Option<String>,
}

pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Open or create the SQLite database with WAL mode and foreign keys enabled
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to configure database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id    TEXT PRIMARY KEY,
                first_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                id            INTEGER PRIMARY KEY,
                owner_id      TEXT NOT NULL,
                service_type  TEXT NOT NULL,
                hostname      TEXT NOT NULL,
                instance_name TEXT NOT NULL,
                port          INTEGER NOT NULL,
                transport     TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                UNIQUE (owner_id, service_type, hostname, instance_name, port, transport)
            );

            CREATE INDEX IF NOT EXISTS idx_records_owner_type ON records(owner_id, service_type);

            CREATE TABLE IF NOT EXISTS grants (
                record_id  INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
                friend_id  TEXT NOT NULL,
                granted_at TEXT NOT NULL,
                PRIMARY KEY (record_id, friend_id)
            );

            CREATE INDEX IF NOT EXISTS idx_grants_friend ON grants(friend_id);

            CREATE TABLE IF NOT EXISTS notifications (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                origin_address TEXT NOT NULL,
                payload        TEXT NOT NULL,
                enqueued_at    TEXT NOT NULL,
                delivered      INTEGER NOT NULL DEFAULT 0,
                delivered_at   TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_notifications_pending ON notifications(delivered, id);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Record a user as known to the system. Returns true if newly recorded.
    pub fn register_user(&self, user_id: &str) -> Result<bool> {
        Ok(insert_user(&self.conn, user_id)?)
    }

    /// Whether the user has been recorded at least once
    pub fn is_known_user(&self, user_id: &str) -> Result<bool> {
        is_known_user(&self.conn, user_id)
    }

    /// Insert a discovered record for its owner and mark the owner as known.
    /// Returns true if the record was new.
    pub fn register_record(&mut self, record: &ServiceRecord) -> Result<bool> {
        let tx = self.conn.transaction()?;
        insert_user(&tx, &record.owner_id)?;
        let key = &record.key;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO records (
                owner_id, service_type, hostname, instance_name, port, transport, registered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                &record.owner_id,
                &key.service_type,
                &key.hostname,
                &key.instance_name,
                key.port,
                key.transport.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    /// All records of an owner
    pub fn list_records(&self, owner_id: &str) -> Result<Vec<ServiceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_id, service_type, hostname, instance_name, port, transport
             FROM records WHERE owner_id = ?1
             ORDER BY service_type, hostname, instance_name, port, transport",
        )?;

        let records = stmt
            .query_map([owner_id], |row| {
                Ok(ServiceRecord {
                    owner_id: row.get(0)?,
                    key: row_to_key(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    /// Distinct hostnames offering a service type for an owner
    pub fn list_hostnames(&self, owner_id: &str, service_type: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT hostname FROM records
             WHERE owner_id = ?1 AND service_type = ?2
             ORDER BY hostname",
        )?;

        let hostnames = stmt
            .query_map(params![owner_id, service_type], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        Ok(hostnames)
    }

    /// Instance names and ports of a service type on one host
    pub fn list_name_ports(
        &self,
        owner_id: &str,
        hostname: &str,
        service_type: &str,
    ) -> Result<Vec<NamePort>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT instance_name, port, transport FROM records
             WHERE owner_id = ?1 AND hostname = ?2 AND service_type = ?3
             ORDER BY instance_name, port, transport",
        )?;

        let name_ports = stmt
            .query_map(params![owner_id, hostname, service_type], |row| {
                Ok(NamePort {
                    instance_name: row.get(0)?,
                    port: row.get::<_, u16>(1)?,
                    transport: parse_transport(row, 2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(name_ports)
    }

    /// Whether a friend holds a grant on the owner's record. A missing record
    /// has no grants.
    pub fn is_granted(&self, owner_id: &str, key: &RecordKey, friend_id: &str) -> Result<bool> {
        match find_record_id(&self.conn, owner_id, key)? {
            Some(record_id) => grant_exists(&self.conn, record_id, friend_id),
            None => Ok(false),
        }
    }

    /// Split the owner's friends into authorized and denied for one record.
    /// Fails with NotFound if the record is not the owner's.
    pub fn authorization_view(
        &self,
        owner_id: &str,
        key: &RecordKey,
        friends: Vec<Friend>,
    ) -> Result<AuthorizationView> {
        let record_id = find_record_id(&self.conn, owner_id, key)?.ok_or(Error::NotFound)?;

        engine::partition(
            friends,
            |friend_id| is_known_user(&self.conn, friend_id),
            |friend_id| grant_exists(&self.conn, record_id, friend_id),
        )
    }

    /// Records of the owner that a friend has been granted
    pub fn records_for_friend(&self, owner_id: &str, friend_id: &str) -> Result<Vec<RecordKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.service_type, r.hostname, r.instance_name, r.port, r.transport
             FROM grants g JOIN records r ON r.id = g.record_id
             WHERE r.owner_id = ?1 AND g.friend_id = ?2
             ORDER BY r.service_type, r.hostname, r.instance_name, r.port, r.transport",
        )?;

        let keys = stmt
            .query_map(params![owner_id, friend_id], |row| row_to_key(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(keys)
    }

    /// Digest of the owner's current advertisement state
    pub fn owner_digest(&self, owner_id: &str) -> Result<String> {
        Ok(digest::compute_digest(&owner_state(&self.conn, owner_id)?))
    }

    /// Grant a friend access to a record and enqueue the change notification.
    /// Granting twice is a no-op that still announces the request.
    pub fn authorize(
        &mut self,
        owner_id: &str,
        key: &RecordKey,
        friend_id: &str,
        origin: &str,
    ) -> Result<i64> {
        let ids = self.mutate_and_notify(owner_id, origin, |tx| {
            let record_id = find_record_id(tx, owner_id, key)?.ok_or(Error::NotFound)?;
            tx.execute(
                "INSERT OR IGNORE INTO grants (record_id, friend_id, granted_at) VALUES (?1, ?2, ?3)",
                params![record_id, friend_id, Utc::now().to_rfc3339()],
            )?;
            Ok(vec![Change {
                action: ChangeAction::Authorize,
                record: key.clone(),
                friend_id: Some(friend_id.to_string()),
            }])
        })?;
        single_id(ids)
    }

    /// Revoke a friend's access to a record and enqueue the change notification.
    /// Revoking a grant that does not exist is a no-op.
    pub fn deauthorize(
        &mut self,
        owner_id: &str,
        key: &RecordKey,
        friend_id: &str,
        origin: &str,
    ) -> Result<i64> {
        let ids = self.mutate_and_notify(owner_id, origin, |tx| {
            let record_id = find_record_id(tx, owner_id, key)?.ok_or(Error::NotFound)?;
            tx.execute(
                "DELETE FROM grants WHERE record_id = ?1 AND friend_id = ?2",
                params![record_id, friend_id],
            )?;
            Ok(vec![Change {
                action: ChangeAction::Deauthorize,
                record: key.clone(),
                friend_id: Some(friend_id.to_string()),
            }])
        })?;
        single_id(ids)
    }

    /// Delete one of the owner's records with all its grants
    pub fn delete_record(&mut self, owner_id: &str, key: &RecordKey, origin: &str) -> Result<i64> {
        let ids = self.mutate_and_notify(owner_id, origin, |tx| {
            let record_id = find_record_id(tx, owner_id, key)?.ok_or(Error::NotFound)?;
            tx.execute("DELETE FROM records WHERE id = ?1", [record_id])?;
            Ok(vec![Change {
                action: ChangeAction::Delete,
                record: key.clone(),
                friend_id: None,
            }])
        })?;
        single_id(ids)
    }

    /// Delete every record of the owner, one notification per deleted record
    pub fn delete_all(&mut self, owner_id: &str, origin: &str) -> Result<Vec<i64>> {
        self.mutate_and_notify(owner_id, origin, |tx| {
            let records: Vec<RecordKey> = owner_records(tx, owner_id)?
                .into_iter()
                .map(|(_, key)| key)
                .collect();
            tx.execute("DELETE FROM records WHERE owner_id = ?1", [owner_id])?;
            Ok(records
                .into_iter()
                .map(|record| Change {
                    action: ChangeAction::DeleteAll,
                    record,
                    friend_id: None,
                })
                .collect())
        })
    }

    /// Append a notification to the queue on its own
    pub fn enqueue(&self, origin: &str, payload: &str) -> Result<i64> {
        insert_notification(&self.conn, origin, payload)
            .map_err(|e| Error::enqueue(e.to_string()))
    }

    /// Undelivered notifications, oldest first
    pub fn list_undelivered(&self, filter: &UndeliveredFilter) -> Result<Vec<PendingNotification>> {
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let mut stmt = self.conn.prepare(
            "SELECT id, origin_address, payload, enqueued_at, delivered, delivered_at
             FROM notifications
             WHERE delivered = 0 AND (?1 IS NULL OR origin_address = ?1)
             ORDER BY id ASC
             LIMIT ?2",
        )?;

        let pending = stmt
            .query_map(params![filter.origin.as_deref(), limit], row_to_notification)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(pending)
    }

    pub fn count_undelivered(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE delivered = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Mark a notification delivered. Returns true if this call changed its
    /// state; unknown or already delivered ids are not an error.
    pub fn mark_delivered(&self, id: i64) -> Result<bool> {
        let count = self.conn.execute(
            "UPDATE notifications SET delivered = 1, delivered_at = ?1
             WHERE id = ?2 AND delivered = 0",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(count == 1)
    }

    /// Remove delivered notifications older than the retention window.
    /// Undelivered notifications are never pruned.
    pub fn prune_delivered(&self, retention_secs: u64) -> Result<u64> {
        // A window reaching past the representable time range keeps everything
        let Some(cutoff) = i64::try_from(retention_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            tracing::warn!("Retention of {}s is out of range, nothing pruned", retention_secs);
            return Ok(0);
        };

        let count = self.conn.execute(
            "DELETE FROM notifications WHERE delivered = 1 AND delivered_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        Ok(count as u64)
    }

    /// Run a store mutation and enqueue one notification per change it reports,
    /// all in one transaction. Any error rolls back both.
    fn mutate_and_notify<F>(&mut self, owner_id: &str, origin: &str, apply: F) -> Result<Vec<i64>>
    where
        F: FnOnce(&Transaction<'_>) -> Result<Vec<Change>>,
    {
        let tx = self.conn.transaction()?;
        let changes = apply(&tx)?;
        let digest = digest::compute_digest(&owner_state(&tx, owner_id)?);

        let mut ids = Vec::with_capacity(changes.len());
        for change in changes {
            let notification = ChangeNotification {
                method: NOTIFY_METHOD.to_string(),
                action: change.action,
                owner_id: owner_id.to_string(),
                record: change.record,
                friend_id: change.friend_id,
                digest: digest.clone(),
            };
            let payload = serde_json::to_string(&notification)
                .map_err(|e| Error::enqueue(e.to_string()))?;
            let id = insert_notification(&tx, origin, &payload)
                .map_err(|e| Error::enqueue(e.to_string()))?;
            ids.push(id);
        }

        tx.commit()?;
        Ok(ids)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn single_id(ids: Vec<i64>) -> Result<i64> {
    ids.into_iter()
        .next()
        .ok_or_else(|| Error::enqueue("mutation produced no notification"))
}

fn insert_user(conn: &Connection, user_id: &str) -> rusqlite::Result<bool> {
    let count = conn.execute(
        "INSERT OR IGNORE INTO users (user_id, first_seen) VALUES (?1, ?2)",
        params![user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(count == 1)
}

fn is_known_user(conn: &Connection, user_id: &str) -> Result<bool> {
    let known = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(known)
}

fn find_record_id(conn: &Connection, owner_id: &str, key: &RecordKey) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM records
             WHERE owner_id = ?1 AND service_type = ?2 AND hostname = ?3
               AND instance_name = ?4 AND port = ?5 AND transport = ?6",
            params![
                owner_id,
                &key.service_type,
                &key.hostname,
                &key.instance_name,
                key.port,
                key.transport.as_str(),
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn grant_exists(conn: &Connection, record_id: i64, friend_id: &str) -> Result<bool> {
    let granted = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM grants WHERE record_id = ?1 AND friend_id = ?2)",
        params![record_id, friend_id],
        |row| row.get(0),
    )?;
    Ok(granted)
}

fn owner_records(conn: &Connection, owner_id: &str) -> Result<Vec<(i64, RecordKey)>> {
    let mut stmt = conn.prepare(
        "SELECT id, service_type, hostname, instance_name, port, transport
         FROM records WHERE owner_id = ?1 ORDER BY id",
    )?;

    let records = stmt
        .query_map([owner_id], |row| Ok((row.get(0)?, row_to_key(row, 1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

/// Records of an owner with the friends granted on each
fn owner_state(conn: &Connection, owner_id: &str) -> Result<Vec<RecordState>> {
    let mut by_id: BTreeMap<i64, RecordState> = owner_records(conn, owner_id)?
        .into_iter()
        .map(|(id, key)| (id, (key, Vec::new())))
        .collect();

    let mut stmt = conn.prepare(
        "SELECT g.record_id, g.friend_id
         FROM grants g JOIN records r ON r.id = g.record_id
         WHERE r.owner_id = ?1",
    )?;
    let grants = stmt
        .query_map([owner_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (record_id, friend_id) in grants {
        if let Some((_, granted)) = by_id.get_mut(&record_id) {
            granted.push(friend_id);
        }
    }

    Ok(by_id.into_values().collect())
}

fn insert_notification(conn: &Connection, origin: &str, payload: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO notifications (origin_address, payload, enqueued_at) VALUES (?1, ?2, ?3)",
        params![origin, payload, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Read a RecordKey from five consecutive columns starting at `start`
fn row_to_key(row: &rusqlite::Row, start: usize) -> rusqlite::Result<RecordKey> {
    Ok(RecordKey {
        service_type: row.get(start)?,
        hostname: row.get(start + 1)?,
        instance_name: row.get(start + 2)?,
        port: row.get::<_, u16>(start + 3)?,
        transport: parse_transport(row, start + 4)?,
    })
}

fn parse_transport(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<shared::types::Transport> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_notification(row: &rusqlite::Row) -> rusqlite::Result<PendingNotification> {
    let enqueued_at: String = row.get(3)?;
    let delivered: i32 = row.get(4)?;
    let delivered_at: Option<String> = row.get(5)?;

    Ok(PendingNotification {
        id: row.get(0)?,
        origin_address: row.get(1)?,
        payload: row.get(2)?,
        enqueued_at: parse_timestamp(&enqueued_at, 3)?,
        delivered: delivered != 0,
        delivered_at: delivered_at
            .as_deref()
            .map(|raw| parse_timestamp(raw, 5))
            .transpose()?,
    })
}
