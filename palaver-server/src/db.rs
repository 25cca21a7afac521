//! SQLite persistence layer.
//!
//! Stores the channel directory, durable identities, persisted memberships,
//! and the append-only message log. Uses WAL mode for concurrent reads
//! during writes.
//!
//! Messages carry an autoincrement `id` that doubles as the monotonic
//! per-store ordering key: replay cursors are plain message ids, so the
//! catch-up contract is storage-agnostic from the client's point of view.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted message row. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: i64,
    pub channel: String,
    pub sender: String,
    /// Set for private messages only.
    pub recipient: Option<String>,
    pub content: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub dedup_token: Option<String>,
}

/// A durable identity. The online flag and connection binding are runtime
/// state owned by the registry, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRow {
    pub name: String,
    pub last_disconnect_at: Option<i64>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS channels (
                name       TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS identities (
                name               TEXT PRIMARY KEY,
                last_disconnect_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS memberships (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                nickname TEXT NOT NULL,
                channel  TEXT NOT NULL,
                UNIQUE(nickname, channel)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                channel     TEXT NOT NULL,
                sender      TEXT NOT NULL,
                recipient   TEXT,
                content     TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                dedup_token TEXT,
                UNIQUE(channel, dedup_token)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_channel_order
                ON messages(channel, created_at, id);
            ",
        )?;

        // Migrate existing databases: add columns that may not exist yet.
        // ALTER TABLE ADD COLUMN is idempotent-safe via error suppression.
        let migrations = [
            "ALTER TABLE messages ADD COLUMN recipient TEXT",
            "ALTER TABLE messages ADD COLUMN dedup_token TEXT",
            "ALTER TABLE identities ADD COLUMN last_disconnect_at INTEGER",
        ];
        for sql in &migrations {
            // Ignore "duplicate column name" errors — column already exists
            let _ = self.conn.execute(sql, []);
        }

        Ok(())
    }

    // ── Channel directory ──────────────────────────────────────────────

    /// Create a channel. Returns false if a channel with that name exists.
    pub fn create_channel(&self, name: &str, created_at: i64) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO channels (name, created_at) VALUES (?1, ?2)",
            params![name, created_at],
        )?;
        Ok(changed > 0)
    }

    pub fn channel_exists(&self, name: &str) -> SqlResult<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM channels WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// List channel names matching a case-insensitive substring filter.
    /// An empty filter matches everything. Result order is unspecified.
    pub fn list_channels(&self, filter: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM channels
             WHERE ?1 = '' OR instr(lower(name), lower(?1)) > 0",
        )?;
        let rows = stmt.query_map(params![filter], |row| row.get(0))?;
        rows.collect()
    }

    /// Rename a channel, rewriting the lookup key on memberships and
    /// messages in the same transaction so history and membership follow
    /// the logical entity. Returns false if the old name does not exist.
    pub fn rename_channel(&self, old: &str, new: &str) -> SqlResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE channels SET name = ?2 WHERE name = ?1",
            params![old, new],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE memberships SET channel = ?2 WHERE channel = ?1",
            params![old, new],
        )?;
        tx.execute(
            "UPDATE messages SET channel = ?2 WHERE channel = ?1",
            params![old, new],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Delete a channel, cascading to its messages and memberships.
    /// Returns false if no such channel exists.
    pub fn delete_channel(&self, name: &str) -> SqlResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute("DELETE FROM channels WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM messages WHERE channel = ?1", params![name])?;
        tx.execute("DELETE FROM memberships WHERE channel = ?1", params![name])?;
        tx.commit()?;
        Ok(true)
    }

    // ── Identities ─────────────────────────────────────────────────────

    /// Create an identity row if absent. Returns true when newly created.
    pub fn ensure_identity(&self, name: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO identities (name) VALUES (?1)",
            params![name],
        )?;
        Ok(changed > 0)
    }

    pub fn identity_exists(&self, name: &str) -> SqlResult<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM identities WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub fn get_identity(&self, name: &str) -> SqlResult<Option<IdentityRow>> {
        self.conn
            .query_row(
                "SELECT name, last_disconnect_at FROM identities WHERE name = ?1",
                params![name],
                |row| {
                    Ok(IdentityRow {
                        name: row.get(0)?,
                        last_disconnect_at: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    /// Stamp the disconnect time. Identities are never deleted.
    pub fn touch_disconnect(&self, name: &str, at: i64) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE identities SET last_disconnect_at = ?2 WHERE name = ?1",
            params![name, at],
        )?;
        Ok(())
    }

    /// Clear the disconnect stamp on reconnect.
    pub fn clear_disconnect(&self, name: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE identities SET last_disconnect_at = NULL WHERE name = ?1",
            params![name],
        )?;
        Ok(())
    }

    // ── Memberships ────────────────────────────────────────────────────

    /// Persist a membership. Returns true when newly added.
    pub fn add_membership(&self, nickname: &str, channel: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO memberships (nickname, channel) VALUES (?1, ?2)",
            params![nickname, channel],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_membership(&self, nickname: &str, channel: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM memberships WHERE nickname = ?1 AND channel = ?2",
            params![nickname, channel],
        )?;
        Ok(changed > 0)
    }

    /// Channels an identity belongs to, in join order.
    pub fn channels_for(&self, nickname: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel FROM memberships WHERE nickname = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![nickname], |row| row.get(0))?;
        rows.collect()
    }

    /// Persisted members of a channel, in join order.
    pub fn members_of(&self, channel: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT nickname FROM memberships WHERE channel = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![channel], |row| row.get(0))?;
        rows.collect()
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Append a message. If a dedup token is supplied and a message with
    /// that token already exists in the channel, this is a no-op that
    /// returns the existing record (idempotent retry semantics).
    pub fn append_message(
        &self,
        channel: &str,
        sender: &str,
        recipient: Option<&str>,
        content: &str,
        created_at: i64,
        dedup_token: Option<&str>,
    ) -> SqlResult<MessageRow> {
        if let Some(token) = dedup_token {
            if let Some(existing) = self.find_by_token(channel, token)? {
                return Ok(existing);
            }
        }
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO messages
                 (channel, sender, recipient, content, created_at, dedup_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![channel, sender, recipient, content, created_at, dedup_token],
        )?;
        if changed == 0 {
            // Lost a token race with a concurrent append — return the winner.
            if let Some(token) = dedup_token {
                if let Some(existing) = self.find_by_token(channel, token)? {
                    return Ok(existing);
                }
            }
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        let id = self.conn.last_insert_rowid();
        Ok(MessageRow {
            id,
            channel: channel.to_string(),
            sender: sender.to_string(),
            recipient: recipient.map(str::to_string),
            content: content.to_string(),
            created_at,
            dedup_token: dedup_token.map(str::to_string),
        })
    }

    fn find_by_token(&self, channel: &str, token: &str) -> SqlResult<Option<MessageRow>> {
        self.conn
            .query_row(
                "SELECT id, channel, sender, recipient, content, created_at, dedup_token
                 FROM messages WHERE channel = ?1 AND dedup_token = ?2",
                params![channel, token],
                map_message_row,
            )
            .optional()
    }

    /// A channel's history, oldest first. With a limit, the most recent
    /// `limit` messages are returned, still oldest first.
    pub fn history(&self, channel: &str, limit: Option<usize>) -> SqlResult<Vec<MessageRow>> {
        match limit {
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, channel, sender, recipient, content, created_at, dedup_token
                     FROM messages WHERE channel = ?1
                     ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt.query_map(params![channel], map_message_row)?;
                rows.collect()
            }
            Some(n) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, channel, sender, recipient, content, created_at, dedup_token
                     FROM messages WHERE channel = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![channel, n as i64], map_message_row)?;
                let mut out = rows.collect::<SqlResult<Vec<_>>>()?;
                out.reverse();
                Ok(out)
            }
        }
    }

    /// Messages with an id strictly greater than the cursor, oldest first.
    /// Used for reconnect catch-up so already-seen messages are skipped.
    pub fn history_after(&self, channel: &str, after_id: i64) -> SqlResult<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, channel, sender, recipient, content, created_at, dedup_token
             FROM messages WHERE channel = ?1 AND id > ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![channel, after_id], map_message_row)?;
        rows.collect()
    }

    /// Raw SQL hook for store-level fault injection in tests.
    #[cfg(test)]
    pub(crate) fn run_sql(&self, sql: &str) -> SqlResult<()> {
        self.conn.execute_batch(sql)
    }

    /// The full message log across all channels, oldest first. Backs the
    /// read-only HTTP dump.
    pub fn all_messages(&self) -> SqlResult<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, channel, sender, recipient, content, created_at, dedup_token
             FROM messages ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], map_message_row)?;
        rows.collect()
    }
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        channel: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        dedup_token: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_list_includes_name_once() {
        let db = Db::open_memory().unwrap();
        assert!(db.create_channel("eng", 1000).unwrap());
        let names = db.list_channels("").unwrap();
        assert_eq!(names.iter().filter(|n| *n == "eng").count(), 1);
    }

    #[test]
    fn create_duplicate_rejected() {
        let db = Db::open_memory().unwrap();
        assert!(db.create_channel("eng", 1000).unwrap());
        assert!(!db.create_channel("eng", 1001).unwrap());
    }

    #[test]
    fn list_filter_is_case_insensitive_substring() {
        let db = Db::open_memory().unwrap();
        db.create_channel("Engineering", 0).unwrap();
        db.create_channel("design", 0).unwrap();
        let hits = db.list_channels("ENG").unwrap();
        assert_eq!(hits, vec!["Engineering".to_string()]);
        assert_eq!(db.list_channels("").unwrap().len(), 2);
    }

    #[test]
    fn rename_rewrites_memberships_and_messages() {
        let db = Db::open_memory().unwrap();
        db.create_channel("old", 0).unwrap();
        db.add_membership("alice", "old").unwrap();
        db.append_message("old", "alice", None, "hi", 1000, None).unwrap();

        assert!(db.rename_channel("old", "new").unwrap());
        assert!(!db.channel_exists("old").unwrap());
        assert!(db.channel_exists("new").unwrap());
        assert_eq!(db.members_of("new").unwrap(), vec!["alice".to_string()]);
        assert_eq!(db.history("new", None).unwrap().len(), 1);
        assert!(db.history("old", None).unwrap().is_empty());
    }

    #[test]
    fn rename_missing_channel_is_not_found() {
        let db = Db::open_memory().unwrap();
        assert!(!db.rename_channel("ghost", "new").unwrap());
    }

    #[test]
    fn delete_cascades_messages_and_memberships() {
        let db = Db::open_memory().unwrap();
        db.create_channel("eng", 0).unwrap();
        db.add_membership("alice", "eng").unwrap();
        db.append_message("eng", "alice", None, "hi", 1000, None).unwrap();

        assert!(db.delete_channel("eng").unwrap());
        assert!(!db.channel_exists("eng").unwrap());
        assert!(db.history("eng", None).unwrap().is_empty());
        assert!(db.members_of("eng").unwrap().is_empty());
        assert!(!db.delete_channel("eng").unwrap());

        // Re-creating yields a fresh channel with empty history
        assert!(db.create_channel("eng", 1).unwrap());
        assert!(db.history("eng", None).unwrap().is_empty());
    }

    #[test]
    fn append_with_same_token_is_idempotent() {
        let db = Db::open_memory().unwrap();
        db.create_channel("eng", 0).unwrap();

        let a = db
            .append_message("eng", "alice", None, "hello", 1000, Some("tok-1"))
            .unwrap();
        let b = db
            .append_message("eng", "alice", None, "hello", 1005, Some("tok-1"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(db.history("eng", None).unwrap().len(), 1);

        // Same token in a different channel is a distinct message
        db.create_channel("ops", 0).unwrap();
        db.append_message("ops", "alice", None, "hello", 1010, Some("tok-1"))
            .unwrap();
        assert_eq!(db.history("ops", None).unwrap().len(), 1);
    }

    #[test]
    fn untokened_appends_never_collide() {
        let db = Db::open_memory().unwrap();
        db.create_channel("eng", 0).unwrap();
        db.append_message("eng", "alice", None, "one", 1000, None).unwrap();
        db.append_message("eng", "alice", None, "two", 1000, None).unwrap();
        assert_eq!(db.history("eng", None).unwrap().len(), 2);
    }

    #[test]
    fn history_is_sorted_by_creation_time() {
        let db = Db::open_memory().unwrap();
        db.create_channel("eng", 0).unwrap();
        // Insert out of chronological order
        db.append_message("eng", "bob", None, "second", 2000, None).unwrap();
        db.append_message("eng", "alice", None, "first", 1000, None).unwrap();
        db.append_message("eng", "carol", None, "third", 3000, None).unwrap();

        let rows = db.history("eng", None).unwrap();
        let times: Vec<i64> = rows.iter().map(|m| m.created_at).collect();
        assert_eq!(times, vec![1000, 2000, 3000]);

        // Limited history keeps the most recent, still ascending
        let last_two = db.history("eng", Some(2)).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "second");
        assert_eq!(last_two[1].content, "third");
    }

    #[test]
    fn history_after_skips_seen_messages() {
        let db = Db::open_memory().unwrap();
        db.create_channel("eng", 0).unwrap();
        let first = db.append_message("eng", "a", None, "one", 1000, None).unwrap();
        db.append_message("eng", "a", None, "two", 2000, None).unwrap();
        db.append_message("eng", "a", None, "three", 3000, None).unwrap();

        let rest = db.history_after("eng", first.id).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].content, "two");
        assert_eq!(rest[1].content, "three");

        assert!(db.history_after("eng", i64::MAX).unwrap().is_empty());
    }

    #[test]
    fn identity_survives_disconnect() {
        let db = Db::open_memory().unwrap();
        assert!(db.ensure_identity("alice").unwrap());
        assert!(!db.ensure_identity("alice").unwrap());

        db.touch_disconnect("alice", 5000).unwrap();
        let row = db.get_identity("alice").unwrap().unwrap();
        assert_eq!(row.last_disconnect_at, Some(5000));

        db.clear_disconnect("alice").unwrap();
        let row = db.get_identity("alice").unwrap().unwrap();
        assert_eq!(row.last_disconnect_at, None);
    }

    #[test]
    fn membership_roundtrip() {
        let db = Db::open_memory().unwrap();
        db.add_membership("alice", "eng").unwrap();
        db.add_membership("alice", "ops").unwrap();
        assert!(!db.add_membership("alice", "eng").unwrap());

        assert_eq!(db.channels_for("alice").unwrap(), vec!["eng", "ops"]);
        assert_eq!(db.members_of("eng").unwrap(), vec!["alice"]);

        assert!(db.remove_membership("alice", "eng").unwrap());
        assert!(!db.remove_membership("alice", "eng").unwrap());
        assert_eq!(db.channels_for("alice").unwrap(), vec!["ops"]);
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palaver.db");
        {
            let db = Db::open(&path).unwrap();
            db.create_channel("eng", 0).unwrap();
            db.ensure_identity("alice").unwrap();
            db.append_message("eng", "alice", None, "hi", 1000, None).unwrap();
        }
        // Second open runs init + migrations against the existing schema
        let db = Db::open(&path).unwrap();
        assert!(db.channel_exists("eng").unwrap());
        assert!(db.identity_exists("alice").unwrap());
        assert_eq!(db.history("eng", None).unwrap().len(), 1);
    }

    #[test]
    fn all_messages_spans_channels() {
        let db = Db::open_memory().unwrap();
        db.append_message("a", "u", None, "msg-a", 1000, None).unwrap();
        db.append_message("b", "u", None, "msg-b", 2000, None).unwrap();
        let all = db.all_messages().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "msg-a");
        assert_eq!(all[1].content, "msg-b");
    }
}
