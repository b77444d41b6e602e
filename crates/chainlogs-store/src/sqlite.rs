//! SQLite log store backend.
//!
//! Persists logs, block hashes, and the chain head to a single SQLite
//! file. Uses `sqlx` with WAL mode so readers get snapshot-consistent
//! results while an apply or rollback transaction commits.
//!
//! Hex values are stored in their normalized lowercase fixed-width form,
//! which makes lexicographic SQL comparison equal to unsigned numeric
//! comparison — topic and data-word range predicates run entirely in SQL.
//!
//! # Usage
//! ```rust,no_run
//! use chainlogs_store::sqlite::SqliteLogStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteLogStore::open("./logs.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteLogStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use chainlogs_core::error::Error;
use chainlogs_core::query::{MAX_TOPIC_INDEX, MIN_TOPIC_INDEX};
use chainlogs_core::store::LogStore;
use chainlogs_core::types::{BlockHeader, ChainHead, Log, HASH_HEX_LEN};

/// SQLite-backed log store.
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./logs.db"`) or a full
    /// SQLite URL (`"sqlite:./logs.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, Error> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single connection so every handle sees the same
    /// database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), Error> {
        // WAL mode — readers are not blocked by the writer
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logs (
                block_number INTEGER NOT NULL,
                log_index    INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                tx_hash      TEXT    NOT NULL,
                address      TEXT    NOT NULL,
                event_sig    TEXT    NOT NULL,
                topic1       TEXT,
                topic2       TEXT,
                topic3       TEXT,
                data         TEXT    NOT NULL,
                created_at   INTEGER NOT NULL,
                PRIMARY KEY (block_number, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_logs_sig_addr
             ON logs (event_sig, address, block_number, log_index);",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block_hashes (
                block_number INTEGER PRIMARY KEY,
                block_hash   TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chain_head (
                id           INTEGER PRIMARY KEY CHECK (id = 0),
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn select_logs(
        &self,
        sql: &str,
        binds: Vec<SqlBind>,
    ) -> Result<Vec<Log>, Error> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                SqlBind::Int(v) => query.bind(v),
                SqlBind::Text(v) => query.bind(v),
            };
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_log).collect()
    }
}

enum SqlBind {
    Int(i64),
    Text(String),
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

fn placeholders(n: usize) -> String {
    let mut s = "?,".repeat(n);
    s.pop();
    s
}

fn topic_column(topic_index: usize) -> Result<&'static str, Error> {
    match topic_index {
        1 => Ok("topic1"),
        2 => Ok("topic2"),
        3 => Ok("topic3"),
        _ => Err(Error::InvalidQuery(format!(
            "topic index must be in {MIN_TOPIC_INDEX}..={MAX_TOPIC_INDEX}, got {topic_index}"
        ))),
    }
}

/// SQL expression selecting the 32-byte word at `word_index` of the data
/// payload, plus the minimum payload length for the word to exist.
/// `None` if the offsets overflow — no stored payload can be that long,
/// so the query matches nothing, same as [`Log::data_word`].
fn word_expr(word_index: usize) -> Option<(String, i64)> {
    // data is "0x" + 64-char words; substr() is 1-based.
    let start = HASH_HEX_LEN.checked_mul(word_index)?.checked_add(3)?;
    let min_len = HASH_HEX_LEN
        .checked_mul(word_index.checked_add(1)?)?
        .checked_add(2)?;
    let start = i64::try_from(start).ok()?;
    let min_len = i64::try_from(min_len).ok()?;
    Some((format!("substr(data, {start}, {HASH_HEX_LEN})"), min_len))
}

fn row_to_log(row: &SqliteRow) -> Result<Log, Error> {
    let ts: i64 = row.try_get("created_at").map_err(db_err)?;
    let created_at = DateTime::<Utc>::from_timestamp(ts, 0)
        .ok_or_else(|| Error::Storage(format!("invalid created_at timestamp {ts}")))?;

    let event_sig: String = row.try_get("event_sig").map_err(db_err)?;
    let mut topics = vec![event_sig.clone()];
    for column in ["topic1", "topic2", "topic3"] {
        match row.try_get::<Option<String>, _>(column).map_err(db_err)? {
            Some(topic) => topics.push(topic),
            None => break,
        }
    }

    Ok(Log {
        block_hash: row.try_get("block_hash").map_err(db_err)?,
        block_number: row.try_get::<i64, _>("block_number").map_err(db_err)? as u64,
        log_index: row.try_get::<i64, _>("log_index").map_err(db_err)? as u32,
        tx_hash: row.try_get("tx_hash").map_err(db_err)?,
        address: row.try_get("address").map_err(db_err)?,
        event_sig,
        topics,
        data: row.try_get("data").map_err(db_err)?,
        created_at,
    })
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn apply_block(&self, header: &BlockHeader, logs: Vec<Log>) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for log in &logs {
            if log.block_number != header.number {
                return Err(Error::Storage(format!(
                    "log at block {} applied with header {}",
                    log.block_number, header.number
                )));
            }
            sqlx::query(
                "INSERT INTO logs (block_number, log_index, block_hash, tx_hash,
                                   address, event_sig, topic1, topic2, topic3,
                                   data, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (block_number, log_index) DO UPDATE SET
                     block_hash = excluded.block_hash,
                     tx_hash    = excluded.tx_hash,
                     address    = excluded.address,
                     event_sig  = excluded.event_sig,
                     topic1     = excluded.topic1,
                     topic2     = excluded.topic2,
                     topic3     = excluded.topic3,
                     data       = excluded.data;",
            )
            .bind(log.block_number as i64)
            .bind(log.log_index as i64)
            .bind(&log.block_hash)
            .bind(&log.tx_hash)
            .bind(&log.address)
            .bind(&log.event_sig)
            .bind(log.topic(1))
            .bind(log.topic(2))
            .bind(log.topic(3))
            .bind(&log.data)
            .bind(log.created_at.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO block_hashes (block_number, block_hash) VALUES (?, ?);",
        )
        .bind(header.number as i64)
        .bind(&header.hash)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Replayed historical blocks must not rewind the head.
        sqlx::query(
            "INSERT INTO chain_head (id, block_number, block_hash, updated_at)
             VALUES (0, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                 block_number = excluded.block_number,
                 block_hash   = excluded.block_hash,
                 updated_at   = excluded.updated_at
             WHERE excluded.block_number >= chain_head.block_number;",
        )
        .bind(header.number as i64)
        .bind(&header.hash)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn rollback_above(&self, block_number: u64) -> Result<(), Error> {
        tracing::debug!(above = block_number, "Rolling back logs");
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let n = block_number as i64;

        sqlx::query("DELETE FROM logs WHERE block_number > ?;")
            .bind(n)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM block_hashes WHERE block_number > ?;")
            .bind(n)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let anchor: Option<String> =
            sqlx::query_scalar("SELECT block_hash FROM block_hashes WHERE block_number = ?;")
                .bind(n)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;

        match anchor {
            Some(hash) => {
                sqlx::query(
                    "INSERT INTO chain_head (id, block_number, block_hash, updated_at)
                     VALUES (0, ?, ?, ?)
                     ON CONFLICT (id) DO UPDATE SET
                         block_number = excluded.block_number,
                         block_hash   = excluded.block_hash,
                         updated_at   = excluded.updated_at;",
                )
                .bind(n)
                .bind(hash)
                .bind(Utc::now().timestamp())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query("DELETE FROM chain_head;")
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)
    }

    async fn chain_head(&self) -> Result<Option<ChainHead>, Error> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, updated_at FROM chain_head WHERE id = 0;",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            Ok(ChainHead {
                block_number: row.try_get::<i64, _>("block_number").map_err(db_err)? as u64,
                block_hash: row.try_get("block_hash").map_err(db_err)?,
                updated_at: row.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<String>, Error> {
        sqlx::query_scalar("SELECT block_hash FROM block_hashes WHERE block_number = ?;")
            .bind(block_number as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn logs_in_range(
        &self,
        start: u64,
        end: u64,
        event_sig: &str,
        address: &str,
    ) -> Result<Vec<Log>, Error> {
        self.select_logs(
            "SELECT * FROM logs
             WHERE event_sig = ? AND address = ?
               AND block_number >= ? AND block_number <= ?
             ORDER BY block_number, log_index;",
            vec![
                SqlBind::Text(event_sig.to_string()),
                SqlBind::Text(address.to_string()),
                SqlBind::Int(start as i64),
                SqlBind::Int(end as i64),
            ],
        )
        .await
    }

    async fn indexed_logs(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        values: &[String],
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        let column = topic_column(topic_index)?;
        let sql = format!(
            "SELECT * FROM logs
             WHERE event_sig = ? AND address = ? AND block_number <= ?
               AND {column} IN ({})
             ORDER BY block_number, log_index;",
            placeholders(values.len())
        );
        let mut binds = vec![
            SqlBind::Text(event_sig.to_string()),
            SqlBind::Text(address.to_string()),
            SqlBind::Int(upper_bound as i64),
        ];
        binds.extend(values.iter().cloned().map(SqlBind::Text));
        self.select_logs(&sql, binds).await
    }

    async fn indexed_logs_topic_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        let column = topic_column(topic_index)?;
        let sql = format!(
            "SELECT * FROM logs
             WHERE event_sig = ? AND address = ? AND block_number <= ?
               AND {column} > ?
             ORDER BY block_number, log_index;"
        );
        self.select_logs(
            &sql,
            vec![
                SqlBind::Text(event_sig.to_string()),
                SqlBind::Text(address.to_string()),
                SqlBind::Int(upper_bound as i64),
                SqlBind::Text(min.to_string()),
            ],
        )
        .await
    }

    async fn indexed_logs_topic_range(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        max: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        let column = topic_column(topic_index)?;
        let sql = format!(
            "SELECT * FROM logs
             WHERE event_sig = ? AND address = ? AND block_number <= ?
               AND {column} >= ? AND {column} <= ?
             ORDER BY block_number, log_index;"
        );
        self.select_logs(
            &sql,
            vec![
                SqlBind::Text(event_sig.to_string()),
                SqlBind::Text(address.to_string()),
                SqlBind::Int(upper_bound as i64),
                SqlBind::Text(min.to_string()),
                SqlBind::Text(max.to_string()),
            ],
        )
        .await
    }

    async fn logs_data_word_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        let Some((word, min_len)) = word_expr(word_index) else {
            return Ok(Vec::new());
        };
        let min_hex = min.strip_prefix("0x").unwrap_or(min);
        let sql = format!(
            "SELECT * FROM logs
             WHERE event_sig = ? AND address = ? AND block_number <= ?
               AND length(data) >= {min_len} AND {word} > ?
             ORDER BY block_number, log_index;"
        );
        self.select_logs(
            &sql,
            vec![
                SqlBind::Text(event_sig.to_string()),
                SqlBind::Text(address.to_string()),
                SqlBind::Int(upper_bound as i64),
                SqlBind::Text(min_hex.to_string()),
            ],
        )
        .await
    }

    async fn logs_data_word_range(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        max: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        let Some((word, min_len)) = word_expr(word_index) else {
            return Ok(Vec::new());
        };
        let min_hex = min.strip_prefix("0x").unwrap_or(min);
        let max_hex = max.strip_prefix("0x").unwrap_or(max);
        let sql = format!(
            "SELECT * FROM logs
             WHERE event_sig = ? AND address = ? AND block_number <= ?
               AND length(data) >= {min_len} AND {word} >= ? AND {word} <= ?
             ORDER BY block_number, log_index;"
        );
        self.select_logs(
            &sql,
            vec![
                SqlBind::Text(event_sig.to_string()),
                SqlBind::Text(address.to_string()),
                SqlBind::Int(upper_bound as i64),
                SqlBind::Text(min_hex.to_string()),
                SqlBind::Text(max_hex.to_string()),
            ],
        )
        .await
    }

    async fn latest_log_by_event_sig(
        &self,
        event_sig: &str,
        address: &str,
        upper_bound: u64,
    ) -> Result<Option<Log>, Error> {
        let row = sqlx::query(
            "SELECT * FROM logs
             WHERE event_sig = ? AND address = ? AND block_number <= ?
             ORDER BY block_number DESC, log_index DESC
             LIMIT 1;",
        )
        .bind(event_sig)
        .bind(address)
        .bind(upper_bound as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_log).transpose()
    }

    async fn latest_logs_by_event_sigs_addrs(
        &self,
        from_block: u64,
        event_sigs: &[String],
        addresses: &[String],
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        let sql = format!(
            "SELECT l.* FROM logs l
             WHERE l.block_number >= ? AND l.block_number <= ?
               AND l.event_sig IN ({sigs}) AND l.address IN ({addrs})
               AND NOT EXISTS (
                   SELECT 1 FROM logs m
                   WHERE m.event_sig = l.event_sig AND m.address = l.address
                     AND m.block_number >= ? AND m.block_number <= ?
                     AND (m.block_number > l.block_number
                          OR (m.block_number = l.block_number
                              AND m.log_index > l.log_index))
               )
             ORDER BY l.block_number, l.log_index;",
            sigs = placeholders(event_sigs.len()),
            addrs = placeholders(addresses.len()),
        );
        let mut binds = vec![
            SqlBind::Int(from_block as i64),
            SqlBind::Int(upper_bound as i64),
        ];
        binds.extend(event_sigs.iter().cloned().map(SqlBind::Text));
        binds.extend(addresses.iter().cloned().map(SqlBind::Text));
        binds.push(SqlBind::Int(from_block as i64));
        binds.push(SqlBind::Int(upper_bound as i64));
        self.select_logs(&sql, binds).await
    }
}
