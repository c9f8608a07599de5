use crate::ban_store::BanStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use unicode_normalization::UnicodeNormalization;

/// Players shown on the leaderboard.
pub const LEADERBOARD_SIZE: i64 = 20;
/// Default number of entries in the recent reports feed.
pub const RECENT_REPORTS_LIMIT: i64 = 50;
/// Results returned by the public player search.
pub const SEARCH_LIMIT: i64 = 10;
/// Results returned by the admin report search.
pub const ADMIN_SEARCH_LIMIT: i64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub player_name: String,
    pub votes: i64,
    pub rank: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: i64,
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub voted_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDetails {
    pub player_name: String,
    pub total_votes: i64,
    pub rank: Option<i64>,
    pub reports: Vec<Report>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMatch {
    pub player_name: String,
    pub votes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BanEntry {
    pub ip: String,
    pub banned_until: String,
}

#[derive(Clone)]
pub struct DbUtils {
    pool: SqlitePool,
}

impl DbUtils {
    /// Open or create the SQLite database at the specified path.
    ///
    /// Configures the connection pool with:
    /// - max 5 connections (appropriate for SQLite's single-writer model)
    /// - 3 second acquire timeout to fail fast on overload
    ///
    /// `":memory:"` opens a private in-memory database on a single, never-recycled
    /// connection.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let in_memory = db_path.as_os_str() == ":memory:";

        let (options, pool_options) = if in_memory {
            (
                SqliteConnectOptions::from_str("sqlite::memory:")?,
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None),
            )
        } else {
            (
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true),
                SqlitePoolOptions::new().max_connections(5),
            )
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        sqlx::query(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS votes (
                id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                player_name            TEXT NOT NULL,
                player_name_normalized TEXT,
                message                TEXT,
                voted_at               TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bans (
                ip           TEXT PRIMARY KEY,
                banned_until TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        let db = DbUtils { pool };
        db.migrate().await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_player_name ON votes(player_name);
            CREATE INDEX IF NOT EXISTS idx_player_name_normalized ON votes(player_name_normalized);
            "#,
        )
        .execute(&db.pool)
        .await?;

        log::info!("DbUtils initialized with db_path={}", db_path.display());
        Ok(db)
    }

    /// Bring databases created by older releases up to the current schema.
    async fn migrate(&self) -> Result<()> {
        let columns: Vec<String> = sqlx::query("PRAGMA table_info(votes)")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get::<String, _>("name"))
            .collect();

        if !columns.iter().any(|c| c == "message") {
            log::info!("migrate: adding votes.message column");
            sqlx::query("ALTER TABLE votes ADD COLUMN message TEXT")
                .execute(&self.pool)
                .await?;
        }

        if !columns.iter().any(|c| c == "player_name_normalized") {
            log::info!("migrate: adding votes.player_name_normalized column");
            sqlx::query("ALTER TABLE votes ADD COLUMN player_name_normalized TEXT")
                .execute(&self.pool)
                .await?;
        }

        let pending: Vec<(i64, String)> =
            sqlx::query("SELECT id, player_name FROM votes WHERE player_name_normalized IS NULL")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| (r.get(0), r.get(1)))
                .collect();

        if !pending.is_empty() {
            let mut tx = self.pool.begin().await?;
            for (id, name) in &pending {
                sqlx::query("UPDATE votes SET player_name_normalized = ? WHERE id = ?")
                    .bind(normalize_name(name))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            log::info!("migrate: backfilled {} normalized names", pending.len());
        }
        Ok(())
    }

    // ========== Votes ==========

    /// Store a vote and return the player's new total.
    pub async fn register_vote(&self, player_name: &str, message: Option<&str>) -> Result<i64> {
        log::info!("register_vote: player_name={}", player_name);
        sqlx::query(
            "INSERT INTO votes (player_name, player_name_normalized, message, voted_at) VALUES (?, ?, ?, ?)",
        )
        .bind(player_name)
        .bind(normalize_name(player_name))
        .bind(message)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to register vote for {:?}", player_name))?;

        self.get_player_votes(player_name).await
    }

    /// Total votes recorded for a player.
    pub async fn get_player_votes(&self, player_name: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM votes WHERE player_name = ?")
            .bind(player_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    /// Players with the most votes, ranked from 1.
    pub async fn get_leaderboard(&self) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query(
            "SELECT player_name, COUNT(*) AS votes FROM votes
             GROUP BY player_name ORDER BY votes DESC, player_name ASC LIMIT ?",
        )
        .bind(LEADERBOARD_SIZE)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, r)| LeaderboardEntry {
                player_name: r.get(0),
                votes: r.get(1),
                rank: i as i64 + 1,
            })
            .collect())
    }

    /// Most recent reports, newest first.
    pub async fn get_recent_reports(&self, limit: i64) -> Result<Vec<Report>> {
        let rows = sqlx::query(
            "SELECT id, player_name, message, voted_at FROM votes
             ORDER BY voted_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(report_from_row).collect())
    }

    /// Totals, rank and report history for one player; `None` if nobody voted for them.
    pub async fn get_player_details(&self, player_name: &str) -> Result<Option<PlayerDetails>> {
        log::info!("get_player_details: player_name={}", player_name);
        let total_votes = self.get_player_votes(player_name).await?;
        if total_votes == 0 {
            return Ok(None);
        }

        let ranking = sqlx::query(
            "SELECT player_name, COUNT(*) AS votes FROM votes
             GROUP BY player_name ORDER BY votes DESC, player_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let rank = ranking
            .iter()
            .position(|r| r.get::<String, _>(0) == player_name)
            .map(|i| i as i64 + 1);

        let rows = sqlx::query(
            "SELECT id, player_name, message, voted_at FROM votes
             WHERE player_name = ? ORDER BY voted_at DESC, id DESC",
        )
        .bind(player_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(PlayerDetails {
            player_name: player_name.to_string(),
            total_votes,
            rank,
            reports: rows.into_iter().map(report_from_row).collect(),
        }))
    }

    /// Accent- and case-insensitive substring search over player names.
    pub async fn search_players(&self, query: &str) -> Result<Vec<PlayerMatch>> {
        log::info!("search_players: query={}", query);
        let pattern = like_pattern(&normalize_name(query));
        let rows = sqlx::query(
            "SELECT player_name, COUNT(*) AS votes FROM votes
             WHERE player_name_normalized LIKE ? ESCAPE '\\'
             GROUP BY player_name ORDER BY votes DESC, player_name ASC LIMIT ?",
        )
        .bind(pattern)
        .bind(SEARCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| PlayerMatch {
                player_name: r.get(0),
                votes: r.get(1),
            })
            .collect())
    }

    // ========== Moderation ==========

    /// Page through all reports, newest first.
    pub async fn get_admin_reports(&self, limit: i64, offset: i64) -> Result<Vec<Report>> {
        let rows = sqlx::query(
            "SELECT id, player_name, message, voted_at FROM votes
             ORDER BY voted_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(report_from_row).collect())
    }

    /// Reports whose player name or message contains `query`.
    pub async fn search_admin_reports(&self, query: &str) -> Result<Vec<Report>> {
        log::info!("search_admin_reports: query={}", query);
        let pattern = like_pattern(query);
        let rows = sqlx::query(
            "SELECT id, player_name, message, voted_at FROM votes
             WHERE player_name LIKE ?1 ESCAPE '\\' OR message LIKE ?1 ESCAPE '\\'
             ORDER BY voted_at DESC, id DESC LIMIT ?2",
        )
        .bind(pattern)
        .bind(ADMIN_SEARCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(report_from_row).collect())
    }

    /// Delete one report. Returns true if it existed.
    pub async fn delete_report(&self, id: i64) -> Result<bool> {
        log::info!("delete_report: id={}", id);
        let res = sqlx::query("DELETE FROM votes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Delete every report for a player. Returns the number removed.
    pub async fn delete_player_reports(&self, player_name: &str) -> Result<u64> {
        log::info!("delete_player_reports: player_name={}", player_name);
        let res = sqlx::query("DELETE FROM votes WHERE player_name = ?")
            .bind(player_name)
            .execute(&self.pool)
            .await?;
        log::info!("delete_player_reports: deleted {} reports", res.rows_affected());
        Ok(res.rows_affected())
    }

    // ========== Bans ==========

    /// Bans still in force at `now`, latest expiry first.
    pub async fn get_bans(&self, now: DateTime<Utc>) -> Result<Vec<BanEntry>> {
        let rows = sqlx::query(
            "SELECT ip, banned_until FROM bans WHERE banned_until > ? ORDER BY banned_until DESC",
        )
        .bind(timestamp(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| BanEntry {
                ip: r.get(0),
                banned_until: r.get(1),
            })
            .collect())
    }

    /// Lift a ban early. Returns true if one existed.
    pub async fn revoke_ban(&self, ip: &str) -> Result<bool> {
        log::info!("revoke_ban: ip={}", ip);
        let res = sqlx::query("DELETE FROM bans WHERE ip = ?")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Drop bans that expired at or before `now`.
    pub async fn purge_expired_bans(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM bans WHERE banned_until <= ?")
            .bind(timestamp(now))
            .execute(&self.pool)
            .await?;
        if res.rows_affected() > 0 {
            log::info!("purge_expired_bans: deleted {} bans", res.rows_affected());
        }
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl BanStore for DbUtils {
    async fn get(&self, ip: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT banned_until FROM bans WHERE ip = ?")
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let raw: String = r.get(0);
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Corrupt ban expiry {:?} for ip={}", raw, ip))
        })
        .transpose()
    }

    async fn upsert(&self, ip: &str, until: DateTime<Utc>) -> Result<()> {
        log::info!("ban upsert: ip={}, until={}", ip, timestamp(until));
        sqlx::query("INSERT OR REPLACE INTO bans (ip, banned_until) VALUES (?, ?)")
            .bind(ip)
            .bind(timestamp(until))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to ban ip={}", ip))?;
        Ok(())
    }

    async fn delete(&self, ip: &str) -> Result<()> {
        self.revoke_ban(ip).await.map(|_| ())
    }
}

/// Fold a player name for search: decompose, drop combining accents, lowercase.
pub fn normalize_name(name: &str) -> String {
    name.nfd()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .collect::<String>()
        .to_lowercase()
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `%query%` with LIKE wildcards in the query escaped.
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn report_from_row(r: sqlx::sqlite::SqliteRow) -> Report {
    Report {
        id: r.get(0),
        player_name: r.get(1),
        message: r.get(2),
        voted_at: r.get(3),
    }
}
