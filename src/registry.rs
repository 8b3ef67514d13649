//! SQLite-backed node registry.
//!
//! One row per `(application, ip, port)` endpoint. All observation paths
//! funnel into [`Registry::merge`], a single conditional upsert, so
//! concurrent workers never race half-written enrichment data.

use crate::types::Node;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Schema migrations, applied in order and recorded in `schema_migrations`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_nodes.sql",
        include_str!("../migrations/0001_create_nodes.sql"),
    ),
    (
        "0002_index_last_seen.sql",
        include_str!("../migrations/0002_index_last_seen.sql"),
    ),
];

const MAX_CONNECTIONS: u32 = 10;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent store for tracked game-server endpoints.
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Open (or create) the registry database and bring its schema current.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open registry database '{}'", path.display()))?;

        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    /// Open an ephemeral in-memory registry.
    ///
    /// The pool is pinned to one connection: every SQLite `:memory:`
    /// connection is its own empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("failed to parse in-memory DSN")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory registry")?;

        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    TEXT PRIMARY KEY,
                applied_at DATETIME NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create schema_migrations table")?;

        for &(version, sql) in MIGRATIONS {
            let applied = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?")
                .bind(version)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read schema_migrations")?
                .is_some();
            if applied {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration '{}' failed", version))?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to record migration '{}'", version))?;
            tx.commit().await?;

            info!(version, "applied schema migration");
        }

        Ok(())
    }

    /// Merge one observation into the registry.
    ///
    /// Inserts a fresh row, or on key conflict bumps `count`, advances
    /// `last_seen` (never backwards), always takes the declared
    /// `version`/`type`, takes `country_code` only when non-empty, and
    /// replaces the seven-field enrichment group as a unit only when the
    /// incoming snapshot carries a `server_name`.
    pub async fn merge(&self, node: &Node) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                application, ip, port, version, type, country_code,
                server_name, map_name, players, max_players,
                game_version, game_name, server_os,
                count, first_seen, last_seen
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(application, ip, port) DO UPDATE SET
                count        = count + 1,
                last_seen    = MAX(nodes.last_seen, excluded.last_seen),
                version      = excluded.version,
                type         = excluded.type,
                country_code = CASE WHEN excluded.country_code != '' THEN excluded.country_code ELSE nodes.country_code END,
                server_name  = CASE WHEN excluded.server_name != '' THEN excluded.server_name  ELSE nodes.server_name  END,
                map_name     = CASE WHEN excluded.server_name != '' THEN excluded.map_name     ELSE nodes.map_name     END,
                players      = CASE WHEN excluded.server_name != '' THEN excluded.players      ELSE nodes.players      END,
                max_players  = CASE WHEN excluded.server_name != '' THEN excluded.max_players  ELSE nodes.max_players  END,
                game_version = CASE WHEN excluded.server_name != '' THEN excluded.game_version ELSE nodes.game_version END,
                game_name    = CASE WHEN excluded.server_name != '' THEN excluded.game_name    ELSE nodes.game_name    END,
                server_os    = CASE WHEN excluded.server_name != '' THEN excluded.server_os    ELSE nodes.server_os    END
            "#,
        )
        .bind(&node.application)
        .bind(&node.ip)
        .bind(node.port)
        .bind(&node.version)
        .bind(&node.kind)
        .bind(&node.country_code)
        .bind(&node.server_name)
        .bind(&node.map_name)
        .bind(node.players)
        .bind(node.max_players)
        .bind(&node.game_version)
        .bind(&node.game_name)
        .bind(&node.server_os)
        .bind(node.first_seen)
        .bind(node.last_seen)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to merge node {}/{}:{}",
                node.application, node.ip, node.port
            )
        })?;

        Ok(())
    }

    /// Fetch one endpoint by its full key.
    pub async fn get(&self, application: &str, ip: &str, port: u16) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE application = ? AND ip = ? AND port = ?")
            .bind(application)
            .bind(ip)
            .bind(port)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch node")?;

        match row {
            Some(row) => Ok(Some(node_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// All tracked endpoints, most recently seen first.
    pub async fn list(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY last_seen DESC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list nodes")?;

        rows.iter()
            .map(node_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Endpoints filtered by application and/or missing enrichment.
    pub async fn subset(
        &self,
        application: Option<&str>,
        only_unenriched: bool,
    ) -> Result<Vec<Node>> {
        let mut sql = String::from("SELECT * FROM nodes WHERE 1=1");
        if application.is_some() {
            sql.push_str(" AND application = ?");
        }
        if only_unenriched {
            sql.push_str(" AND server_name = ''");
        }
        sql.push_str(" ORDER BY last_seen DESC");

        let mut query = sqlx::query(&sql);
        if let Some(app) = application {
            query = query.bind(app);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("failed to load node subset")?;

        rows.iter()
            .map(node_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Remove one endpoint. Removing a missing key is not an error.
    pub async fn delete(&self, application: &str, ip: &str, port: u16) -> Result<()> {
        sqlx::query("DELETE FROM nodes WHERE application = ? AND ip = ? AND port = ?")
            .bind(application)
            .bind(ip)
            .bind(port)
            .execute(&self.pool)
            .await
            .context("failed to delete node")?;

        Ok(())
    }

    /// Remove every endpoint that never answered a live query, optionally
    /// restricted to one application. Returns the number of rows removed.
    pub async fn delete_unenriched(&self, application: Option<&str>) -> Result<u64> {
        let mut sql = String::from("DELETE FROM nodes WHERE server_name = ''");
        if application.is_some() {
            sql.push_str(" AND application = ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(app) = application {
            query = query.bind(app);
        }

        let result = query
            .execute(&self.pool)
            .await
            .context("failed to delete unenriched nodes")?;

        Ok(result.rows_affected())
    }

    /// Close the connection pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn node_from_row(row: &SqliteRow) -> Result<Node, sqlx::Error> {
    Ok(Node {
        application: row.try_get("application")?,
        ip: row.try_get("ip")?,
        port: row.try_get("port")?,
        version: row.try_get("version")?,
        kind: row.try_get("type")?,
        country_code: row.try_get("country_code")?,
        server_name: row.try_get("server_name")?,
        map_name: row.try_get("map_name")?,
        players: row.try_get("players")?,
        max_players: row.try_get("max_players")?,
        game_version: row.try_get("game_version")?,
        game_name: row.try_get("game_name")?,
        server_os: row.try_get("server_os")?,
        count: row.try_get("count")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Beacon, ServerInfo, ServerOs};
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    fn bare_node(app: &str, ip: &str, port: u16, at: DateTime<Utc>) -> Node {
        let beacon = Beacon {
            application: app.to_string(),
            kind: "steam".to_string(),
            version: "1.0.0".to_string(),
            port,
        };
        Node::from_beacon(&beacon, ip.to_string(), at)
    }

    fn enriched_node(app: &str, ip: &str, port: u16, at: DateTime<Utc>) -> Node {
        let mut node = bare_node(app, ip, port, at);
        node.apply_server_info(&ServerInfo {
            name: "Night Raid EU".to_string(),
            map: "chernarusplus".to_string(),
            game: "DayZ".to_string(),
            version: "1.26".to_string(),
            players: 17,
            max_players: 60,
            environment: ServerOs::Linux,
        });
        node
    }

    #[tokio::test]
    async fn merge_inserts_then_accumulates() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::minutes(5);
        let t2 = t0 + ChronoDuration::minutes(10);

        for at in [t0, t1, t2] {
            let mut node = bare_node("MetricZ", "198.51.100.7", 2302, at);
            node.first_seen = at;
            node.last_seen = at;
            registry.merge(&node).await.unwrap();
        }

        let stored = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.count, 3);
        assert_eq!(stored.first_seen, t0);
        assert_eq!(stored.last_seen, t2);
    }

    #[tokio::test]
    async fn merge_without_snapshot_preserves_enrichment() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        registry
            .merge(&enriched_node("MetricZ", "198.51.100.7", 2302, t0))
            .await
            .unwrap();

        let mut bare = bare_node("MetricZ", "198.51.100.7", 2302, t0 + ChronoDuration::minutes(5));
        bare.version = "1.0.1".to_string();
        registry.merge(&bare).await.unwrap();

        let stored = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.count, 2);
        assert_eq!(stored.version, "1.0.1");
        assert_eq!(stored.server_name, "Night Raid EU");
        assert_eq!(stored.map_name, "chernarusplus");
        assert_eq!(stored.players, 17);
    }

    #[tokio::test]
    async fn merge_with_snapshot_replaces_group_as_unit() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        registry
            .merge(&enriched_node("MetricZ", "198.51.100.7", 2302, t0))
            .await
            .unwrap();

        // A fresh snapshot with an empty game_name must still clear the old
        // game_name: the group moves together.
        let mut next = enriched_node("MetricZ", "198.51.100.7", 2302, t0 + ChronoDuration::minutes(1));
        next.server_name = "Night Raid EU (wiped)".to_string();
        next.map_name = "livonia".to_string();
        next.players = 0;
        next.game_name = String::new();
        registry.merge(&next).await.unwrap();

        let stored = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.server_name, "Night Raid EU (wiped)");
        assert_eq!(stored.map_name, "livonia");
        assert_eq!(stored.players, 0);
        assert_eq!(stored.game_name, "");
    }

    #[tokio::test]
    async fn merge_keeps_country_until_replacement_arrives() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        let mut first = bare_node("MetricZ", "198.51.100.7", 2302, t0);
        first.country_code = "DE".to_string();
        registry.merge(&first).await.unwrap();

        // empty country on a later merge must not erase the known one
        registry
            .merge(&bare_node("MetricZ", "198.51.100.7", 2302, t0 + ChronoDuration::minutes(1)))
            .await
            .unwrap();

        let stored = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.country_code, "DE");

        let mut third = bare_node("MetricZ", "198.51.100.7", 2302, t0 + ChronoDuration::minutes(2));
        third.country_code = "FR".to_string();
        registry.merge(&third).await.unwrap();

        let stored = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.country_code, "FR");
    }

    #[tokio::test]
    async fn merge_never_rewinds_last_seen() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::minutes(10);

        registry
            .merge(&bare_node("MetricZ", "198.51.100.7", 2302, t1))
            .await
            .unwrap();
        registry
            .merge(&bare_node("MetricZ", "198.51.100.7", 2302, t0))
            .await
            .unwrap();

        let stored = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.count, 2);
        assert_eq!(stored.last_seen, t1);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let registry = Registry::open_in_memory().await.unwrap();
        let found = registry.get("MetricZ", "203.0.113.1", 2302).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn list_orders_by_recency() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        registry
            .merge(&bare_node("MetricZ", "198.51.100.1", 2302, t0))
            .await
            .unwrap();
        registry
            .merge(&bare_node("MetricZ", "198.51.100.2", 2302, t0 + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        registry
            .merge(&bare_node("MetricZ", "198.51.100.3", 2302, t0 + ChronoDuration::minutes(2)))
            .await
            .unwrap();

        let nodes = registry.list().await.unwrap();
        let ips: Vec<&str> = nodes.iter().map(|n| n.ip.as_str()).collect();
        assert_eq!(ips, vec!["198.51.100.2", "198.51.100.3", "198.51.100.1"]);
    }

    #[tokio::test]
    async fn subset_filters_application_and_enrichment() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        registry
            .merge(&bare_node("MetricZ", "198.51.100.1", 2302, t0))
            .await
            .unwrap();
        registry
            .merge(&enriched_node("MetricZ", "198.51.100.2", 2302, t0))
            .await
            .unwrap();
        registry
            .merge(&bare_node("OtherApp", "198.51.100.3", 2302, t0))
            .await
            .unwrap();

        let all = registry.subset(None, false).await.unwrap();
        assert_eq!(all.len(), 3);

        let metricz_only = registry.subset(Some("MetricZ"), false).await.unwrap();
        assert_eq!(metricz_only.len(), 2);

        let unenriched = registry.subset(None, true).await.unwrap();
        assert_eq!(unenriched.len(), 2);

        let metricz_unenriched = registry.subset(Some("MetricZ"), true).await.unwrap();
        assert_eq!(metricz_unenriched.len(), 1);
        assert_eq!(metricz_unenriched[0].ip, "198.51.100.1");
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        registry
            .merge(&bare_node("MetricZ", "198.51.100.7", 2302, t0))
            .await
            .unwrap();
        registry.delete("MetricZ", "198.51.100.7", 2302).await.unwrap();

        assert!(registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .is_none());

        // deleting again is a no-op
        registry.delete("MetricZ", "198.51.100.7", 2302).await.unwrap();
    }

    #[tokio::test]
    async fn delete_unenriched_respects_application_filter() {
        let registry = Registry::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        registry
            .merge(&bare_node("MetricZ", "198.51.100.1", 2302, t0))
            .await
            .unwrap();
        registry
            .merge(&enriched_node("MetricZ", "198.51.100.2", 2302, t0))
            .await
            .unwrap();
        registry
            .merge(&bare_node("OtherApp", "198.51.100.3", 2302, t0))
            .await
            .unwrap();

        let removed = registry.delete_unenriched(Some("MetricZ")).await.unwrap();
        assert_eq!(removed, 1);
        assert!(registry
            .get("OtherApp", "198.51.100.3", 2302)
            .await
            .unwrap()
            .is_some());

        let removed = registry.delete_unenriched(None).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = registry.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ip, "198.51.100.2");
    }

    #[tokio::test]
    async fn reopen_keeps_data_and_skips_applied_migrations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.db");
        let t0 = Utc::now();

        {
            let registry = Registry::open(&path).await.unwrap();
            registry
                .merge(&bare_node("MetricZ", "198.51.100.7", 2302, t0))
                .await
                .unwrap();
            registry.close().await;
        }

        let registry = Registry::open(&path).await.unwrap();
        let stored = registry
            .get("MetricZ", "198.51.100.7", 2302)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.count, 1);
        registry.close().await;
    }
}
