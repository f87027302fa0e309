//! # Relational Store
//!
//! Single source of truth for desired state and accumulated counters.
//! Backed by SQLite through `sqlx`; the schema is created at startup from
//! the embedded DDL below. Counter updates always go through SQL
//! `col = col + ?` increments so concurrent flow reports interleave
//! safely, and each flow report is applied in one transaction.

use chrono::{FixedOffset, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("node is still referenced by a tunnel")]
    NodeInUse,
    #[error("tunnel still has forwards attached")]
    TunnelHasForwards,
    #[error("tunnel still has user permissions attached")]
    TunnelHasPermissions,
    #[error("name already exists")]
    NameTaken,
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS node (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    secret        TEXT NOT NULL UNIQUE,
    public_addr   TEXT NOT NULL,
    control_addr  TEXT NOT NULL,
    port_min      INTEGER NOT NULL,
    port_max      INTEGER NOT NULL,
    status        INTEGER NOT NULL DEFAULT 0,
    version       TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tunnel (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL UNIQUE,
    in_node_id    INTEGER NOT NULL,
    out_node_id   INTEGER,
    kind          INTEGER NOT NULL,
    path_node_ids TEXT,
    iface_map     TEXT,
    bind_map      TEXT,
    iface         TEXT,
    flow_mode     INTEGER NOT NULL DEFAULT 2,
    status        INTEGER NOT NULL DEFAULT 1,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS forward (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL,
    tunnel_id     INTEGER NOT NULL,
    name          TEXT NOT NULL,
    in_port       INTEGER NOT NULL,
    out_port      INTEGER,
    path_ports    TEXT,
    remote_addr   TEXT NOT NULL,
    iface         TEXT,
    status        INTEGER NOT NULL DEFAULT 1,
    in_bytes      INTEGER NOT NULL DEFAULT 0,
    out_bytes     INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS user (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    flow          INTEGER NOT NULL DEFAULT 0,
    in_bytes      INTEGER NOT NULL DEFAULT 0,
    out_bytes     INTEGER NOT NULL DEFAULT 0,
    expires_at_ms INTEGER,
    status        INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS user_tunnel (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL,
    tunnel_id     INTEGER NOT NULL,
    flow          INTEGER NOT NULL DEFAULT 0,
    in_bytes      INTEGER NOT NULL DEFAULT 0,
    out_bytes     INTEGER NOT NULL DEFAULT 0,
    expires_at_ms INTEGER,
    status        INTEGER NOT NULL DEFAULT 1,
    UNIQUE(user_id, tunnel_id)
);
CREATE TABLE IF NOT EXISTS node_runtime (
    node_id       INTEGER PRIMARY KEY,
    system_info   TEXT,
    interfaces    TEXT,
    services      TEXT,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS node_op_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    diag_id       TEXT NOT NULL,
    node_id       INTEGER NOT NULL,
    cmd           TEXT NOT NULL,
    request_id    TEXT NOT NULL,
    success       INTEGER NOT NULL,
    message       TEXT NOT NULL,
    stdout        TEXT,
    at_ms         INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS statistics_flow (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL,
    time          TEXT NOT NULL,
    flow          INTEGER NOT NULL DEFAULT 0,
    total_flow    INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    UNIQUE(user_id, time)
);
CREATE TABLE IF NOT EXISTS panel_config (
    name          TEXT PRIMARY KEY,
    value         TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
"#;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Hour bucket key for statistics rows: `"HH:00"` in UTC+8.
pub fn hour_key_utc8() -> String {
    let offset = FixedOffset::east_opt(8 * 3600).expect("static offset");
    Utc::now().with_timezone(&offset).format("%H:00").to_string()
}

#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub name: String,
    pub in_node_id: i64,
    pub out_node_id: Option<i64>,
    pub kind: i64,
    pub path_node_ids: Vec<i64>,
    pub iface_map: std::collections::BTreeMap<i64, String>,
    pub bind_map: std::collections::BTreeMap<i64, String>,
    pub iface: Option<String>,
    pub flow_mode: i64,
}

#[derive(Debug, Clone)]
pub struct NewForward {
    pub user_id: i64,
    pub tunnel_id: i64,
    pub name: String,
    pub in_port: i64,
    pub out_port: Option<i64>,
    pub path_ports: std::collections::BTreeMap<i64, i64>,
    pub remote_addr: String,
    pub iface: Option<String>,
}

/// All increments of a single flow report, applied atomically.
#[derive(Debug, Clone)]
pub struct FlowApply {
    pub forward_id: i64,
    pub user_id: i64,
    pub user_tunnel_id: Option<i64>,
    pub in_inc: i64,
    pub out_inc: i64,
    pub quota_inc: i64,
    pub hour_key: String,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Single-connection in-memory store; every test gets its own.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // ── Nodes ──

    pub async fn create_node(
        &self,
        name: &str,
        public_addr: &str,
        control_addr: &str,
        port_min: i64,
        port_max: i64,
    ) -> Result<Node> {
        let now = now_ms();
        let secret = Uuid::new_v4().to_string();
        let res = sqlx::query(
            "INSERT INTO node (name, secret, public_addr, control_addr, port_min, port_max, status, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(name)
        .bind(&secret)
        .bind(public_addr)
        .bind(control_addr)
        .bind(port_min)
        .bind(port_max)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.node_by_id(res.last_insert_rowid())
            .await?
            .ok_or(StoreError::Db(sqlx::Error::RowNotFound))
    }

    pub async fn node_by_id(&self, id: i64) -> Result<Option<Node>> {
        Ok(sqlx::query_as::<_, Node>("SELECT * FROM node WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn node_by_secret(&self, secret: &str) -> Result<Option<Node>> {
        Ok(
            sqlx::query_as::<_, Node>("SELECT * FROM node WHERE secret = ?")
                .bind(secret)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(sqlx::query_as::<_, Node>("SELECT * FROM node ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn update_node(
        &self,
        id: i64,
        name: &str,
        public_addr: &str,
        control_addr: &str,
        port_min: i64,
        port_max: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE node SET name = ?, public_addr = ?, control_addr = ?, port_min = ?, port_max = ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(name)
        .bind(public_addr)
        .bind(control_addr)
        .bind(port_min)
        .bind(port_max)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletion is refused while any tunnel references the node in
    /// either the entry or exit slot.
    pub async fn delete_node(&self, id: i64) -> Result<()> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tunnel WHERE in_node_id = ? OR out_node_id = ?",
        )
        .bind(id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if count > 0 {
            return Err(StoreError::NodeInUse);
        }
        sqlx::query("DELETE FROM node WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_node_online(&self, id: i64, version: &str) -> Result<()> {
        sqlx::query("UPDATE node SET status = 1, version = ?, updated_at_ms = ? WHERE id = ?")
            .bind(version)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_node_offline(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE node SET status = 0, updated_at_ms = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Tunnels ──

    pub async fn create_tunnel(&self, t: &NewTunnel) -> Result<Tunnel> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tunnel WHERE name = ?")
            .bind(&t.name)
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Err(StoreError::NameTaken);
        }
        let now = now_ms();
        let res = sqlx::query(
            "INSERT INTO tunnel (name, in_node_id, out_node_id, kind, path_node_ids, iface_map, bind_map, iface, flow_mode, status, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&t.name)
        .bind(t.in_node_id)
        .bind(t.out_node_id)
        .bind(t.kind)
        .bind(encode_id_list(&t.path_node_ids))
        .bind(encode_id_map(&t.iface_map))
        .bind(encode_id_map(&t.bind_map))
        .bind(&t.iface)
        .bind(t.flow_mode)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.tunnel_by_id(res.last_insert_rowid())
            .await?
            .ok_or(StoreError::Db(sqlx::Error::RowNotFound))
    }

    pub async fn tunnel_by_id(&self, id: i64) -> Result<Option<Tunnel>> {
        Ok(sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_tunnels(&self) -> Result<Vec<Tunnel>> {
        Ok(sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn update_tunnel(
        &self,
        id: i64,
        name: &str,
        flow_mode: i64,
        iface: Option<&str>,
    ) -> Result<()> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tunnel WHERE name = ? AND id <> ?")
                .bind(name)
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if count > 0 {
            return Err(StoreError::NameTaken);
        }
        sqlx::query(
            "UPDATE tunnel SET name = ?, flow_mode = ?, iface = ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(name)
        .bind(flow_mode)
        .bind(iface)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_tunnel(&self, id: i64) -> Result<()> {
        let (forwards,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM forward WHERE tunnel_id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if forwards > 0 {
            return Err(StoreError::TunnelHasForwards);
        }
        let (perms,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM user_tunnel WHERE tunnel_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if perms > 0 {
            return Err(StoreError::TunnelHasPermissions);
        }
        sqlx::query("DELETE FROM tunnel WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Forwards ──

    pub async fn create_forward(&self, f: &NewForward) -> Result<Forward> {
        let now = now_ms();
        let res = sqlx::query(
            "INSERT INTO forward (user_id, tunnel_id, name, in_port, out_port, path_ports, remote_addr, iface, status, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(f.user_id)
        .bind(f.tunnel_id)
        .bind(&f.name)
        .bind(f.in_port)
        .bind(f.out_port)
        .bind(encode_port_map(&f.path_ports))
        .bind(&f.remote_addr)
        .bind(&f.iface)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.forward_by_id(res.last_insert_rowid())
            .await?
            .ok_or(StoreError::Db(sqlx::Error::RowNotFound))
    }

    pub async fn forward_by_id(&self, id: i64) -> Result<Option<Forward>> {
        Ok(
            sqlx::query_as::<_, Forward>("SELECT * FROM forward WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_forwards(&self, user_id: Option<i64>) -> Result<Vec<Forward>> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query_as::<_, Forward>(
                    "SELECT * FROM forward WHERE user_id = ? ORDER BY id",
                )
                .bind(uid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Forward>("SELECT * FROM forward ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    pub async fn forwards_for_user(&self, user_id: i64) -> Result<Vec<Forward>> {
        self.list_forwards(Some(user_id)).await
    }

    pub async fn forwards_for_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<Vec<Forward>> {
        Ok(sqlx::query_as::<_, Forward>(
            "SELECT * FROM forward WHERE user_id = ? AND tunnel_id = ? ORDER BY id",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Every forward joined with its tunnel, for desired-set computation.
    pub async fn forwards_with_tunnels(&self) -> Result<Vec<(Forward, Tunnel)>> {
        let forwards = self.list_forwards(None).await?;
        let tunnels = self.list_tunnels().await?;
        let by_id: std::collections::HashMap<i64, Tunnel> =
            tunnels.into_iter().map(|t| (t.id, t)).collect();
        Ok(forwards
            .into_iter()
            .filter_map(|f| by_id.get(&f.tunnel_id).cloned().map(|t| (f, t)))
            .collect())
    }

    pub async fn update_forward(&self, id: i64, name: &str, remote_addr: &str) -> Result<()> {
        sqlx::query(
            "UPDATE forward SET name = ?, remote_addr = ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(name)
        .bind(remote_addr)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_forward_status(&self, id: i64, status: i64) -> Result<()> {
        sqlx::query("UPDATE forward SET status = ?, updated_at_ms = ? WHERE id = ?")
            .bind(status)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_forward(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM forward WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Users and permissions ──

    pub async fn create_user(
        &self,
        name: &str,
        flow_gib: i64,
        expires_at_ms: Option<i64>,
    ) -> Result<User> {
        let res = sqlx::query(
            "INSERT INTO user (name, flow, expires_at_ms, status) VALUES (?, ?, ?, 1)",
        )
        .bind(name)
        .bind(flow_gib)
        .bind(expires_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(sqlx::query_as::<_, User>("SELECT * FROM user WHERE id = ?")
            .bind(res.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM user WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn set_user_status(&self, id: i64, status: i64) -> Result<()> {
        sqlx::query("UPDATE user SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
        flow_gib: i64,
        expires_at_ms: Option<i64>,
    ) -> Result<UserTunnel> {
        let res = sqlx::query(
            "INSERT INTO user_tunnel (user_id, tunnel_id, flow, expires_at_ms, status) VALUES (?, ?, ?, ?, 1)",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .bind(flow_gib)
        .bind(expires_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(
            sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnel WHERE id = ?")
                .bind(res.last_insert_rowid())
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn user_tunnel_by_id(&self, id: i64) -> Result<Option<UserTunnel>> {
        Ok(
            sqlx::query_as::<_, UserTunnel>("SELECT * FROM user_tunnel WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn user_tunnel_for(&self, user_id: i64, tunnel_id: i64) -> Result<Option<UserTunnel>> {
        Ok(sqlx::query_as::<_, UserTunnel>(
            "SELECT * FROM user_tunnel WHERE user_id = ? AND tunnel_id = ?",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn set_user_tunnel_status(&self, id: i64, status: i64) -> Result<()> {
        sqlx::query("UPDATE user_tunnel SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Flow accounting ──

    /// Applies one usage report atomically: forward, user, optional
    /// user-tunnel counters plus the hourly statistics bucket.
    pub async fn apply_flow(&self, apply: &FlowApply) -> Result<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE forward SET in_bytes = in_bytes + ?, out_bytes = out_bytes + ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(apply.in_inc)
        .bind(apply.out_inc)
        .bind(now)
        .bind(apply.forward_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE user SET in_bytes = in_bytes + ?, out_bytes = out_bytes + ? WHERE id = ?")
            .bind(apply.in_inc)
            .bind(apply.out_inc)
            .bind(apply.user_id)
            .execute(&mut *tx)
            .await?;
        if let Some(ut_id) = apply.user_tunnel_id {
            sqlx::query(
                "UPDATE user_tunnel SET in_bytes = in_bytes + ?, out_bytes = out_bytes + ? WHERE id = ?",
            )
            .bind(apply.in_inc)
            .bind(apply.out_inc)
            .bind(ut_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO statistics_flow (user_id, time, flow, total_flow, created_at_ms) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, time) DO UPDATE SET flow = flow + excluded.flow, total_flow = total_flow + excluded.total_flow",
        )
        .bind(apply.user_id)
        .bind(&apply.hour_key)
        .bind(apply.quota_inc)
        .bind(apply.quota_inc)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn hour_bucket(&self, user_id: i64, time: &str) -> Result<Option<StatisticsFlow>> {
        Ok(sqlx::query_as::<_, StatisticsFlow>(
            "SELECT * FROM statistics_flow WHERE user_id = ? AND time = ?",
        )
        .bind(user_id)
        .bind(time)
        .fetch_optional(&self.pool)
        .await?)
    }

    // ── Runtime telemetry ──

    pub async fn upsert_runtime(&self, node_id: i64, column: RuntimeField, value: &Value) -> Result<()> {
        let text = value.to_string();
        let now = now_ms();
        let sql = match column {
            RuntimeField::SystemInfo => {
                "INSERT INTO node_runtime (node_id, system_info, updated_at_ms) VALUES (?, ?, ?) \
                 ON CONFLICT(node_id) DO UPDATE SET system_info = excluded.system_info, updated_at_ms = excluded.updated_at_ms"
            }
            RuntimeField::Interfaces => {
                "INSERT INTO node_runtime (node_id, interfaces, updated_at_ms) VALUES (?, ?, ?) \
                 ON CONFLICT(node_id) DO UPDATE SET interfaces = excluded.interfaces, updated_at_ms = excluded.updated_at_ms"
            }
            RuntimeField::Services => {
                "INSERT INTO node_runtime (node_id, services, updated_at_ms) VALUES (?, ?, ?) \
                 ON CONFLICT(node_id) DO UPDATE SET services = excluded.services, updated_at_ms = excluded.updated_at_ms"
            }
        };
        sqlx::query(sql)
            .bind(node_id)
            .bind(text)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn runtime_for(&self, node_id: i64) -> Result<Option<NodeRuntime>> {
        Ok(
            sqlx::query_as::<_, NodeRuntime>("SELECT * FROM node_runtime WHERE node_id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ── Operation log ──

    #[allow(clippy::too_many_arguments)]
    pub async fn log_op(
        &self,
        diag_id: &str,
        node_id: i64,
        cmd: &str,
        request_id: &str,
        success: bool,
        message: &str,
        stdout: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_op_log (diag_id, node_id, cmd, request_id, success, message, stdout, at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(diag_id)
        .bind(node_id)
        .bind(cmd)
        .bind(request_id)
        .bind(success)
        .bind(message)
        .bind(stdout)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_ops(&self, node_id: Option<i64>, limit: i64) -> Result<Vec<NodeOpLog>> {
        let limit = limit.clamp(1, 200);
        let rows = match node_id {
            Some(id) => {
                sqlx::query_as::<_, NodeOpLog>(
                    "SELECT * FROM node_op_log WHERE node_id = ? ORDER BY at_ms DESC LIMIT ?",
                )
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, NodeOpLog>(
                    "SELECT * FROM node_op_log ORDER BY at_ms DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    // ── Config KV ──

    pub async fn config_string(&self, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM panel_config WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    pub async fn set_config(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO panel_config (name, value, updated_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(name)
        .bind(value)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn config_int(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.config_string(name).await?.and_then(|s| parse_config_int(&s)))
    }

    /// Timeout for the iperf3 LocalProbe step. Key priority:
    /// `diag_local_probe_timeout_ms`, then `_s`, then the unitless key
    /// (read as seconds). Default 3000 ms.
    pub async fn diag_local_probe_timeout_ms(&self) -> u64 {
        if let Ok(Some(v)) = self.config_int("diag_local_probe_timeout_ms").await {
            if v > 0 {
                return v as u64;
            }
        }
        if let Ok(Some(v)) = self.config_int("diag_local_probe_timeout_s").await {
            if v > 0 {
                return (v as u64) * 1000;
            }
        }
        if let Ok(Some(v)) = self.config_int("diag_local_probe_timeout").await {
            if v > 0 {
                return (v as u64) * 1000;
            }
        }
        3000
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RuntimeField {
    SystemInfo,
    Interfaces,
    Services,
}

/// Accepts plain integers plus a trailing `s` suffix for seconds.
fn parse_config_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(base) = s.strip_suffix(['s', 'S']) {
        return base.trim().parse().ok();
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn store_with_forward() -> (Store, Forward, User) {
        let store = Store::open_in_memory().await.unwrap();
        let node = store
            .create_node("n1", "1.1.1.1", "1.1.1.1", 10000, 20000)
            .await
            .unwrap();
        let tunnel = store
            .create_tunnel(&NewTunnel {
                name: "t1".into(),
                in_node_id: node.id,
                out_node_id: None,
                kind: TUNNEL_PORT_FORWARD,
                path_node_ids: vec![],
                iface_map: BTreeMap::new(),
                bind_map: BTreeMap::new(),
                iface: None,
                flow_mode: FLOW_MODE_DOUBLE,
            })
            .await
            .unwrap();
        let user = store.create_user("alice", 1, None).await.unwrap();
        let forward = store
            .create_forward(&NewForward {
                user_id: user.id,
                tunnel_id: tunnel.id,
                name: "web".into(),
                in_port: 10000,
                out_port: None,
                path_ports: BTreeMap::new(),
                remote_addr: "1.2.3.4:80".into(),
                iface: None,
            })
            .await
            .unwrap();
        (store, forward, user)
    }

    #[tokio::test]
    async fn counters_keep_raw_directions() {
        let (store, forward, user) = store_with_forward().await;
        let apply = FlowApply {
            forward_id: forward.id,
            user_id: user.id,
            user_tunnel_id: None,
            in_inc: 100,
            out_inc: 40,
            quota_inc: 140,
            hour_key: "08:00".into(),
        };
        store.apply_flow(&apply).await.unwrap();
        store.apply_flow(&apply).await.unwrap();

        let f = store.forward_by_id(forward.id).await.unwrap().unwrap();
        assert_eq!((f.in_bytes, f.out_bytes), (200, 80));
        let u = store.user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!((u.in_bytes, u.out_bytes), (200, 80));
        let bucket = store.hour_bucket(user.id, "08:00").await.unwrap().unwrap();
        assert_eq!(bucket.flow, 280);
        assert_eq!(bucket.total_flow, 280);
    }

    #[tokio::test]
    async fn node_delete_refused_while_referenced() {
        let (store, forward, _) = store_with_forward().await;
        let tunnel = store.tunnel_by_id(forward.tunnel_id).await.unwrap().unwrap();
        match store.delete_node(tunnel.in_node_id).await {
            Err(StoreError::NodeInUse) => {}
            other => panic!("expected NodeInUse, got {other:?}"),
        }
        match store.delete_tunnel(tunnel.id).await {
            Err(StoreError::TunnelHasForwards) => {}
            other => panic!("expected TunnelHasForwards, got {other:?}"),
        }
        store.delete_forward(forward.id).await.unwrap();
        store.delete_tunnel(tunnel.id).await.unwrap();
        store.delete_node(tunnel.in_node_id).await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_names_are_unique() {
        let (store, forward, _) = store_with_forward().await;
        let tunnel = store.tunnel_by_id(forward.tunnel_id).await.unwrap().unwrap();
        let dup = store
            .create_tunnel(&NewTunnel {
                name: tunnel.name.clone(),
                in_node_id: tunnel.in_node_id,
                out_node_id: None,
                kind: TUNNEL_PORT_FORWARD,
                path_node_ids: vec![],
                iface_map: BTreeMap::new(),
                bind_map: BTreeMap::new(),
                iface: None,
                flow_mode: FLOW_MODE_DOUBLE,
            })
            .await;
        assert!(matches!(dup, Err(StoreError::NameTaken)));
    }

    #[tokio::test]
    async fn probe_timeout_key_priority() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.diag_local_probe_timeout_ms().await, 3000);
        store.set_config("diag_local_probe_timeout", "5").await.unwrap();
        assert_eq!(store.diag_local_probe_timeout_ms().await, 5000);
        store.set_config("diag_local_probe_timeout_s", "2s").await.unwrap();
        assert_eq!(store.diag_local_probe_timeout_ms().await, 2000);
        store.set_config("diag_local_probe_timeout_ms", "750").await.unwrap();
        assert_eq!(store.diag_local_probe_timeout_ms().await, 750);
    }

    #[test]
    fn config_int_accepts_seconds_suffix() {
        assert_eq!(parse_config_int("30"), Some(30));
        assert_eq!(parse_config_int("30s"), Some(30));
        assert_eq!(parse_config_int(" 5S "), Some(5));
        assert_eq!(parse_config_int("nope"), None);
    }
}
