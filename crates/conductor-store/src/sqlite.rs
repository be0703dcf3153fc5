//! SQLite trace store

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::trace::{NewTrace, StepKind, TraceNode, TracePersistence, TraceStatus, TraceStep};
use conductor_core::usage::TokenUsage;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SQLite trace store (thread-safe via Arc<Mutex>)
pub struct SqliteTraceStore {
    conn: Arc<Mutex<Connection>>,
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("Database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

fn json_column(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<JsonValue>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(column, e))
}

fn time_column(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| conversion_error(column, e))
}

const NODE_COLUMNS: &str = "id, parent_id, swarm_id, user_id, agent_id, input, metadata, status, \
    output, error, prompt_tokens, completion_tokens, cost, created_at, finished_at";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<TraceNode> {
    let status: String = row.get(7)?;
    let status: TraceStatus = status.parse().map_err(|e: anyhow::Error| conversion_error(7, e))?;
    let prompt_tokens: i64 = row.get(10)?;
    let completion_tokens: i64 = row.get(11)?;
    let cost: f64 = row.get(12)?;
    Ok(TraceNode {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        swarm_id: row.get(2)?,
        user_id: row.get(3)?,
        agent_id: row.get(4)?,
        input: row.get(5)?,
        metadata: json_column(row, 6)?.unwrap_or(JsonValue::Null),
        status,
        steps: Vec::new(),
        output: json_column(row, 8)?,
        error: row.get(9)?,
        usage: TokenUsage::new(prompt_tokens.max(0) as u64, completion_tokens.max(0) as u64)
            .with_cost(cost),
        created_at: time_column(row, 13)?.ok_or_else(|| conversion_error(13, "missing created_at"))?,
        finished_at: time_column(row, 14)?,
    })
}

fn load_steps(conn: &Connection, trace_id: &str) -> Result<Vec<TraceStep>> {
    let mut stmt = conn.prepare(
        "SELECT kind, content, usage, created_at FROM trace_steps
         WHERE trace_id = ?1 ORDER BY id",
    )?;
    let steps = stmt
        .query_map(params![trace_id], |row| {
            let kind: String = row.get(0)?;
            let kind: StepKind = kind.parse().map_err(|e: anyhow::Error| conversion_error(0, e))?;
            let usage = json_column(row, 2)?
                .map(serde_json::from_value::<TokenUsage>)
                .transpose()
                .map_err(|e| conversion_error(2, e))?;
            Ok(TraceStep {
                kind,
                content: json_column(row, 1)?.unwrap_or(JsonValue::Null),
                timestamp: time_column(row, 3)?
                    .ok_or_else(|| conversion_error(3, "missing created_at"))?,
                usage,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(steps)
}

fn load_node(conn: &Connection, trace_id: &str) -> Result<Option<TraceNode>> {
    let node = conn
        .query_row(
            &format!("SELECT {} FROM traces WHERE id = ?1", NODE_COLUMNS),
            params![trace_id],
            node_from_row,
        )
        .optional()?;
    match node {
        Some(mut node) => {
            node.steps = load_steps(conn, trace_id)?;
            Ok(Some(node))
        }
        None => Ok(None),
    }
}

/// Error for a write that found no pending node
fn not_pending(conn: &Connection, trace_id: &str) -> Result<anyhow::Error> {
    let exists = conn
        .query_row("SELECT 1 FROM traces WHERE id = ?1", params![trace_id], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(if exists {
        ConductorError::TraceFinalized(trace_id.to_string()).into()
    } else {
        ConductorError::TraceNotFound(trace_id.to_string()).into()
    })
}

impl SqliteTraceStore {
    /// Open (or create) a store at `path` and apply the schema
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Initializing trace database at {:?}", path.as_ref());
        Self::init(conn)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS traces (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                swarm_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                input TEXT NOT NULL,
                metadata TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                output TEXT,
                error TEXT,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                finished_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trace_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                usage TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(trace_id) REFERENCES traces(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_traces_swarm ON traces(swarm_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trace_steps_trace ON trace_steps(trace_id)",
            [],
        )?;

        debug!("Trace schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl TracePersistence for SqliteTraceStore {
    async fn start_trace(&self, trace: NewTrace) -> Result<String> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let id = Uuid::new_v4().to_string();
            let node = trace.into_node(id.clone());
            let metadata = serde_json::to_string(&node.metadata)?;
            let conn = lock(&conn);

            conn.execute(
                "INSERT INTO traces (id, parent_id, swarm_id, user_id, agent_id, input, metadata, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &node.id,
                    &node.parent_id,
                    &node.swarm_id,
                    &node.user_id,
                    &node.agent_id,
                    &node.input,
                    metadata,
                    node.status.to_string(),
                    node.created_at.to_rfc3339(),
                ],
            )?;

            debug!("Inserted trace {} for agent '{}'", id, node.agent_id);
            Ok(id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn add_step(&self, trace_id: &str, step: TraceStep) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let trace_id = trace_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let content = serde_json::to_string(&step.content)?;
            let usage = step.usage.map(|u| serde_json::to_string(&u)).transpose()?;
            let conn = lock(&conn);

            let inserted = conn.execute(
                "INSERT INTO trace_steps (trace_id, kind, content, usage, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5 FROM traces WHERE id = ?1 AND status = 'pending'",
                params![
                    &trace_id,
                    step.kind.as_str(),
                    content,
                    usage,
                    step.timestamp.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                return Err(not_pending(&conn, &trace_id)?);
            }
            Ok(())
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn complete_trace(&self, trace_id: &str, output: Option<JsonValue>, usage: TokenUsage) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let trace_id = trace_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let output = output.map(|o| serde_json::to_string(&o)).transpose()?;
            let conn = lock(&conn);

            let updated = conn.execute(
                "UPDATE traces SET status = 'completed', output = ?2, prompt_tokens = ?3,
                     completion_tokens = ?4, cost = ?5, finished_at = ?6
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    &trace_id,
                    output,
                    usage.prompt_tokens as i64,
                    usage.completion_tokens as i64,
                    usage.cost,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if updated == 0 {
                return Err(not_pending(&conn, &trace_id)?);
            }
            debug!("Completed trace {}", trace_id);
            Ok(())
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn fail_trace(&self, trace_id: &str, error: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let trace_id = trace_id.to_owned();
        let error = error.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let updated = conn.execute(
                "UPDATE traces SET status = 'failed', error = ?2, finished_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![&trace_id, &error, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(not_pending(&conn, &trace_id)?);
            }
            debug!("Failed trace {}: {}", trace_id, error);
            Ok(())
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceNode>> {
        let conn = Arc::clone(&self.conn);
        let trace_id = trace_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            load_node(&conn, &trace_id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn list_swarm(&self, swarm_id: &str) -> Result<Vec<TraceNode>> {
        let conn = Arc::clone(&self.conn);
        let swarm_id = swarm_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM traces WHERE swarm_id = ?1 ORDER BY rowid",
                NODE_COLUMNS
            ))?;
            let mut nodes = stmt
                .query_map(params![&swarm_id], node_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for node in &mut nodes {
                node.steps = load_steps(&conn, &node.id)?;
            }
            Ok(nodes)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}
