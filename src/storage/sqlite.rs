use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    timestamp, AgentUpdate, DecisionRecord, GraphOperation, LockAttempt, NodeRecord,
    ResearchAgent, ResearchSession, SessionStatus, Storage,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Attempts made when a lock row changes between the conditional update and the read-back.
const LOCK_READBACK_ATTEMPTS: usize = 3;

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory database, used by tests.
    ///
    /// A single connection is kept open for the pool's lifetime since every
    /// new in-memory connection would see an empty database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn set_flag(&self, id: &str, column: &str, value: bool) -> StorageResult<()> {
        // `column` is always one of our own literals, never caller input.
        let sql = format!(
            "UPDATE research_sessions SET {} = ?, updated_at = ? WHERE session_id = ?",
            column
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(timestamp(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound {
                session_id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_session(&self, session: &ResearchSession) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO research_sessions (
                session_id, topic, research_type, status, iteration, confidence,
                is_aggregated, budget_exhausted, max_iterations, confidence_threshold,
                failure_reason, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.topic)
        .bind(session.research_type.to_string())
        .bind(session.status.to_string())
        .bind(session.iteration as i64)
        .bind(session.confidence)
        .bind(session.is_aggregated)
        .bind(session.budget_exhausted)
        .bind(session.max_iterations as i64)
        .bind(session.confidence_threshold)
        .bind(&session.failure_reason)
        .bind(timestamp(&session.created_at))
        .bind(timestamp(&session.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<ResearchSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT session_id, topic, research_type, status, iteration, confidence,
                   is_aggregated, budget_exhausted, max_iterations, confidence_threshold,
                   failure_reason, locked_by, locked_at, created_at, updated_at, completed_at
            FROM research_sessions
            WHERE session_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_sessions(&self) -> StorageResult<Vec<ResearchSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT session_id, topic, research_type, status, iteration, confidence,
                   is_aggregated, budget_exhausted, max_iterations, confidence_threshold,
                   failure_reason, locked_by, locked_at, created_at, updated_at, completed_at
            FROM research_sessions
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        reason: Option<String>,
    ) -> StorageResult<()> {
        let now = timestamp(&Utc::now());
        let completed_at = status.is_terminal().then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE research_sessions
            SET status = ?,
                failure_reason = COALESCE(?, failure_reason),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(&reason)
        .bind(&completed_at)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound {
                session_id: id.to_string(),
            });
        }

        debug!(session_id = %id, status = %status, "Session status updated");
        Ok(())
    }

    async fn increment_iteration(&self, id: &str) -> StorageResult<u32> {
        let iteration: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE research_sessions
            SET iteration = iteration + 1, updated_at = ?
            WHERE session_id = ?
            RETURNING iteration
            "#,
        )
        .bind(timestamp(&Utc::now()))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        iteration
            .map(|i| i as u32)
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: id.to_string(),
            })
    }

    async fn update_confidence(&self, id: &str, confidence: f64) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE research_sessions SET confidence = ?, updated_at = ? WHERE session_id = ?",
        )
        .bind(confidence.clamp(0.0, 1.0))
        .bind(timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound {
                session_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_aggregated(&self, id: &str, aggregated: bool) -> StorageResult<()> {
        self.set_flag(id, "is_aggregated", aggregated).await
    }

    async fn set_budget_exhausted(&self, id: &str, exhausted: bool) -> StorageResult<()> {
        self.set_flag(id, "budget_exhausted", exhausted).await
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        // Nodes, operations, decisions and agents cascade.
        sqlx::query("DELETE FROM research_sessions WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        session_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StorageResult<LockAttempt> {
        for _ in 0..LOCK_READBACK_ATTEMPTS {
            // Single conditional write: free, re-entrant, or stale.
            let result = sqlx::query(
                r#"
                UPDATE research_sessions
                SET locked_by = ?, locked_at = ?
                WHERE session_id = ?
                  AND (locked_by IS NULL OR locked_by = ? OR locked_at < ?)
                "#,
            )
            .bind(holder)
            .bind(timestamp(&now))
            .bind(session_id)
            .bind(holder)
            .bind(timestamp(&stale_before))
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(LockAttempt::Acquired);
            }

            let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
                "SELECT locked_by, locked_at FROM research_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                None => {
                    return Err(StorageError::SessionNotFound {
                        session_id: session_id.to_string(),
                    })
                }
                Some((Some(locked_by), locked_at)) => {
                    return Ok(LockAttempt::Held {
                        locked_by,
                        locked_at: locked_at.unwrap_or_default(),
                    })
                }
                // Released between our write and read; try again.
                Some((None, _)) => continue,
            }
        }

        Ok(LockAttempt::Held {
            locked_by: String::from("unknown"),
            locked_at: String::new(),
        })
    }

    async fn release_lock(&self, session_id: &str, holder: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE research_sessions
            SET locked_by = NULL, locked_at = NULL
            WHERE session_id = ? AND locked_by = ?
            "#,
        )
        .bind(session_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn register_agent(&self, agent: &ResearchAgent) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO research_agents (
                agent_id, session_id, agent_type, agent_role, focus_description,
                search_queries, status, token_usage, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_id) DO NOTHING
            "#,
        )
        .bind(&agent.agent_id)
        .bind(&agent.session_id)
        .bind(&agent.agent_type)
        .bind(&agent.agent_role)
        .bind(&agent.focus_description)
        .bind(to_json(&agent.search_queries)?)
        .bind(agent.status.to_string())
        .bind(agent.token_usage as i64)
        .bind(timestamp(&agent.created_at))
        .bind(timestamp(&agent.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<ResearchAgent>> {
        let row: Option<AgentRow> = sqlx::query_as(
            r#"
            SELECT agent_id, session_id, agent_type, agent_role, focus_description,
                   search_queries, status, output_file, token_usage, error_message,
                   created_at, updated_at, completed_at
            FROM research_agents
            WHERE agent_id = ?
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_agents(&self, session_id: &str) -> StorageResult<Vec<ResearchAgent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            r#"
            SELECT agent_id, session_id, agent_type, agent_role, focus_description,
                   search_queries, status, output_file, token_usage, error_message,
                   created_at, updated_at, completed_at
            FROM research_agents
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn update_agent_status(&self, agent_id: &str, update: &AgentUpdate) -> StorageResult<()> {
        let now = timestamp(&Utc::now());
        let completed_at = update.status.is_terminal().then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE research_agents
            SET status = ?,
                output_file = COALESCE(?, output_file),
                error_message = COALESCE(?, error_message),
                token_usage = COALESCE(?, token_usage),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE agent_id = ?
            "#,
        )
        .bind(update.status.to_string())
        .bind(&update.output_file)
        .bind(&update.error_message)
        .bind(update.token_usage.map(|t| t as i64))
        .bind(&completed_at)
        .bind(&now)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }

        debug!(agent_id = %agent_id, status = %update.status, "Agent status updated");
        Ok(())
    }

    async fn commit_operations(
        &self,
        session_id: &str,
        operations: &[GraphOperation],
        upserts: &[NodeRecord],
        deletes: &[String],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for node in upserts {
            sqlx::query(
                r#"
                INSERT INTO got_nodes (
                    node_id, session_id, parent_id, node_type, content, summary,
                    quality_score, status, depth, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id, node_id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    node_type = excluded.node_type,
                    content = excluded.content,
                    summary = excluded.summary,
                    quality_score = excluded.quality_score,
                    status = excluded.status,
                    depth = excluded.depth
                "#,
            )
            .bind(&node.node_id)
            .bind(&node.session_id)
            .bind(&node.parent_id)
            .bind(&node.node_type)
            .bind(&node.content)
            .bind(&node.summary)
            .bind(node.quality_score)
            .bind(&node.status)
            .bind(node.depth)
            .bind(timestamp(&node.created_at))
            .execute(&mut *tx)
            .await?;
        }

        for node_id in deletes {
            sqlx::query("DELETE FROM got_nodes WHERE session_id = ? AND node_id = ?")
                .bind(session_id)
                .bind(node_id)
                .execute(&mut *tx)
                .await?;
        }

        for op in operations {
            sqlx::query(
                r#"
                INSERT INTO got_operations (
                    operation_id, session_id, operation_type, input_nodes, output_nodes,
                    payload, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&op.operation_id)
            .bind(&op.session_id)
            .bind(op.operation_type.to_string())
            .bind(to_json(&op.input_nodes)?)
            .bind(to_json(&op.output_nodes)?)
            .bind(to_json(&op.payload)?)
            .bind(timestamp(&op.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            session_id = %session_id,
            operations = operations.len(),
            upserts = upserts.len(),
            deletes = deletes.len(),
            "Graph operations committed"
        );
        Ok(())
    }

    async fn get_nodes(&self, session_id: &str) -> StorageResult<Vec<NodeRecord>> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            r#"
            SELECT node_id, session_id, parent_id, node_type, content, summary,
                   quality_score, status, depth, created_at
            FROM got_nodes
            WHERE session_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn get_operations(&self, session_id: &str) -> StorageResult<Vec<GraphOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            r#"
            SELECT operation_id, session_id, operation_type, input_nodes, output_nodes,
                   payload, created_at
            FROM got_operations
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(GraphOperation::try_from).collect()
    }

    async fn log_decision(&self, record: &DecisionRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (id, session_id, iteration, action, params, reasoning, caller_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(record.iteration as i64)
        .bind(&record.action)
        .bind(to_json(&record.params)?)
        .bind(&record.reasoning)
        .bind(&record.caller_id)
        .bind(timestamp(&record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_decisions(&self, session_id: &str) -> StorageResult<Vec<DecisionRecord>> {
        let rows: Vec<DecisionRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, iteration, action, params, reasoning, caller_id, created_at
            FROM activity_log
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    topic: String,
    research_type: String,
    status: String,
    iteration: i64,
    confidence: f64,
    is_aggregated: bool,
    budget_exhausted: bool,
    max_iterations: i64,
    confidence_threshold: f64,
    failure_reason: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl From<SessionRow> for ResearchSession {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.session_id,
            topic: row.topic,
            research_type: row.research_type.parse().unwrap_or_default(),
            status: row.status.parse().unwrap_or_default(),
            iteration: row.iteration.max(0) as u32,
            confidence: row.confidence,
            is_aggregated: row.is_aggregated,
            budget_exhausted: row.budget_exhausted,
            max_iterations: row.max_iterations.max(0) as u32,
            confidence_threshold: row.confidence_threshold,
            failure_reason: row.failure_reason,
            locked_by: row.locked_by,
            locked_at: row.locked_at.as_deref().map(parse_timestamp),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
        }
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    node_id: String,
    session_id: String,
    parent_id: Option<String>,
    node_type: String,
    content: String,
    summary: String,
    quality_score: f64,
    status: String,
    depth: i64,
    created_at: String,
}

impl From<NodeRow> for NodeRecord {
    fn from(row: NodeRow) -> Self {
        Self {
            node_id: row.node_id,
            session_id: row.session_id,
            parent_id: row.parent_id,
            node_type: row.node_type,
            content: row.content,
            summary: row.summary,
            quality_score: row.quality_score,
            status: row.status,
            depth: row.depth,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    operation_id: String,
    session_id: String,
    operation_type: String,
    input_nodes: String,
    output_nodes: String,
    payload: String,
    created_at: String,
}

impl TryFrom<OperationRow> for GraphOperation {
    type Error = StorageError;

    // Replay depends on the payload, so a corrupt row is an error rather than a default.
    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let serialization = |e: serde_json::Error| StorageError::Serialization {
            message: format!("operation {}: {}", row.operation_id, e),
        };
        Ok(Self {
            operation_type: row
                .operation_type
                .parse()
                .map_err(|message| StorageError::Serialization { message })?,
            input_nodes: serde_json::from_str(&row.input_nodes).map_err(serialization)?,
            output_nodes: serde_json::from_str(&row.output_nodes).map_err(serialization)?,
            payload: serde_json::from_str(&row.payload).map_err(serialization)?,
            created_at: parse_timestamp(&row.created_at),
            session_id: row.session_id,
            operation_id: row.operation_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DecisionRow {
    id: String,
    session_id: String,
    iteration: i64,
    action: String,
    params: String,
    reasoning: String,
    caller_id: String,
    created_at: String,
}

impl From<DecisionRow> for DecisionRecord {
    fn from(row: DecisionRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            iteration: row.iteration.max(0) as u32,
            action: row.action,
            params: serde_json::from_str(&row.params).unwrap_or(serde_json::Value::Null),
            reasoning: row.reasoning,
            caller_id: row.caller_id,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    agent_id: String,
    session_id: String,
    agent_type: String,
    agent_role: Option<String>,
    focus_description: Option<String>,
    search_queries: String,
    status: String,
    output_file: Option<String>,
    token_usage: i64,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl From<AgentRow> for ResearchAgent {
    fn from(row: AgentRow) -> Self {
        Self {
            agent_id: row.agent_id,
            session_id: row.session_id,
            agent_type: row.agent_type,
            agent_role: row.agent_role,
            focus_description: row.focus_description,
            search_queries: serde_json::from_str(&row.search_queries).unwrap_or_default(),
            status: row.status.parse().unwrap_or_default(),
            output_file: row.output_file,
            token_usage: row.token_usage.max(0) as u64,
            error_message: row.error_message,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
        }
    }
}
