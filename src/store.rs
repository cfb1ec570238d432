//! Session persistence layer
//!
//! The orchestration core reads a session once at turn start and writes
//! back at turn end; everything in between works on the in-memory copy.
//! Each `update` is atomic per call but calls do not compose into a
//! transaction. Turn ordering is insertion order and is never rewritten.

use crate::error::OrchestratorError;
use crate::inquiry::InquiryStatus;
use crate::models::{Session, SessionPatch, SessionState, Turn, TurnRole};
use crate::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Trait for session persistence
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<()>;
    async fn get(&self, session_id: Uuid) -> Result<Option<Session>>;
    async fn update(&self, session_id: Uuid, patch: SessionPatch) -> Result<()>;
    async fn append_turn(&self, session_id: Uuid, turn: Turn) -> Result<()>;
}

// =============================
// In-memory store
// =============================

/// In-memory session store for development and tests
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id).cloned())
    }

    async fn update(&self, session_id: Uuid, patch: SessionPatch) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;

        if let Some(state) = patch.current_state {
            session.current_state = state;
        }
        if let Some(status) = patch.inquiry_status {
            session.inquiry_status = status;
        }
        if let Some(plan) = patch.reading_plan {
            session.reading_plan = Some(plan);
        }
        session.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn append_turn(&self, session_id: Uuid, turn: Turn) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;

        session.chat_history.push(turn);
        session.updated_at = chrono::Utc::now();
        Ok(())
    }
}

// =============================
// Postgres store
// =============================

/// Postgres-backed session store. Schema is created lazily on first use.
pub struct PgSessionStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgSessionStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestratorError::DatabaseError(format!("failed to build pool: {}", e))
            })?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS reading_sessions (
                      session_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      title TEXT NOT NULL,
                      current_state TEXT NOT NULL,
                      paper_path TEXT,
                      markdown_path TEXT,
                      inquiry_status JSONB NOT NULL DEFAULT '{}'::jsonb,
                      context_packages JSONB NOT NULL DEFAULT '{}'::jsonb,
                      reading_plan TEXT,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS reading_session_turns (
                      turn_id BIGSERIAL PRIMARY KEY,
                      session_id UUID NOT NULL,
                      role TEXT NOT NULL,
                      content TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_turns_session_order
                    ON reading_session_turns (session_id, turn_id);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestratorError::DatabaseError(format!(
                    "failed to initialize session schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    fn role_from_db(role: &str) -> TurnRole {
        match role.to_lowercase().as_str() {
            "assistant" => TurnRole::Assistant,
            "user" => TurnRole::User,
            other => {
                warn!(role = other, "unknown turn role in store, treating as user");
                TurnRole::User
            }
        }
    }

    fn state_from_db(state: &str) -> SessionState {
        SessionState::parse(state).unwrap_or_else(|| {
            warn!(state, "unknown state in store, resetting to initial");
            SessionState::GuidePendingReport
        })
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: &Session) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO reading_sessions
              (session_id, user_id, title, current_state, paper_path, markdown_path,
               inquiry_status, context_packages, reading_plan, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(&session.title)
        .bind(session.current_state.as_str())
        .bind(&session.paper_path)
        .bind(&session.markdown_path)
        .bind(serde_json::to_value(&session.inquiry_status)?)
        .bind(serde_json::to_value(&session.context_packages)?)
        .bind(&session.reading_plan)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::DatabaseError(format!("failed to create session: {}", e)))?;

        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT session_id, user_id, title, current_state, paper_path, markdown_path,
                   inquiry_status, context_packages, reading_plan, created_at, updated_at
            FROM reading_sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrchestratorError::DatabaseError(format!("failed to load session: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let state_raw: String = row.try_get("current_state").unwrap_or_default();
        let inquiry_json: serde_json::Value =
            row.try_get("inquiry_status").unwrap_or(serde_json::json!({}));
        let packages_json: serde_json::Value = row
            .try_get("context_packages")
            .unwrap_or(serde_json::json!({}));

        let inquiry_status: InquiryStatus =
            serde_json::from_value(inquiry_json).unwrap_or_default();
        let context_packages =
            serde_json::from_value(packages_json).unwrap_or_default();

        let turn_rows = sqlx::query(
            r#"
            SELECT role, content, created_at
            FROM reading_session_turns
            WHERE session_id = $1
            ORDER BY turn_id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::DatabaseError(format!("failed to load turns: {}", e)))?;

        let chat_history = turn_rows
            .into_iter()
            .map(|turn_row| {
                let role: String = turn_row.try_get("role").unwrap_or_else(|_| "user".to_string());
                Turn {
                    role: Self::role_from_db(&role),
                    content: turn_row.try_get("content").unwrap_or_default(),
                    created_at: turn_row
                        .try_get("created_at")
                        .unwrap_or_else(|_| chrono::Utc::now()),
                }
            })
            .collect();

        Ok(Some(Session {
            session_id: row.try_get("session_id").unwrap_or(session_id),
            user_id: row.try_get("user_id").unwrap_or_else(|_| Uuid::nil()),
            title: row.try_get("title").unwrap_or_default(),
            current_state: Self::state_from_db(&state_raw),
            paper_path: row.try_get("paper_path").ok().flatten(),
            markdown_path: row.try_get("markdown_path").ok().flatten(),
            chat_history,
            inquiry_status,
            context_packages,
            reading_plan: row.try_get("reading_plan").ok().flatten(),
            created_at: row.try_get("created_at").unwrap_or_else(|_| chrono::Utc::now()),
            updated_at: row.try_get("updated_at").unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    async fn update(&self, session_id: Uuid, patch: SessionPatch) -> Result<()> {
        self.ensure_schema().await?;

        let inquiry_json = patch
            .inquiry_status
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE reading_sessions SET
              current_state = COALESCE($2, current_state),
              inquiry_status = COALESCE($3, inquiry_status),
              reading_plan = COALESCE($4, reading_plan),
              updated_at = NOW()
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(patch.current_state.map(|s| s.as_str().to_string()))
        .bind(inquiry_json)
        .bind(patch.reading_plan)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::DatabaseError(format!("failed to update session: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::SessionNotFound(session_id));
        }

        Ok(())
    }

    async fn append_turn(&self, session_id: Uuid, turn: Turn) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO reading_session_turns (session_id, role, content, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(session_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(turn.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::DatabaseError(format!("failed to append turn: {}", e)))?;

        Ok(())
    }
}
