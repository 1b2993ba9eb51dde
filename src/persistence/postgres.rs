//! PostgreSQL store
//!
//! Conditional updates are single statements (`UPDATE ... WHERE id = $1 AND
//! state = $2 RETURNING ...`), so concurrent schedulers race on the row, not
//! on a read-then-write.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{ensure_allowed, ApprovalUpdate, Store};
use crate::domain::{
    ActivityEvent, ApprovalItem, ApprovalStatus, BrakePhase, BrakeState, DeadLetterRecord,
    NewActivity, Task, TaskState, TaskTransition, UserProfile,
};
use crate::error::{JobPilotError, Result};

const TASK_COLUMNS: &str = r#"
    id, user_id, agent_kind, action, payload, state, attempt_count, max_attempts,
    soft_timeout_secs, hard_timeout_secs, created_at, updated_at, last_heartbeat_at,
    next_attempt_at, paused, checkpoint, result, error_history, approval_id
"#;

const APPROVAL_COLUMNS: &str = r#"
    id, user_id, agent_kind, action_name, payload, status, rationale, confidence,
    created_at, decided_at, expires_at, decision_reason, task_id
"#;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    let state: String = row.get("state");
    let history: serde_json::Value = row.get("error_history");

    Ok(Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        agent_kind: row.get("agent_kind"),
        action: row.get("action"),
        payload: row.get("payload"),
        state: TaskState::try_from(state.as_str()).map_err(JobPilotError::Internal)?,
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        soft_timeout_secs: row.get::<i64, _>("soft_timeout_secs") as u64,
        hard_timeout_secs: row.get::<i64, _>("hard_timeout_secs") as u64,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        next_attempt_at: row.get("next_attempt_at"),
        paused: row.get("paused"),
        checkpoint: row.get("checkpoint"),
        result: row.get("result"),
        error_history: serde_json::from_value(history)?,
        approval_id: row.get("approval_id"),
    })
}

fn approval_from_row(row: &PgRow) -> Result<ApprovalItem> {
    let status: String = row.get("status");

    Ok(ApprovalItem {
        id: row.get("id"),
        user_id: row.get("user_id"),
        agent_kind: row.get("agent_kind"),
        action_name: row.get("action_name"),
        payload: row.get("payload"),
        status: ApprovalStatus::try_from(status.as_str()).map_err(JobPilotError::Internal)?,
        rationale: row.get("rationale"),
        confidence: row.get("confidence"),
        created_at: row.get("created_at"),
        decided_at: row.get("decided_at"),
        expires_at: row.get("expires_at"),
        decision_reason: row.get("decision_reason"),
        task_id: row.get("task_id"),
    })
}

fn activity_from_row(row: &PgRow) -> ActivityEvent {
    ActivityEvent {
        event_id: row.get("event_id"),
        seq: row.get("seq"),
        user_id: row.get("user_id"),
        task_id: row.get("task_id"),
        event_type: row.get("event_type"),
        data: row.get("data"),
        timestamp: row.get("created_at"),
    }
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterRecord> {
    let history: serde_json::Value = row.get("error_history");

    Ok(DeadLetterRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        user_id: row.get("user_id"),
        agent_kind: row.get("agent_kind"),
        action: row.get("action"),
        payload: row.get("payload"),
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        final_error: row.get("final_error"),
        error_history: serde_json::from_value(history)?,
        created_at: row.get("created_at"),
    })
}

fn brake_from_row(row: &PgRow) -> Result<BrakeState> {
    let phase: String = row.get("phase");
    let awaiting: serde_json::Value = row.get("awaiting");

    Ok(BrakeState {
        user_id: row.get("user_id"),
        paused: row.get("paused"),
        phase: BrakePhase::try_from(phase.as_str()).map_err(JobPilotError::Internal)?,
        paused_at: row.get("paused_at"),
        reason: row.get("reason"),
        awaiting: serde_json::from_value(awaiting)?,
        updated_at: row.get("updated_at"),
    })
}

fn map_unique_violation(err: sqlx::Error, what: String) -> JobPilotError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => JobPilotError::Conflict(what),
        _ => JobPilotError::Database(err),
    }
}

#[async_trait]
impl Store for PostgresStore {
    // ==================== Tasks ====================

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, user_id, agent_kind, action, payload, state, attempt_count, max_attempts,
                soft_timeout_secs, hard_timeout_secs, created_at, updated_at, last_heartbeat_at,
                next_attempt_at, paused, checkpoint, result, error_history, approval_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(task.id)
        .bind(&task.user_id)
        .bind(&task.agent_kind)
        .bind(&task.action)
        .bind(&task.payload)
        .bind(task.state.as_str())
        .bind(task.attempt_count as i32)
        .bind(task.max_attempts as i32)
        .bind(task.soft_timeout_secs as i64)
        .bind(task.hard_timeout_secs as i64)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.last_heartbeat_at)
        .bind(task.next_attempt_at)
        .bind(task.paused)
        .bind(&task.checkpoint)
        .bind(&task.result)
        .bind(serde_json::to_value(&task.error_history)?)
        .bind(task.approval_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, format!("task {} or its approval already exists", task.id)))?;

        debug!("Inserted task {} ({}/{})", task.id, task.agent_kind, task.action);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, transition), fields(from = %transition.from, to = %transition.to))]
    async fn transition_task(
        &self,
        id: Uuid,
        transition: &TaskTransition,
    ) -> Result<Option<Task>> {
        ensure_allowed(transition)?;

        let failure = match &transition.failure {
            Some(f) => serde_json::to_value(vec![f])?,
            None => serde_json::json!([]),
        };

        let sql = format!(
            r#"
            UPDATE tasks SET
                state = $3,
                updated_at = $4,
                paused = COALESCE($5::BOOLEAN, paused),
                attempt_count = COALESCE($6::INTEGER, attempt_count),
                last_heartbeat_at = COALESCE($7::TIMESTAMPTZ, last_heartbeat_at),
                next_attempt_at = CASE WHEN $8 THEN $9::TIMESTAMPTZ ELSE next_attempt_at END,
                checkpoint = CASE WHEN $10 THEN $11::JSONB ELSE checkpoint END,
                result = COALESCE($12::JSONB, result),
                error_history = error_history || $13::JSONB
            WHERE id = $1 AND state = $2 AND ($14::BOOLEAN IS NULL OR paused = $14::BOOLEAN)
            RETURNING {}
            "#,
            TASK_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(transition.at)
            .bind(transition.paused)
            .bind(transition.attempt_count.map(|c| c as i32))
            .bind(transition.heartbeat_at)
            .bind(transition.next_attempt_at.is_some())
            .bind(transition.next_attempt_at.flatten())
            .bind(transition.checkpoint.is_some())
            .bind(transition.checkpoint.clone().flatten())
            .bind(&transition.result)
            .bind(failure)
            .bind(transition.expect_paused)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET last_heartbeat_at = $2 WHERE id = $1 AND state = 'running'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE state = $1 ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn list_user_tasks(&self, user_id: &str, state: Option<TaskState>) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR state = $2::TEXT)
            ORDER BY created_at ASC
            "#,
            TASK_COLUMNS
        ))
        .bind(user_id)
        .bind(state.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn find_task_by_approval(&self, approval_id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE approval_id = $1",
            TASK_COLUMNS
        ))
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn purge_terminal_tasks(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE state IN ('succeeded', 'dead_lettered', 'cancelled') AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ==================== Approvals ====================

    #[instrument(skip(self, item), fields(approval_id = %item.id))]
    async fn insert_approval(&self, item: &ApprovalItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_items (
                id, user_id, agent_kind, action_name, payload, status, rationale, confidence,
                created_at, decided_at, expires_at, decision_reason, task_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(item.id)
        .bind(&item.user_id)
        .bind(&item.agent_kind)
        .bind(&item.action_name)
        .bind(&item.payload)
        .bind(item.status.as_str())
        .bind(&item.rationale)
        .bind(item.confidence)
        .bind(item.created_at)
        .bind(item.decided_at)
        .bind(item.expires_at)
        .bind(&item.decision_reason)
        .bind(item.task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, format!("approval {} already exists", item.id)))?;

        Ok(())
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM approval_items WHERE id = $1",
            APPROVAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(approval_from_row).transpose()
    }

    async fn list_approvals(
        &self,
        user_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM approval_items
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2::TEXT)
            ORDER BY created_at ASC
            "#,
            APPROVAL_COLUMNS
        ))
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(approval_from_row).collect()
    }

    async fn count_approvals(&self, user_id: &str, status: ApprovalStatus) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM approval_items WHERE user_id = $1 AND status = $2",
        )
        .bind(user_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("count") as u64)
    }

    #[instrument(skip(self, reason))]
    async fn resolve_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ApprovalUpdate> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE approval_items
            SET status = $2, decided_at = $3, decision_reason = $4
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            APPROVAL_COLUMNS
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(at)
        .bind(&reason)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(ApprovalUpdate::Applied(approval_from_row(&row)?));
        }

        match self.get_approval(id).await? {
            Some(current) => Ok(ApprovalUpdate::Conflict(current)),
            None => Ok(ApprovalUpdate::Missing),
        }
    }

    async fn attach_approval_task(&self, approval_id: Uuid, task_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE approval_items SET task_id = $2 WHERE id = $1")
            .bind(approval_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_expired_approvals(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM approval_items
            WHERE status = 'pending' AND expires_at < $1
            ORDER BY expires_at ASC
            "#,
            APPROVAL_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(approval_from_row).collect()
    }

    async fn list_undispatched_approvals(&self) -> Result<Vec<ApprovalItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM approval_items
            WHERE status = 'approved' AND task_id IS NULL
            ORDER BY decided_at ASC
            "#,
            APPROVAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(approval_from_row).collect()
    }

    // ==================== Activity ====================

    async fn append_activity(&self, activity: NewActivity) -> Result<ActivityEvent> {
        let row = sqlx::query(
            r#"
            INSERT INTO activity_events (event_id, user_id, task_id, event_type, data)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING seq, event_id, user_id, task_id, event_type, data, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&activity.user_id)
        .bind(activity.task_id)
        .bind(activity.kind.as_str())
        .bind(&activity.data)
        .fetch_one(&self.pool)
        .await?;

        Ok(activity_from_row(&row))
    }

    async fn activity_since(&self, user_id: &str, since: i64) -> Result<Vec<ActivityEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, event_id, user_id, task_id, event_type, data, created_at
            FROM activity_events
            WHERE user_id = $1 AND seq > $2
            ORDER BY seq ASC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(activity_from_row).collect())
    }

    // ==================== Dead letters ====================

    #[instrument(skip(self, record), fields(task_id = %record.task_id))]
    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, task_id, user_id, agent_kind, action, payload, attempt_count,
                final_error, error_history, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.task_id)
        .bind(&record.user_id)
        .bind(&record.agent_kind)
        .bind(&record.action)
        .bind(&record.payload)
        .bind(record.attempt_count as i32)
        .bind(&record.final_error)
        .bind(serde_json::to_value(&record.error_history)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_dead_letters(&self, agent_kind: Option<&str>) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, user_id, agent_kind, action, payload, attempt_count,
                   final_error, error_history, created_at
            FROM dead_letters
            WHERE ($1::TEXT IS NULL OR agent_kind = $1::TEXT)
            ORDER BY created_at ASC
            "#,
        )
        .bind(agent_kind)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    // ==================== Brake ====================

    async fn put_brake(&self, state: &BrakeState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO brake_states (user_id, paused, phase, paused_at, reason, awaiting, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO UPDATE SET
                paused = EXCLUDED.paused,
                phase = EXCLUDED.phase,
                paused_at = EXCLUDED.paused_at,
                reason = EXCLUDED.reason,
                awaiting = EXCLUDED.awaiting,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.user_id)
        .bind(state.paused)
        .bind(state.phase.as_str())
        .bind(state.paused_at)
        .bind(&state.reason)
        .bind(serde_json::to_value(&state.awaiting)?)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_brakes(&self) -> Result<Vec<BrakeState>> {
        let rows = sqlx::query(
            "SELECT user_id, paused, phase, paused_at, reason, awaiting, updated_at FROM brake_states",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(brake_from_row).collect()
    }

    // ==================== Profiles ====================

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT user_id, tier, deal_breakers, updated_at FROM user_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let rules: serde_json::Value = r.get("deal_breakers");
                Ok(Some(UserProfile {
                    user_id: r.get("user_id"),
                    tier: r.get("tier"),
                    deal_breakers: serde_json::from_value(rules)?,
                    updated_at: r.get("updated_at"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, tier, deal_breakers, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                deal_breakers = EXCLUDED.deal_breakers,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.tier)
        .bind(serde_json::to_value(&profile.deal_breakers)?)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Daily counters ====================

    async fn daily_actions(&self, user_id: &str, day: NaiveDate) -> Result<u32> {
        let row = sqlx::query(
            "SELECT count FROM daily_action_counts WHERE user_id = $1 AND day = $2",
        )
        .bind(user_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i32, _>("count") as u32).unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn try_consume_daily_action(
        &self,
        user_id: &str,
        day: NaiveDate,
        cap: u32,
    ) -> Result<bool> {
        if cap == 0 {
            return Ok(false);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO daily_action_counts (user_id, day, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (user_id, day) DO UPDATE
                SET count = daily_action_counts.count + 1
                WHERE daily_action_counts.count < $3
            RETURNING count
            "#,
        )
        .bind(user_id)
        .bind(day)
        .bind(cap as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}
