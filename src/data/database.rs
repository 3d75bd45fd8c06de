//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with embedded migrations.

use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

const ACTOR_COLUMNS: &str = "id, uri, username, domain, inbox_uri, shared_inbox_uri, followers_uri, \
     key_id, public_key_pem, private_key_pem, is_local, manually_approves_followers, \
     created_at, updated_at";

/// Candidates tried per claim before reporting the queue idle
const CLAIM_ATTEMPTS: usize = 8;

const JOB_COLUMNS: &str = "id, queue, payload, ordering_key, target_host, state, attempts, \
     next_run_at_ms, locked_at_ms, last_error, last_status, created_at_ms, updated_at_ms";

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

/// The host itself followed by every parent domain.
///
/// `a.b.example` yields `a.b.example`, `b.example`, `example`.
fn domain_suffixes(host: &str) -> Vec<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let mut suffixes = Vec::new();
    let mut rest = host.as_str();
    while !rest.is_empty() {
        suffixes.push(rest.to_string());
        match rest.split_once('.') {
            Some((_, parent)) => rest = parent,
            None => break,
        }
    }
    suffixes
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert a new actor
    pub async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, uri, username, domain, inbox_uri, shared_inbox_uri, followers_uri,
                key_id, public_key_pem, private_key_pem, is_local, manually_approves_followers,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.inbox_uri)
        .bind(&actor.shared_inbox_uri)
        .bind(&actor.followers_uri)
        .bind(&actor.key_id)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.is_local)
        .bind(actor.manually_approves_followers)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or refresh a remote actor keyed by URI.
    ///
    /// Never touches a local actor row. Returns the stored row.
    pub async fn upsert_remote_actor(&self, actor: &Actor) -> Result<Actor, AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, uri, username, domain, inbox_uri, shared_inbox_uri, followers_uri,
                key_id, public_key_pem, private_key_pem, is_local, manually_approves_followers,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                username = excluded.username,
                domain = excluded.domain,
                inbox_uri = excluded.inbox_uri,
                shared_inbox_uri = excluded.shared_inbox_uri,
                followers_uri = excluded.followers_uri,
                key_id = excluded.key_id,
                public_key_pem = excluded.public_key_pem,
                manually_approves_followers = excluded.manually_approves_followers,
                updated_at = excluded.updated_at
            WHERE actors.is_local = 0
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.inbox_uri)
        .bind(&actor.shared_inbox_uri)
        .bind(&actor.followers_uri)
        .bind(&actor.key_id)
        .bind(&actor.public_key_pem)
        .bind(actor.manually_approves_followers)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_actor_by_uri(&actor.uri)
            .await?
            .ok_or(AppError::Database(sqlx::Error::RowNotFound))
    }

    /// Get actor by internal ID
    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor =
            sqlx::query_as::<_, Actor>(&format!("SELECT {ACTOR_COLUMNS} FROM actors WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(actor)
    }

    /// Get actor by ActivityPub id
    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor =
            sqlx::query_as::<_, Actor>(&format!("SELECT {ACTOR_COLUMNS} FROM actors WHERE uri = ?"))
                .bind(uri)
                .fetch_optional(&self.pool)
                .await?;

        Ok(actor)
    }

    /// Get actor owning a signature key id
    pub async fn get_actor_by_key_id(&self, key_id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(&format!(
            "SELECT {ACTOR_COLUMNS} FROM actors WHERE key_id = ? ORDER BY is_local DESC LIMIT 1"
        ))
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Get local actor by username
    pub async fn get_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(&format!(
            "SELECT {ACTOR_COLUMNS} FROM actors WHERE is_local = 1 AND username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Replace a remote actor's public key after a refresh
    pub async fn update_remote_actor_key(
        &self,
        uri: &str,
        key_id: &str,
        public_key_pem: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE actors SET key_id = ?, public_key_pem = ?, updated_at = ? WHERE uri = ? AND is_local = 0",
        )
        .bind(key_id)
        .bind(public_key_pem)
        .bind(chrono::Utc::now())
        .bind(uri)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a remote actor; follows, statuses, likes and reblogs cascade
    pub async fn delete_remote_actor(&self, uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM actors WHERE uri = ? AND is_local = 0")
            .bind(uri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Insert follow relationship unless one exists for the same pair
    pub async fn insert_follow(&self, follow: &Follow) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO follows (
                id, source_actor_id, target_actor_id, state, activity_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&follow.id)
        .bind(&follow.source_actor_id)
        .bind(&follow.target_actor_id)
        .bind(&follow.state)
        .bind(&follow.activity_id)
        .bind(follow.created_at)
        .bind(follow.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get the relationship between two actors
    pub async fn get_follow(
        &self,
        source_actor_id: &str,
        target_actor_id: &str,
    ) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE source_actor_id = ? AND target_actor_id = ?",
        )
        .bind(source_actor_id)
        .bind(target_actor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Get the relationship created by a Follow activity
    pub async fn get_follow_by_activity_id(
        &self,
        activity_id: &str,
    ) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE activity_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Set relationship state (and the correlating activity id when given)
    pub async fn update_follow_state(
        &self,
        id: &str,
        state: FollowState,
        activity_id: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE follows SET state = ?, activity_id = COALESCE(?, activity_id), updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(activity_id)
        .bind(chrono::Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete follow relationship
    pub async fn delete_follow(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM follows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delivery inboxes of the approved remote followers of a local actor
    pub async fn get_follower_inboxes(&self, target_actor_id: &str) -> Result<Vec<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>(
            r#"
            SELECT COALESCE(a.shared_inbox_uri, a.inbox_uri)
            FROM follows f
            JOIN actors a ON a.id = f.source_actor_id
            WHERE f.target_actor_id = ? AND f.state = 'approved' AND a.is_local = 0
            ORDER BY f.created_at
            "#,
        )
        .bind(target_actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(inboxes)
    }

    /// Whether some local actor follows the owner of a followers collection
    pub async fn is_followers_collection_followed_locally(
        &self,
        followers_uri: &str,
    ) -> Result<bool, AppError> {
        let followed: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM actors t
                JOIN follows f ON f.target_actor_id = t.id
                JOIN actors s ON s.id = f.source_actor_id
                WHERE t.followers_uri = ? AND s.is_local = 1 AND f.state = 'approved'
            )
            "#,
        )
        .bind(followers_uri)
        .fetch_one(&self.pool)
        .await?;

        Ok(followed != 0)
    }

    // =========================================================================
    // Statuses
    // =========================================================================

    /// Insert status unless its URI is already stored
    pub async fn insert_status(&self, status: &Status) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO statuses (
                id, uri, actor_id, content, in_reply_to_uri, visibility, is_local, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.id)
        .bind(&status.uri)
        .bind(&status.actor_id)
        .bind(&status.content)
        .bind(&status.in_reply_to_uri)
        .bind(&status.visibility)
        .bind(status.is_local)
        .bind(status.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get status by URI
    pub async fn get_status_by_uri(&self, uri: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    /// Delete a status only when owned by `actor_id`
    pub async fn delete_status_owned_by(&self, uri: &str, actor_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM statuses WHERE uri = ? AND actor_id = ?")
            .bind(uri)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Likes / Reblogs
    // =========================================================================

    /// Record a like or reblog; duplicates by activity or by (actor, status) are ignored
    pub async fn insert_interaction(
        &self,
        kind: InteractionKind,
        interaction: &Interaction,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (id, activity_id, actor_id, status_uri, created_at) VALUES (?, ?, ?, ?, ?)",
            kind.table()
        ))
        .bind(&interaction.id)
        .bind(&interaction.activity_id)
        .bind(&interaction.actor_id)
        .bind(&interaction.status_uri)
        .bind(interaction.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count interactions on a status
    pub async fn count_interactions(
        &self,
        kind: InteractionKind,
        status_uri: &str,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE status_uri = ?",
            kind.table()
        ))
        .bind(status_uri)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Remove an interaction identified by its activity id, if owned by `actor_id`
    pub async fn delete_interaction_by_activity(
        &self,
        kind: InteractionKind,
        activity_id: &str,
        actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE activity_id = ? AND actor_id = ?",
            kind.table()
        ))
        .bind(activity_id)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove an interaction identified by (actor, status)
    pub async fn delete_interaction_by_status(
        &self,
        kind: InteractionKind,
        actor_id: &str,
        status_uri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE actor_id = ? AND status_uri = ?",
            kind.table()
        ))
        .bind(actor_id)
        .bind(status_uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Inbound idempotency
    // =========================================================================

    /// Look up a finished processing record
    pub async fn get_processed_activity(
        &self,
        digest: &str,
        activity_id: &str,
    ) -> Result<Option<ProcessedActivity>, AppError> {
        let record = sqlx::query_as::<_, ProcessedActivity>(
            "SELECT * FROM processed_activities WHERE digest = ? AND activity_id = ?",
        )
        .bind(digest)
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Store the processing record and drop the claim in one transaction.
    /// The first record for a key wins.
    ///
    /// Returns false when a record for the key already existed.
    pub async fn finish_activity(
        &self,
        digest: &str,
        activity_id: &str,
        outcome: ProcessedOutcome,
        detail: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_activities (digest, activity_id, outcome, detail, processed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(digest)
        .bind(activity_id)
        .bind(outcome.as_str())
        .bind(detail)
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM activity_claims WHERE digest = ? AND activity_id = ?")
            .bind(digest)
            .bind(activity_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(inserted.rows_affected() > 0)
    }

    /// Atomically claim an activity for processing.
    ///
    /// Succeeds when the activity has no processing record and either no
    /// claim exists or the existing claim was taken at or before
    /// `stale_before_ms`.
    pub async fn try_claim_activity(
        &self,
        digest: &str,
        activity_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO activity_claims (digest, activity_id, claimed_at_ms)
            SELECT ?1, ?2, ?3
            WHERE NOT EXISTS (
                SELECT 1 FROM processed_activities p
                WHERE p.digest = ?1 AND p.activity_id = ?2
            )
            ON CONFLICT(digest, activity_id) DO UPDATE SET claimed_at_ms = excluded.claimed_at_ms
            WHERE activity_claims.claimed_at_ms <= ?4
            "#,
        )
        .bind(digest)
        .bind(activity_id)
        .bind(now_ms)
        .bind(stale_before_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release a processing claim
    pub async fn release_activity_claim(
        &self,
        digest: &str,
        activity_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("DELETE FROM activity_claims WHERE digest = ? AND activity_id = ?")
            .bind(digest)
            .bind(activity_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Insert a job row; `job.id` is ignored. Returns the assigned id.
    pub async fn insert_job(&self, job: &JobRecord) -> Result<i64, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                queue, payload, ordering_key, target_host, state, attempts, next_run_at_ms,
                locked_at_ms, last_error, last_status, created_at_ms, updated_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(&job.ordering_key)
        .bind(&job.target_host)
        .bind(&job.state)
        .bind(job.attempts)
        .bind(job.next_run_at_ms)
        .bind(job.locked_at_ms)
        .bind(&job.last_error)
        .bind(job.last_status)
        .bind(job.created_at_ms)
        .bind(job.updated_at_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Claim the next runnable job of a queue and mark it running.
    ///
    /// Runnable: pending and due, or running with a lock taken at or before
    /// `stale_before_ms`. A job is skipped while an earlier job with the
    /// same ordering key is still pending or running. The claim increments
    /// `attempts`.
    pub async fn claim_next_job(
        &self,
        queue: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<Option<JobRecord>, AppError> {
        // A candidate can be taken by another worker between the select and
        // the conditional update; pick again when that happens.
        for _ in 0..CLAIM_ATTEMPTS {
            let candidate: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT j.id FROM jobs j
                WHERE j.queue = ?2
                  AND (
                    (j.state = 'pending' AND j.next_run_at_ms <= ?1)
                    OR (j.state = 'running' AND j.locked_at_ms <= ?3)
                  )
                  AND (
                    j.ordering_key IS NULL
                    OR NOT EXISTS (
                        SELECT 1 FROM jobs e
                        WHERE e.ordering_key = j.ordering_key
                          AND e.id < j.id
                          AND e.state IN ('pending', 'running')
                    )
                  )
                ORDER BY j.next_run_at_ms, j.id
                LIMIT 1
                "#,
            )
            .bind(now_ms)
            .bind(queue)
            .bind(stale_before_ms)
            .fetch_optional(&self.pool)
            .await?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'running', locked_at_ms = ?1, attempts = attempts + 1, updated_at_ms = ?1
                WHERE id = ?2
                  AND (
                    (state = 'pending' AND next_run_at_ms <= ?1)
                    OR (state = 'running' AND locked_at_ms <= ?3)
                  )
                "#,
            )
            .bind(now_ms)
            .bind(id)
            .bind(stale_before_ms)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                return self.get_job(id).await;
            }
        }

        Ok(None)
    }

    /// Mark a running job finished
    pub async fn complete_job(
        &self,
        id: i64,
        last_status: Option<i64>,
        now_ms: i64,
    ) -> Result<(), AppError> {
        self.finish_job(id, "done", None, last_status, now_ms).await
    }

    /// Mark a job permanently failed
    pub async fn fail_job(
        &self,
        id: i64,
        error: &str,
        last_status: Option<i64>,
        now_ms: i64,
    ) -> Result<(), AppError> {
        self.finish_job(id, "failed", Some(error), last_status, now_ms)
            .await
    }

    /// Mark a job dropped without delivery
    pub async fn drop_job(&self, id: i64, reason: &str, now_ms: i64) -> Result<(), AppError> {
        self.finish_job(id, "dropped", Some(reason), None, now_ms)
            .await
    }

    async fn finish_job(
        &self,
        id: i64,
        state: &str,
        error: Option<&str>,
        last_status: Option<i64>,
        now_ms: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, locked_at_ms = NULL,
                last_error = COALESCE(?, last_error),
                last_status = COALESCE(?, last_status),
                updated_at_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(state)
        .bind(error)
        .bind(last_status)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Put a running job back to pending with a later run time
    pub async fn reschedule_job(
        &self,
        id: i64,
        next_run_at_ms: i64,
        error: &str,
        last_status: Option<i64>,
        now_ms: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', locked_at_ms = NULL, next_run_at_ms = ?,
                last_error = ?, last_status = ?, updated_at_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(next_run_at_ms)
        .bind(error)
        .bind(last_status)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get job by id
    pub async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, AppError> {
        let job = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// List jobs, newest first
    pub async fn list_jobs(
        &self,
        queue: Option<&str>,
        state: Option<&str>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, AppError> {
        let mut query_builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));
        if let Some(queue) = queue {
            query_builder.push(" AND queue = ").push_bind(queue);
        }
        if let Some(state) = state {
            query_builder.push(" AND state = ").push_bind(state);
        }
        query_builder
            .push(" ORDER BY id DESC LIMIT ")
            .push_bind(limit);

        let jobs = query_builder
            .build_query_as::<JobRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok(jobs)
    }

    /// Count jobs of a queue in a state
    pub async fn count_jobs(&self, queue: &str, state: &str) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = ?")
                .bind(queue)
                .bind(state)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Number of jobs per `(queue, state)`; absent pairs have none
    pub async fn job_counts(&self) -> Result<Vec<(String, String, i64)>, AppError> {
        let counts = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT queue, state, COUNT(*) FROM jobs GROUP BY queue, state",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    /// Return a failed or dropped job to the queue with a fresh attempt budget
    pub async fn requeue_job(&self, id: i64, now_ms: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, next_run_at_ms = ?, locked_at_ms = NULL, updated_at_ms = ?
            WHERE id = ? AND state IN ('failed', 'dropped')
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop pending jobs addressed to a domain or any of its subdomains
    pub async fn drop_pending_jobs_for_domain(
        &self,
        domain: &str,
        now_ms: i64,
    ) -> Result<u64, AppError> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dropped', last_error = 'domain blocked', updated_at_ms = ?
            WHERE state = 'pending'
              AND target_host IS NOT NULL
              AND (target_host = ? OR target_host LIKE '%.' || ?)
            "#,
        )
        .bind(now_ms)
        .bind(&domain)
        .bind(&domain)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Domain blocks
    // =========================================================================

    /// Check if a host or any parent domain is blocked
    pub async fn is_domain_blocked(&self, host: &str) -> Result<bool, AppError> {
        let candidates = domain_suffixes(host);
        if candidates.is_empty() {
            return Ok(false);
        }

        let mut query_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM domain_blocks WHERE domain IN (");
        {
            let mut separated = query_builder.separated(", ");
            for candidate in &candidates {
                separated.push_bind(candidate);
            }
        }
        query_builder.push(")");

        let count = query_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    /// Block a domain. Returns false when already blocked.
    pub async fn block_domain(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO domain_blocks (id, domain, created_at) VALUES (?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(domain.trim().trim_end_matches('.').to_ascii_lowercase())
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Unblock a domain
    pub async fn unblock_domain(&self, domain: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM domain_blocks WHERE domain = ?")
            .bind(domain.trim().trim_end_matches('.').to_ascii_lowercase())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get all domain blocks
    pub async fn get_all_domain_blocks(&self) -> Result<Vec<DomainBlock>, AppError> {
        let blocks = sqlx::query_as::<_, DomainBlock>(
            "SELECT id, domain, created_at FROM domain_blocks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(blocks)
    }
}
