//! Indexing run history and aggregate statistics.
//!
//! Records one entry per indexing run in a bounded per-source list, keeps
//! rolling aggregate stats, and maintains per-day counters with a 90-day
//! retention window. The indexing engine is the sole writer.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::{now_iso, DailyStats, IndexingRun, RunState, Source, SourceStats};

/// Maximum retained runs per source.
const MAX_RUNS_PER_SOURCE: usize = 100;
/// Daily counters expire after 90 days.
const DAILY_TTL_DAYS: i64 = 90;

/// Terminal details reported when a run finishes.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run_id: String,
    pub status: RunState,
    pub documents_processed: i64,
    pub documents_new: i64,
    pub documents_updated: i64,
    pub documents_skipped: i64,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Combined view returned by [`AnalyticsStore::get_system_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub sources: BTreeMap<String, SourceStats>,
    pub recent_runs: Vec<IndexingRun>,
}

#[derive(Clone)]
pub struct AnalyticsStore {
    pool: SqlitePool,
}

impl AnalyticsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a `running` entry and trim the list to the newest
    /// [`MAX_RUNS_PER_SOURCE`]. Returns the new run id.
    pub async fn record_run_start(&self, source: Source) -> Result<String> {
        let run = IndexingRun {
            id: Uuid::new_v4().to_string(),
            source,
            started_at: now_iso(),
            completed_at: None,
            status: RunState::Running,
            documents_processed: 0,
            documents_new: 0,
            documents_updated: 0,
            documents_skipped: 0,
            error: None,
            duration_ms: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO indexing_runs (id, source, started_at, status, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(source.as_str())
        .bind(&run.started_at)
        .bind("running")
        .bind(serde_json::to_string(&run)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM indexing_runs
            WHERE source = ? AND id NOT IN (
                SELECT id FROM indexing_runs WHERE source = ?
                ORDER BY started_at DESC LIMIT ?
            )
            "#,
        )
        .bind(source.as_str())
        .bind(source.as_str())
        .bind(MAX_RUNS_PER_SOURCE as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(run.id)
    }

    /// Record a run's terminal state.
    ///
    /// A still-`running` entry with the same id is replaced in place;
    /// otherwise a new terminal entry is pushed (covers trimmed or
    /// externally-started runs). Also updates aggregate and daily stats.
    pub async fn record_run_complete(
        &self,
        source: Source,
        details: RunCompletion,
    ) -> Result<()> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT data FROM indexing_runs WHERE id = ? AND source = ? AND status = 'running'",
        )
        .bind(&details.run_id)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let completed_at = now_iso();
        let run = match existing {
            Some(json) => {
                let mut run: IndexingRun = serde_json::from_str(&json)?;
                run.completed_at = Some(completed_at.clone());
                run.status = details.status;
                run.documents_processed = details.documents_processed;
                run.documents_new = details.documents_new;
                run.documents_updated = details.documents_updated;
                run.documents_skipped = details.documents_skipped;
                run.error = details.error.clone();
                run.duration_ms = details.duration_ms;

                sqlx::query("UPDATE indexing_runs SET status = ?, data = ? WHERE id = ?")
                    .bind(status_str(details.status))
                    .bind(serde_json::to_string(&run)?)
                    .bind(&run.id)
                    .execute(&self.pool)
                    .await?;
                run
            }
            None => {
                let run = IndexingRun {
                    id: details.run_id.clone(),
                    source,
                    started_at: completed_at.clone(),
                    completed_at: Some(completed_at.clone()),
                    status: details.status,
                    documents_processed: details.documents_processed,
                    documents_new: details.documents_new,
                    documents_updated: details.documents_updated,
                    documents_skipped: details.documents_skipped,
                    error: details.error.clone(),
                    duration_ms: details.duration_ms,
                };
                sqlx::query(
                    r#"
                    INSERT INTO indexing_runs (id, source, started_at, status, data)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data
                    "#,
                )
                .bind(&run.id)
                .bind(source.as_str())
                .bind(&run.started_at)
                .bind(status_str(details.status))
                .bind(serde_json::to_string(&run)?)
                .execute(&self.pool)
                .await?;
                run
            }
        };

        self.update_source_stats(source, &run).await?;
        self.bump_daily(source, &run).await?;
        Ok(())
    }

    /// Recent runs, newest first, deduplicated by `(source, started_at)`
    /// preferring terminal entries over `running` ones.
    pub async fn get_recent_runs(&self, source: Source, limit: usize) -> Result<Vec<IndexingRun>> {
        let rows = sqlx::query(
            "SELECT data FROM indexing_runs WHERE source = ? ORDER BY started_at DESC",
        )
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut seen: BTreeMap<String, IndexingRun> = BTreeMap::new();
        for row in rows {
            let run: IndexingRun = serde_json::from_str(row.get("data"))?;
            let key = format!("{}|{}", run.source, run.started_at);
            let keep = match seen.get(&key) {
                // Terminal entries win over still-running duplicates.
                Some(existing) => {
                    existing.status == RunState::Running && run.status != RunState::Running
                }
                None => true,
            };
            if keep {
                seen.insert(key, run);
            }
        }

        let mut runs: Vec<IndexingRun> = seen.into_values().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    pub async fn get_source_stats(&self, source: Source) -> Result<SourceStats> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT data FROM source_stats WHERE source = ?")
                .bind(source.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(SourceStats::default()),
        }
    }

    /// `days` entries, oldest first, zero-filled for missing days.
    pub async fn get_daily_stats(&self, source: Source, days: usize) -> Result<Vec<DailyStats>> {
        let rows = sqlx::query(
            "SELECT date, runs, documents, errors FROM daily_stats WHERE source = ? AND expires_at > ?",
        )
        .bind(source.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut by_date: BTreeMap<String, DailyStats> = BTreeMap::new();
        for row in rows {
            let date: String = row.get("date");
            by_date.insert(
                date.clone(),
                DailyStats {
                    date,
                    runs: row.get("runs"),
                    documents: row.get("documents"),
                    errors: row.get("errors"),
                },
            );
        }

        let today = chrono::Utc::now().date_naive();
        let mut out = Vec::with_capacity(days);
        for offset in (0..days as i64).rev() {
            let date = (today - chrono::Duration::days(offset))
                .format("%Y-%m-%d")
                .to_string();
            out.push(by_date.remove(&date).unwrap_or(DailyStats {
                date,
                runs: 0,
                documents: 0,
                errors: 0,
            }));
        }
        Ok(out)
    }

    /// Aggregates per-source stats and the top-N combined recent runs.
    pub async fn get_system_stats(&self, sources: &[Source]) -> Result<SystemStats> {
        let mut per_source = BTreeMap::new();
        let mut all_runs = Vec::new();
        for &source in sources {
            per_source.insert(source.as_str().to_string(), self.get_source_stats(source).await?);
            all_runs.extend(self.get_recent_runs(source, 10).await?);
        }
        all_runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all_runs.truncate(20);
        Ok(SystemStats {
            sources: per_source,
            recent_runs: all_runs,
        })
    }

    async fn update_source_stats(&self, source: Source, run: &IndexingRun) -> Result<()> {
        let mut stats = self.get_source_stats(source).await?;
        stats.total_runs += 1;
        stats.last_run_at = Some(run.started_at.clone());
        match run.status {
            RunState::Completed => {
                stats.successful_runs += 1;
                stats.last_success_at = run.completed_at.clone();
            }
            RunState::Error => stats.failed_runs += 1,
            RunState::Running => {}
        }
        if let Some(duration) = run.duration_ms {
            // Running average over all recorded completions.
            stats.avg_duration_ms +=
                (duration as f64 - stats.avg_duration_ms) / stats.total_runs as f64;
        }
        stats.total_documents_processed += run.documents_processed;

        sqlx::query(
            r#"
            INSERT INTO source_stats (source, data) VALUES (?, ?)
            ON CONFLICT(source) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(source.as_str())
        .bind(serde_json::to_string(&stats)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_daily(&self, source: Source, run: &IndexingRun) -> Result<()> {
        let now = chrono::Utc::now();
        let date = now.format("%Y-%m-%d").to_string();
        let expires = now.timestamp_millis() + DAILY_TTL_DAYS * 24 * 3600 * 1000;
        let errors = (run.status == RunState::Error) as i64;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM daily_stats WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO daily_stats (source, date, runs, documents, errors, expires_at)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT(source, date) DO UPDATE SET
                runs = runs + 1,
                documents = documents + excluded.documents,
                errors = errors + excluded.errors
            "#,
        )
        .bind(source.as_str())
        .bind(&date)
        .bind(run.documents_processed)
        .bind(errors)
        .bind(expires)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn status_str(status: RunState) -> &'static str {
    match status {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, AnalyticsStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::migrate::open(&tmp.path().join("kc.sqlite")).await.unwrap();
        (tmp, AnalyticsStore::new(pool))
    }

    fn completion(run_id: &str, status: RunState, docs: i64) -> RunCompletion {
        RunCompletion {
            run_id: run_id.to_string(),
            status,
            documents_processed: docs,
            documents_new: docs,
            documents_updated: 0,
            documents_skipped: 0,
            error: None,
            duration_ms: Some(1000),
        }
    }

    #[tokio::test]
    async fn complete_replaces_running_in_place() {
        let (_tmp, store) = test_store().await;
        let run_id = store.record_run_start(Source::Jira).await.unwrap();
        store
            .record_run_complete(Source::Jira, completion(&run_id, RunState::Completed, 5))
            .await
            .unwrap();

        let runs = store.get_recent_runs(Source::Jira, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunState::Completed);
        assert_eq!(runs[0].documents_processed, 5);
    }

    #[tokio::test]
    async fn unknown_run_id_pushes_terminal_entry() {
        let (_tmp, store) = test_store().await;
        store
            .record_run_complete(Source::Slack, completion("ghost", RunState::Error, 0))
            .await
            .unwrap();
        let runs = store.get_recent_runs(Source::Slack, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunState::Error);
    }

    #[tokio::test]
    async fn run_list_is_bounded() {
        let (_tmp, store) = test_store().await;
        for _ in 0..105 {
            store.record_run_start(Source::Gmail).await.unwrap();
        }
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM indexing_runs WHERE source = 'gmail'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert!(count <= MAX_RUNS_PER_SOURCE as i64);
    }

    #[tokio::test]
    async fn stats_accumulate() {
        let (_tmp, store) = test_store().await;
        let a = store.record_run_start(Source::Drive).await.unwrap();
        store
            .record_run_complete(Source::Drive, completion(&a, RunState::Completed, 10))
            .await
            .unwrap();
        let b = store.record_run_start(Source::Drive).await.unwrap();
        store
            .record_run_complete(Source::Drive, completion(&b, RunState::Error, 2))
            .await
            .unwrap();

        let stats = store.get_source_stats(Source::Drive).await.unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.successful_runs, 1);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.total_documents_processed, 12);
        assert!(stats.avg_duration_ms > 0.0);
    }

    #[tokio::test]
    async fn daily_stats_zero_fill_oldest_first() {
        let (_tmp, store) = test_store().await;
        let id = store.record_run_start(Source::Github).await.unwrap();
        store
            .record_run_complete(Source::Github, completion(&id, RunState::Completed, 3))
            .await
            .unwrap();

        let daily = store.get_daily_stats(Source::Github, 7).await.unwrap();
        assert_eq!(daily.len(), 7);
        // today is the last entry
        assert_eq!(daily[6].runs, 1);
        assert_eq!(daily[6].documents, 3);
        for day in &daily[..6] {
            assert_eq!(day.runs, 0);
        }
        // ascending dates
        for pair in daily.windows(2) {
            assert!(pair[0].date < pair[1].date);
        }
    }

    #[tokio::test]
    async fn system_stats_combined() {
        let (_tmp, store) = test_store().await;
        let id = store.record_run_start(Source::Jira).await.unwrap();
        store
            .record_run_complete(Source::Jira, completion(&id, RunState::Completed, 1))
            .await
            .unwrap();

        let stats = store
            .get_system_stats(&[Source::Jira, Source::Slack])
            .await
            .unwrap();
        assert_eq!(stats.sources.len(), 2);
        assert_eq!(stats.recent_runs.len(), 1);
    }
}
