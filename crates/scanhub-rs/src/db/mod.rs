use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, Utc};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    types::Json,
    Connection, SqliteConnection, SqlitePool,
};
use uuid::Uuid;

use crate::models::{Finding, Job, JobStatus, JobWithTarget, NewFinding, Severity, Target};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const JOB_COLUMNS: &str =
    "j.id, j.user_id, j.target_id, j.status, j.tools_used, j.created_at, j.started_at, j.finished_at";

const SEVERITY_RANK: &str = "CASE severity WHEN 'critical' THEN 4 WHEN 'high' THEN 3 \
     WHEN 'medium' THEN 2 WHEN 'low' THEN 1 ELSE 0 END";

pub async fn create_pool(url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    Ok(SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

pub async fn insert_target(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    name: &str,
    url: &str,
) -> sqlx::Result<Target> {
    let target = Target {
        id: Uuid::new_v4(),
        user_id,
        name: name.to_string(),
        url: url.to_string(),
        created_at: Utc::now(),
    };
    sqlx::query("INSERT INTO targets(id, user_id, name, url, created_at) VALUES(?, ?, ?, ?, ?)")
        .bind(target.id)
        .bind(target.user_id)
        .bind(&target.name)
        .bind(&target.url)
        .bind(target.created_at)
        .execute(conn)
        .await?;
    Ok(target)
}

pub async fn fetch_target(conn: &mut SqliteConnection, id: Uuid) -> sqlx::Result<Option<Target>> {
    sqlx::query_as::<_, Target>(
        "SELECT id, user_id, name, url, created_at FROM targets WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub async fn list_targets(conn: &mut SqliteConnection, user_id: Uuid) -> sqlx::Result<Vec<Target>> {
    sqlx::query_as::<_, Target>(
        "SELECT id, user_id, name, url, created_at FROM targets WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(conn)
    .await
}

/// Inserts a new QUEUED job.
pub async fn insert_job(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    target_id: Uuid,
    tools: &[String],
) -> sqlx::Result<Job> {
    let job = Job {
        id: Uuid::new_v4(),
        user_id,
        target_id,
        status: JobStatus::Queued,
        tools_used: tools.to_vec(),
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    };
    sqlx::query(
        "INSERT INTO jobs(id, user_id, target_id, status, tools_used, created_at) VALUES(?, ?, ?, 'queued', ?, ?)",
    )
    .bind(job.id)
    .bind(job.user_id)
    .bind(job.target_id)
    .bind(Json(&job.tools_used))
    .bind(job.created_at)
    .execute(conn)
    .await?;
    Ok(job)
}

pub async fn fetch_job(conn: &mut SqliteConnection, id: Uuid) -> sqlx::Result<Option<Job>> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn fetch_job_with_target(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> sqlx::Result<Option<JobWithTarget>> {
    sqlx::query_as::<_, JobWithTarget>(&format!(
        "SELECT {JOB_COLUMNS}, t.url AS target_url FROM jobs j JOIN targets t ON t.id = j.target_id WHERE j.id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub async fn list_jobs(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    status: Option<JobStatus>,
) -> sqlx::Result<Vec<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs j WHERE j.user_id = ? AND (? IS NULL OR j.status = ?) ORDER BY j.created_at DESC"
    );
    sqlx::query_as::<_, Job>(&sql)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_all(conn)
        .await
}

pub async fn queued_job_ids(conn: &mut SqliteConnection) -> sqlx::Result<Vec<Uuid>> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at")
        .fetch_all(conn)
        .await
}

/// QUEUED → RUNNING. Returns `false` when the job was not QUEUED.
pub async fn mark_running(
    conn: &mut SqliteConnection,
    id: Uuid,
    at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
    )
    .bind(at)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// RUNNING → DONE/FAILED. Returns `false` when the job was not RUNNING.
pub async fn mark_finished(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: JobStatus,
    at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    debug_assert!(status.is_terminal());
    let res = sqlx::query(
        "UPDATE jobs SET status = ?, finished_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(status)
    .bind(at)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Stores all findings of one tool atomically.
pub async fn insert_findings(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    tool: &str,
    findings: &[NewFinding],
) -> sqlx::Result<usize> {
    let mut tx = conn.begin().await?;
    for finding in findings {
        sqlx::query(
            "INSERT INTO findings(id, job_id, severity, title, description, evidence, recommendation, tool, created_at) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(finding.severity)
        .bind(&finding.title)
        .bind(&finding.description)
        .bind(&finding.evidence)
        .bind(&finding.recommendation)
        .bind(tool)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(findings.len())
}

/// Findings of a job, most severe first, newest first within a severity.
pub async fn list_findings(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    severity: Option<Severity>,
) -> sqlx::Result<Vec<Finding>> {
    let sql = format!(
        "SELECT id, job_id, severity, title, description, evidence, recommendation, tool, created_at \
         FROM findings WHERE job_id = ? AND (? IS NULL OR severity = ?) \
         ORDER BY {SEVERITY_RANK} DESC, created_at DESC"
    );
    sqlx::query_as::<_, Finding>(&sql)
        .bind(job_id)
        .bind(severity)
        .bind(severity)
        .fetch_all(conn)
        .await
}

/// Deletes a target owned by `user_id`; its jobs and their findings go with it.
pub async fn delete_target(
    conn: &mut SqliteConnection,
    id: Uuid,
    user_id: Uuid,
) -> sqlx::Result<bool> {
    let res = sqlx::query("DELETE FROM targets WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_jobs: i64,
    pub total_findings: i64,
    pub findings_by_severity: BTreeMap<String, i64>,
    pub findings_by_tool: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SeverityCount {
    pub severity: Severity,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, sqlx::FromRow)]
pub struct ToolCount {
    pub tool: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TimelinePoint {
    /// Calendar day, `YYYY-MM-DD` (UTC).
    pub date: String,
    pub jobs: i64,
    pub findings: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, sqlx::FromRow)]
pub struct TargetCount {
    pub target_id: Uuid,
    pub target_url: String,
    pub count: i64,
}

pub async fn metrics_summary(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> sqlx::Result<MetricsSummary> {
    let total_jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

    let findings_by_severity: BTreeMap<String, i64> = findings_by_severity(&mut *conn, user_id)
        .await?
        .into_iter()
        .map(|c| (c.severity.as_str().to_string(), c.count))
        .collect();
    let findings_by_tool = findings_by_tool(&mut *conn, user_id)
        .await?
        .into_iter()
        .map(|c| (c.tool, c.count))
        .collect();

    Ok(MetricsSummary {
        total_jobs,
        total_findings: findings_by_severity.values().sum(),
        findings_by_severity,
        findings_by_tool,
    })
}

/// Finding counts for every severity level, zero included, least severe first.
pub async fn findings_by_severity(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> sqlx::Result<Vec<SeverityCount>> {
    let rows: Vec<(Severity, i64)> = sqlx::query_as(
        "SELECT f.severity, COUNT(*) FROM findings f JOIN jobs j ON j.id = f.job_id \
         WHERE j.user_id = ? GROUP BY f.severity",
    )
    .bind(user_id)
    .fetch_all(conn)
    .await?;

    Ok(Severity::ALL
        .iter()
        .map(|&severity| SeverityCount {
            severity,
            count: rows
                .iter()
                .find(|(s, _)| *s == severity)
                .map(|(_, n)| *n)
                .unwrap_or(0),
        })
        .collect())
}

pub async fn findings_by_tool(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> sqlx::Result<Vec<ToolCount>> {
    sqlx::query_as::<_, ToolCount>(
        "SELECT f.tool AS tool, COUNT(*) AS count FROM findings f JOIN jobs j ON j.id = f.job_id \
         WHERE j.user_id = ? GROUP BY f.tool ORDER BY count DESC, f.tool",
    )
    .bind(user_id)
    .fetch_all(conn)
    .await
}

/// Jobs created and findings recorded per day since `since`, oldest day first.
pub async fn metrics_timeline(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    since: DateTime<Utc>,
) -> sqlx::Result<Vec<TimelinePoint>> {
    let jobs: Vec<(String, i64)> = sqlx::query_as(
        "SELECT date(created_at) AS day, COUNT(*) FROM jobs \
         WHERE user_id = ? AND julianday(created_at) >= julianday(?) GROUP BY day",
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(&mut *conn)
    .await?;

    let findings: Vec<(String, i64)> = sqlx::query_as(
        "SELECT date(f.created_at) AS day, COUNT(*) FROM findings f JOIN jobs j ON j.id = f.job_id \
         WHERE j.user_id = ? AND julianday(f.created_at) >= julianday(?) GROUP BY day",
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(&mut *conn)
    .await?;

    let mut days: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for (day, n) in jobs {
        days.entry(day).or_default().0 = n;
    }
    for (day, n) in findings {
        days.entry(day).or_default().1 = n;
    }
    Ok(days
        .into_iter()
        .map(|(date, (jobs, findings))| TimelinePoint {
            date,
            jobs,
            findings,
        })
        .collect())
}

/// Targets with the most findings across their jobs.
pub async fn top_targets(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    limit: i64,
) -> sqlx::Result<Vec<TargetCount>> {
    sqlx::query_as::<_, TargetCount>(
        "SELECT t.id AS target_id, t.url AS target_url, COUNT(f.id) AS count \
         FROM targets t JOIN jobs j ON j.target_id = t.id JOIN findings f ON f.job_id = j.id \
         WHERE j.user_id = ? GROUP BY t.id, t.url ORDER BY count DESC, t.url LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(conn)
    .await
}


#[cfg(test)]
mod tests {
    use super::{testing::test_db, *};

    #[tokio::test]
    async fn transitions_are_guarded() {
        let db = test_db().await;
        let mut conn = db.pool.acquire().await.expect("conn");
        let user = Uuid::new_v4();
        let target = insert_target(&mut conn, user, "app", "https://app.example.com")
            .await
            .expect("target");
        let job = insert_job(&mut conn, user, target.id, &["Nuclei".to_string()])
            .await
            .expect("job");

        assert!(!mark_finished(&mut conn, job.id, JobStatus::Done, Utc::now()).await.expect("update"));
        assert!(mark_running(&mut conn, job.id, Utc::now()).await.expect("update"));
        assert!(!mark_running(&mut conn, job.id, Utc::now()).await.expect("update"));
        assert!(mark_finished(&mut conn, job.id, JobStatus::Done, Utc::now()).await.expect("update"));
        assert!(!mark_finished(&mut conn, job.id, JobStatus::Failed, Utc::now()).await.expect("update"));

        let stored = fetch_job(&mut conn, job.id).await.expect("fetch").expect("exists");
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.tools_used, vec!["Nuclei".to_string()]);
        assert!(stored.started_at.is_some() && stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn findings_filter_and_order_by_severity() {
        let db = test_db().await;
        let mut conn = db.pool.acquire().await.expect("conn");
        let user = Uuid::new_v4();
        let target = insert_target(&mut conn, user, "app", "https://app.example.com")
            .await
            .expect("target");
        let job = insert_job(&mut conn, user, target.id, &["Nuclei".to_string()])
            .await
            .expect("job");

        let drafts = [
            NewFinding::new(Severity::Low, "low"),
            NewFinding::new(Severity::Critical, "critical"),
            NewFinding::info("info"),
            NewFinding::new(Severity::High, "high"),
        ];
        insert_findings(&mut conn, job.id, "Nuclei", &drafts).await.expect("insert");

        let all = list_findings(&mut conn, job.id, None).await.expect("list");
        let titles: Vec<_> = all.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, ["critical", "high", "low", "info"]);
        assert!(all.iter().all(|f| f.tool == "Nuclei" && f.job_id == job.id));

        let high = list_findings(&mut conn, job.id, Some(Severity::High)).await.expect("list");
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].severity, Severity::High);

        let metrics = metrics_summary(&mut conn, user).await.expect("metrics");
        assert_eq!(metrics.total_jobs, 1);
        assert_eq!(metrics.total_findings, 4);
        assert_eq!(metrics.findings_by_severity.len(), 5);
        assert_eq!(metrics.findings_by_severity["medium"], 0);
        assert_eq!(metrics.findings_by_tool["Nuclei"], 4);
    }

    #[tokio::test]
    async fn deleting_a_target_cascades_to_jobs_and_findings() {
        let db = test_db().await;
        let mut conn = db.pool.acquire().await.expect("conn");
        let user = Uuid::new_v4();
        let target = insert_target(&mut conn, user, "app", "https://app.example.com")
            .await
            .expect("target");
        let job = insert_job(&mut conn, user, target.id, &["ZAP".to_string()])
            .await
            .expect("job");
        insert_findings(&mut conn, job.id, "ZAP", &[NewFinding::info("summary")])
            .await
            .expect("insert");

        assert!(!delete_target(&mut conn, target.id, Uuid::new_v4()).await.expect("delete"));
        assert!(fetch_target(&mut conn, target.id).await.expect("fetch").is_some());

        assert!(delete_target(&mut conn, target.id, user).await.expect("delete"));
        assert!(fetch_target(&mut conn, target.id).await.expect("fetch").is_none());
        assert!(fetch_job(&mut conn, job.id).await.expect("fetch").is_none());
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM findings")
            .fetch_one(&mut *conn)
            .await
            .expect("count");
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn breakdowns_timeline_and_top_targets() {
        let db = test_db().await;
        let mut conn = db.pool.acquire().await.expect("conn");
        let user = Uuid::new_v4();
        let busy = insert_target(&mut conn, user, "busy", "https://busy.example.com")
            .await
            .expect("target");
        let quiet = insert_target(&mut conn, user, "quiet", "https://quiet.example.com")
            .await
            .expect("target");
        let first = insert_job(&mut conn, user, busy.id, &["Nuclei".to_string()])
            .await
            .expect("job");
        let second = insert_job(&mut conn, user, quiet.id, &["ZAP".to_string()])
            .await
            .expect("job");
        insert_findings(
            &mut conn,
            first.id,
            "Nuclei",
            &[NewFinding::new(Severity::High, "a"), NewFinding::new(Severity::High, "b")],
        )
        .await
        .expect("insert");
        insert_findings(&mut conn, second.id, "ZAP", &[NewFinding::info("c")])
            .await
            .expect("insert");

        let other = Uuid::new_v4();
        let foreign = insert_target(&mut conn, other, "x", "https://x.example.com")
            .await
            .expect("target");
        let foreign_job = insert_job(&mut conn, other, foreign.id, &["ZAP".to_string()])
            .await
            .expect("job");
        insert_findings(&mut conn, foreign_job.id, "ZAP", &[NewFinding::info("not mine")])
            .await
            .expect("insert");

        let severities = findings_by_severity(&mut conn, user).await.expect("severity");
        assert_eq!(severities.len(), 5);
        let high = severities.iter().find(|c| c.severity == Severity::High).expect("high");
        assert_eq!(high.count, 2);
        let info = severities.iter().find(|c| c.severity == Severity::Info).expect("info");
        assert_eq!(info.count, 1);

        let tools = findings_by_tool(&mut conn, user).await.expect("tools");
        assert_eq!(
            tools,
            [
                ToolCount { tool: "Nuclei".to_string(), count: 2 },
                ToolCount { tool: "ZAP".to_string(), count: 1 },
            ]
        );

        let timeline = metrics_timeline(&mut conn, user, Utc::now() - chrono::Duration::days(30))
            .await
            .expect("timeline");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].date, Utc::now().format("%Y-%m-%d").to_string());
        assert_eq!((timeline[0].jobs, timeline[0].findings), (2, 3));

        let future = metrics_timeline(&mut conn, user, Utc::now() + chrono::Duration::days(1))
            .await
            .expect("timeline");
        assert!(future.is_empty());

        let top = top_targets(&mut conn, user, 5).await.expect("top");
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].target_id, busy.id);
        assert_eq!(top[0].target_url, "https://busy.example.com");
        assert_eq!(top[0].count, 2);
        assert_eq!(top_targets(&mut conn, user, 1).await.expect("top").len(), 1);
    }

    #[tokio::test]
    async fn findings_require_existing_job() {
        let db = test_db().await;
        let mut conn = db.pool.acquire().await.expect("conn");
        let res = insert_findings(&mut conn, Uuid::new_v4(), "ZAP", &[NewFinding::info("orphan")]).await;
        assert!(res.is_err());
    }
}
