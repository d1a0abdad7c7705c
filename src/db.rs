use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::models::{GroupDefinition, MemberRecord, RollStateRecord, StudentMatch};

/// Advisory lock key for the recomputation single-flight lock.
const RUN_LOCK_KEY: i64 = 0x696e_6369_6465_6e74;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery",
            "Lee",
            "avery.lee@school.test",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules",
            "Moreno",
            "jules.moreno@school.test",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara",
            "Patel",
            "kiara.patel@school.test",
        ),
        (
            Uuid::parse_str("7b7c2f43-6a4c-4a22-9d8e-1f2b3c4d5e6f")?,
            "Tomas",
            "Rivera",
            "tomas.rivera@school.test",
        ),
        (
            Uuid::parse_str("9e8d7c6b-5a49-4838-b727-161514131211")?,
            "Mina",
            "Okafor",
            "mina.okafor@school.test",
        ),
    ];

    for (id, first_name, last_name, email) in students {
        sqlx::query(
            r#"
            INSERT INTO incident_groups.students (id, first_name, last_name, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name
            "#,
        )
        .bind(id)
        .bind(first_name)
        .bind(last_name)
        .bind(email)
        .execute(pool)
        .await?;
    }

    let now = Utc::now();
    let rolls = vec![
        ("Homeroom A", now - Duration::days(2)),
        ("Homeroom B", now - Duration::days(6)),
        ("Homeroom C", now - Duration::days(12)),
        ("Homeroom D", now - Duration::days(30)),
    ];

    for (name, completed_at) in rolls {
        sqlx::query(
            r#"
            INSERT INTO incident_groups.rolls (id, name, completed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(completed_at)
        .execute(pool)
        .await?;
    }

    let states = vec![
        ("seed-001", "avery.lee@school.test", "Homeroom A", "late"),
        ("seed-002", "avery.lee@school.test", "Homeroom B", "late"),
        ("seed-003", "avery.lee@school.test", "Homeroom C", "late"),
        ("seed-004", "jules.moreno@school.test", "Homeroom A", "absent"),
        ("seed-005", "jules.moreno@school.test", "Homeroom B", "absent"),
        ("seed-006", "kiara.patel@school.test", "Homeroom C", "late"),
        ("seed-007", "kiara.patel@school.test", "Homeroom D", "absent"),
        ("seed-008", "tomas.rivera@school.test", "Homeroom A", "present"),
        ("seed-009", "mina.okafor@school.test", "Homeroom B", "unmark"),
    ];

    for (source_key, email, roll_name, state) in states {
        let student_id: Uuid =
            sqlx::query("SELECT id FROM incident_groups.students WHERE email = $1")
                .bind(email)
                .fetch_one(pool)
                .await?
                .get("id");
        let roll_id: Uuid = sqlx::query("SELECT id FROM incident_groups.rolls WHERE name = $1")
            .bind(roll_name)
            .fetch_one(pool)
            .await?
            .get("id");

        sqlx::query(
            r#"
            INSERT INTO incident_groups.student_roll_states
            (id, roll_id, student_id, state, source_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(roll_id)
        .bind(student_id)
        .bind(state)
        .bind(source_key)
        .execute(pool)
        .await?;
    }

    let groups = vec![
        (
            Uuid::parse_str("11111111-2222-4333-8444-555555555555")?,
            "Frequent lates",
            2,
            ">",
            "late",
            4,
        ),
        (
            Uuid::parse_str("66666666-7777-4888-9999-aaaaaaaaaaaa")?,
            "Repeated absences",
            1,
            ">",
            "absent",
            2,
        ),
        (
            Uuid::parse_str("bbbbbbbb-cccc-4ddd-8eee-ffffffffffff")?,
            "Occasional flags",
            3,
            "<",
            "late,absent",
            2,
        ),
    ];

    for (id, name, incident_threshold, comparator, roll_states, window_weeks) in groups {
        sqlx::query(
            r#"
            INSERT INTO incident_groups.groups
            (id, name, incident_threshold, comparator, roll_states, window_weeks)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE
            SET incident_threshold = EXCLUDED.incident_threshold,
                comparator = EXCLUDED.comparator,
                roll_states = EXCLUDED.roll_states,
                window_weeks = EXCLUDED.window_weeks
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(incident_threshold)
        .bind(comparator)
        .bind(roll_states)
        .bind(window_weeks)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn import_roll_states(
    pool: &PgPool,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        first_name: String,
        last_name: String,
        email: String,
        roll_name: String,
        completed_at: DateTime<Utc>,
        state: String,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result.context("malformed CSV row")?;
        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO incident_groups.students (id, first_name, last_name, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.first_name)
        .bind(&row.last_name)
        .bind(&row.email)
        .fetch_one(pool)
        .await?
        .get("id");

        let roll_id: Uuid = sqlx::query(
            r#"
            INSERT INTO incident_groups.rolls (id, name, completed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET completed_at = EXCLUDED.completed_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.roll_name)
        .bind(row.completed_at)
        .fetch_one(pool)
        .await?
        .get("id");

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO incident_groups.student_roll_states
            (id, roll_id, student_id, state, source_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(roll_id)
        .bind(student_id)
        .bind(&row.state)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn list_group_definitions(pool: &PgPool) -> Result<Vec<GroupDefinition>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, name, incident_threshold, comparator, roll_states, window_weeks, \
         last_run_at, matched_student_count \
         FROM incident_groups.groups \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| GroupDefinition {
            id: row.get("id"),
            name: row.get("name"),
            incident_threshold: row.get("incident_threshold"),
            comparator: row.get("comparator"),
            roll_states: row.get("roll_states"),
            window_weeks: row.get("window_weeks"),
            last_run_at: row.get("last_run_at"),
            matched_student_count: row.get("matched_student_count"),
        })
        .collect())
}

pub async fn rolls_completed_on_or_after(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows = sqlx::query("SELECT id FROM incident_groups.rolls WHERE completed_at >= $1")
        .bind(cutoff)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|row| row.get("id")).collect())
}

pub async fn roll_states_for_rolls(
    pool: &PgPool,
    roll_ids: &[Uuid],
) -> Result<Vec<RollStateRecord>, sqlx::Error> {
    if roll_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "SELECT srs.roll_id, srs.student_id, \
         s.first_name || ' ' || s.last_name AS student_name, srs.state \
         FROM incident_groups.student_roll_states srs \
         JOIN incident_groups.students s ON s.id = srs.student_id \
         WHERE srs.roll_id = ANY($1)",
    )
    .bind(roll_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| RollStateRecord {
            roll_id: row.get("roll_id"),
            student_id: row.get("student_id"),
            student_name: row.get("student_name"),
            state: row.get("state"),
        })
        .collect())
}

/// Replace a group's membership and stamp its run metadata in one
/// transaction. A reader never observes the cleared-but-unpopulated
/// intermediate state; a mid-commit failure rolls back to the prior
/// membership.
pub async fn commit_group_run(
    pool: &PgPool,
    group_id: Uuid,
    matches: &[StudentMatch],
    run_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM incident_groups.group_students WHERE group_id = $1")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

    for entry in matches {
        sqlx::query(
            "INSERT INTO incident_groups.group_students (group_id, student_id, incident_count) \
             VALUES ($1, $2, $3)",
        )
        .bind(group_id)
        .bind(entry.student_id)
        .bind(entry.incident_count as i32)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE incident_groups.groups \
         SET last_run_at = $2, matched_student_count = $3 \
         WHERE id = $1",
    )
    .bind(group_id)
    .bind(run_at)
    .bind(matches.len() as i32)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Holds the session-scoped advisory lock for the duration of a run.
/// The connection is pinned so the lock is released on the same
/// session that acquired it.
pub struct RunLock {
    conn: PoolConnection<Postgres>,
}

impl RunLock {
    pub async fn release(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LOCK_KEY)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

/// Returns `None` when another run already holds the lock.
pub async fn try_acquire_run_lock(pool: &PgPool) -> Result<Option<RunLock>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(RUN_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await?;

    if locked {
        Ok(Some(RunLock { conn }))
    } else {
        Ok(None)
    }
}

pub async fn group_members(
    pool: &PgPool,
    group_id: Uuid,
) -> Result<Vec<MemberRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT gs.student_id, s.first_name || ' ' || s.last_name AS full_name, \
         s.email, gs.incident_count \
         FROM incident_groups.group_students gs \
         JOIN incident_groups.students s ON s.id = gs.student_id \
         WHERE gs.group_id = $1 \
         ORDER BY gs.incident_count DESC, s.last_name, s.first_name",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| MemberRecord {
            student_id: row.get("student_id"),
            full_name: row.get("full_name"),
            email: row.get("email"),
            incident_count: i64::from(row.get::<i32, _>("incident_count")),
        })
        .collect())
}
