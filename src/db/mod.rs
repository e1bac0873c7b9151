use sqlx::{
    Row, Sqlite,
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::Poll;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("poll #{0} not found")]
    PollNotFound(u64),
    #[error("option index {index} out of range for poll #{poll_id}")]
    IndexOutOfRange { poll_id: u64, index: usize },
    #[error("vote count length {got} does not match option count {expected} for poll #{poll_id}")]
    SchemaMismatch {
        poll_id: u64,
        expected: usize,
        got: usize,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// The mirror store. Every mutation is a single statement or a transaction,
// so concurrent writers racing on the same poll resolve inside SQLite
// rather than in application code.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    // In-memory store for tests. A single connection, since every sqlite
    // ":memory:" connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id INTEGER PRIMARY KEY,
                question TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                poll_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                label TEXT NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (poll_id, position),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // Insert a poll only if its id is not already mirrored. Returns whether
    // the insert won; a duplicate creation event lands here and is a no-op.
    pub async fn upsert_poll_if_absent(&self, poll: &Poll) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO polls (id, question, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(poll.id as i64)
        .bind(&poll.question)
        .bind(poll.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            for (i, label) in poll.options.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO poll_options (poll_id, position, label, votes)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(poll.id as i64)
                .bind(i as i64)
                .bind(label)
                .bind(poll.votes.get(i).copied().unwrap_or(0) as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    // Atomically add one vote to a single option. The increment happens in
    // SQL, so concurrent increments to the same poll never lose updates.
    pub async fn increment_vote(&self, poll_id: u64, option_index: usize) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE poll_options
            SET votes = votes + 1
            WHERE poll_id = ? AND position = ?
            "#,
        )
        .bind(poll_id as i64)
        .bind(option_index as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }

        // Nothing matched: tell the caller whether the poll itself is
        // missing (live path buffers on this) or the index is bad.
        let poll_exists = sqlx::query("SELECT 1 FROM polls WHERE id = ?")
            .bind(poll_id as i64)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if poll_exists {
            Err(StoreError::IndexOutOfRange {
                poll_id,
                index: option_index,
            })
        } else {
            Err(StoreError::PollNotFound(poll_id))
        }
    }

    // Replace the whole vote vector with an authoritative one, all or
    // nothing. Used by reconciliation only.
    pub async fn replace_votes(&self, poll_id: u64, counts: &[u64]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let option_count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM poll_options WHERE poll_id = ?")
                .bind(poll_id as i64)
                .fetch_one(&mut *tx)
                .await?
                .get("n");

        if option_count == 0 {
            return Err(StoreError::PollNotFound(poll_id));
        }
        if option_count as usize != counts.len() {
            return Err(StoreError::SchemaMismatch {
                poll_id,
                expected: option_count as usize,
                got: counts.len(),
            });
        }

        for (i, count) in counts.iter().enumerate() {
            sqlx::query(
                r#"
                UPDATE poll_options
                SET votes = ?
                WHERE poll_id = ? AND position = ?
                "#,
            )
            .bind(*count as i64)
            .bind(poll_id as i64)
            .bind(i as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_poll(&self, poll_id: u64) -> Result<Option<Poll>, StoreError> {
        let poll_row = sqlx::query(
            r#"
            SELECT id, question, created_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = poll_row else {
            return Ok(None);
        };

        let mut poll = Self::poll_from_row(&row)?;

        let option_rows = sqlx::query(
            r#"
            SELECT label, votes
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY position
            "#,
        )
        .bind(poll_id as i64)
        .fetch_all(&self.pool)
        .await?;

        for row in option_rows {
            poll.options.push(row.get::<String, _>("label"));
            poll.votes.push(row.get::<i64, _>("votes") as u64);
        }

        Ok(Some(poll))
    }

    // All mirrored polls, newest first. Options arrive via a join ordered by
    // (poll, position) and are folded back onto their poll.
    pub async fn list_polls(&self) -> Result<Vec<Poll>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.question, p.created_at, o.label, o.votes
            FROM polls p
            JOIN poll_options o ON o.poll_id = p.id
            ORDER BY p.created_at DESC, p.id DESC, o.position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut polls: Vec<Poll> = Vec::new();
        for row in rows {
            let id = row.get::<i64, _>("id") as u64;
            if polls.last().map(|p| p.id) != Some(id) {
                polls.push(Self::poll_from_row(&row)?);
            }
            let poll = polls.last_mut().unwrap();
            poll.options.push(row.get::<String, _>("label"));
            poll.votes.push(row.get::<i64, _>("votes") as u64);
        }

        Ok(polls)
    }

    fn poll_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Poll, StoreError> {
        let created_at_str = row.get::<String, _>("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| {
                StoreError::Database(sqlx::Error::Decode(
                    format!("bad created_at '{created_at_str}': {e}").into(),
                ))
            })?
            .with_timezone(&Utc);

        Ok(Poll {
            id: row.get::<i64, _>("id") as u64,
            question: row.get::<String, _>("question"),
            options: Vec::new(),
            votes: Vec::new(),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tea_or_coffee(id: u64) -> Poll {
        Poll::new(
            id,
            "Tea or Coffee?".to_string(),
            vec!["Tea".into(), "Coffee".into()],
        )
    }

    #[tokio::test]
    async fn duplicate_creation_is_a_no_op() {
        let db = Database::in_memory().await.unwrap();
        let poll = tea_or_coffee(1);

        assert!(db.upsert_poll_if_absent(&poll).await.unwrap());
        assert!(!db.upsert_poll_if_absent(&poll).await.unwrap());

        let polls = db.list_polls().await.unwrap();
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].votes, vec![0, 0]);
    }

    #[tokio::test]
    async fn tea_or_coffee_tally() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_poll_if_absent(&tea_or_coffee(1)).await.unwrap();

        db.increment_vote(1, 1).await.unwrap();
        db.increment_vote(1, 1).await.unwrap();
        db.increment_vote(1, 0).await.unwrap();

        let poll = db.get_poll(1).await.unwrap().unwrap();
        assert_eq!(poll.votes, vec![1, 2]);
    }

    #[tokio::test]
    async fn increments_commute() {
        // Same multiset of vote events in two different orders.
        let orders: [&[usize]; 2] = [&[0, 1, 1, 2, 0], &[2, 0, 1, 0, 1]];
        let mut finals = Vec::new();

        for order in orders {
            let db = Database::in_memory().await.unwrap();
            let poll = Poll::new(
                9,
                "Q".to_string(),
                vec!["a".into(), "b".into(), "c".into()],
            );
            db.upsert_poll_if_absent(&poll).await.unwrap();
            for &idx in order {
                db.increment_vote(9, idx).await.unwrap();
            }
            finals.push(db.get_poll(9).await.unwrap().unwrap().votes);
        }

        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[0], vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn vote_for_unknown_poll_is_not_found() {
        let db = Database::in_memory().await.unwrap();
        match db.increment_vote(7, 0).await {
            Err(StoreError::PollNotFound(7)) => {}
            other => panic!("expected PollNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_range_index_leaves_counts_unchanged() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_poll_if_absent(&tea_or_coffee(1)).await.unwrap();

        match db.increment_vote(1, 2).await {
            Err(StoreError::IndexOutOfRange { poll_id: 1, index: 2 }) => {}
            other => panic!("expected IndexOutOfRange, got {other:?}"),
        }

        let poll = db.get_poll(1).await.unwrap().unwrap();
        assert_eq!(poll.votes, vec![0, 0]);
    }

    #[tokio::test]
    async fn replace_votes_overwrites_whole_vector() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_poll_if_absent(&tea_or_coffee(3)).await.unwrap();
        db.increment_vote(3, 0).await.unwrap();

        db.replace_votes(3, &[5, 9]).await.unwrap();

        let poll = db.get_poll(3).await.unwrap().unwrap();
        assert_eq!(poll.votes, vec![5, 9]);
    }

    #[tokio::test]
    async fn replace_votes_length_mismatch_applies_nothing() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_poll_if_absent(&tea_or_coffee(3)).await.unwrap();

        match db.replace_votes(3, &[1, 2, 3]).await {
            Err(StoreError::SchemaMismatch {
                poll_id: 3,
                expected: 2,
                got: 3,
            }) => {}
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }

        let poll = db.get_poll(3).await.unwrap().unwrap();
        assert_eq!(poll.votes, vec![0, 0]);
    }

    #[tokio::test]
    async fn list_returns_newest_first() {
        let db = Database::in_memory().await.unwrap();

        let mut older = tea_or_coffee(1);
        older.created_at = older.created_at - chrono::Duration::minutes(5);
        let newer = tea_or_coffee(2);

        db.upsert_poll_if_absent(&older).await.unwrap();
        db.upsert_poll_if_absent(&newer).await.unwrap();

        let polls = db.list_polls().await.unwrap();
        assert_eq!(polls.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(polls[0].options, vec!["Tea", "Coffee"]);
    }

    #[tokio::test]
    async fn get_unknown_poll_is_none() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.get_poll(42).await.unwrap().is_none());
    }
}
