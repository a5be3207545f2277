use crate::config::{ConfigError, DatabaseConfig, DatabaseTarget};
use crate::transform::{IncidentRecord, Record, ReviewRecord};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{debug, info, instrument};

const INSERT_REVIEW: &str = r#"
    INSERT INTO review (review_at, exhibition_id, rating_id)
    VALUES ($1, $2, $3)
"#;

const INSERT_INCIDENT: &str = r#"
    INSERT INTO incident (incident_at, exhibition_id, incident_type_id)
    VALUES ($1, $2, $3)
"#;

/// Errors that can occur while writing records
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database unreachable: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("Failed to insert record: {0}")]
    Write(#[source] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(e),
            sqlx::Error::Database(ref db) if is_connection_sqlstate(db.code().as_deref()) => {
                StoreError::Connection(e)
            }
            other => StoreError::Write(other),
        }
    }
}

/// SQLSTATE classes 08 (connection exception) and 28 (invalid authorization)
fn is_connection_sqlstate(code: Option<&str>) -> bool {
    matches!(code, Some(code) if code.starts_with("08") || code.starts_with("28"))
}

/// Destination for transformed records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write one record to the table matching its shape
    async fn insert(&self, record: &Record) -> Result<(), StoreError>;
}

/// Record store backed by a Postgres connection pool
pub struct PgStore {
    pool: PgPool,
    target: DatabaseTarget,
}

impl PgStore {
    /// Create a store for `target`. Connections are opened on first use and
    /// reused afterwards.
    pub fn connect_lazy(
        config: &DatabaseConfig,
        target: DatabaseTarget,
    ) -> Result<Self, ConfigError> {
        let connection = config.target(target)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_lazy_with(connection.connect_options());

        info!(
            target = target.as_str(),
            host = %connection.host,
            port = connection.port,
            database = %connection.name,
            "Using {} database connection",
            target.as_str()
        );

        Ok(Self { pool, target })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, target: DatabaseTarget) -> Self {
        Self { pool, target }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
        info!(target = self.target.as_str(), "Database connections closed");
    }

    async fn insert_review(&self, review: &ReviewRecord) -> Result<(), StoreError> {
        sqlx::query(INSERT_REVIEW)
            .bind(review.review_at)
            .bind(review.exhibition_id)
            .bind(review.rating_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_incident(&self, incident: &IncidentRecord) -> Result<(), StoreError> {
        sqlx::query(INSERT_INCIDENT)
            .bind(incident.incident_at)
            .bind(incident.exhibition_id)
            .bind(incident.incident_type_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    #[instrument(skip(self, record), fields(table = record.table()))]
    async fn insert(&self, record: &Record) -> Result<(), StoreError> {
        match record {
            Record::Review(review) => self.insert_review(review).await?,
            Record::Incident(incident) => self.insert_incident(incident).await?,
        }

        debug!(
            table = record.table(),
            exhibition_id = record.exhibition_id(),
            "Record inserted"
        );

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn review() -> Record {
        Record::Review(ReviewRecord {
            review_at: DateTime::parse_from_rfc3339("2024-06-01T12:00:00+00:00").unwrap(),
            exhibition_id: 3,
            rating_id: 4,
        })
    }

    fn incident() -> Record {
        Record::Incident(IncidentRecord {
            incident_at: DateTime::parse_from_rfc3339("2024-06-01T14:30:00+01:00").unwrap(),
            exhibition_id: 1,
            incident_type_id: 2,
        })
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();

        store.insert(&review()).await.unwrap();
        store.insert(&incident()).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.table("review"), vec![review()]);
        assert_eq!(store.table("incident"), vec![incident()]);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused"
            ))),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Write(_)
        ));
    }

    #[test]
    fn test_connection_sqlstates() {
        assert!(is_connection_sqlstate(Some("08006")));
        assert!(is_connection_sqlstate(Some("28P01")));
        assert!(!is_connection_sqlstate(Some("23503")));
        assert!(!is_connection_sqlstate(None));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn test_records_land_in_their_tables(db: PgPool) {
        let store = PgStore::from_pool(db.clone(), DatabaseTarget::Local);

        store.insert(&review()).await.unwrap();
        store.insert(&incident()).await.unwrap();

        let (review_at, exhibition_id, rating_id): (DateTime<Utc>, i32, i32) =
            sqlx::query_as("SELECT review_at, exhibition_id, rating_id FROM review")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(review_at, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        assert_eq!((exhibition_id, rating_id), (3, 4));

        let (incident_at, exhibition_id, incident_type_id): (DateTime<Utc>, i32, i32) =
            sqlx::query_as(
                "SELECT incident_at, exhibition_id, incident_type_id FROM incident",
            )
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(incident_at, Utc.with_ymd_and_hms(2024, 6, 1, 13, 30, 0).unwrap());
        assert_eq!((exhibition_id, incident_type_id), (1, 2));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn test_unknown_exhibition_is_a_write_error(db: PgPool) {
        let store = PgStore::from_pool(db.clone(), DatabaseTarget::Local);

        let record = Record::Review(ReviewRecord {
            review_at: DateTime::parse_from_rfc3339("2024-06-01T12:00:00+00:00").unwrap(),
            exhibition_id: 99,
            rating_id: 1,
        });

        assert!(matches!(
            store.insert(&record).await,
            Err(StoreError::Write(_))
        ));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM review")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn test_closed_pool_is_a_connection_error(db: PgPool) {
        let store = PgStore::from_pool(db, DatabaseTarget::Local);
        store.close().await;

        assert!(matches!(
            store.insert(&incident()).await,
            Err(StoreError::Connection(_))
        ));
    }
}
