//! Connection pool, migrations, and the single-writer actor.

use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;

use profile_sync_core::Result;

use crate::errors::StorageError;

pub use write_actor::WriteHandle;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

pub const DB_FILE_NAME: &str = "profile-sync.db";

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const MAX_POOL_SIZE: u32 = 8;

#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(r2d2::Error::QueryError)
    }
}

/// Creates `app_data_dir` if needed and returns the database file path in it.
pub fn init(app_data_dir: &str) -> Result<String> {
    std::fs::create_dir_all(app_data_dir).map_err(StorageError::from)?;
    let db_path = Path::new(app_data_dir).join(DB_FILE_NAME);
    Ok(db_path.to_string_lossy().to_string())
}

pub fn create_pool(db_path: &str) -> Result<Arc<DbPool>> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path);
    let pool = Pool::builder()
        .max_size(MAX_POOL_SIZE)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .map_err(StorageError::from)?;
    debug!("[Storage] Connection pool ready for {}", db_path);
    Ok(Arc::new(pool))
}

pub fn get_connection(pool: &DbPool) -> Result<DbConnection> {
    Ok(pool.get().map_err(StorageError::from)?)
}

pub fn run_migrations(db_path: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(db_path).map_err(StorageError::from)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    if !applied.is_empty() {
        info!("[Storage] Applied {} migration(s) to {}", applied.len(), db_path);
    }
    Ok(())
}

pub mod write_actor {
    //! All writes go through one dedicated thread so SQLite never sees two
    //! concurrent writers. Each job runs inside its own transaction.

    use diesel::sqlite::SqliteConnection;
    use log::{debug, error};
    use tokio::sync::{mpsc, oneshot};

    use profile_sync_core::{Error, Result};

    use super::DbPool;
    use crate::errors::StorageError;

    type Job = Box<dyn FnOnce(&DbPool) + Send + 'static>;

    enum TxError {
        Diesel(diesel::result::Error),
        Job(Error),
    }

    impl From<diesel::result::Error> for TxError {
        fn from(err: diesel::result::Error) -> Self {
            TxError::Diesel(err)
        }
    }

    #[derive(Clone)]
    pub struct WriteHandle {
        sender: mpsc::UnboundedSender<Job>,
    }

    impl WriteHandle {
        /// Runs `job` on the writer thread inside a transaction and returns its
        /// result. An `Err` from `job` rolls the transaction back.
        pub async fn exec<F, T>(&self, job: F) -> Result<T>
        where
            F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
            T: Send + 'static,
        {
            let (reply, response) = oneshot::channel();
            let task: Job = Box::new(move |pool: &DbPool| {
                let result = run_in_transaction(pool, job);
                let _ = reply.send(result);
            });

            self.sender
                .send(task)
                .map_err(|_| StorageError::WriterUnavailable("writer stopped".to_string()))?;
            response
                .await
                .map_err(|_| StorageError::WriterUnavailable("writer dropped the job".to_string()))?
        }
    }

    fn run_in_transaction<F, T>(pool: &DbPool, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T>,
    {
        let mut conn = pool.get().map_err(StorageError::from)?;
        conn.immediate_transaction::<T, TxError, _>(|tx| job(tx).map_err(TxError::Job))
            .map_err(|err| match err {
                TxError::Diesel(e) => Error::from(StorageError::from(e)),
                TxError::Job(e) => e,
            })
    }

    /// Starts the writer thread. The thread exits once every handle is dropped.
    pub fn spawn_writer(pool: DbPool) -> WriteHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let spawned = std::thread::Builder::new()
            .name("profile-sync-db-writer".to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    job(&pool);
                }
                debug!("[Storage] Writer thread stopped");
            });
        if let Err(err) = spawned {
            error!("[Storage] Failed to start writer thread: {}", err);
        }
        WriteHandle { sender }
    }
}

#[cfg(test)]
mod tests {
    use super::write_actor::spawn_writer;
    use super::*;
    use diesel::prelude::*;
    use profile_sync_core::Error;
    use tempfile::tempdir;

    fn setup() -> (Arc<DbPool>, WriteHandle) {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        (pool, writer)
    }

    #[derive(QueryableByName)]
    struct CountRow {
        #[diesel(sql_type = diesel::sql_types::BigInt)]
        c: i64,
    }

    #[tokio::test]
    async fn migrations_create_profile_sync_tables() {
        let (pool, _writer) = setup();
        let mut conn = get_connection(&pool).expect("conn");
        for table in [
            "profiles",
            "processed_snapshots",
            "failed_profile_fetches",
            "sync_cursors",
        ] {
            let row = diesel::sql_query(format!(
                "SELECT COUNT(*) as c FROM sqlite_master WHERE type='table' AND name='{}'",
                table
            ))
            .get_result::<CountRow>(&mut conn)
            .expect("table exists");
            assert_eq!(row.c, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn failed_job_rolls_back() {
        let (pool, writer) = setup();

        let result: Result<()> = writer
            .exec(|conn| {
                diesel::sql_query(
                    "INSERT INTO processed_snapshots (hash, processed_at) VALUES ('bafy-snap', 1)",
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Err(Error::invalid_data("abort"))
            })
            .await;
        assert!(result.is_err());

        let mut conn = get_connection(&pool).expect("conn");
        let row = diesel::sql_query("SELECT COUNT(*) as c FROM processed_snapshots")
            .get_result::<CountRow>(&mut conn)
            .expect("count");
        assert_eq!(row.c, 0);
    }

    #[tokio::test]
    async fn rerunning_migrations_is_a_no_op() {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("first run");
        run_migrations(&db_path).expect("second run");
    }
}
