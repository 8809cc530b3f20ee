//! SQLite-backed durable store for synchronized profiles.

pub mod db;
pub mod errors;
pub mod profiles;
pub mod schema;

pub use db::write_actor::spawn_writer;
pub use db::{create_pool, get_connection, init, run_migrations, DbPool, WriteHandle};
pub use errors::StorageError;
pub use profiles::ProfileRepository;
