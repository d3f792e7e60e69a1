use std::str::FromStr;

use sqlx::{
    Error, Pool, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use utils::assets::database_path;

pub mod models;

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    /// Open (creating if missing) the worker database in the asset directory.
    pub async fn new() -> Result<DBService, Error> {
        let database_url = format!("sqlite://{}", database_path().to_string_lossy());
        Self::new_with_url(&database_url).await
    }

    /// Open a database at an explicit `sqlite://` URL and run migrations.
    pub async fn new_with_url(database_url: &str) -> Result<DBService, Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }

    /// Private in-memory database with the full schema, used by tests.
    ///
    /// The pool is pinned to a single connection that never idles out, since
    /// an in-memory SQLite database disappears with its last connection.
    pub async fn new_in_memory() -> Result<DBService, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }
}
