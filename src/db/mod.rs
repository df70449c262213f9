pub mod memory;
pub mod store;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Database connection wrapper.
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}
