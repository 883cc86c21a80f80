//! Embedded PostgreSQL for integration tests and benchmarks.
//!
//! Each [`EmbeddedPostgres`] is a separate server owned by the caller; stop
//! it when done. There is no shared instance.

use postgresql_embedded::PostgreSQL;

use crate::config::ClientOptions;

/// A running embedded `PostgreSQL` instance with one database created.
pub struct EmbeddedPostgres {
    postgresql: PostgreSQL,
    options: ClientOptions,
}

impl EmbeddedPostgres {
    /// Install (bundled binaries), start the server and create `database`.
    ///
    /// # Errors
    /// Returns an error if the server cannot be set up or started, or the
    /// database cannot be created.
    pub async fn start(database: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut postgresql = PostgreSQL::default();
        postgresql.setup().await?;
        postgresql.start().await?;
        postgresql.create_database(database).await?;

        let settings = postgresql.settings();
        let options = ClientOptions::new(
            settings.host.clone(),
            database,
            settings.username.clone(),
            settings.password.clone(),
        )
        .with_port(settings.port)
        .with_ssl_mode("disable")
        .with_pool_size(4, 0);

        tracing::info!(port = settings.port, database, "embedded postgres started");
        Ok(Self {
            postgresql,
            options,
        })
    }

    /// Options that connect to this instance's database.
    #[must_use]
    pub fn options(&self) -> ClientOptions {
        self.options.clone()
    }

    /// Stop the server, ignoring shutdown errors.
    pub async fn stop(self) {
        if let Err(err) = self.postgresql.stop().await {
            tracing::debug!(error = %err, "embedded postgres did not stop cleanly");
        }
    }
}
