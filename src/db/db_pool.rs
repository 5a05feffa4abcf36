use crate::config::DatabaseSettings;
use crate::db::connection::DatabaseConnectionConfig;
use crate::db::DbError;
use postgres::{Client, NoTls};
use postgres_native_tls::MakeTlsConnector;
use r2d2::ManageConnection;
use tracing::debug;

/// r2d2 manager for read-only PostgreSQL sessions.
///
/// Every connection it hands out has `statement_timeout` set and
/// `default_transaction_read_only` switched on before first use.
pub struct PostgresConnectionManager {
    config: DatabaseConnectionConfig,
    settings: DatabaseSettings,
}

impl PostgresConnectionManager {
    pub fn new(config: DatabaseConnectionConfig, settings: DatabaseSettings) -> Self {
        Self { config, settings }
    }

    pub fn identity(&self) -> String {
        self.config.identity()
    }

    fn tls_connector(&self) -> Result<native_tls::TlsConnector, DbError> {
        let verify = self.config.ssl_verify;
        if !verify {
            debug!("Certificate checks disabled for {}", self.config.identity());
        }
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!verify)
            .danger_accept_invalid_hostnames(!verify)
            .build()?;
        Ok(connector)
    }

    fn session_setup_sql(&self) -> String {
        format!(
            "SET statement_timeout = {}; SET default_transaction_read_only = on;",
            self.settings.statement_timeout_ms
        )
    }
}

impl ManageConnection for PostgresConnectionManager {
    type Connection = Client;
    type Error = DbError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let pg_config = self
            .config
            .to_postgres_config(self.settings.connect_timeout());

        let mut client = if self.config.ssl {
            pg_config.connect(MakeTlsConnector::new(self.tls_connector()?))?
        } else {
            pg_config.connect(NoTls)?
        };

        client.batch_execute(&self.session_setup_sql())?;
        debug!("Opened read-only session for {}", self.config.identity());
        Ok(client)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1")?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}
