use crate::db::DbError;
use postgres::error::SqlState;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

fn default_port() -> u16 {
    5432
}

/// Connection parameters supplied by the client with every request.
///
/// Never persisted; the password only lives as long as the pool built from it.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Encrypts the session. Certificates are not checked unless `ssl_verify` is set.
    #[serde(default)]
    pub ssl: bool,
    /// Verify the server certificate and host name when `ssl` is on.
    #[serde(default)]
    pub ssl_verify: bool,
}

impl fmt::Debug for DatabaseConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("ssl", &self.ssl)
            .field("ssl_verify", &self.ssl_verify)
            .finish_non_exhaustive()
    }
}

impl DatabaseConnectionConfig {
    /// Identity used for schema caching: `user@host:port/database`.
    pub fn identity(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }

    /// Pool key; also fingerprints credentials so a changed password gets a fresh pool.
    pub fn pool_key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.password.hash(&mut hasher);
        self.ssl.hash(&mut hasher);
        self.ssl_verify.hash(&mut hasher);
        format!("{}#{:016x}", self.identity(), hasher.finish())
    }

    pub fn to_postgres_config(&self, connect_timeout: Duration) -> postgres::Config {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .connect_timeout(connect_timeout)
            .application_name("nl-pg");
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        if self.ssl {
            config.ssl_mode(postgres::config::SslMode::Require);
        }
        config
    }
}

/// Translates common connection failures into messages a user can act on.
pub fn friendly_connection_error(err: &DbError) -> String {
    if let DbError::Postgres(pg) = err {
        if let Some(code) = pg.code() {
            if let Some(message) = message_for_sqlstate(code) {
                return message.to_string();
            }
        }
        if is_connection_refused(pg) {
            return CONNECTION_REFUSED.to_string();
        }
    }

    // r2d2 flattens the underlying error into its message
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("connection refused") {
        CONNECTION_REFUSED.to_string()
    } else if lowered.contains("password authentication failed")
        || lowered.contains("authentication failed")
    {
        AUTH_FAILED.to_string()
    } else if lowered.contains("database") && lowered.contains("does not exist") {
        MISSING_DATABASE.to_string()
    } else {
        text
    }
}

const CONNECTION_REFUSED: &str =
    "Could not connect to the database server. Check that it is running and that the host and port are correct.";
const AUTH_FAILED: &str = "Authentication failed. Check your username and password.";
const MISSING_DATABASE: &str = "The database does not exist. Check the database name.";

fn message_for_sqlstate(code: &SqlState) -> Option<&'static str> {
    if *code == SqlState::INVALID_PASSWORD || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
    {
        Some(AUTH_FAILED)
    } else if *code == SqlState::INVALID_CATALOG_NAME {
        Some(MISSING_DATABASE)
    } else {
        None
    }
}

fn is_connection_refused(err: &postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DatabaseConnectionConfig {
        serde_json::from_str(
            r#"{"host":"db.local","database":"shop","user":"reader","password":"secret"}"#,
        )
        .unwrap()
    }

    #[test]
    fn port_defaults_and_identity_excludes_password() {
        let config = sample();
        assert_eq!(config.port, 5432);
        assert!(!config.ssl);
        assert_eq!(config.identity(), "reader@db.local:5432/shop");
        assert!(!config.pool_key().contains("secret"));
    }

    #[test]
    fn pool_key_changes_with_password() {
        let first = sample();
        let mut second = sample();
        second.password = "other".to_string();
        assert_eq!(first.identity(), second.identity());
        assert_ne!(first.pool_key(), second.pool_key());
    }

    #[test]
    fn certificate_checks_are_opt_in() {
        let config = sample();
        assert!(!config.ssl_verify);

        let verified: DatabaseConnectionConfig = serde_json::from_str(
            r#"{"host":"db.local","database":"shop","user":"reader","password":"secret","ssl":true,"sslVerify":true}"#,
        )
        .unwrap();
        assert!(verified.ssl_verify);

        let mut unverified = verified.clone();
        unverified.ssl_verify = false;
        assert_ne!(verified.pool_key(), unverified.pool_key());
    }

    #[test]
    fn debug_output_hides_password() {
        let printed = format!("{:?}", sample());
        assert!(!printed.contains("secret"));
        assert!(printed.contains("db.local"));
    }

    #[test]
    fn pool_messages_are_translated() {
        let err = DbError::Task("error connecting to server: Connection refused (os error 111)".into());
        assert_eq!(friendly_connection_error(&err), CONNECTION_REFUSED);

        let err = DbError::Task("password authentication failed for user \"reader\"".into());
        assert_eq!(friendly_connection_error(&err), AUTH_FAILED);

        let err = DbError::Task("database \"shop\" does not exist".into());
        assert_eq!(friendly_connection_error(&err), MISSING_DATABASE);

        let err = DbError::Task("something else".into());
        assert_eq!(friendly_connection_error(&err), "Database task failed: something else");
    }
}
