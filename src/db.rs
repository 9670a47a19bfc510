use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::migrate::Migrator;
use std::str::FromStr;
use crate::auth::ensure_bootstrap_admin;
use crate::config::AppConfig;

pub(crate) static MIGRATOR: Migrator = sqlx::migrate!("db/migrations");

pub struct DbPool(pub SqlitePool);

pub async fn open_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");
    let opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(if in_memory { SqliteJournalMode::Memory } else { SqliteJournalMode::Wal });
    let pool_opts = if in_memory {
        // every connection to :memory: is a separate database
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    pool_opts.connect_with(opts).await
}

pub struct DbPoolFairing();
#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let Some(cfg) = rocket.state::<AppConfig>().cloned() else {
            error!("Application config is not managed, cannot open database");
            return Err(rocket);
        };
        info!("Opening database: {}", cfg.database_url);
        let pool = match open_pool(&cfg.database_url).await {
            Ok(pool) => pool,
            Err(err) => {
                error!("Database connection error: {:?}", err);
                return Err(rocket);
            }
        };

        match MIGRATOR.run(&pool).await {
            Ok(_) => info!("Migrations applied successfully!"),
            Err(err) => {
                error!("Migration error: {:?}", err);
                return Err(rocket);
            }
        };

        if let Some(admin) = &cfg.bootstrap_admin {
            if let Err(err) = ensure_bootstrap_admin(&pool, admin).await {
                error!("Cannot create bootstrap admin: {err}");
                return Err(rocket);
            }
        }

        Ok(rocket.manage(DbPool(pool)))
    }
}

/// Maps constraint violations to a user facing message, anything else is unexpected.
pub fn constraint_violation_message(err: &sqlx::Error) -> Option<&'static str> {
    let db_err = err.as_database_error()?;
    if db_err.is_unique_violation() {
        Some("Ya existe un registro con esos datos.")
    } else if db_err.is_foreign_key_violation() {
        Some("El registro está en uso por otros datos y no se puede modificar o eliminar.")
    } else if db_err.is_check_violation() {
        Some("Algún valor está fuera del rango permitido.")
    } else {
        None
    }
}
