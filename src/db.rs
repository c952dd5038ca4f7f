use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, Context};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::BigInt;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use sha2::{Digest, Sha256};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 2;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool_size = max_size.max(1);
    let pool = Pool::builder()
        .max_size(pool_size)
        .connection_timeout(Duration::from_secs(10))
        .build(manager)?;
    Ok(pool)
}

/// Applies pending embedded migrations and returns how many ran.
pub fn run_migrations(pool: &PgPool) -> anyhow::Result<usize> {
    let mut conn = pool
        .get()
        .context("failed to get database connection for migrations")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
    Ok(applied.len())
}

/// Session-level advisory locks on storage keys, held by the connection for
/// as long as the guard lives. Anything that creates or drops the last
/// reference to a blob must hold the blob's lock while doing so.
pub struct KeyLocks<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> KeyLocks<'c> {
    /// Blocks until every key is locked. Keys are taken in a fixed order so
    /// two holders of overlapping sets cannot deadlock.
    pub fn acquire<'k, I>(conn: &'c mut PgConnection, keys: I) -> QueryResult<Self>
    where
        I: IntoIterator<Item = &'k str>,
    {
        let ids: BTreeSet<i64> = keys.into_iter().map(advisory_id).collect();
        let mut locks = Self { conn };
        for id in ids {
            diesel::sql_query("SELECT pg_advisory_lock($1)")
                .bind::<BigInt, _>(id)
                .execute(&mut *locks.conn)?;
        }
        Ok(locks)
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.conn
    }
}

impl Drop for KeyLocks<'_> {
    fn drop(&mut self) {
        if let Err(err) = diesel::sql_query("SELECT pg_advisory_unlock_all()").execute(&mut *self.conn)
        {
            tracing::warn!(error = %err, "failed to release advisory locks");
        }
    }
}

fn advisory_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}
