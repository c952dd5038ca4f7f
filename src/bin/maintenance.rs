use std::collections::HashSet;
use std::env;

use anyhow::{Context, Result};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;

use grantdesk::{
    auth::Role,
    config::AppConfig,
    db::{self, KeyLocks},
    schema::attachments,
    storage::{LocalStorage, ObjectStorage},
    workflow::{
        accounts::{self, Registration},
        applications,
    },
};

const USAGE: &str = "Usage: maintenance <create-admin EMAIL PASSWORD | prune-blobs>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("create-admin") => {
            let (Some(email), Some(password)) = (args.next(), args.next()) else {
                eprintln!("{USAGE}");
                std::process::exit(1);
            };
            create_admin(email, password)?;
        }
        Some("prune-blobs") => prune_blobs().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        upload_dir = %config.upload_dir.display(),
        "loaded configuration"
    );
    Ok(config)
}

fn create_admin(email: String, password: String) -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let admin = accounts::create_user_with_role(
        &mut conn,
        Registration {
            email,
            password,
            role: Role::Admin.as_str().to_string(),
            ..Registration::default()
        },
        Role::Admin,
    )
    .context("failed to create admin account")?;

    println!("Created admin {} ({})", admin.email, admin.id);
    Ok(())
}

/// Removes stored blobs that no attachment row references.
async fn prune_blobs() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let storage = LocalStorage::new(config.upload_dir.clone())?;

    let referenced: HashSet<String> = {
        let mut conn = pool.get().context("failed to get database connection")?;
        attachments::table
            .select(attachments::storage_key)
            .distinct()
            .load::<String>(&mut conn)
            .context("failed to load attachment keys")?
            .into_iter()
            .collect()
    };

    let orphans: Vec<String> = storage
        .list_keys()
        .await?
        .into_iter()
        .filter(|key| !referenced.contains(key))
        .collect();

    if orphans.is_empty() {
        println!("No orphaned blobs found.");
        return Ok(());
    }

    println!("Deleting {} orphaned blobs…", orphans.len());
    let mut conn = pool.get().context("failed to get database connection")?;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    for key in &orphans {
        // An upload may have claimed the blob since the snapshot above.
        let mut locks = KeyLocks::acquire(&mut conn, [key.as_str()])
            .with_context(|| format!("failed to lock blob {key}"))?;
        if applications::blob_referenced(locks.conn(), key)
            .with_context(|| format!("failed to check references for {key}"))?
        {
            skipped += 1;
            continue;
        }
        if let Err(err) = storage.delete_object(key).await {
            failed += 1;
            eprintln!("Failed to delete blob {key}: {err}");
        }
    }

    if skipped > 0 {
        println!("Kept {skipped} blobs referenced by new uploads.");
    }
    println!("Pruned {} blobs.", orphans.len() - failed - skipped);
    Ok(())
}
