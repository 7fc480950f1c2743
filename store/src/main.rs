//! Mooring inspector - prints what a local datastore holds.
//!
//! Usage: `mooring [DATABASE_PATH]`. Without an argument the path is read from
//! `MOORING_DATABASE_PATH`.

use mooring_store::db::{self, Database};
use mooring_store::queue::{CommandStore, SqlCommandStore};
use mooring_store::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mooring_store=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => Config::from_env()?.database_path,
    };

    tracing::info!("Inspecting {}", path.display());
    let db = Arc::new(Database::new(path));
    db.open().await?;

    {
        let mut session = db.session().await?;
        println!("Objects:");
        for (class_name, count) in db::count_by_class(&mut session).await? {
            println!("  {class_name:<24} {count}");
        }

        println!("Pins:");
        for name in db::pin_names(&mut session).await? {
            let members = db::pin_members(&mut session, &name).await?;
            println!("  {name:<24} {}", members.len());
        }
    }

    let commands = SqlCommandStore::new(db.clone());
    let pending = commands.load_all().await?;
    println!("Queued commands: {}", pending.len());
    for pin in pending {
        println!(
            "  {} {:<6} target={}",
            pin.file_name(),
            pin.command.kind(),
            pin.target_uuid.as_deref().unwrap_or("-")
        );
    }

    db.close().await?;
    Ok(())
}
