use clap::Parser;
use mirrorfs::cli::{ClientArgs, ClientCommand};
use mirrorfs::client::{acquire_watch_lock, Client, MirrorWatcher, Reconciler};
use mirrorfs::error::SyncResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirrorfs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(args).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: ClientArgs) -> SyncResult<()> {
    let client = Client::connect(&args.server, &args.client_id, &args.mount).await?;
    let cancel = CancellationToken::new();

    match args.command {
        ClientCommand::Store { file } => {
            client.store(&file, &cancel).await?;
            println!("Successfully stored {}", file);
        }
        ClientCommand::Fetch { file } => {
            client.fetch(&file, &cancel).await?;
            println!("Successfully fetched {}", file);
        }
        ClientCommand::Delete { file } => {
            client.delete(&file).await?;
            println!("Successfully deleted {}", file);
        }
        ClientCommand::Watch => {
            // Keep the handle alive for the whole watch; it guards the
            // directory against a second sync instance.
            let _watch_lock = acquire_watch_lock(&args.mount)?;

            let coord = Arc::new(Mutex::new(()));
            let reconciler = Reconciler::new(
                client.clone(),
                coord.clone(),
                Duration::from_secs(args.sync_interval.max(1)),
            );
            let watcher = MirrorWatcher::new(
                client.clone(),
                coord,
                Duration::from_secs(args.event_timeout.max(1)),
            );

            let reconciler_task = tokio::spawn({
                let cancel = cancel.clone();
                async move { reconciler.run(cancel).await }
            });
            let watcher_task = tokio::spawn({
                let mount = args.mount.clone();
                let cancel = cancel.clone();
                async move { watcher.run(mount, cancel).await }
            });

            println!("Watching mirror directory: {}", args.mount.display());
            println!("Press Ctrl+C to stop...");
            tokio::signal::ctrl_c().await.ok();
            println!("\nStopping watcher...");

            cancel.cancel();
            let _ = reconciler_task.await;
            if let Ok(Err(e)) = watcher_task.await {
                tracing::error!("watcher exited with error: {}", e);
            }
        }
    }
    Ok(())
}
