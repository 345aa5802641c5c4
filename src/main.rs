use anyhow::{Context, Result};
use rsync_backup::backup::{
    build_backup_plan, check_rsync, BackupEnv, BackupSessionStatus, IgnoreSpaceExhaustion,
    Progress, RsyncLister, RsyncTransfer, SessionStatus, TracingObserver,
};
use rsync_backup::utils::{self, disk::Fs2Probe};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    utils::logging::init_tracing();

    let config = Arc::new(utils::config::load_config()?);
    let dest_root = config
        .destination_root
        .clone()
        .context("destination_root is not configured (RSYNC_BACKUP__DESTINATION_ROOT)")?;

    info!("Starting rsync-backup v{}", env!("CARGO_PKG_VERSION"));
    let version = check_rsync(&config.rsync_path).await?;
    info!("Using {}", version);

    let status = BackupSessionStatus::new();
    {
        let status = status.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            status.stop();
        });
    }

    let session = status.start();
    let lister = RsyncLister::new(&config.rsync_path);
    let (plan, mut progress): (_, Progress) =
        match build_backup_plan(&lister, config.clone(), &TracingObserver, session.token()).await {
            Ok(built) => built,
            Err(e) if e.is_terminated() => {
                info!("Interrupted while planning");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

    let sync = RsyncTransfer::new(&config.rsync_path);
    let env = BackupEnv {
        sync: &sync,
        space: &Fs2Probe,
        hook: &IgnoreSpaceExhaustion,
        observer: &TracingObserver,
    };
    let result = plan
        .run_backup(&mut progress, &dest_root, &env, session.token())
        .await;

    match SessionStatus::from_result(&result) {
        SessionStatus::Succeeded => info!("Backup succeeded in {:?}", progress.elapsed),
        SessionStatus::SucceededWithErrors => warn!(
            "Backup finished with errors: {} skipped, {} failed",
            progress.total_progress.skipped.unwrap_or_default(),
            progress.total_progress.failed.unwrap_or_default()
        ),
        SessionStatus::Terminated => info!("Backup interrupted"),
        SessionStatus::Failed => {}
    }

    match result {
        Ok(outcome) => {
            for entry in outcome.log_tail.iter().filter(|e| e.level == "error") {
                warn!("{} ({})", entry.message, entry.directory.as_deref().unwrap_or("-"));
            }
            info!("Snapshot: {}", outcome.snapshot.display());
            info!("Session log: {}", outcome.log_file.display());
            Ok(())
        }
        Err(e) if e.is_terminated() => Ok(()),
        Err(e) => {
            error!("Backup failed: {}", e);
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping backup");
}
