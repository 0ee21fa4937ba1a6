use std::time::Instant;

use anyhow::anyhow;
use assetsync_core::{
    config::SyncConfig,
    events::{EventBus, SyncEvent},
    manifest::{store, ManifestSync},
    models::Resource,
    transfer::{BatchResult, DownloadCoordinator, DownloadRequest, HttpFetcher},
    watcher::{invalidate, FolderWatcher},
    ResourceStatus, SyncError,
};
use clap::Parser;
use colored::Colorize;
use log::{error, info, warn};
use progress::BatchBar;
use tokio_util::sync::CancellationToken;

mod progress;

/// Mirror a project's assets into the local working folder
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Project to pull, instead of the configured one
    #[arg(short = 'p', long)]
    project: Option<String>,

    /// Branch to pull, instead of the configured one
    #[arg(short = 'b', long)]
    branch: Option<String>,

    /// Verify every local file even if the manifest did not change
    #[arg(short = 'f', long)]
    force_check: bool,

    /// Keep running and download files again when they are removed
    #[arg(short = 'w', long)]
    watch: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{} {}", "Error:".bright_red(), err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    pretty_env_logger::init();
    dotenvy::dotenv().ok();
    let args = Args::parse();

    info!("{}", format!("AssetSync Client v{}", env!("CARGO_PKG_VERSION")).cyan());

    let mut config = SyncConfig::load()?;
    if let Some(project) = args.project {
        config.project_name = Some(project);
    }
    if let Some(branch) = args.branch {
        config.branch_name = branch;
    }
    let project_name = config.require_project()?.to_string();
    let username = config
        .username
        .clone()
        .ok_or_else(|| anyhow!("username is not set in the configuration"))?;
    let api = config.api_client()?;
    let api_key = config.api_key.clone().unwrap_or_default();

    let ct = CancellationToken::new();
    let ctrl_c = ct.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping transfers...");
            ctrl_c.cancel();
        }
    });

    let instant = Instant::now();
    let sync = ManifestSync::new(api, config.page_size, config.processing_concurrency);
    let project = sync.find_project(&username, &project_name).await?;
    let branch = sync.find_branch(project.id, &config.branch_name).await?;
    info!(
        "{}",
        format!("Project {} ({}) from {}", project.name, branch.name, sync.api().base_url()).italic()
    );

    let cache_path = store::cache_path(&config.projects_root, &project_name);
    let check = sync.has_updates(&cache_path, project.id, &branch.id, &ct).await?;
    if check.changed {
        info!("[{}] Manifest changed, {} assets listed", "*".yellow(), check.fresh.len());
        store::save(&cache_path, &check.fresh).await?;
    } else {
        info!("[{}] Manifest unchanged", "=".green());
    }

    let (mut resources, folder_paths) = sync
        .build_resources(&check.fresh, &project_name, &config.projects_root)
        .await?;
    sync.fetch_material_textures(&mut resources, &ct).await?;

    let events = EventBus::default();
    let coordinator = DownloadCoordinator::new(HttpFetcher::new(), config.download_concurrency, events.clone())
        .with_retry(config.file_retry, config.batch_retry);
    let request = DownloadRequest {
        api_key,
        project_name: project_name.clone(),
        projects_root: config.projects_root.clone(),
        folder_paths,
    };

    if check.changed || args.force_check {
        info!("[{}] Verifying local files...", "/".cyan());
        coordinator.scan_local(&mut resources, &request, &ct).await?;
    } else {
        trust_local_files(&mut resources, &events);
    }

    let result = download(&coordinator, &mut resources, &request, &events, &ct).await?;
    report(&result, &resources);
    info!("Pull completed in {:.2}s", instant.elapsed().as_secs_f32());

    if args.watch {
        let root = config.projects_root.join(&project_name);
        tokio::fs::create_dir_all(&root).await?;
        watch(&coordinator, &mut resources, &request, &events, &root, &ct).await?;
    }

    Ok(())
}

/// With an unchanged manifest, files that exist are taken as they are.
fn trust_local_files(resources: &mut [Resource], events: &EventBus) {
    for resource in resources.iter_mut() {
        if resource.file_exists() {
            events.status_changed(resource.set_status(ResourceStatus::Downloaded));
        }
    }
}

async fn download(
    coordinator: &DownloadCoordinator<HttpFetcher>,
    resources: &mut [Resource],
    request: &DownloadRequest,
    events: &EventBus,
    ct: &CancellationToken,
) -> anyhow::Result<BatchResult> {
    let bar = BatchBar::attach(events)?;
    let result = coordinator.download_assets(resources, request, ct).await;
    bar.finish();
    Ok(result?)
}

fn report(result: &BatchResult, resources: &[Resource]) {
    if result.total == 0 {
        info!("{} Everything is up to date", "SUCCESS!".green());
        return;
    }
    for resource in resources.iter().filter(|x| x.requires_download()) {
        warn!(
            "[{}] {} ({}): {}",
            "x".red(),
            resource.name.red(),
            resource.kind.label(),
            resource.status
        );
    }
    if result.success() {
        info!("{} {} assets downloaded", "SUCCESS!".green(), result.succeeded);
    } else {
        warn!(
            "{} {} of {} assets downloaded, {} failed",
            "INCOMPLETE!".yellow(),
            result.succeeded,
            result.total,
            result.failed
        );
    }
}

async fn watch(
    coordinator: &DownloadCoordinator<HttpFetcher>,
    resources: &mut [Resource],
    request: &DownloadRequest,
    events: &EventBus,
    root: &std::path::Path,
    ct: &CancellationToken,
) -> anyhow::Result<()> {
    let mut watcher = FolderWatcher::new(root)?;
    info!("Watching {} (Ctrl-C to stop)", watcher.root().display().to_string().blue());
    loop {
        let event = tokio::select! {
            _ = ct.cancelled() => break,
            event = watcher.next() => event,
        };
        let Some(event) = event else {
            break;
        };
        let changes = invalidate(resources, &event);
        if changes.is_empty() {
            continue;
        }
        for change in changes {
            events.publish(SyncEvent::StatusChanged(change));
        }
        info!("[{}] Restoring removed files...", "+".green());
        match download(coordinator, resources, request, events, ct).await {
            Ok(result) => report(&result, resources),
            Err(err) => match err.downcast_ref::<SyncError>() {
                Some(SyncError::Cancelled) => break,
                _ => error!("{} {}", "Error:".bright_red(), err),
            },
        }
    }
    info!("Stopped watching");
    Ok(())
}
