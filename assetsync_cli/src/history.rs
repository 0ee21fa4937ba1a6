use assetsync_core::{
    config::SyncConfig, models::UploadRecord, transfer::TransferStateStore, UploadStatus,
};
use chrono::Local;
use clap::Args;
use colored::Colorize;
use log::info;

/// List recorded uploads, newest first
#[derive(Args, Debug)]
pub struct HistoryCommand {
    /// Page to show, starting at 1
    #[arg(long, default_value_t = 1)]
    page: u64,

    /// Records per page
    #[arg(long, default_value_t = 20)]
    per_page: u64,
}

impl HistoryCommand {
    pub async fn run(&self, config: SyncConfig) -> anyhow::Result<()> {
        let ledger = TransferStateStore::open(&config.ledger_path).await?;
        let per_page = self.per_page.max(1);
        let total = ledger.get_count().await?;
        let pages = total.div_ceil(per_page).max(1);
        let page = self.page.clamp(1, pages);

        let records = ledger.get_page((page - 1) * per_page, per_page).await?;
        ledger.close().await;

        info!("Upload history, page {}/{} ({} records)", page, pages, total);
        for record in &records {
            info!("{}", format_record(record, &config));
        }
        Ok(())
    }
}

fn format_record(record: &UploadRecord, config: &SyncConfig) -> String {
    let marker = match record.status {
        UploadStatus::Uploaded => "+".green(),
        UploadStatus::Failed => "x".red(),
    };
    let local = record
        .local_path
        .strip_prefix(&config.projects_root)
        .unwrap_or(&record.local_path)
        .to_string_lossy()
        .to_string();
    let detail = match (&record.error_message, &record.cdn_url) {
        (Some(error), _) => error.red().to_string(),
        (None, Some(url)) => url.to_string(),
        (None, None) => record.remote_path.clone(),
    };
    format!(
        "[{}] {} {} ({} bytes) {}",
        marker,
        record.uploaded_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        local.cyan(),
        record.content_length,
        detail
    )
}
