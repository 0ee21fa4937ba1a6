use assetsync_core::{
    events::{EventBus, SyncEvent},
    ResourceStatus,
};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

/// Terminal progress for one download batch, fed from the event bus.
pub struct BatchBar {
    bar: ProgressBar,
    task: JoinHandle<()>,
}

impl BatchBar {
    pub fn attach(events: &EventBus) -> anyhow::Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:.cyan/blue}] {pos}/{len} assets",
            )?
            .progress_chars("#>-"),
        );

        let mut receiver = events.subscribe();
        let handle = bar.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(SyncEvent::BatchProgress { completed, total }) => {
                        handle.set_length(total as u64);
                        handle.set_position(completed as u64);
                    }
                    Ok(SyncEvent::StatusChanged(change)) if is_damaged(change.to) => {
                        handle.println(format!(
                            "[{}] asset {} is {}",
                            "!".red(),
                            change.id,
                            change.to.to_string().red()
                        ));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(BatchBar { bar, task })
    }

    pub fn finish(self) {
        self.task.abort();
        self.bar.finish_and_clear();
    }
}

fn is_damaged(status: ResourceStatus) -> bool {
    matches!(
        status,
        ResourceStatus::Corrupted
            | ResourceStatus::SizeMismatch
            | ResourceStatus::EmptyFile
            | ResourceStatus::Error
    )
}
