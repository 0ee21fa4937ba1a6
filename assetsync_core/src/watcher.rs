//! Notices files disappearing from the working folder so their resources can
//! be marked for download again.

use std::{
    mem,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::{debug, info, warn};
use notify::{
    event::{ModifyKind, RemoveKind, RenameMode},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::{runtime::Handle, sync::mpsc};

use crate::{
    models::{Resource, StatusChange},
    Result, ResourceStatus, SyncError,
};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    FilesRemoved(Vec<PathBuf>),
    RescanRequired,
}

#[derive(Default)]
struct Pending {
    files: Vec<PathBuf>,
    rescan: bool,
}

struct DebouncerInner {
    armed: AtomicBool,
    pending: Mutex<Pending>,
    window: Duration,
    sender: mpsc::UnboundedSender<WatchEvent>,
    runtime: Handle,
}

/// Coalesces bursts of removals into one [`WatchEvent`] per window.
///
/// A directory removal wins over single files: the queue is dropped and a
/// rescan is requested instead. Safe to feed from the watcher's own thread.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

impl Debouncer {
    /// Must be created inside a tokio runtime; the flush timers run on it.
    pub fn new(window: Duration, sender: mpsc::UnboundedSender<WatchEvent>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| SyncError::Config("the folder watcher needs a tokio runtime".to_string()))?;
        Ok(Debouncer {
            inner: Arc::new(DebouncerInner {
                armed: AtomicBool::new(false),
                pending: Mutex::new(Pending::default()),
                window,
                sender,
                runtime,
            }),
        })
    }

    pub fn push_file(&self, path: PathBuf) {
        if is_ignored(&path) {
            return;
        }
        if let Ok(mut pending) = self.inner.pending.lock() {
            if !pending.rescan && !pending.files.contains(&path) {
                pending.files.push(path);
            }
        }
        self.arm();
    }

    pub fn push_directory(&self, path: PathBuf) {
        if is_ignored(&path) {
            return;
        }
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.rescan = true;
            pending.files.clear();
        }
        self.arm();
    }

    fn arm(&self) {
        if self
            .inner
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(inner.window).await;
            flush(&inner);
        });
    }
}

fn flush(inner: &DebouncerInner) {
    let pending = match inner.pending.lock() {
        Ok(mut pending) => {
            // disarm under the lock so a concurrent push either lands in this
            // flush or arms a new timer
            inner.armed.store(false, Ordering::Release);
            mem::take(&mut *pending)
        }
        Err(_) => {
            inner.armed.store(false, Ordering::Release);
            return;
        }
    };
    let event = if pending.rescan {
        WatchEvent::RescanRequired
    } else if !pending.files.is_empty() {
        WatchEvent::FilesRemoved(pending.files)
    } else {
        return;
    };
    debug!("Flushing watch event {:?}", event);
    let _ = inner.sender.send(event);
}

/// Build output is regenerated constantly and never tracked.
fn is_ignored(path: &Path) -> bool {
    path.components().any(|x| x.as_os_str() == "build")
}

/// Watches a working tree for removed files and renamed-away entries.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

impl FolderWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        Self::with_window(root, DEBOUNCE_WINDOW)
    }

    pub fn with_window(root: &Path, window: Duration) -> Result<Self> {
        let (sender, events) = mpsc::unbounded_channel();
        let debouncer = Debouncer::new(window, sender)?;

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!("Watch error: {}", err);
                    return;
                }
            };
            match event.kind {
                EventKind::Remove(RemoveKind::File) => {
                    event.paths.into_iter().for_each(|x| debouncer.push_file(x))
                }
                EventKind::Remove(RemoveKind::Folder) => {
                    event.paths.into_iter().for_each(|x| debouncer.push_directory(x))
                }
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    event.paths.into_iter().for_each(|x| push_guessed(&debouncer, x))
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                    if let Some(from) = event.paths.into_iter().next() {
                        push_guessed(&debouncer, from);
                    }
                }
                _ => {}
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!("Watching {} for removed files", root.display());

        Ok(FolderWatcher {
            _watcher: watcher,
            root: root.to_path_buf(),
            events,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Next debounced event; `None` once the watcher is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

/// The entry is already gone, so its kind is guessed from the name.
fn push_guessed(debouncer: &Debouncer, path: PathBuf) {
    match path.extension() {
        Some(_) => debouncer.push_file(path),
        None => debouncer.push_directory(path),
    }
}

/// Statuses that imply a file on disk.
fn expects_local_file(status: ResourceStatus) -> bool {
    !matches!(
        status,
        ResourceStatus::Unset
            | ResourceStatus::OnServer
            | ResourceStatus::Downloading
            | ResourceStatus::Missing
            | ResourceStatus::Error
            | ResourceStatus::Unknown
    )
}

/// Marks resources whose files went away as `Missing` and returns the
/// transitions made.
pub fn invalidate(resources: &mut [Resource], event: &WatchEvent) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    for resource in resources.iter_mut() {
        if !expects_local_file(resource.status) {
            continue;
        }
        let Some(path) = resource.path.as_deref() else {
            continue;
        };
        let gone = match event {
            WatchEvent::FilesRemoved(paths) => paths.iter().any(|x| x == path),
            WatchEvent::RescanRequired => !path.exists(),
        };
        if gone {
            changes.extend(resource.set_status(ResourceStatus::Missing));
        }
    }
    if !changes.is_empty() {
        info!("{} tracked files went missing", changes.len());
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::AssetId,
        models::{ResourceKind, TextureInfo},
    };
    use tempfile::tempdir;
    use tokio::time::timeout;

    const WINDOW: Duration = Duration::from_millis(30);

    fn debouncer() -> Result<(Debouncer, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok((Debouncer::new(WINDOW, sender)?, receiver))
    }

    #[tokio::test]
    async fn should_coalesce_a_burst_of_removals() -> Result<(), Box<dyn std::error::Error>> {
        let (debouncer, mut events) = debouncer()?;
        debouncer.push_file(PathBuf::from("/p/a.png"));
        debouncer.push_file(PathBuf::from("/p/b.png"));
        debouncer.push_file(PathBuf::from("/p/a.png"));

        let event = timeout(Duration::from_secs(2), events.recv()).await?;

        assert_eq!(
            event,
            Some(WatchEvent::FilesRemoved(vec![PathBuf::from("/p/a.png"), PathBuf::from("/p/b.png")]))
        );
        assert!(timeout(WINDOW * 3, events.recv()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn should_prefer_rescan_over_files() -> Result<(), Box<dyn std::error::Error>> {
        let (debouncer, mut events) = debouncer()?;
        debouncer.push_file(PathBuf::from("/p/a.png"));
        debouncer.push_directory(PathBuf::from("/p/textures"));
        debouncer.push_file(PathBuf::from("/p/b.png"));

        let event = timeout(Duration::from_secs(2), events.recv()).await?;

        assert_eq!(event, Some(WatchEvent::RescanRequired));
        Ok(())
    }

    #[tokio::test]
    async fn should_emit_separate_events_for_separate_bursts() -> Result<(), Box<dyn std::error::Error>> {
        let (debouncer, mut events) = debouncer()?;
        debouncer.push_file(PathBuf::from("/p/a.png"));
        let first = timeout(Duration::from_secs(2), events.recv()).await?;
        debouncer.push_file(PathBuf::from("/p/b.png"));
        let second = timeout(Duration::from_secs(2), events.recv()).await?;

        assert_eq!(first, Some(WatchEvent::FilesRemoved(vec![PathBuf::from("/p/a.png")])));
        assert_eq!(second, Some(WatchEvent::FilesRemoved(vec![PathBuf::from("/p/b.png")])));
        Ok(())
    }

    #[tokio::test]
    async fn should_ignore_build_output() -> Result<(), Box<dyn std::error::Error>> {
        let (debouncer, mut events) = debouncer()?;
        debouncer.push_file(PathBuf::from("/p/build/a.png"));
        debouncer.push_directory(PathBuf::from("/p/build"));

        assert!(timeout(WINDOW * 4, events.recv()).await.is_err());
        Ok(())
    }

    fn downloaded(id: i64, path: PathBuf) -> Resource {
        let mut resource = Resource::new(AssetId(id), format!("r{}", id), ResourceKind::Texture(TextureInfo::default()));
        resource.path = Some(path);
        resource.status = ResourceStatus::Downloaded;
        resource
    }

    #[test]
    fn should_mark_removed_files_missing() {
        let mut resources = vec![
            downloaded(1, PathBuf::from("/p/a.png")),
            downloaded(2, PathBuf::from("/p/b.png")),
        ];
        resources[1].status = ResourceStatus::OnServer;
        resources.push(downloaded(3, PathBuf::from("/p/c.png")));

        let changes = invalidate(
            &mut resources,
            &WatchEvent::FilesRemoved(vec![PathBuf::from("/p/a.png"), PathBuf::from("/p/b.png")]),
        );

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, AssetId(1));
        assert_eq!(resources[0].status, ResourceStatus::Missing);
        assert!(resources[0].requires_download());
        assert_eq!(resources[1].status, ResourceStatus::OnServer);
        assert_eq!(resources[2].status, ResourceStatus::Downloaded);
    }

    #[test]
    fn should_rescan_for_missing_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let kept = dir.path().join("kept.png");
        std::fs::write(&kept, b"x")?;
        let mut resources = vec![downloaded(1, kept), downloaded(2, dir.path().join("gone.png"))];

        let changes = invalidate(&mut resources, &WatchEvent::RescanRequired);

        assert_eq!(changes.len(), 1);
        assert_eq!(resources[0].status, ResourceStatus::Downloaded);
        assert_eq!(resources[1].status, ResourceStatus::Missing);
        Ok(())
    }

    #[tokio::test]
    async fn should_report_deleted_files_from_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("rock.png");
        std::fs::write(&path, b"rock")?;
        let mut watcher = FolderWatcher::with_window(dir.path(), WINDOW)?;

        std::fs::remove_file(&path)?;
        let event = timeout(Duration::from_secs(5), watcher.next()).await?;

        match event {
            Some(WatchEvent::FilesRemoved(paths)) => {
                assert!(paths.iter().any(|x| x.file_name() == path.file_name()))
            }
            other => panic!("unexpected event {:?}", other),
        }
        Ok(())
    }
}
