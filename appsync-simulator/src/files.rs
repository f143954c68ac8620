//! Mapping template files: a process-wide cache of their contents and the
//! change notifications that invalidate it.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::prelude::*;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::task::JoinHandle;
use tower::BoxError;

use crate::loader::BatchCache;
use crate::loader::BatchFn;
use crate::loader::Load;

/// Caches template file contents for the lifetime of the process.
///
/// Files are read lazily, on the first load of their path, and kept until
/// [`FileLoader::clear`] is called for that path. Every path is read on its
/// own, so one unreadable template never fails the load of another.
#[derive(Clone, Debug)]
pub struct FileLoader {
    cache: BatchCache<PathBuf, Arc<str>>,
}

impl Default for FileLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLoader {
    pub fn new() -> Self {
        Self {
            cache: BatchCache::single("template_files", ReadFiles),
        }
    }

    pub fn load(&self, path: impl Into<PathBuf>) -> Load<Arc<str>> {
        self.cache.load(path.into())
    }

    /// Drops the cached contents of `path`; the next load reads the file again.
    pub fn clear(&self, path: impl Into<PathBuf>) {
        self.cache.clear(&path.into());
    }

    /// Clears `path` every time the file changes on disk.
    ///
    /// The returned task runs until it is aborted.
    pub fn watch(&self, path: impl Into<PathBuf>) -> Result<JoinHandle<()>, notify::Error> {
        let path = path.into();
        let mut changes = watch(&path)?;
        let files = self.clone();
        Ok(tokio::spawn(async move {
            // the first item only signals that watching started
            changes.next().await;
            while changes.next().await.is_some() {
                tracing::debug!(path = %path.display(), "mapping template changed, clearing file cache");
                files.clear(path.clone());
            }
        }))
    }
}

struct ReadFiles;

#[async_trait::async_trait]
impl BatchFn<PathBuf, Arc<str>> for ReadFiles {
    async fn load(&self, paths: Vec<PathBuf>) -> Result<Vec<Arc<str>>, BoxError> {
        future::try_join_all(paths.into_iter().map(|path| async move {
            tracing::debug!(path = %path.display(), "reading mapping template");
            tokio::fs::read_to_string(&path)
                .await
                .map(Arc::from)
                .map_err(|e| BoxError::from(format!("{}: {e}", path.display())))
        }))
        .await
    }
}

/// Streams one item per modification of the file at `path`, after a first
/// item emitted straight away. The stream only ends when dropped.
pub(crate) fn watch(path: &Path) -> Result<impl Stream<Item = ()> + Send + Unpin, notify::Error> {
    let (mut watch_sender, watch_receiver) = mpsc::channel(1);
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                // Only modifications invalidate a template. A full channel
                // means the consumer is behind: retry until it catches up so
                // no change is lost.
                if let notify::event::EventKind::Modify(_) = event.kind {
                    loop {
                        match watch_sender.try_send(()) {
                            Ok(_) => break,
                            Err(err) if err.is_full() => {
                                tracing::warn!(
                                    "could not process file watch notification. {}",
                                    err.to_string()
                                );
                                std::thread::sleep(Duration::from_millis(50));
                            }
                            // the stream was dropped, nobody is listening anymore
                            Err(_) => break,
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("file watch error: {e}"),
        })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;

    Ok(stream::once(future::ready(()))
        .chain(watch_receiver)
        .chain(stream::once(async move {
            // keeps the watcher alive as long as the stream, never polled
            drop(watcher);
        }))
        .boxed())
}
