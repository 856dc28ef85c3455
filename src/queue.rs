use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::cipher::Secret;
use crate::client::RemoteApi;
use crate::config::{ClientConfig, DEFAULT_CHUNK_SIZE};
use crate::errors::{Result, TransferError};
use crate::events::{EventBus, Listener, ListenerId};
use crate::types::{DownloadItem, ItemId, RemoteFile, SenderId, TransferItem, UploadItem};
use crate::worker::{TransferWorker, WorkerEvent};

/// Queue level events, delivered to listeners of a [`TransferQueue`].
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The item became active; its default target is already applied
    Started(Arc<TransferItem>),
    Progress {
        item: Arc<TransferItem>,
        transferred: u64,
        total: u64,
    },
    /// `metadata` is `None` for downloads and for undecodable upload responses
    FileDone {
        item: Arc<TransferItem>,
        metadata: Option<RemoteFile>,
    },
    Stopped(Arc<TransferItem>),
    Failed {
        item: Arc<TransferItem>,
        cause: Arc<TransferError>,
    },
    /// The queue drained without failures
    AllDone,
}

impl TransferEvent {
    pub fn item(&self) -> Option<&Arc<TransferItem>> {
        match self {
            TransferEvent::Started(item)
            | TransferEvent::Stopped(item)
            | TransferEvent::Progress { item, .. }
            | TransferEvent::FileDone { item, .. }
            | TransferEvent::Failed { item, .. } => Some(item),
            TransferEvent::AllDone => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub chunk_size: usize,
    /// Remote upload folder used by [`TransferQueue::start_default`]
    pub default_target: String,
    /// Local folder for downloads started with
    /// [`TransferQueue::start_default`]. Without one, such downloads need
    /// an explicit target.
    pub download_folder: Option<PathBuf>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_target: "/".to_string(),
            download_folder: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub active: Option<ItemId>,
    /// A stop was requested and the active worker has not terminated yet
    pub stopping: bool,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }
}

enum QueueCommand {
    Add {
        item: TransferItem,
        reply: oneshot::Sender<ItemId>,
    },
    Remove {
        id: ItemId,
        reply: oneshot::Sender<bool>,
    },
    Start {
        target: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Pending {
        reply: oneshot::Sender<Vec<TransferItem>>,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
    Shutdown,
}

/// Serialises transfers: one worker at a time, in FIFO order.
///
/// All state lives in a single actor task; the handle only sends commands.
/// Worker events reach the same task over a second channel, so caller
/// operations and queue advancement never race.
pub struct TransferQueue {
    command_tx: mpsc::UnboundedSender<QueueCommand>,
    events: Arc<EventBus<TransferEvent>>,
    actor_handle: JoinHandle<()>,
}

impl TransferQueue {
    pub fn new(api: RemoteApi, secret: Secret) -> Self {
        Self::with_options(api, secret, QueueOptions::default())
    }

    pub fn with_options(api: RemoteApi, secret: Secret, options: QueueOptions) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new(SenderId::new()));

        let (worker_event_tx, worker_event_rx) = mpsc::unbounded_channel();

        let actor = QueueActor {
            api,
            secret,
            options,
            items: VecDeque::new(),
            active: None,
            targets: None,
            events: events.clone(),
            worker_event_tx,
        };
        let actor_handle = tokio::spawn(actor.run(command_rx, worker_event_rx));

        Self {
            command_tx,
            events,
            actor_handle,
        }
    }

    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let api = RemoteApi::from_config(config)?;
        let secret = config.shared_secret()?;
        let options = QueueOptions {
            chunk_size: config.chunk_size,
            default_target: config.default_target.clone(),
            download_folder: config.download_folder.clone(),
        };

        Ok(Self::with_options(api, secret, options))
    }

    pub fn id(&self) -> SenderId {
        self.events.sender()
    }

    pub fn add_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: Listener<TransferEvent> + 'static,
    {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    /// Appends an item to the queue.
    pub async fn add(&self, item: TransferItem) -> Result<ItemId> {
        self.request(|reply| QueueCommand::Add { item, reply }).await
    }

    pub async fn add_upload(&self, item: UploadItem) -> Result<ItemId> {
        self.add(TransferItem::upload(item)).await
    }

    pub async fn add_download(&self, item: DownloadItem) -> Result<ItemId> {
        self.add(TransferItem::download(item)).await
    }

    /// Drops a pending item. The active item cannot be removed.
    pub async fn remove(&self, id: ItemId) -> Result<bool> {
        self.request(|reply| QueueCommand::Remove { id, reply }).await
    }

    /// Starts processing with `target` as the default destination, both as
    /// the remote upload folder and as the local download folder.
    ///
    /// Returns `false` when a worker is already active (or still stopping)
    /// or there is nothing queued.
    pub async fn start(&self, target: impl Into<String>) -> Result<bool> {
        let target = Some(target.into());
        self.request(|reply| QueueCommand::Start { target, reply }).await
    }

    /// Like [`start`](Self::start) with the configured remote target and
    /// download folder.
    pub async fn start_default(&self) -> Result<bool> {
        self.request(|reply| QueueCommand::Start { target: None, reply }).await
    }

    /// Asks the active worker to stop. Pending items are kept.
    pub async fn stop(&self) -> Result<bool> {
        self.request(|reply| QueueCommand::Stop { reply }).await
    }

    pub async fn pending(&self) -> Result<Vec<TransferItem>> {
        self.request(|reply| QueueCommand::Pending { reply }).await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.request(|reply| QueueCommand::Status { reply }).await
    }

    /// Whether a worker is running or still draining after `stop`.
    pub async fn is_active(&self) -> Result<bool> {
        Ok(!self.status().await?.is_idle())
    }

    /// Stops the active worker and ends the actor task.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.command_tx.send(QueueCommand::Shutdown);
        drop(self.command_tx);

        self.actor_handle
            .await
            .map_err(|_| TransferError::QueueShutdown)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> QueueCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| TransferError::QueueShutdown)?;

        reply_rx
            .await
            .map_err(|_| TransferError::QueueShutdown)
    }
}

type WorkerMessage = (SenderId, WorkerEvent);

/// Relays one worker's events to the queue actor.
struct WorkerForwarder {
    worker_event_tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl Listener<WorkerEvent> for WorkerForwarder {
    fn handle_event(&self, event: &WorkerEvent, sender: SenderId) {
        let _ = self.worker_event_tx.send((sender, event.clone()));
    }
}

struct ActiveTransfer {
    worker: Arc<TransferWorker>,
    item: Arc<TransferItem>,
    // The worker only holds it weakly
    _forwarder: Arc<WorkerForwarder>,
    stopping: bool,
}

/// Destinations applied to items that lack one.
struct DefaultTargets {
    remote: String,
    local: Option<PathBuf>,
}

struct QueueActor {
    api: RemoteApi,
    secret: Secret,
    options: QueueOptions,
    items: VecDeque<TransferItem>,
    active: Option<ActiveTransfer>,
    targets: Option<DefaultTargets>,
    events: Arc<EventBus<TransferEvent>>,
    worker_event_tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl QueueActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<QueueCommand>,
        mut worker_event_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    // Handle dropped or shutdown requested
                    let Some(command) = command else { break };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some((worker, event)) = worker_event_rx.recv() => {
                    self.handle_worker_event(worker, event);
                }
            }
        }

        if let Some(active) = self.active.take() {
            active.worker.request_stop();
        }
        debug!(queue = %self.events.sender(), "Queue actor finished");
    }

    /// Returns `false` once the actor should exit.
    fn handle_command(&mut self, command: QueueCommand) -> bool {
        match command {
            QueueCommand::Add { item, reply } => {
                let id = item.id;
                debug!(queue = %self.events.sender(), item = %id, "Item queued");
                self.items.push_back(item);
                let _ = reply.send(id);
            }
            QueueCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove(id));
            }
            QueueCommand::Start { target, reply } => {
                let _ = reply.send(self.start(target));
            }
            QueueCommand::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
            QueueCommand::Pending { reply } => {
                let _ = reply.send(self.items.iter().cloned().collect());
            }
            QueueCommand::Status { reply } => {
                let _ = reply.send(QueueStatus {
                    pending: self.items.len(),
                    active: self.active.as_ref().map(|active| active.item.id),
                    stopping: self.active.as_ref().is_some_and(|active| active.stopping),
                });
            }
            QueueCommand::Shutdown => return false,
        }

        true
    }

    fn remove(&mut self, id: ItemId) -> bool {
        if self.active.as_ref().is_some_and(|active| active.item.id == id) {
            return false;
        }

        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }

    fn start(&mut self, target: Option<String>) -> bool {
        if self.active.is_some() || self.items.is_empty() {
            return false;
        }

        self.targets = Some(match target {
            Some(target) => DefaultTargets {
                local: Some(PathBuf::from(&target)),
                remote: target,
            },
            None => DefaultTargets {
                remote: self.options.default_target.clone(),
                local: self.options.download_folder.clone(),
            },
        });
        self.start_head()
    }

    fn stop(&mut self) -> bool {
        match self.active.as_mut() {
            Some(active) => {
                info!(queue = %self.events.sender(), item = %active.item.id, "Stopping transfer");
                active.worker.request_stop();
                active.stopping = true;
                true
            }
            None => false,
        }
    }

    fn start_head(&mut self) -> bool {
        let Some(head) = self.items.front_mut() else {
            return false;
        };

        if let Some(targets) = &self.targets {
            if let Err(err) = head.apply_default_targets(&targets.remote, targets.local.as_deref()) {
                if let Some(item) = self.items.pop_front().map(Arc::new) {
                    warn!(item = %item.id, error = %err, remaining = self.items.len(), "Transfer rejected, queue halted");
                    self.events.fire(&TransferEvent::Failed { item, cause: Arc::new(err) });
                }
                return false;
            }
        }
        let item = Arc::new(head.clone());

        self.events.fire(&TransferEvent::Started(item.clone()));

        let worker = TransferWorker::with_chunk_size(
            item.clone(),
            self.api.clone(),
            self.secret.clone(),
            self.options.chunk_size,
        );
        let forwarder = Arc::new(WorkerForwarder {
            worker_event_tx: self.worker_event_tx.clone(),
        });
        worker.add_listener(&forwarder);
        worker.start();

        info!(queue = %self.events.sender(), item = %item.id, worker = %worker.id(), "Transfer dispatched");
        self.active = Some(ActiveTransfer {
            worker,
            item,
            _forwarder: forwarder,
            stopping: false,
        });

        true
    }

    fn handle_worker_event(&mut self, worker: SenderId, event: WorkerEvent) {
        let Some(active) = self.active.as_ref() else {
            debug!(worker = %worker, "Ignoring event from inactive worker");
            return;
        };
        if active.worker.id() != worker {
            debug!(worker = %worker, "Ignoring event from inactive worker");
            return;
        }

        let item = active.item.clone();
        match event {
            // Chunks already in flight when stop was requested
            WorkerEvent::Progress { .. } if active.stopping => {}
            WorkerEvent::Progress { transferred, total, .. } => {
                self.events.fire(&TransferEvent::Progress { item, transferred, total });
            }
            WorkerEvent::Done { response } => {
                let stopping = self.finish_active();
                self.items.pop_front();

                let metadata = response.and_then(|payload| match RemoteFile::from_response(&payload) {
                    Ok(file) => Some(file),
                    Err(err) => {
                        warn!(item = %item.id, error = %err, "Could not decode server response");
                        None
                    }
                });
                self.events.fire(&TransferEvent::FileDone { item, metadata });

                if stopping {
                    return;
                }
                if self.items.is_empty() {
                    info!(queue = %self.events.sender(), "All transfers done");
                    self.events.fire(&TransferEvent::AllDone);
                } else {
                    self.start_head();
                }
            }
            WorkerEvent::Stopped => {
                // Stays at the head; the next start restarts it
                self.finish_active();
                self.events.fire(&TransferEvent::Stopped(item));
            }
            WorkerEvent::Failed(cause) => {
                self.finish_active();
                self.items.pop_front();
                warn!(item = %item.id, error = %cause, remaining = self.items.len(), "Transfer failed, queue halted");
                self.events.fire(&TransferEvent::Failed { item, cause });
            }
        }
    }

    /// Releases the active worker; returns whether a stop had been requested.
    fn finish_active(&mut self) -> bool {
        self.active
            .take()
            .is_some_and(|active| active.stopping)
    }
}
