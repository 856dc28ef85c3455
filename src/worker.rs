use std::sync::Arc;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::body::{BodyFailure, UploadBody};
use crate::cipher::{CipherWriter, Direction, Secret, StreamTransform};
use crate::client::RemoteApi;
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::errors::{Result, TransferError};
use crate::events::{EventBus, Listener, ListenerId};
use crate::types::{DownloadItem, SenderId, TransferItem, TransferKind, UploadItem};

/// Events fired by a single [`TransferWorker`].
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress {
        source: String,
        target: Option<String>,
        transferred: u64,
        total: u64,
    },
    /// Transfer finished. Uploads carry the raw server response.
    Done {
        response: Option<Bytes>,
    },
    Stopped,
    Failed(Arc<TransferError>),
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerEvent::Progress { .. })
    }
}

enum Outcome {
    Completed(Option<Bytes>),
    Stopped,
}

/// Streams one item between the storage service and local storage.
pub struct TransferWorker {
    id: SenderId,
    item: Arc<TransferItem>,
    api: RemoteApi,
    secret: Secret,
    chunk_size: usize,
    cancellation_token: CancellationToken,
    events: EventBus<WorkerEvent>,
}

impl TransferWorker {
    pub fn new(item: Arc<TransferItem>, api: RemoteApi, secret: Secret) -> Arc<Self> {
        Self::with_chunk_size(item, api, secret, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(item: Arc<TransferItem>, api: RemoteApi, secret: Secret, chunk_size: usize) -> Arc<Self> {
        let id = SenderId::new();

        Arc::new(Self {
            id,
            item,
            api,
            secret,
            chunk_size: chunk_size.max(1),
            cancellation_token: CancellationToken::new(),
            events: EventBus::new(id),
        })
    }

    pub fn id(&self) -> SenderId {
        self.id
    }

    pub fn item(&self) -> &Arc<TransferItem> {
        &self.item
    }

    pub fn add_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: Listener<WorkerEvent> + 'static,
    {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    /// Asks the transfer to stop at the next chunk boundary.
    pub fn request_stop(&self) {
        self.cancellation_token.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Spawns the transfer on the tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!(worker = %self.id, item = %self.item.id, "Transfer started");

        let result = if self.stop_requested() {
            Ok(Outcome::Stopped)
        } else {
            match &self.item.kind {
                TransferKind::Upload(upload) => self.upload(upload).await,
                TransferKind::Download(download) => self.download(download).await,
            }
        };

        let event = match result {
            Ok(Outcome::Completed(response)) => {
                info!(worker = %self.id, item = %self.item.id, "Transfer done");
                WorkerEvent::Done { response }
            }
            Ok(Outcome::Stopped) => {
                info!(worker = %self.id, item = %self.item.id, "Transfer stopped");
                WorkerEvent::Stopped
            }
            Err(err) => {
                error!(worker = %self.id, item = %self.item.id, error = %err, "Transfer failed");
                WorkerEvent::Failed(Arc::new(err))
            }
        };

        self.events.fire(&event);
    }

    async fn download(&self, item: &DownloadItem) -> Result<Outcome> {
        let target = item.target.as_ref()
            .ok_or_else(|| TransferError::InvalidItem("download has no target".to_string()))?;
        // Reject a bad algorithm or missing secret before touching the network
        StreamTransform::for_item(Direction::Decrypt, item.encryption.as_deref(), &self.secret)?;

        let response = self.api.download(&item.file, item.version.as_deref()).await?;
        let status = response.status();
        if !status.is_success() {
            warn!(worker = %self.id, status = status.as_u16(), "Download rejected");
            return Err(TransferError::Protocol { status: status.as_u16() });
        }

        let declared = response.content_length();
        debug!(worker = %self.id, total = ?declared, sink = %target, "Receiving body");

        let mut sink = target.open().await?;
        let mut writer = CipherWriter::wrap(&mut sink, Direction::Decrypt, item.encryption.as_deref(), &self.secret)?;
        let mut body = response.bytes_stream();
        let mut transferred = 0u64;
        let mut stopped = false;

        'body: while let Some(chunk) = body.next().await {
            let chunk = chunk?;

            for piece in chunk.chunks(self.chunk_size) {
                if self.stop_requested() {
                    stopped = true;
                    break 'body;
                }

                writer.write_all(piece).await?;
                transferred += piece.len() as u64;
                self.fire_progress(transferred, declared);
            }
        }

        // Cipher layer first so its last frame reaches the sink; a stopped
        // transfer has no last frame to verify.
        if stopped {
            drop(writer);
        } else {
            writer.finish().await?;
        }
        sink.flush().await?;
        sink.shutdown().await?;
        drop(body);

        if stopped {
            Ok(Outcome::Stopped)
        } else {
            Ok(Outcome::Completed(None))
        }
    }

    async fn upload(self: &Arc<Self>, item: &UploadItem) -> Result<Outcome> {
        let transform = StreamTransform::for_item(Direction::Encrypt, item.encryption.as_deref(), &self.secret)?;
        let (reader, declared) = item.source.open().await?;
        debug!(worker = %self.id, total = ?declared, source = %item.source, "Sending body");

        let failure = BodyFailure::default();
        let on_progress = {
            let worker = Arc::downgrade(self);
            Box::new(move |transferred: u64| {
                if let Some(worker) = worker.upgrade() {
                    worker.fire_progress(transferred, declared);
                }
            })
        };
        let body = UploadBody::new(
            ReaderStream::with_capacity(reader, self.chunk_size),
            transform,
            self.cancellation_token.clone(),
            failure.clone(),
            on_progress,
        );

        let response = match self.api.upload(item, reqwest::Body::wrap_stream(body)).await {
            Ok(response) => response,
            Err(_) if self.stop_requested() => return Ok(Outcome::Stopped),
            Err(err) => return Err(failure.take().unwrap_or(err)),
        };

        let status = response.status();
        if !status.is_success() {
            warn!(worker = %self.id, status = status.as_u16(), "Upload rejected");
            return Err(TransferError::Protocol { status: status.as_u16() });
        }

        let payload = response.bytes().await?;
        Ok(Outcome::Completed(Some(payload)))
    }

    fn fire_progress(&self, transferred: u64, declared: Option<u64>) {
        self.events.fire(&WorkerEvent::Progress {
            source: self.item.source_label(),
            target: self.item.target_label(),
            transferred,
            total: declared.unwrap_or(transferred).max(transferred),
        });
    }
}
