pub mod cipher;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod local;
pub mod queue;
pub mod types;
pub mod worker;

mod body;

pub use cipher::{Algorithm, CipherWriter, Direction, Secret, StreamTransform};
pub use client::RemoteApi;
pub use config::ClientConfig;
pub use errors::{Result, TransferError};
pub use events::{EventBus, Listener, ListenerId};
pub use local::{LocalSink, LocalSource, SharedBuffer};
pub use queue::{QueueOptions, QueueStatus, TransferEvent, TransferQueue};
pub use types::{
    DownloadItem,
    ItemId,
    RemoteFile,
    RemoteFileRef,
    SenderId,
    TransferItem,
    TransferKind,
    UploadItem,
};
pub use worker::{TransferWorker, WorkerEvent};
