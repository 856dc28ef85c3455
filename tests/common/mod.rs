//! In-process storage server speaking just enough HTTP/1.1 for the queue
//! tests: chunked `PUT /api/files` and `GET /api/files/{id}/download`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use url::Url;
use cloudsync::{RemoteApi, Secret, TransferEvent, TransferQueue, QueueOptions};

pub const TOKEN: &str = "test-token";

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub id: String,
    pub path: Option<String>,
    pub public: bool,
    pub encryption: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct StubState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<RecordedUpload>>,
    next_id: AtomicU64,
    /// Answer uploads with a body that is not JSON
    pub garbage_responses: AtomicBool,
    /// Pause between 4 KiB pieces of download bodies, in milliseconds
    pub throttle_ms: AtomicU64,
}

impl StubState {
    pub fn put_file(&self, id: &str, content: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(id.to_string(), content.into());
    }

    pub fn file(&self, id: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(id).cloned()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }
}

pub struct StubServer {
    pub addr: SocketAddr,
    pub state: Arc<StubState>,
    handle: JoinHandle<()>,
}

impl StubServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(StubState::default());

        let handle = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = state.clone();
                    tokio::spawn(async move {
                        // Clients hanging up mid-body are expected
                        let _ = handle_connection(stream, state).await;
                    });
                }
            })
        };

        Self { addr, state, handle }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/api/", self.addr)
    }

    pub fn api(&self) -> RemoteApi {
        RemoteApi::new(&self.endpoint(), TOKEN).unwrap()
    }

    pub fn queue(&self, secret: &[u8]) -> TransferQueue {
        TransferQueue::with_options(self.api(), Secret::new(secret.to_vec()), QueueOptions::default())
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Request {
    method: String,
    url: Url,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn handle_connection(stream: TcpStream, state: Arc<StubState>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let request = read_request(&mut reader).await?;
    let mut stream = reader.into_inner();

    if request.headers.get("x-auth").map(String::as_str) != Some(TOKEN) {
        return respond(&mut stream, 401, "text/plain", b"unauthorized").await;
    }

    let segments: Vec<String> = request.url
        .path_segments()
        .map(|segments| segments.map(str::to_string).collect())
        .unwrap_or_default();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["api", "files", id, "download"]) => {
            let Some(content) = state.file(id) else {
                return respond(&mut stream, 404, "text/plain", b"not found").await;
            };
            send_download(&mut stream, &content, state.throttle_ms.load(Ordering::SeqCst)).await
        }
        ("PUT", ["api", "files"]) => {
            let id = (state.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
            store_upload(&mut stream, &state, id, request).await
        }
        ("PUT", ["api", "files", id]) => {
            let id = id.to_string();
            store_upload(&mut stream, &state, id, request).await
        }
        _ => respond(&mut stream, 405, "text/plain", b"unsupported").await,
    }
}

async fn read_request(reader: &mut BufReader<TcpStream>) -> std::io::Result<Request> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or("/").to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"));
    let body = if chunked {
        read_chunked(reader).await?
    } else {
        let len = headers
            .get("content-length")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0; len];
        reader.read_exact(&mut body).await?;
        body
    };

    let url = Url::parse(&format!("http://stub{}", target))
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    Ok(Request { method, url, headers, body })
}

async fn read_chunked(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();

    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;
        let size_hex = size_line.trim().split(';').next().unwrap_or("0");
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

        if size == 0 {
            // Trailers end with an empty line
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).await? == 0 || trailer.trim().is_empty() {
                    return Ok(body);
                }
            }
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
}

async fn store_upload(stream: &mut TcpStream, state: &StubState, id: String, request: Request) -> std::io::Result<()> {
    let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
    let upload = RecordedUpload {
        id: id.clone(),
        path: query.get("path").cloned(),
        public: query.get("public").map(String::as_str) == Some("1"),
        encryption: query.get("encryption").cloned(),
        body: request.body,
    };

    state.put_file(&id, upload.body.clone());
    state.uploads.lock().unwrap().push(upload.clone());

    if state.garbage_responses.load(Ordering::SeqCst) {
        return respond(stream, 200, "text/html", b"<html>upload ok</html>").await;
    }

    let payload = json!({
        "data": {
            "id": upload.id,
            "version": "1",
            "path": upload.path,
            "size": upload.body.len(),
            "public": upload.public,
            "encryption": upload.encryption,
            "uploaded_at": "2024-05-01T10:00:00Z",
        }
    });
    respond(stream, 200, "application/json", payload.to_string().as_bytes()).await
}

async fn send_download(stream: &mut TcpStream, content: &[u8], throttle_ms: u64) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content.len()
    );
    stream.write_all(head.as_bytes()).await?;

    for piece in content.chunks(4096) {
        stream.write_all(piece).await?;
        stream.flush().await?;
        if throttle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(throttle_ms)).await;
        }
    }

    stream.shutdown().await
}

async fn respond(stream: &mut TcpStream, status: u16, content_type: &str, body: &[u8]) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Method Not Allowed",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await
}

/// Collects queue events into a channel.
pub fn collect_events(queue: &TransferQueue) -> (mpsc::UnboundedReceiver<TransferEvent>, Arc<impl Fn(&TransferEvent, cloudsync::SenderId) + Send + Sync + use<>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |event: &TransferEvent, _: cloudsync::SenderId| {
        let _ = tx.send(event.clone());
    });
    queue.add_listener(&listener);

    (rx, listener)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> TransferEvent {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for queue event")
        .expect("event channel closed")
}

/// Reads events up to and including the first terminal queue event
/// (`AllDone`, `Failed` or `Stopped`).
pub async fn events_until_settled(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();

    loop {
        let event = next_event(rx).await;
        let settled = matches!(
            event,
            TransferEvent::AllDone | TransferEvent::Failed { .. } | TransferEvent::Stopped(_)
        );
        events.push(event);
        if settled {
            return events;
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
