//! In-process fake of the Cloud Storage JSON API endpoints used by `GcsClient`.

use reqwest::Url;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::gcs::GcsClient;

/// Objects returned per list page, small enough to force pagination
const PAGE_SIZE: usize = 2;

/// A request as received by the fake server
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: Url,
}

impl Recorded {
    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self, name: &str) -> Option<String> {
        self.url.query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), Vec<u8>>,
    requests: Vec<Recorded>,
}

/// Fake storage server on a random local port
pub struct FakeGcs {
    endpoint: String,
    state: Arc<Mutex<State>>,
}

impl FakeGcs {
    pub fn start() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(State::default()));

        let shared = state.clone();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = TcpListener::from_std(listener).unwrap();
                while let Ok((stream, _)) = listener.accept().await {
                    let state = shared.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, state).await;
                    });
                }
            });
        });

        Self { endpoint, state }
    }

    pub fn client(&self) -> GcsClient {
        GcsClient::new(&self.endpoint, Some("test-token".to_string())).unwrap()
    }

    pub fn insert(&self, bucket: &str, name: &str, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert((bucket.to_string(), name.to_string()), body.to_vec());
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.objects.get(&(bucket.to_string(), name.to_string())).cloned()
    }

    /// Object names in `bucket`, sorted
    pub fn names(&self, bucket: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).await?;

    let (status, payload) = respond(&method, &target, body, &state);
    let mut stream = reader.into_inner();
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        payload.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.shutdown().await
}

fn respond(method: &str, target: &str, body: Vec<u8>, state: &Mutex<State>) -> (&'static str, Vec<u8>) {
    let url = Url::parse(&format!("http://fake{}", target)).unwrap();
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.map(percent_decode).collect())
        .unwrap_or_default();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let mut state = state.lock().unwrap();
    state.requests.push(Recorded {
        method: method.to_string(),
        url: url.clone(),
    });

    match (method, segments.as_slice()) {
        ("POST", ["upload", "storage", "v1", "b", bucket, "o"]) => {
            let Some(name) = query.get("name") else {
                return ("400 Bad Request", b"{}".to_vec());
            };
            state.objects.insert((bucket.to_string(), name.clone()), body);
            ("200 OK", serde_json::json!({ "name": name }).to_string().into_bytes())
        }
        ("GET", ["storage", "v1", "b", bucket, "o"]) => {
            let prefix = query.get("prefix").cloned().unwrap_or_default();
            let offset: usize = query.get("pageToken").and_then(|t| t.parse().ok()).unwrap_or(0);
            let matching: Vec<&String> = state
                .objects
                .keys()
                .filter(|(b, name)| b.as_str() == *bucket && name.starts_with(&prefix))
                .map(|(_, name)| name)
                .collect();
            let page: Vec<_> = matching
                .iter()
                .skip(offset)
                .take(PAGE_SIZE)
                .map(|name| serde_json::json!({ "name": name }))
                .collect();
            let mut list = serde_json::json!({ "items": page });
            if offset + PAGE_SIZE < matching.len() {
                list["nextPageToken"] = serde_json::json!((offset + PAGE_SIZE).to_string());
            }
            ("200 OK", list.to_string().into_bytes())
        }
        ("GET", ["storage", "v1", "b", bucket, "o", name]) if query.get("alt").map(String::as_str) == Some("media") => {
            match state.objects.get(&(bucket.to_string(), name.to_string())) {
                Some(bytes) => ("200 OK", bytes.clone()),
                None => ("404 Not Found", b"{}".to_vec()),
            }
        }
        _ => ("404 Not Found", b"{}".to_vec()),
    }
}

fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&segment[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap()
}
