//! Minimal HTTP/1.1 server for streaming tests.
//!
//! Serves one scripted stream per connection: headers first, then body
//! chunks written with delays so the client sees them as separate reads,
//! and the connection can be dropped mid-body. Fixed status and JSON
//! replies are served by `wiremock` in the tests that need them.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    delay: Duration,
    data: String,
    hold: bool,
}

impl Chunk {
    pub fn now(data: &str) -> Self {
        Self::after_ms(data, 0)
    }

    pub fn later(data: &str) -> Self {
        Self::after_ms(data, 20)
    }

    pub fn after_ms(data: &str, ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            data: data.to_string(),
            hold: false,
        }
    }

    /// Keep the connection open, writing nothing, until the client hangs up.
    pub fn hold_open() -> Self {
        Self {
            hold: true,
            ..Self::now("")
        }
    }
}

#[derive(Debug, Clone)]
struct Script {
    content_type: &'static str,
    chunks: Vec<Chunk>,
}

pub(crate) struct TestServer {
    addr: std::net::SocketAddr,
    requests: Mutex<mpsc::UnboundedReceiver<String>>,
    hangups: Mutex<mpsc::UnboundedReceiver<()>>,
}

impl TestServer {
    pub async fn sse(chunks: Vec<Chunk>) -> Self {
        Self::start(Script {
            content_type: "text/event-stream",
            chunks,
        })
        .await
    }

    pub async fn ndjson(chunks: Vec<Chunk>) -> Self {
        Self::start(Script {
            content_type: "application/x-ndjson",
            chunks,
        })
        .await
    }

    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (hangup_tx, hangup_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let script = script.clone();
                let tx = tx.clone();
                let hangup_tx = hangup_tx.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, script, tx, hangup_tx).await;
                });
            }
        });

        Self {
            addr,
            requests: Mutex::new(rx),
            hangups: Mutex::new(hangup_rx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The next request received, as raw text (head and body).
    pub async fn request(&self) -> String {
        self.requests.lock().await.recv().await.unwrap_or_default()
    }

    /// Resolves once a client closes a connection held by `Chunk::hold_open`.
    pub async fn hangup(&self) {
        let _ = self.hangups.lock().await.recv().await;
    }
}

async fn serve(
    mut socket: TcpStream,
    script: Script,
    requests: mpsc::UnboundedSender<String>,
    hangups: mpsc::UnboundedSender<()>,
) -> std::io::Result<()> {
    let request = read_request(&mut socket).await?;
    let _ = requests.send(request);

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        script.content_type
    );
    socket.write_all(head.as_bytes()).await?;
    socket.flush().await?;
    for chunk in script.chunks {
        if chunk.hold {
            let mut tmp = [0u8; 512];
            while matches!(socket.read(&mut tmp).await, Ok(n) if n > 0) {}
            let _ = hangups.send(());
            return Ok(());
        }
        if !chunk.delay.is_zero() {
            tokio::time::sleep(chunk.delay).await;
        }
        socket.write_all(chunk.data.as_bytes()).await?;
        socket.flush().await?;
    }
    socket.shutdown().await
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
