//! Test doubles: a one-shot HTTP stub and a scripted oracle

use async_trait::async_trait;
use sortie_core::intent::PromptFraming;
use sortie_core::{OracleError, OraclePrompt, ReasoningOracle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

pub fn prompt() -> OraclePrompt {
    OraclePrompt {
        framing: PromptFraming::Command,
        system: "Translate commands into actions.".to_string(),
        user: "User command: scan 10.0.0.5".to_string(),
        schema: None,
    }
}

/// Oracle that always fails the same way, or always answers the same text
pub struct Flaky {
    name: String,
    outcome: Result<String, OracleError>,
    pub calls: AtomicUsize,
}

impl Flaky {
    pub fn failing(name: &str, error: OracleError) -> Self {
        Self {
            name: name.to_string(),
            outcome: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn answering(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ReasoningOracle for Flaky {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _prompt: &OraclePrompt) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Serves exactly one HTTP request with a canned response
pub struct StubServer {
    port: u16,
    seen: oneshot::Receiver<String>,
}

impl StubServer {
    pub async fn respond(status: u16, body: &str) -> Self {
        let response = format!(
            "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        Self::start(Some(response)).await
    }

    /// Reads the request and never answers
    pub async fn hang() -> Self {
        Self::start(None).await
    }

    async fn start(response: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, seen) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let _ = tx.send(request);
            match response {
                Some(response) => {
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
                None => tokio::time::sleep(Duration::from_secs(3600)).await,
            }
        });

        Self { port, seen }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// The raw request the stub received
    pub async fn request(self) -> String {
        self.seen.await.unwrap()
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
