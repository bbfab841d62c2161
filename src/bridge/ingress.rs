//! Server-side half of the Bridge: a per-request ephemeral Unix-domain
//! socket that lets a module's own server entry point handle one forwarded
//! request in isolation (spec §4.5 server side, §9 redesign note replacing
//! `__del__`-based cleanup with scoped acquire/release).
//!
//! Lifecycle: `prepared → listening → answered → finalized`. `finalize` is
//! called on every exit path, including error, by the caller — never relied
//! on via `Drop` alone, since the unlink is filesystem I/O and the teacher's
//! redesign note explicitly asks for this to be an owned, explicit step.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use super::client::{RpcRequest, RpcResponse};

const POLL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

pub struct Ingress {
    pub request_id: String,
    socket_path: PathBuf,
    _keep_unique: tempfile::TempPath,
}

impl Ingress {
    /// Allocates a fresh temp file whose path becomes the Unix socket
    /// address; the underlying descriptor is kept only to guarantee
    /// uniqueness and is dropped (closed) before bind (spec §4.5 step 3).
    pub fn prepare(request_id: String) -> anyhow::Result<Self> {
        let file = tempfile::NamedTempFile::new().context("allocating ingress socket path")?;
        let path = file.path().to_path_buf();
        let temp_path = file.into_temp_path();
        // The path must not exist for UnixListener::bind; drop the file but
        // remember the path via TempPath so nothing else reuses it first.
        std::fs::remove_file(&temp_path).ok();

        Ok(Self {
            request_id,
            socket_path: path,
            _keep_unique: temp_path,
        })
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Launches a background listener bound to the socket, hands the one
    /// accepted connection's framed request bytes to `run_server` (which
    /// invokes the module's server entry point with those bytes as stdin
    /// and captures its stdout as the response bytes), then relays the
    /// response back over the same connection. Retries connecting with a
    /// 100ms backoff until a response is available or the deadline elapses,
    /// at which point it yields a 5xx (spec §5 Timeouts).
    pub async fn handle<F>(&self, request: &RpcRequest, run_server: F) -> anyhow::Result<RpcResponse>
    where
        F: FnOnce(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + 'static,
    {
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding ingress socket {}", self.socket_path.display()))?;

        let request_bytes = serde_json::to_vec(request)?;
        let server_task = tokio::spawn(async move {
            let (mut stream, _addr) = listener.accept().await?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            stream.shutdown().await.ok();

            let response_bytes = tokio::task::spawn_blocking(move || run_server(buf))
                .await
                .context("server entry point panicked")??;

            Ok::<Vec<u8>, anyhow::Error>(response_bytes)
        });

        let client_result = self.query_until_answered(request_bytes).await;

        // Whichever side finishes, wait for the server task so the socket
        // isn't dropped out from under it mid-write.
        let _ = server_task.await;

        match client_result {
            Ok(bytes) => serde_json::from_slice(&bytes).context("decoding server response"),
            Err(e) => Ok(RpcResponse {
                status: 500,
                headers: Default::default(),
                body: format!("ingress error: {}", e).into_bytes(),
            }),
        }
    }

    async fn query_until_answered(&self, request_bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + DEFAULT_DEADLINE;
        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(mut stream) => {
                    stream.write_all(&request_bytes).await?;
                    stream.shutdown().await.ok();
                    let mut response = Vec::new();
                    stream.read_to_end(&mut response).await?;
                    return Ok(response);
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
                Err(e) => return Err(e).context("ingress socket never came up"),
            }
        }
    }

    /// Unlinks the socket file (spec Testable Property #6: the ephemeral
    /// socket file does not exist once the response is flushed).
    pub fn finalize(self) {
        std::fs::remove_file(&self.socket_path).ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn socket_file_is_gone_after_finalize() {
        let ingress = Ingress::prepare("TESTREQID01".to_owned()).unwrap();
        let path = ingress.socket_path().to_path_buf();

        let request = RpcRequest {
            method: "GET".to_owned(),
            url: "/".to_owned(),
            params: Default::default(),
            headers: Default::default(),
            data: Vec::new(),
        };

        let response = ingress
            .handle(&request, |_bytes| {
                Ok(serde_json::to_vec(&RpcResponse {
                    status: 200,
                    headers: Default::default(),
                    body: b"hello".to_vec(),
                })
                .unwrap())
            })
            .await
            .unwrap();

        assert_eq!(200, response.status);
        assert_eq!(b"hello".to_vec(), response.body);

        ingress.finalize();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn socket_file_is_gone_even_on_error() {
        let ingress = Ingress::prepare("TESTREQID02".to_owned()).unwrap();
        let path = ingress.socket_path().to_path_buf();

        let request = RpcRequest::default();
        let response = ingress
            .handle(&request, |_bytes| Err(anyhow::anyhow!("boom")))
            .await
            .unwrap();
        assert_eq!(500, response.status);

        ingress.finalize();
        assert!(!path.exists());
    }
}
