//! TLS termination for the API surface (spec §4.6 `server.api.tls`),
//! matching `original_source/runtime/server.py`'s `ssl_args` — `certfile`/
//! `keyfile` are required once TLS is enabled, and an optional `ca_certs`
//! chain turns on client-certificate authentication instead of leaving the
//! connection open to anyone with the server's own certificate.
use core::task::{Context, Poll};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::vec::Vec;
use std::{fs, io, sync::Arc};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::rustls::internal::pemfile;
use tokio_rustls::rustls::{self, AllowAnyAuthenticatedClient, RootCertStore, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

fn error(err: String) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

pub(crate) struct TlsHyperAcceptor {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    in_progress_stream: Option<Accept<TcpStream>>,
}

impl TlsHyperAcceptor {
    /// `ca_chain` mirrors `server.api.tls.ca_chain` (spec §4.6): when set,
    /// only clients presenting a certificate signed by that chain complete
    /// the handshake.
    pub(crate) async fn new(
        addr: impl ToSocketAddrs,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
        ca_chain: Option<impl AsRef<Path>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let tls_cfg = {
            let certs = load_certs(cert_file)?;
            let key = load_private_key(key_file)?;
            let client_auth = match ca_chain {
                Some(path) => {
                    let roots = load_client_ca_roots(path)?;
                    AllowAnyAuthenticatedClient::new(roots)
                }
                None => rustls::NoClientAuth::new(),
            };
            let mut cfg = ServerConfig::new(client_auth);
            cfg.set_single_cert(certs, key).map_err(|e| error(format!("{}", e)))?;
            // http/2 needs a distinct HOST-header story; only http/1.1 for now.
            cfg.set_protocols(&[b"http/1.1".to_vec()]);
            Arc::new(cfg)
        };
        Ok(TlsHyperAcceptor {
            listener,
            acceptor: tls_cfg.into(),
            in_progress_stream: None,
        })
    }
}

impl hyper::server::accept::Accept for TlsHyperAcceptor {
    type Conn = TlsStream<TcpStream>;
    type Error = io::Error;

    fn poll_accept(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
        let mut accept = match self.in_progress_stream.take() {
            Some(s) => {
                tracing::trace!("TLS handshake currently in progress. Polling for current status");
                s
            }
            None => {
                tracing::trace!("No handshake in progress, checking for new connection");
                let socket = match Pin::new(&mut self.listener).poll_accept(cx) {
                    Poll::Ready(Ok((socket, _))) => socket,
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                    Poll::Pending => return Poll::Pending,
                };
                self.acceptor.accept(socket)
            }
        };

        match Pin::new(&mut accept).poll(cx) {
            Poll::Ready(Ok(i)) => {
                tracing::trace!("TLS handshake complete, returning active connection");
                Poll::Ready(Some(Ok(i)))
            }
            // A plaintext request against the TLS port, or a client cert
            // rejected by AllowAnyAuthenticatedClient, both surface here.
            Poll::Ready(Err(e)) if matches!(e.kind(), std::io::ErrorKind::InvalidData) => {
                tracing::trace!("rejected handshake: {:?}", e);
                // The connection is unusable; drop it and wake the task to
                // poll for the next one instead of returning an error that
                // would tear down the whole acceptor.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => {
                self.in_progress_stream = Some(accept);
                Poll::Pending
            }
        }
    }
}

fn load_certs(filename: impl AsRef<Path>) -> io::Result<Vec<rustls::Certificate>> {
    let certfile = fs::File::open(&filename).map_err(|e| {
        error(format!(
            "failed to open {}: {}",
            filename.as_ref().display(),
            e
        ))
    })?;
    let mut reader = io::BufReader::new(certfile);
    pemfile::certs(&mut reader).map_err(|_| error("failed to load certificate".into()))
}

fn load_private_key(filename: impl AsRef<Path>) -> io::Result<rustls::PrivateKey> {
    let keyfile = fs::File::open(&filename).map_err(|e| {
        error(format!(
            "failed to open {}: {}",
            filename.as_ref().display(),
            e
        ))
    })?;
    let mut reader = io::BufReader::new(keyfile);

    let keys = pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|_| error("failed to load private key".into()))?;
    if keys.len() != 1 {
        return Err(error("expected a single private key".into()));
    }
    Ok(keys[0].clone())
}

fn load_client_ca_roots(filename: impl AsRef<Path>) -> io::Result<RootCertStore> {
    let chainfile = fs::File::open(&filename).map_err(|e| {
        error(format!(
            "failed to open {}: {}",
            filename.as_ref().display(),
            e
        ))
    })?;
    let mut reader = io::BufReader::new(chainfile);

    let mut roots = RootCertStore::empty();
    roots
        .add_pem_file(&mut reader)
        .map_err(|_| error("failed to parse client CA chain".into()))?;
    Ok(roots)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn load_certs_rejects_missing_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert_eq!(io::ErrorKind::Other, err.kind());
    }

    #[test]
    fn load_client_ca_roots_rejects_missing_file() {
        let err = load_client_ca_roots(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert_eq!(io::ErrorKind::Other, err.kind());
    }
}
