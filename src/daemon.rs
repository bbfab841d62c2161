//! PID-file lifecycle, foreground/background switch, and graceful shutdown
//! (spec C7). Grounded in the teacher's `main.rs` server-bootstrap code
//! (the TLS/plain-HTTP `hyper::Server` branching) and in
//! `original_source/runtime/server.py`'s `run()` for the intent-sensing
//! stop-on-start behavior the teacher has no equivalent of.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::config::Config;
use crate::http_surface::ServerState;
use crate::tls::TlsHyperAcceptor;

/// If the PID file names a live process, this is the user's way of asking to
/// stop it (spec §4.7, §7 "intent-sensing"), not an error.
fn pid_file_holds_live_process(config: &Config) -> Option<u32> {
    let text = std::fs::read_to_string(config.pid_file()).ok()?;
    let pid: u32 = text.trim().parse().ok()?;
    std::path::Path::new(&format!("/proc/{}", pid)).exists().then_some(pid)
}

fn stop(config: &Config, pid: u32) -> anyhow::Result<()> {
    std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .context("sending termination signal")?;
    std::fs::remove_file(config.pid_file()).ok();
    tracing::info!(pid, "daemon stopped");
    Ok(())
}

/// `--start-server` entry point. Either stops an already-running daemon
/// (intent-sensing), or starts one in the foreground or detached in the
/// background per `server.daemon.foreground`.
pub async fn start(config: Arc<Config>, foreground: bool) -> anyhow::Result<()> {
    if let Some(pid) = pid_file_holds_live_process(&config) {
        tracing::info!(pid, "daemon already running, treating this invocation as a stop request");
        return stop(&config, pid);
    }

    if foreground || config.get_bool("server.daemon.foreground").unwrap_or(false) {
        run_foreground(config).await
    } else {
        spawn_background(&config)
    }
}

/// Detach a background copy of the current binary with stdio redirected to
/// the rotating log file, then record its PID and return immediately
/// (spec §4.7 "fork, write the new PID"; the idiomatic Rust substitute for
/// Python's `Daemonize`, since the teacher has no daemonization dependency
/// either).
fn spawn_background(config: &Config) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("resolving current executable path")?;
    let log_dir = config.home_dir().join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("kiwi.log"))
        .context("opening daemon log file")?;

    let child = std::process::Command::new(exe)
        .arg("--server")
        .arg("--start-server")
        .env("KIWI_SERVER_DAEMON_FOREGROUND", "true")
        .env("KIWI_HOME_DIR", config.home_dir())
        .stdout(log_file.try_clone().context("cloning log file handle")?)
        .stderr(log_file)
        .stdin(std::process::Stdio::null())
        .spawn()
        .context("spawning background daemon process")?;

    std::fs::create_dir_all(config.home_dir())?;
    std::fs::write(config.pid_file(), child.id().to_string())?;
    tracing::info!(pid = child.id(), "daemon started in background");
    Ok(())
}

/// Runs the API server and Cyclops in-process until interrupted
/// (spec §4.7 "Foreground mode ... orderly shutdown of each enabled
/// sub-server").
pub async fn run_foreground(config: Arc<Config>) -> anyhow::Result<()> {
    std::fs::create_dir_all(config.home_dir())?;
    std::fs::write(config.pid_file(), std::process::id().to_string())?;

    let host = config.get_str("server.host").unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = config.get_i64("server.port").unwrap_or(8013);
    let addr: SocketAddr = format!("{}:{}", host, port).parse().context("parsing server.host/server.port")?;

    let state = Arc::new(ServerState { config: config.clone() });

    let mut handles = Vec::new();

    if config.get_bool("server.api.enabled").unwrap_or(true) {
        let state = state.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = serve_api(state, &config, addr).await {
                tracing::error!(error = %e, "API server exited with an error");
            }
        }));
    }

    if config.get_bool("server.cyclops.enabled").unwrap_or(true) {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = crate::cyclops::run(config).await {
                tracing::error!(error = %e, "Cyclops exited with an error");
            }
        }));
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received, stopping sub-servers");
    for handle in handles {
        handle.abort();
    }
    std::fs::remove_file(config.pid_file()).ok();
    Ok(())
}

async fn serve_api(state: Arc<ServerState>, config: &Config, addr: SocketAddr) -> anyhow::Result<()> {
    let tls_enabled = config.get_bool("server.api.tls.enabled").unwrap_or(false);

    if tls_enabled {
        let cert = config.get_path_buf("server.api.tls.cert").ok_or_else(|| anyhow::anyhow!("server.api.tls.cert not set"))?;
        let key = config.get_path_buf("server.api.tls.key").ok_or_else(|| anyhow::anyhow!("server.api.tls.key not set"))?;
        let ca_chain = config.get_path_buf("server.api.tls.ca_chain");

        let make_svc = make_service_fn(move |conn: &TlsStream<TcpStream>| {
            let (inner, _) = conn.get_ref();
            let addr_res = inner.peer_addr().map_err(|e| e.to_string());
            let state = state.clone();
            Box::pin(async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    let a_res = addr_res.clone();
                    async move {
                        match a_res {
                            Ok(addr) => Ok(crate::http_surface::route(state, req, addr).await.unwrap()),
                            Err(e) => {
                                tracing::error!(error = %e, "socket connection error on new connection");
                                Ok::<_, Infallible>(
                                    Response::builder()
                                        .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
                                        .body(Body::from("socket connection error"))
                                        .unwrap(),
                                )
                            }
                        }
                    }
                }))
            })
        });

        hyper::Server::builder(TlsHyperAcceptor::new(&addr, cert, key, ca_chain).await?).serve(make_svc).await?;
    } else {
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let addr = conn.remote_addr();
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { crate::http_surface::route(state, req, addr).await }
                }))
            }
        });

        hyper::Server::bind(&addr).serve(make_svc).await?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pid_file_with_nonexistent_pid_is_not_live() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        std::fs::create_dir_all(config.home_dir()).unwrap();
        std::fs::write(config.pid_file(), "999999999").unwrap();
        assert!(pid_file_holds_live_process(&config).is_none());
    }

    #[test]
    fn pid_file_absent_is_not_live() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        assert!(pid_file_holds_live_process(&config).is_none());
    }
}
