use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::TlsPaths;
use crate::engine::Engine;
use crate::observability;
use crate::wire;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a TLS acceptor from PEM files, or `None` when TLS is off.
pub fn load_tls_acceptor(paths: Option<&TlsPaths>) -> io::Result<Option<TlsAcceptor>> {
    let Some(paths) = paths else { return Ok(None) };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&paths.cert)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", paths.cert.display()),
        ));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&paths.key)?))?
        .ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "no private key found in key file")
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

pub struct Server {
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
    max_connections: usize,
}

impl Server {
    pub fn new(engine: Arc<Engine>, password: String, max_connections: usize) -> Self {
        Self {
            engine,
            password,
            tls: None,
            max_connections,
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsAcceptor>) -> Self {
        self.tls = tls;
        self
    }

    /// Accept connections until `shutdown` resolves, then wait up to ten
    /// seconds for open connections to finish.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (socket, peer) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                            continue;
                        }
                    };

                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!("connection limit reached, rejecting {peer}");
                            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL)
                                .increment(1);
                            drop(socket);
                            continue;
                        }
                    };

                    info!("connection from {peer}");
                    metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                    let engine = self.engine.clone();
                    let password = self.password.clone();
                    let tls = self.tls.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        let served = wire::process_connection(socket, engine, password, tls).await;
                        if let Err(e) = served {
                            tracing::error!("connection error from {peer}: {e}");
                        }
                        metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }

        self.drain(&semaphore).await;
    }

    async fn drain(&self, semaphore: &Semaphore) {
        info!("draining connections...");
        let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            if semaphore.available_permits() == self.max_connections {
                info!("all connections drained");
                return;
            }
            tokio::select! {
                _ = &mut deadline => {
                    let remaining = self.max_connections - semaphore.available_permits();
                    tracing::warn!("drain timeout, {remaining} connections still open");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_off_without_paths() {
        assert!(load_tls_acceptor(None).unwrap().is_none());
    }

    #[test]
    fn tls_missing_files_error() {
        let paths = TlsPaths {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        let err = load_tls_acceptor(Some(&paths)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
