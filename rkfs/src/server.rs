use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};
use quinn::{Connection, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_util::sync::CancellationToken;

use crate::config::TlsConfig;
use crate::protocol::{frame_reader, frame_writer};
use crate::slave::SlaveManager;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Accepts slave connections on `addr` until `shutdown` fires. Each
/// connection is identified and handed to its slave on its own task.
pub async fn serve(
    addr: SocketAddr,
    tls: &TlsConfig,
    manager: Arc<SlaveManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let endpoint = make_server_endpoint(addr, tls)?;
    info!("[server] listening for slaves on {addr}");

    loop {
        let connecting = tokio::select! {
            _ = shutdown.cancelled() => break,
            connecting = endpoint.accept() => connecting,
        };
        let Some(connecting) = connecting else {
            break;
        };
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            match connecting.await {
                Ok(conn) => {
                    if let Err(e) = handle_connection(conn, manager).await {
                        warn!("[server] slave connection failed: {e:#}");
                    }
                }
                Err(e) => error!("[server] failed to establish connection: {e:?}"),
            }
        });
    }

    endpoint.close(0u32.into(), b"master shutting down");
    info!("[server] stopped accepting slaves");
    Ok(())
}

/// Runs one slave connection: the slave opens a single bidirectional
/// stream which carries the whole session.
async fn handle_connection(conn: Connection, manager: Arc<SlaveManager>) -> anyhow::Result<()> {
    let peer = conn.remote_address();
    debug!("[server] connection accepted: addr={peer}");

    let handshake = manager.context().settings.handshake_timeout;
    let (send, recv) = tokio::time::timeout(handshake, conn.accept_bi())
        .await
        .with_context(|| format!("{peer} opened no stream in time"))??;

    let slave = match manager
        .accept_slave(peer, frame_reader(recv), frame_writer(send))
        .await
    {
        Ok(slave) => slave,
        Err(e) => {
            // let the rejection frame reach the slave before closing
            tokio::time::sleep(Duration::from_millis(200)).await;
            conn.close(1u32.into(), b"rejected");
            return Err(e.into());
        }
    };

    loop {
        tokio::select! {
            reason = conn.closed() => {
                info!("[server] connection of {} closed: {reason}", slave.name());
                if slave.is_online() && slave.peer_addr() == Some(peer) {
                    slave.set_offline(&format!("connection closed: {reason}"));
                }
                break;
            }
            _ = tokio::time::sleep(LIVENESS_INTERVAL) => {
                if slave.peer_addr() != Some(peer) {
                    conn.close(0u32.into(), b"slave offline");
                    break;
                }
            }
        }
    }
    Ok(())
}

fn make_server_endpoint(bind_addr: SocketAddr, tls: &TlsConfig) -> anyhow::Result<Endpoint> {
    let server_config = configure_server(tls)?;
    let endpoint = Endpoint::server(server_config, bind_addr)?;
    Ok(endpoint)
}

/// Builds the QUIC server config from the configured certificate, or a
/// self-signed one if none is set, restricted to the configured suites.
fn configure_server(tls: &TlsConfig) -> anyhow::Result<ServerConfig> {
    let (certs, key) = match (&tls.cert_path, &tls.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(cert_path)
                .with_context(|| format!("Failed to read certificate {}", cert_path.display()))?;
            let key = fs::read(key_path)
                .with_context(|| format!("Failed to read private key {}", key_path.display()))?;
            (
                vec![CertificateDer::from(cert)],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)),
            )
        }
        _ => {
            warn!("[server] no certificate configured, using a self-signed one");
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
            let cert_der = CertificateDer::from(cert.serialize_der()?);
            let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
            (vec![cert_der], PrivateKeyDer::Pkcs8(key))
        }
    };

    let mut provider = rustls::crypto::ring::default_provider();
    if !tls.cipher_suites.is_empty() {
        provider
            .cipher_suites
            .retain(|s| tls.cipher_suites.contains(&format!("{:?}", s.suite())));
    }
    let crypto = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)?;
    Ok(ServerConfig::with_crypto(Arc::new(quic)))
}
