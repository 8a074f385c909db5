//! Line-oriented request/response server (`/command args`), used for backlog
//! fetch and submission. Optional TLS.

use log::{debug, info, warn};
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;

// Optional TLS
use rustls::ServerConfig as RustlsConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

use crate::common::models::{OfflineSubmission, UserId};
use crate::server::backfill::Backfill;
use crate::server::collaborators::Directory;
use crate::server::config::ServerConfig;
use crate::server::store::PresenceStore;

pub struct Server {
    pub backfill: Arc<Backfill>,
    pub directory: Arc<dyn Directory>,
    pub store: Arc<dyn PresenceStore>,
    pub config: ServerConfig,
}

impl Server {
    /// Configure TLS acceptor from TLS_CERT_PATH / TLS_KEY_PATH
    fn setup_tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.enable_encryption {
            return Ok(None);
        }

        let cert_path = std::env::var("TLS_CERT_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_CERT_PATH environment variable not set"))?;
        let key_path = std::env::var("TLS_KEY_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_KEY_PATH environment variable not set"))?;

        let cert_file = File::open(&cert_path)
            .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", cert_path, e))?;
        let cert_chain = certs(&mut StdBufReader::new(cert_file))?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();
        if cert_chain.is_empty() {
            return Err(anyhow::anyhow!("No certificates found in {}", cert_path));
        }
        info!("[TLS] Loaded {} certificate(s) from {}", cert_chain.len(), cert_path);

        // PKCS8 first, then RSA
        let key_file = File::open(&key_path)
            .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", key_path, e))?;
        let mut keys = pkcs8_private_keys(&mut StdBufReader::new(key_file))?;
        if keys.is_empty() {
            let key_file = File::open(&key_path)?;
            keys = rsa_private_keys(&mut StdBufReader::new(key_file))?;
        }
        if keys.is_empty() {
            return Err(anyhow::anyhow!("No private keys found in {}", key_path));
        }

        let rustls_cfg = RustlsConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, rustls::PrivateKey(keys.remove(0)))
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        Ok(Some(TlsAcceptor::from(Arc::new(rustls_cfg))))
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("[CONN] Listening on {}", addr);

        let tls_acceptor = match self.setup_tls_acceptor() {
            Ok(Some(acceptor)) => {
                info!("[TLS] TLS enabled");
                Some(acceptor)
            }
            Ok(None) => {
                info!("[TLS] TLS disabled; plain TCP");
                None
            }
            Err(e) => {
                warn!("[TLS] TLS configuration failed, falling back to plain TCP: {}", e);
                None
            }
        };

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("[CONN] New connection from {}", peer);
            let server = self.clone();
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => handle_client(server, tls_stream).await,
                        Err(e) => Err(e.into()),
                    },
                    None => handle_client(server, stream).await,
                };
                if let Err(e) = result {
                    warn!("[CONN] Client {} error: {}", peer, e);
                }
            });
        }
    }

    async fn authenticate(&self, token: &str) -> Result<UserId, String> {
        match self.directory.validate_session(token).await {
            Ok(Some(user_id)) => Ok(user_id),
            Ok(None) => Err("ERR: Invalid or expired session".to_string()),
            Err(e) => Err(format!("ERR: {}", e)),
        }
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str]) -> String {
        debug!("[CONN] Command {} ({} args)", cmd, args.len());
        match cmd {
            "/offline_messages" if args.len() == 1 => {
                let user_id = match self.authenticate(args[0]).await {
                    Ok(user_id) => user_id,
                    Err(response) => return response,
                };
                match self.backfill.fetch_backlog(user_id).await {
                    Ok(backlog) => match serde_json::to_string(&backlog) {
                        Ok(json) => format!("OK: {}", json),
                        Err(e) => format!("ERR: {}", e),
                    },
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/submit_offline" if args.len() >= 2 => {
                let user_id = match self.authenticate(args[0]).await {
                    Ok(user_id) => user_id,
                    Err(response) => return response,
                };
                let submission: OfflineSubmission = match serde_json::from_str(&args[1..].join(" ")) {
                    Ok(submission) => submission,
                    Err(e) => return format!("ERR: Invalid submission: {}", e),
                };
                match self.backfill.submit_consumed(user_id, submission).await {
                    Ok(report) => format!(
                        "OK: removed {} private, acknowledged {} group",
                        report.private_removed, report.group_acked
                    ),
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/online" if args.len() == 2 => {
                if let Err(response) = self.authenticate(args[0]).await {
                    return response;
                }
                let Ok(target) = args[1].parse::<UserId>() else {
                    return "ERR: Invalid user id".to_string();
                };
                match self.store.is_online(target).await {
                    Ok(online) => format!("OK: {}", online),
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/local_time" => format!("OK: {}", chrono::Utc::now().timestamp_millis()),
            "/help" => help(),
            "/quit" => "OK: Disconnected".to_string(),
            _ => "ERR: Unknown or malformed command".to_string(),
        }
    }
}

fn help() -> String {
    [
        "OK: Available commands:",
        "/offline_messages <token>",
        "/submit_offline <token> {\"private\":[seq_id..],\"group\":[ack..]}",
        "/online <token> <user_id>",
        "/local_time",
        "/help",
        "/quit",
    ]
    .join("\n")
}

/// One line in, one response out, until `/quit` or EOF.
pub async fn handle_client<S>(server: Arc<Server>, stream: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > server.config.max_message_length {
            writer.write_all(b"ERR: Line too long\n").await?;
            writer.flush().await?;
            continue;
        }

        let mut parts = trimmed.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();
        let response = server.handle_command(cmd, &args).await;

        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        if cmd == "/quit" {
            break;
        }
    }
    Ok(())
}
