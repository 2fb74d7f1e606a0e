//! Transfer Engine: executes one DCC reception to completion or failure.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::GlobalConfig;
use crate::dcc::ctcp::{self, DccAddr, DccOffer};
use crate::dcc::registry::{Registry, TransferKey, TransferPatch, TransferStatus};
use crate::dcc::PendingAccepts;
use crate::error::BotError;

const CHUNK_SIZE: usize = 64 * 1024;
const MIME_SNIFF_THRESHOLD: usize = 4096;
const CHUNK_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Narrow capability injected into a Transfer so it can send IRC lines
/// (`DCC RESUME`, passive-mode `DCC SEND` reply) without holding the whole
/// Session. Breaks the Session<->Transfer ownership cycle.
pub trait LineSender: Send + Sync {
    fn send_line(&self, line: String);
}

trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

/// Everything the engine needs beyond the parsed offer and the key it was
/// registered under.
pub struct TransferParams {
    pub key: TransferKey,
    pub offer: DccOffer,
    pub global: Arc<GlobalConfig>,
    pub registry: Arc<Registry>,
    pub pending_accepts: Arc<PendingAccepts>,
    pub line_sender: Arc<dyn LineSender>,
    /// Our address as seen by the IRC connection, used to advertise a
    /// listener address back to the peer for passive DCC.
    pub local_ip: Ipv4Addr,
}

pub async fn run(params: TransferParams) -> Result<(), BotError> {
    let TransferParams {
        key,
        offer,
        global,
        registry,
        pending_accepts,
        line_sender,
        local_ip,
    } = params;

    if offer.size > global.max_file_size {
        return Err(BotError::FileSizeExceeded);
    }
    if !global.allow_private_ips {
        if let Some(ip) = offer.addr.ipv4() {
            if is_private(ip) {
                return Err(BotError::ProtocolViolation(format!(
                    "peer address {ip} is private and allow_private_ips is false"
                )));
            }
        }
    }

    let cancel = registry.insert(key.clone(), offer.size).await?;

    let result = run_inner(
        &key,
        &offer,
        &global,
        &registry,
        &pending_accepts,
        &*line_sender,
        local_ip,
        &cancel,
    )
    .await;

    match &result {
        Ok(()) => {
            registry
                .update(
                    &key,
                    TransferPatch {
                        status: Some(TransferStatus::Completed),
                        ..Default::default()
                    },
                )
                .await;
        }
        Err(BotError::Cancelled) => {
            registry
                .update(
                    &key,
                    TransferPatch {
                        status: Some(TransferStatus::Cancelled),
                        ..Default::default()
                    },
                )
                .await;
        }
        Err(e) => {
            registry
                .update(
                    &key,
                    TransferPatch {
                        status: Some(TransferStatus::Failed),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                )
                .await;
        }
    }

    result
}

async fn run_inner(
    key: &TransferKey,
    offer: &DccOffer,
    global: &GlobalConfig,
    registry: &Registry,
    pending_accepts: &PendingAccepts,
    line_sender: &dyn LineSender,
    local_ip: Ipv4Addr,
    cancel: &CancellationToken,
) -> Result<(), BotError> {
    registry
        .update(
            key,
            TransferPatch {
                status: Some(TransferStatus::InProgress),
                ..Default::default()
            },
        )
        .await;

    let final_path = PathBuf::from(&global.download_path).join(&offer.filename);
    let incomplete_path = {
        let mut p = final_path.clone();
        let mut name = p.file_name().unwrap_or_default().to_os_string();
        name.push(&global.incomplete_suffix);
        p.set_file_name(name);
        p
    };

    tokio::fs::create_dir_all(&global.download_path)
        .await
        .map_err(|e| BotError::Internal(format!("create_dir_all: {e}")))?;

    let offset = probe_resume(
        &incomplete_path,
        offer,
        global,
        key,
        pending_accepts,
        line_sender,
        cancel,
    )
    .await?;

    if offset == offer.size {
        // Either the partial on disk already covers the whole file, or
        // this is a zero-byte transfer with nothing to receive and no
        // partial ever created; ensure the incomplete path exists before
        // renaming it into place.
        if tokio::fs::metadata(&incomplete_path).await.is_err() {
            OpenOptions::new()
                .create(true)
                .write(true)
                .open(&incomplete_path)
                .await
                .map_err(|e| BotError::Internal(format!("create empty file: {e}")))?;
        }
        tokio::fs::rename(&incomplete_path, &final_path)
            .await
            .map_err(|e| BotError::Internal(format!("rename: {e}")))?;
        registry
            .update(
                key,
                TransferPatch {
                    received: Some(0),
                    offset: Some(offset),
                    ..Default::default()
                },
            )
            .await;
        return Ok(());
    }

    let mut stream = connect(offer, global, key, line_sender, local_ip, cancel).await?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&incomplete_path)
        .await
        .map_err(|e| BotError::Internal(format!("open file: {e}")))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| BotError::Internal(format!("seek: {e}")))?;

    let mut hasher = Md5::new();
    let mut received: u64 = 0;
    let mut buf = [0u8; CHUNK_SIZE];
    let mut sniff_buf: Vec<u8> = Vec::with_capacity(MIME_SNIFF_THRESHOLD);
    let mut mime_checked = false;
    let mut last_progress = tokio::time::Instant::now();
    let mut bytes_since_progress: u64 = 0;
    let window_start = tokio::time::Instant::now();

    loop {
        if offset + received >= offer.size {
            break;
        }

        let read_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = stream.shutdown().await;
                return Err(BotError::Cancelled);
            }
            res = timeout(CHUNK_READ_TIMEOUT, stream.read(&mut buf)) => res,
        };

        let n = match read_result {
            Ok(Ok(0)) => {
                if offset + received < offer.size {
                    return Err(BotError::ShortRead);
                }
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(BotError::NetworkUnavailable(e.to_string())),
            Err(_) => return Err(BotError::NetworkUnavailable("stalled: no data for 30s".into())),
        };

        file.write_all(&buf[..n])
            .await
            .map_err(|e| BotError::Internal(format!("write: {e}")))?;
        hasher.update(&buf[..n]);
        received += n as u64;
        bytes_since_progress += n as u64;

        if !mime_checked && sniff_buf.len() < MIME_SNIFF_THRESHOLD {
            sniff_buf.extend_from_slice(&buf[..n]);
            if sniff_buf.len() >= MIME_SNIFF_THRESHOLD {
                mime_checked = true;
                if let Some(kind) = infer::get(&sniff_buf) {
                    if !global.allowed_mimetypes.contains(kind.mime_type()) {
                        let _ = stream.shutdown().await;
                        drop(file);
                        let _ = tokio::fs::remove_file(&incomplete_path).await;
                        return Err(BotError::DisallowedMimeType(kind.mime_type().to_string()));
                    }
                }
            }
        }

        let ack = ((offset + received) as u32).to_be_bytes();
        let _ = stream.write_all(&ack).await;

        if last_progress.elapsed() >= Duration::from_secs(1) {
            let speed = bytes_since_progress as f64 / last_progress.elapsed().as_secs_f64();
            registry
                .update(
                    key,
                    TransferPatch {
                        received: Some(received),
                        offset: Some(offset),
                        speed: Some(speed),
                        ..Default::default()
                    },
                )
                .await;
            last_progress = tokio::time::Instant::now();
            bytes_since_progress = 0;
        }
    }

    file.flush()
        .await
        .map_err(|e| BotError::Internal(format!("flush: {e}")))?;
    drop(file);

    let overall_speed = if window_start.elapsed().as_secs_f64() > 0.0 {
        received as f64 / window_start.elapsed().as_secs_f64()
    } else {
        0.0
    };
    registry
        .update(
            key,
            TransferPatch {
                received: Some(received),
                offset: Some(offset),
                speed: Some(overall_speed),
                ..Default::default()
            },
        )
        .await;
    let computed = format!("{:x}", hasher.finalize());

    tokio::fs::rename(&incomplete_path, &final_path)
        .await
        .map_err(|e| BotError::Internal(format!("rename: {e}")))?;

    let snapshot = registry
        .snapshot()
        .await
        .into_iter()
        .find(|r| r.server == key.server && r.peer_nick == key.peer_nick && r.filename == key.filename);
    let advertised = snapshot.and_then(|r| r.md5_advertised);

    if global.auto_md5sum || advertised.is_some() {
        registry
            .update(
                key,
                TransferPatch {
                    md5_computed: Some(computed.clone()),
                    ..Default::default()
                },
            )
            .await;
        if let Some(advertised) = advertised {
            if !advertised.eq_ignore_ascii_case(&computed) {
                return Err(BotError::ChecksumMismatch {
                    advertised,
                    computed,
                });
            }
        }
    }

    Ok(())
}

async fn probe_resume(
    incomplete_path: &std::path::Path,
    offer: &DccOffer,
    global: &GlobalConfig,
    key: &TransferKey,
    pending_accepts: &PendingAccepts,
    line_sender: &dyn LineSender,
    cancel: &CancellationToken,
) -> Result<u64, BotError> {
    let existing_len = match tokio::fs::metadata(incomplete_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    if existing_len == 0 || existing_len >= offer.size {
        if existing_len >= offer.size && existing_len > 0 {
            return Ok(offer.size);
        }
        return Ok(0);
    }

    let accept_rx = pending_accepts.wait_for(&key.peer_nick, &offer.filename, offer.port, offer.token.as_deref());
    line_sender.send_line(ctcp::encode_resume(
        &offer.filename,
        offer.port,
        existing_len,
        offer.token.as_deref(),
    ));

    let wait = timeout(Duration::from_secs(global.resume_timeout), accept_rx);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BotError::Cancelled),
        result = wait => match result {
            Ok(Ok(accept)) => Ok(accept.position),
            Ok(Err(_)) | Err(_) => {
                // No ACCEPT within the window: discard the partial and
                // restart the transfer from scratch.
                let _ = tokio::fs::remove_file(incomplete_path).await;
                Ok(0)
            }
        },
    }
}

async fn connect(
    offer: &DccOffer,
    global: &GlobalConfig,
    key: &TransferKey,
    line_sender: &dyn LineSender,
    local_ip: Ipv4Addr,
    cancel: &CancellationToken,
) -> Result<Box<dyn AsyncDuplex>, BotError> {
    match offer.addr {
        DccAddr::Dotted(ip) => {
            let tcp = timeout(
                Duration::from_secs(global.resume_timeout),
                TcpStream::connect((ip, offer.port)),
            )
            .await
            .map_err(|_| BotError::NetworkUnavailable("connect timed out".into()))?
            .map_err(|e| BotError::NetworkUnavailable(e.to_string()))?;

            if offer.secure {
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .build()
                    .map_err(|e| BotError::Internal(e.to_string()))?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let tls = connector
                    .connect(&ip.to_string(), tcp)
                    .await
                    .map_err(|e| BotError::NetworkUnavailable(e.to_string()))?;
                Ok(Box::new(tls))
            } else {
                Ok(Box::new(tcp))
            }
        }
        DccAddr::Passive => {
            let listener = TcpListener::bind(("0.0.0.0", 0))
                .await
                .map_err(|e| BotError::Internal(format!("bind: {e}")))?;
            let our_port = listener
                .local_addr()
                .map_err(|e| BotError::Internal(e.to_string()))?
                .port();
            line_sender.send_line(ctcp::encode_passive_send(
                &offer.filename,
                local_ip,
                our_port,
                offer.size,
                offer.token.as_deref().unwrap_or(&key.peer_nick),
            ));

            let accept_fut = timeout(Duration::from_secs(global.resume_timeout), listener.accept());
            let (tcp, _) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BotError::Cancelled),
                res = accept_fut => res
                    .map_err(|_| BotError::ResumeTimeout)?
                    .map_err(|e| BotError::NetworkUnavailable(e.to_string()))?,
            };

            if offer.secure {
                let identity_err = BotError::Internal(
                    "passive DCC SSEND requires a server certificate, none configured".into(),
                );
                return Err(identity_err);
            }
            Ok(Box::new(tcp))
        }
    }
}

fn is_private(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct NoopSender;
    impl LineSender for NoopSender {
        fn send_line(&self, _line: String) {}
    }

    fn key() -> TransferKey {
        TransferKey {
            server: "irc.example.org".to_string(),
            peer_nick: "bot1".to_string(),
            filename: "greeting.txt".to_string(),
        }
    }

    async fn spawn_peer(payload: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(payload).await.unwrap();
            let mut ack = [0u8; 4];
            let _ = sock.read_exact(&mut ack).await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn happy_path_active_dcc_completes() {
        let payload = b"hello world";
        let (addr, _peer) = spawn_peer(payload).await;

        let dir = TempDir::new().unwrap();
        let global = Arc::new(GlobalConfig {
            download_path: dir.path().to_string_lossy().to_string(),
            auto_md5sum: false,
            allow_private_ips: true,
            resume_timeout: 5,
            ..GlobalConfig::default()
        });
        let registry = Registry::new();
        let pending = Arc::new(PendingAccepts::new());

        let offer = DccOffer {
            secure: false,
            filename: "greeting.txt".to_string(),
            addr: DccAddr::Dotted(match addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                _ => unreachable!(),
            }),
            port: addr.port(),
            size: payload.len() as u64,
            token: None,
        };

        let params = TransferParams {
            key: key(),
            offer,
            global,
            registry: registry.clone(),
            pending_accepts: pending,
            line_sender: Arc::new(NoopSender),
            local_ip: Ipv4Addr::new(127, 0, 0, 1),
        };

        run(params).await.unwrap();

        let contents = tokio::fs::read(dir.path().join("greeting.txt")).await.unwrap();
        assert_eq!(contents, payload);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn oversized_offer_is_rejected_before_connecting() {
        let dir = TempDir::new().unwrap();
        let global = Arc::new(GlobalConfig {
            download_path: dir.path().to_string_lossy().to_string(),
            max_file_size: 10,
            ..GlobalConfig::default()
        });
        let registry = Registry::new();
        let offer = DccOffer {
            secure: false,
            filename: "big.bin".to_string(),
            addr: DccAddr::Dotted(Ipv4Addr::LOCALHOST),
            port: 1,
            size: 1000,
            token: None,
        };
        let params = TransferParams {
            key: key(),
            offer,
            global,
            registry: registry.clone(),
            pending_accepts: Arc::new(PendingAccepts::new()),
            line_sender: Arc::new(NoopSender),
            local_ip: Ipv4Addr::LOCALHOST,
        };
        let result = run(params).await;
        assert!(matches!(result, Err(BotError::FileSizeExceeded)));
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn zero_size_transfer_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _peer = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
        });

        let global = Arc::new(GlobalConfig {
            download_path: dir.path().to_string_lossy().to_string(),
            auto_md5sum: false,
            allow_private_ips: true,
            ..GlobalConfig::default()
        });
        let registry = Registry::new();
        let offer = DccOffer {
            secure: false,
            filename: "empty.bin".to_string(),
            addr: DccAddr::Dotted(Ipv4Addr::LOCALHOST),
            port: addr.port(),
            size: 0,
            token: None,
        };
        let params = TransferParams {
            key: key(),
            offer,
            global,
            registry: registry.clone(),
            pending_accepts: Arc::new(PendingAccepts::new()),
            line_sender: Arc::new(NoopSender),
            local_ip: Ipv4Addr::LOCALHOST,
        };
        run(params).await.unwrap();
        let contents = tokio::fs::read(dir.path().join("empty.bin")).await.unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn private_ip_detection() {
        assert!(is_private(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(is_private(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
