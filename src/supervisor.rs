//! First-boot setup of the backend proxy engine.
//!
//! The supervisor fetches the backend binary if it is missing, writes the
//! backend config and starts the child process once. It never waits on the
//! child and never restarts it; the platform running the relay is expected to
//! restart the whole process.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use n0_error::{e, stack_error};
use n0_future::StreamExt;
use serde::Serialize;
use tokio::{
    fs,
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    process::{Child, Command},
};
use tracing::{debug, info, warn};

use crate::config::Config;

/// File name of the backend binary inside the app dir.
pub const BINARY_NAME: &str = "web";

/// File name of the backend config inside the app dir.
pub const CONFIG_NAME: &str = "config.json";

/// Host serving prebuilt backend binaries, one subdomain per architecture.
pub const DOWNLOAD_HOST: &str = "ssss.nyc.mn";

/// Environment variable capping the backend's heap.
pub const MEMORY_LIMIT_VAR: &str = "GOMEMLIMIT";

/// Value of [`MEMORY_LIMIT_VAR`].
pub const MEMORY_LIMIT: &str = "50MiB";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READY_POLL_ATTEMPTS: usize = 50;

/// Architecture tag used to pick the download URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Arch {
    #[display("arm64")]
    Arm64,
    #[display("amd64")]
    Amd64,
}

impl Arch {
    /// The architecture this binary was built for.
    pub fn detect() -> Self {
        Self::from_target_arch(std::env::consts::ARCH)
    }

    /// Maps a Rust `target_arch` name to a tag.
    ///
    /// Only the ARM family maps to `arm64`; everything else, including 32-bit
    /// x86 and other non-x86 targets, maps to `amd64`.
    pub fn from_target_arch(arch: &str) -> Self {
        match arch {
            "arm" | "aarch64" | "arm64ec" => Self::Arm64,
            _ => Self::Amd64,
        }
    }

    /// Download URL for this architecture's backend binary.
    pub fn download_url(self) -> String {
        format!("https://{self}.{DOWNLOAD_HOST}/{BINARY_NAME}")
    }
}

/// Failures while preparing or starting the backend.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum BootstrapError {
    #[error("failed to create app dir {path:?}")]
    CreateDir {
        path: PathBuf,
        #[error(source, std_err)]
        source: io::Error,
    },

    #[error("failed to download backend from {url}")]
    Download {
        url: String,
        #[error(source, std_err)]
        source: reqwest::Error,
    },

    #[error("failed to store backend binary at {path:?}")]
    StoreBinary {
        path: PathBuf,
        #[error(source, std_err)]
        source: io::Error,
    },

    #[error("failed to make {path:?} executable")]
    Chmod {
        path: PathBuf,
        #[error(source, std_err)]
        source: io::Error,
    },

    #[error("failed to serialize backend config")]
    SerializeConfig {
        #[error(source, std_err)]
        source: serde_json::Error,
    },

    #[error("failed to write backend config to {path:?}")]
    WriteConfig {
        path: PathBuf,
        #[error(source, std_err)]
        source: io::Error,
    },

    #[error("failed to spawn backend {path:?}")]
    Spawn {
        path: PathBuf,
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Backend config file, serialized as JSON.
#[derive(Debug, Serialize)]
pub struct BackendConfig<'a> {
    log: LogSettings,
    inbounds: [Inbound<'a>; 1],
    outbounds: [Outbound; 1],
}

#[derive(Debug, Serialize)]
struct LogSettings {
    loglevel: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Inbound<'a> {
    port: u16,
    listen: &'static str,
    protocol: &'static str,
    settings: InboundSettings<'a>,
    stream_settings: StreamSettings<'a>,
}

#[derive(Debug, Serialize)]
struct InboundSettings<'a> {
    clients: [Client<'a>; 1],
    decryption: &'static str,
}

#[derive(Debug, Serialize)]
struct Client<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamSettings<'a> {
    network: &'static str,
    ws_settings: WsSettings<'a>,
}

#[derive(Debug, Serialize)]
struct WsSettings<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct Outbound {
    protocol: &'static str,
}

impl<'a> BackendConfig<'a> {
    /// Single loopback VLESS-over-WebSocket inbound and a direct outbound.
    pub fn new(config: &'a Config) -> Self {
        Self {
            log: LogSettings { loglevel: "none" },
            inbounds: [Inbound {
                port: config.internal_port,
                listen: "127.0.0.1",
                protocol: "vless",
                settings: InboundSettings {
                    clients: [Client {
                        id: &config.identifier,
                    }],
                    decryption: "none",
                },
                stream_settings: StreamSettings {
                    network: "ws",
                    ws_settings: WsSettings {
                        path: &config.ws_path,
                    },
                },
            }],
            outbounds: [Outbound {
                protocol: "freedom",
            }],
        }
    }
}

/// Prepares and launches the backend.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: Config,
    download_url: String,
    http_client: reqwest::Client,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            download_url: Arch::detect().download_url(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Fetches the binary from `url` instead of the architecture default.
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    pub fn binary_path(&self) -> PathBuf {
        self.config.app_dir.join(BINARY_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config.app_dir.join(CONFIG_NAME)
    }

    /// Runs every bootstrap step and starts the backend.
    ///
    /// Download and chmod failures are logged and skipped; the spawn that
    /// follows reports the real problem. The returned child is not waited on.
    pub async fn run(&self) -> Result<Child, BootstrapError> {
        self.ensure_app_dir().await?;
        if let Err(err) = self.ensure_binary().await {
            warn!("backend download failed: {err:#}");
        }
        if let Err(err) = self.make_executable().await {
            warn!("{err:#}");
        }
        let config_path = self.write_config().await?;
        self.check_port().await;
        let child = self.spawn(&config_path)?;
        info!(
            port = self.config.internal_port,
            pid = child.id(),
            "backend started on internal port"
        );
        tokio::spawn(wait_until_ready(self.config.backend_addr()));
        Ok(child)
    }

    /// Creates the app dir with mode `0o755` if it does not exist.
    pub async fn ensure_app_dir(&self) -> Result<(), BootstrapError> {
        let path = &self.config.app_dir;
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder
            .create(path)
            .await
            .map_err(|source| e!(BootstrapError::CreateDir { path: path.clone(), source }))
    }

    /// Downloads the backend binary unless it is already present.
    ///
    /// The body is streamed into a sibling temp file that is renamed into
    /// place once complete, so a partial download is never taken for the
    /// binary. Returns whether a download happened.
    pub async fn ensure_binary(&self) -> Result<bool, BootstrapError> {
        let path = self.binary_path();
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "backend binary present");
            return Ok(false);
        }
        let url = &self.download_url;
        info!(%url, "downloading backend");
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|source| e!(BootstrapError::Download { url: url.clone(), source }))?;

        let partial = path.with_extension("download");
        let store_err = |source| e!(BootstrapError::StoreBinary { path: partial.clone(), source });
        let mut file = fs::File::create(&partial).await.map_err(store_err)?;
        let mut body = response.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|source| e!(BootstrapError::Download { url: url.clone(), source }))?;
            file.write_all(&chunk).await.map_err(store_err)?;
            total += chunk.len() as u64;
        }
        file.flush().await.map_err(store_err)?;
        drop(file);
        fs::rename(&partial, &path).await.map_err(store_err)?;
        debug!(bytes = total, path = %path.display(), "backend downloaded");
        Ok(true)
    }

    /// Sets mode `0o755` on the binary, falling back to `chmod +x` via `sh`.
    pub async fn make_executable(&self) -> Result<(), BootstrapError> {
        let path = self.binary_path();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let direct = fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await;
            if let Err(err) = direct {
                debug!("set_permissions failed ({err:#}), falling back to chmod");
                let status = Command::new("sh")
                    .args(["-c", "chmod +x \"$1\"", "sh"])
                    .arg(&path)
                    .stdin(Stdio::null())
                    .status()
                    .await
                    .and_then(|status| {
                        if status.success() {
                            Ok(())
                        } else {
                            Err(io::Error::other(format!("chmod exited with {status}")))
                        }
                    });
                status.map_err(|source| e!(BootstrapError::Chmod { path, source }))?;
            }
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    /// Writes the backend config, replacing any previous file.
    pub async fn write_config(&self) -> Result<PathBuf, BootstrapError> {
        let path = self.config_path();
        let json = serde_json::to_vec(&BackendConfig::new(&self.config))
            .map_err(|source| e!(BootstrapError::SerializeConfig { source }))?;
        fs::write(&path, json)
            .await
            .map_err(|source| e!(BootstrapError::WriteConfig { path: path.clone(), source }))?;
        Ok(path)
    }

    /// Warns if something else already listens on the backend port.
    ///
    /// Returns whether the port was free.
    pub async fn check_port(&self) -> bool {
        let addr = self.config.backend_addr();
        match TcpListener::bind(addr).await {
            Ok(_) => true,
            Err(err) => {
                warn!(%addr, "backend port is unavailable, sessions may not be served: {err:#}");
                false
            }
        }
    }

    /// Starts the backend with inherited stdio and the memory limit set.
    pub fn spawn(&self, config_path: &Path) -> Result<Child, BootstrapError> {
        let path = self.binary_path();
        Command::new(&path)
            .arg("-c")
            .arg(config_path)
            .env(MEMORY_LIMIT_VAR, MEMORY_LIMIT)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| e!(BootstrapError::Spawn { path, source }))
    }
}

/// Polls the backend port and logs once it accepts connections.
async fn wait_until_ready(addr: SocketAddr) {
    for _ in 0..READY_POLL_ATTEMPTS {
        if TcpStream::connect(addr).await.is_ok() {
            info!(%addr, "backend accepting connections");
            return;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    warn!(%addr, "backend did not start accepting connections");
}
