//! Virus scanning of staged files.
//!
//! The engine only depends on [`VirusScanner`]; [`ClamAvScanner`] talks to a clamd
//! daemon over a unix socket or TCP.

use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    str,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("virus scan failed: {0}")]
    Failed(String),
    #[error("virus scan timed out after {0} seconds")]
    Timeout(u64),
}

#[async_trait]
pub trait VirusScanner: Send + Sync {
    /// Scan a file on local disk. `Ok(Some(threat))` when something was found.
    async fn scan(&self, path: &Path) -> Result<Option<String>, ScanError>;
}

/// How to reach clamd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClamdTransport {
    Socket(PathBuf),
    Tcp { host: String, port: u16 },
}

/// Socket used when nothing is configured, with the CentOS 7 location tried first.
pub fn default_socket() -> PathBuf {
    let centos_7_socket = Path::new("/var/run/clamd.scan/clamd.sock");
    if centos_7_socket.exists() {
        centos_7_socket.to_path_buf()
    } else {
        PathBuf::from("/var/run/clamav/clamd.ctl")
    }
}

#[derive(Clone, Debug)]
pub struct ClamAvScanner {
    transport: ClamdTransport,
    timeout_secs: u64,
}

impl ClamAvScanner {
    pub fn new(transport: ClamdTransport, timeout_secs: u64) -> Self {
        Self {
            transport,
            timeout_secs,
        }
    }
}

/// Pull the signature name out of a clamd reply such as
/// `/tmp/upload-1: Eicar-Signature FOUND`.
pub fn parse_threat(response: &str) -> String {
    response
        .trim()
        .trim_end_matches('\0')
        .rsplit_once(": ")
        .map(|(_, verdict)| verdict)
        .unwrap_or(response)
        .trim_end_matches("FOUND")
        .trim()
        .to_string()
}

fn scan_blocking(transport: &ClamdTransport, path: &Path) -> Result<Option<String>, ScanError> {
    let response = match transport {
        #[cfg(unix)]
        ClamdTransport::Socket(socket_path) => clamav_client::scan_file(
            path,
            clamav_client::Socket {
                socket_path: socket_path.as_path(),
            },
            None,
        ),
        #[cfg(not(unix))]
        ClamdTransport::Socket(_) => {
            return Err(ScanError::Failed(
                "unix sockets are not supported on this platform".into(),
            ));
        }
        ClamdTransport::Tcp { host, port } => {
            let address = format!("{}:{}", host, port);
            clamav_client::scan_file(
                path,
                clamav_client::Tcp {
                    host_address: address.as_str(),
                },
                None,
            )
        }
    }
    .map_err(|e| ScanError::Failed(format!("clamd connection error: {}", e)))?;

    let is_clean = clamav_client::clean(&response)
        .map_err(|e| ScanError::Failed(format!("unreadable clamd response: {}", e)))?;
    if is_clean {
        return Ok(None);
    }
    let text = str::from_utf8(&response).unwrap_or("unknown");
    Ok(Some(parse_threat(text)))
}

#[async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, path: &Path) -> Result<Option<String>, ScanError> {
        let start = Instant::now();
        tracing::debug!(transport = ?self.transport, path = %path.display(), "starting clamd scan");

        let transport = self.transport.clone();
        let owned_path = path.to_path_buf();
        let result = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            tokio::task::spawn_blocking(move || scan_blocking(&transport, &owned_path)),
        )
        .await;

        match result {
            Ok(Ok(verdict)) => {
                tracing::debug!(
                    duration_ms = start.elapsed().as_millis(),
                    infected = matches!(verdict, Ok(Some(_))),
                    "clamd scan finished"
                );
                verdict
            }
            Ok(Err(join_err)) => Err(ScanError::Failed(format!(
                "scan task failed: {}",
                join_err
            ))),
            Err(_) => Err(ScanError::Timeout(self.timeout_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_names_are_extracted() {
        assert_eq!(
            parse_threat("/tmp/upload-1: Eicar-Signature FOUND\0"),
            "Eicar-Signature"
        );
        assert_eq!(parse_threat("stream: Win.Test.EICAR_HDB-1 FOUND"), "Win.Test.EICAR_HDB-1");
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let scanner = ClamAvScanner::new(
            ClamdTransport::Socket(dir.path().join("missing.sock")),
            5,
        );
        assert!(scanner.scan(&file).await.is_err());
    }
}
