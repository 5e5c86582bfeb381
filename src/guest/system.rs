//! System info service.

use crate::error::Result;

/// Guest init version and kernel version, as reported by the system info
/// RPC.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    /// Crate version of the guest init.
    pub version: String,
    /// Contents of /proc/version; empty when unavailable.
    pub kernel_version: String,
}

/// Collects system info. A missing /proc/version (non-Linux test hosts)
/// yields an empty kernel string rather than an error.
pub async fn info() -> Result<SystemInfo> {
    let kernel_version = match tokio::fs::read_to_string("/proc/version").await {
        Ok(v) => v.trim().to_string(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };

    Ok(SystemInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        kernel_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn info_reports_crate_version() {
        let info = info().await.unwrap();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }
}
