//! CNI plugin invocation and result parsing.
//!
//! CNI plugins are executed as child processes: the network configuration
//! goes to stdin, the operation and attachment identifiers travel in
//! `CNI_*` environment variables, and ADD returns a JSON result on stdout.
//! Only the result format is interpreted here; the plugins themselves are
//! external.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// CNI spec version spoken to the plugins.
const CNI_VERSION: &str = "1.0.0";

/// Locations of the CNI configuration and plugin binaries.
#[derive(Debug, Clone)]
pub struct CniConfig {
    /// Directory with `.conflist`/`.conf` network configurations.
    pub conf_dir: PathBuf,
    /// Directory with plugin binaries.
    pub bin_dir: PathBuf,
    /// IPAM state root checked for leaks on release.
    pub ipam_state_dir: PathBuf,
}

impl CniConfig {
    /// Standard configuration: env overrides first, then the packaged
    /// directories, then the system CNI paths.
    #[must_use]
    pub fn load() -> Self {
        if let Ok(dir) = std::env::var("KVMBOX_CNI_CONF_DIR") {
            if !dir.is_empty() {
                return Self {
                    conf_dir: PathBuf::from(dir),
                    bin_dir: std::env::var("KVMBOX_CNI_BIN_DIR")
                        .map(PathBuf::from)
                        .unwrap_or_else(|_| PathBuf::from("/opt/cni/bin")),
                    ipam_state_dir: PathBuf::from("/var/lib/cni/networks"),
                };
            }
        }

        let packaged_conf = crate::paths::share_dir().join("config/cni/net.d");
        if packaged_conf.is_dir() {
            return Self {
                conf_dir: packaged_conf,
                bin_dir: crate::paths::share_dir().join("libexec/cni"),
                ipam_state_dir: PathBuf::from("/var/lib/cni/networks"),
            };
        }

        Self {
            conf_dir: PathBuf::from("/etc/cni/net.d"),
            bin_dir: PathBuf::from("/opt/cni/bin"),
            ipam_state_dir: PathBuf::from("/var/lib/cni/networks"),
        }
    }
}

// =============================================================================
// Result Format
// =============================================================================

/// Parsed CNI ADD result (the fields this shim consumes).
#[derive(Debug, Clone, Deserialize)]
pub struct CniResult {
    /// Interfaces created by the plugins.
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    /// IP allocations.
    #[serde(default)]
    pub ips: Vec<CniIpConfig>,
    /// DNS configuration.
    #[serde(default)]
    pub dns: CniDns,
}

/// One interface in a CNI result.
#[derive(Debug, Clone, Deserialize)]
pub struct CniInterface {
    /// Interface name.
    pub name: String,
    /// MAC address.
    #[serde(default)]
    pub mac: String,
    /// Namespace the interface lives in; empty for host interfaces.
    #[serde(default)]
    pub sandbox: String,
}

/// One IP allocation in a CNI result.
#[derive(Debug, Clone, Deserialize)]
pub struct CniIpConfig {
    /// Address in CIDR notation.
    pub address: String,
    /// Gateway.
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    /// Index into `interfaces` this address belongs to.
    #[serde(default)]
    pub interface: Option<usize>,
}

/// DNS section of a CNI result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CniDns {
    /// Nameserver addresses.
    #[serde(default)]
    pub nameservers: Vec<String>,
}

/// Networking details extracted from a CNI result.
#[derive(Debug, Clone)]
pub struct NetworkAllocation {
    /// TAP device created for the VM.
    pub tap_device: String,
    /// TAP MAC address.
    pub mac: String,
    /// Guest IP address.
    pub ip: IpAddr,
    /// Prefix length of the allocation.
    pub prefix_len: u8,
    /// Gateway address.
    pub gateway: Option<IpAddr>,
    /// DNS servers.
    pub nameservers: Vec<String>,
}

/// Extracts the TAP device, address, and gateway from a parsed result.
pub fn parse_result(result: &CniResult) -> Result<NetworkAllocation> {
    let tap = result
        .interfaces
        .iter()
        .find(|iface| iface.name.starts_with("tap"))
        .ok_or_else(|| {
            Error::Internal(format!(
                "CNI result has no TAP interface (interfaces: {:?})",
                result
                    .interfaces
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
            ))
        })?;

    let ip_config = result
        .ips
        .first()
        .ok_or_else(|| Error::Internal("CNI result has no IP allocation".into()))?;

    let (ip, prefix_len) = parse_cidr(&ip_config.address)?;

    Ok(NetworkAllocation {
        tap_device: tap.name.clone(),
        mac: tap.mac.clone(),
        ip,
        prefix_len,
        gateway: ip_config.gateway,
        nameservers: result.dns.nameservers.clone(),
    })
}

fn parse_cidr(s: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| Error::Internal(format!("malformed CIDR in CNI result: {s:?}")))?;
    let ip: IpAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("malformed address in CNI result {s:?}: {e}")))?;
    let prefix_len: u8 = prefix
        .parse()
        .map_err(|e| Error::Internal(format!("malformed prefix in CNI result {s:?}: {e}")))?;
    Ok((ip, prefix_len))
}

/// Converts a prefix length to a dotted-quad netmask (IPv4 only).
#[must_use]
pub fn prefix_to_netmask(prefix_len: u8) -> String {
    let mask: u32 = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len.min(32) as u32)
    };
    format!(
        "{}.{}.{}.{}",
        (mask >> 24) & 0xff,
        (mask >> 16) & 0xff,
        (mask >> 8) & 0xff,
        mask & 0xff
    )
}

// =============================================================================
// Plugin Execution
// =============================================================================

/// Executes CNI plugins for one attachment.
pub struct CniDriver {
    config: CniConfig,
}

impl CniDriver {
    /// Creates a driver over the given paths.
    #[must_use]
    pub fn new(config: CniConfig) -> Self {
        Self { config }
    }

    /// The IPAM state root (for leak verification).
    #[must_use]
    pub fn ipam_state_dir(&self) -> &Path {
        &self.config.ipam_state_dir
    }

    /// Loads the first network configuration, lexicographically.
    async fn load_netconf(&self) -> Result<(String, serde_json::Value)> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.conf_dir)
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "cannot read CNI conf dir {:?}: {e}",
                    self.config.conf_dir
                ))
            })?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
            if name.ends_with(".conflist") || name.ends_with(".conf") {
                entries.push(path);
            }
        }
        entries.sort();
        let path = entries.first().ok_or_else(|| {
            Error::Internal(format!(
                "no CNI network configuration in {:?}",
                self.config.conf_dir
            ))
        })?;

        let raw = tokio::fs::read_to_string(path).await?;
        let conf: serde_json::Value = serde_json::from_str(&raw)?;
        let name = conf
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("default")
            .to_string();
        Ok((name, conf))
    }

    /// Runs CNI ADD for a container; returns the parsed result.
    pub async fn add(&self, container_id: &str, netns: &str) -> Result<CniResult> {
        let (network_name, conf) = self.load_netconf().await?;
        let output = self
            .invoke("ADD", &network_name, &conf, container_id, netns)
            .await?;

        let result: CniResult = serde_json::from_slice(&output).map_err(|e| {
            Error::Internal(format!("failed to parse CNI ADD result: {e}"))
        })?;
        debug!(container = %container_id, network = %network_name, "CNI ADD complete");
        Ok(result)
    }

    /// Runs CNI DEL for a container.
    pub async fn del(&self, container_id: &str, netns: &str) -> Result<()> {
        let (network_name, conf) = self.load_netconf().await?;
        self.invoke("DEL", &network_name, &conf, container_id, netns)
            .await?;
        debug!(container = %container_id, network = %network_name, "CNI DEL complete");
        Ok(())
    }

    async fn invoke(
        &self,
        command: &str,
        network_name: &str,
        conf: &serde_json::Value,
        container_id: &str,
        netns: &str,
    ) -> Result<Vec<u8>> {
        // conflist wraps plugin configs; execute the first plugin with the
        // list's name and version spliced in.
        let plugin_conf = match conf.get("plugins").and_then(|p| p.as_array()) {
            Some(plugins) => {
                let mut first = plugins
                    .first()
                    .ok_or_else(|| Error::Internal("empty CNI plugin list".into()))?
                    .clone();
                if let Some(obj) = first.as_object_mut() {
                    obj.insert("name".into(), serde_json::json!(network_name));
                    obj.insert("cniVersion".into(), serde_json::json!(CNI_VERSION));
                }
                first
            }
            None => conf.clone(),
        };

        let plugin_type = plugin_conf
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Internal("CNI plugin config has no type".into()))?;
        let plugin_bin = self.config.bin_dir.join(plugin_type);

        let mut child = tokio::process::Command::new(&plugin_bin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", "eth0")
            .env("CNI_PATH", &self.config.bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to execute {plugin_bin:?}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(&serde_json::to_vec(&plugin_conf)?)
                .await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            // Plugins report structured errors on stdout; IPAM exhaustion
            // and duplicate-allocation conflicts get distinct kinds.
            let message = if stdout.trim().is_empty() {
                stderr.trim().to_string()
            } else {
                stdout.trim().to_string()
            };
            warn!(container = %container_id, command, error = %message, "CNI plugin failed");

            let lowered = message.to_lowercase();
            if lowered.contains("no ip addresses available") {
                return Err(Error::NetworkExhausted(message));
            }
            if lowered.contains("already allocated") || lowered.contains("duplicate") {
                return Err(Error::NetworkConflict {
                    id: container_id.to_string(),
                    reason: message,
                });
            }
            return Err(Error::Internal(format!("CNI {command} failed: {message}")));
        }

        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> CniResult {
        serde_json::from_value(serde_json::json!({
            "cniVersion": "1.0.0",
            "interfaces": [
                { "name": "kvmbr0", "mac": "aa:bb:cc:00:00:01" },
                { "name": "tap3f9c2a", "mac": "aa:bb:cc:dd:ee:ff", "sandbox": "/var/run/netns/c1" }
            ],
            "ips": [
                { "address": "10.88.0.5/16", "gateway": "10.88.0.1", "interface": 1 }
            ],
            "dns": { "nameservers": ["10.88.0.1", "1.1.1.1"] }
        }))
        .unwrap()
    }

    #[test]
    fn parse_extracts_tap_ip_gateway() {
        let alloc = parse_result(&sample_result()).unwrap();
        assert_eq!(alloc.tap_device, "tap3f9c2a");
        assert_eq!(alloc.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(alloc.ip.to_string(), "10.88.0.5");
        assert_eq!(alloc.prefix_len, 16);
        assert_eq!(alloc.gateway.unwrap().to_string(), "10.88.0.1");
        assert_eq!(alloc.nameservers.len(), 2);
    }

    #[test]
    fn parse_rejects_missing_tap() {
        let result: CniResult = serde_json::from_value(serde_json::json!({
            "interfaces": [{ "name": "eth0" }],
            "ips": [{ "address": "10.0.0.2/24" }]
        }))
        .unwrap();
        assert!(parse_result(&result).is_err());
    }

    #[test]
    fn parse_rejects_missing_ip() {
        let result: CniResult = serde_json::from_value(serde_json::json!({
            "interfaces": [{ "name": "tap0" }],
            "ips": []
        }))
        .unwrap();
        assert!(parse_result(&result).is_err());
    }

    #[test]
    fn netmask_conversion() {
        assert_eq!(prefix_to_netmask(16), "255.255.0.0");
        assert_eq!(prefix_to_netmask(24), "255.255.255.0");
        assert_eq!(prefix_to_netmask(32), "255.255.255.255");
        assert_eq!(prefix_to_netmask(0), "0.0.0.0");
    }
}
