//! Container network strategies.
//!
//! A [`Network`] names a strategy by type tag; the [`Registry`] resolves the
//! tag to a [`NetworkStrategy`] that creates the interface for a given init
//! pid and emits an opaque [`NetworkState`] record. Statistics are read back
//! from the recorded state, keyed off the interface name.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use berth_common::error::{BerthError, Result};

/// Configuration of one container network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Strategy type tag, e.g. `"loopback"` or `"veth"`.
    #[serde(rename = "type")]
    pub net_type: String,
    /// Interface name inside the container; the strategy picks a default
    /// when empty.
    #[serde(default)]
    pub name: String,
    /// Host bridge the interface attaches to, for bridged strategies.
    #[serde(default)]
    pub bridge: String,
    /// CIDR address assigned inside the container.
    #[serde(default)]
    pub address: String,
    /// Default gateway inside the container.
    #[serde(default)]
    pub gateway: String,
    /// Interface MTU; 0 keeps the kernel default.
    #[serde(default)]
    pub mtu: u32,
}

/// A route installed inside the container's network namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR.
    pub destination: String,
    /// Source address, empty for any.
    #[serde(default)]
    pub source: String,
    /// Gateway address, empty for link-scope routes.
    #[serde(default)]
    pub gateway: String,
    /// Interface the route is bound to.
    pub interface: String,
}

/// Opaque per-network record emitted by a strategy at create time.
///
/// Entries appear in runtime state in the same order as the configured
/// networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Strategy type tag that produced this record.
    #[serde(rename = "type")]
    pub net_type: String,
    /// Interface name inside the container.
    pub interface: String,
    /// Host side of a veth pair, empty for other strategies.
    #[serde(default)]
    pub veth_host: String,
    /// Container side of a veth pair, empty for other strategies.
    #[serde(default)]
    pub veth_child: String,
}

/// Interface counters read from `/sys/class/net/<iface>/statistics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets received.
    pub rx_packets: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Receive drops.
    pub rx_dropped: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Transmit drops.
    pub tx_dropped: u64,
}

/// One way of providing a network to a container.
pub trait NetworkStrategy: Send + Sync + std::fmt::Debug {
    /// Creates the network for the init pid, appending its state record.
    ///
    /// The strategy is responsible for moving any created interfaces into
    /// the init's network namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if interface creation or migration fails.
    fn create(&self, network: &Network, nspid: Pid, state: &mut Vec<NetworkState>) -> Result<()>;

    /// Finishes interface bring-up from inside the container's namespaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be configured.
    fn initialize(&self, network: &Network, state: &NetworkState) -> Result<()>;

    /// Reads interface counters for a previously created network.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysfs counters cannot be read.
    fn stats(&self, state: &NetworkState) -> Result<NetworkStats>;
}

/// Maps network type tags to their strategies.
pub struct Registry {
    strategies: HashMap<String, Box<dyn NetworkStrategy>>,
}

impl Registry {
    /// Creates a registry holding the built-in strategies.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register("loopback", Box::new(Loopback));
        registry
    }

    /// Registers a strategy under a type tag, replacing any previous one.
    pub fn register(&mut self, tag: impl Into<String>, strategy: Box<dyn NetworkStrategy>) {
        self.strategies.insert(tag.into(), strategy);
    }

    /// Resolves a type tag to its strategy.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ConfigMismatch`] for an unknown tag.
    pub fn resolve(&self, tag: &str) -> Result<&dyn NetworkStrategy> {
        self.strategies
            .get(tag)
            .map(|strategy| strategy.as_ref())
            .ok_or_else(|| BerthError::ConfigMismatch {
                message: format!("unknown network strategy type: {tag}"),
            })
    }
}

/// Returns the process-wide strategy registry.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::with_defaults)
}

/// The loopback strategy: no interface to create or migrate, only the
/// in-namespace `lo` device to bring up.
#[derive(Debug)]
pub struct Loopback;

impl NetworkStrategy for Loopback {
    fn create(&self, network: &Network, _nspid: Pid, state: &mut Vec<NetworkState>) -> Result<()> {
        let interface = if network.name.is_empty() {
            "lo".to_string()
        } else {
            network.name.clone()
        };
        state.push(NetworkState {
            net_type: "loopback".into(),
            interface,
            veth_host: String::new(),
            veth_child: String::new(),
        });
        Ok(())
    }

    fn initialize(&self, _network: &Network, state: &NetworkState) -> Result<()> {
        interface_up(&state.interface)
    }

    fn stats(&self, state: &NetworkState) -> Result<NetworkStats> {
        read_interface_stats(&state.interface)
    }
}

/// Brings a network interface up in the calling process's namespace.
///
/// # Errors
///
/// Returns an error if the name is too long or an ioctl fails.
pub fn interface_up(name: &str) -> Result<()> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(BerthError::ConfigMismatch {
            message: format!("interface name too long: {name}"),
        });
    }

    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| BerthError::system("socket", e))?;

    // SAFETY: an all-zero ifreq is a valid initial value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: ifr is a properly initialized ifreq and sock is a live
    // AF_INET datagram socket.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) } < 0 {
        return Err(BerthError::system("ioctl(SIOCGIFFLAGS)", Errno::last()));
    }
    // SAFETY: SIOCGIFFLAGS populated the flags member of the union.
    unsafe {
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    // SAFETY: same ifreq, now carrying the updated flags.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &ifr) } < 0 {
        return Err(BerthError::system("ioctl(SIOCSIFFLAGS)", Errno::last()));
    }
    tracing::debug!(interface = name, "interface up");
    Ok(())
}

fn read_interface_stats(interface: &str) -> Result<NetworkStats> {
    let base = PathBuf::from("/sys/class/net").join(interface).join("statistics");
    let read = |counter: &str| -> Result<u64> {
        let path = base.join(counter);
        let contents = std::fs::read_to_string(&path).map_err(|e| BerthError::io(path, e))?;
        Ok(contents.trim().parse().unwrap_or(0))
    };
    Ok(NetworkStats {
        rx_bytes: read("rx_bytes")?,
        rx_packets: read("rx_packets")?,
        rx_errors: read("rx_errors")?,
        rx_dropped: read("rx_dropped")?,
        tx_bytes: read("tx_bytes")?,
        tx_packets: read("tx_packets")?,
        tx_errors: read("tx_errors")?,
        tx_dropped: read("tx_dropped")?,
    })
}
