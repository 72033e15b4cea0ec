//! Which entry of the configured ip list this process is.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket},
};

use log::debug;

use crate::{Result, WorkerErr};

/// Answers questions about the addresses of the machine this process runs on.
pub trait HostAddress: Send + Sync {
    /// The address other hosts reach this one at.
    fn host_ip(&self) -> io::Result<IpAddr>;

    /// Whether `address` (an ip or a host name) belongs to this machine.
    fn is_local(&self, address: &str) -> bool;
}

/// The addresses of the real machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostAddress for SystemHost {
    fn host_ip(&self) -> io::Result<IpAddr> {
        // Connecting a UDP socket sends nothing, it only picks the outbound interface.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1))?;
        Ok(socket.local_addr()?.ip())
    }

    fn is_local(&self, address: &str) -> bool {
        resolve(address).into_iter().any(|ip| {
            ip.is_unspecified() || ip.is_loopback() || UdpSocket::bind((ip, 0)).is_ok()
        })
    }
}

/// A host with a fixed set of addresses.
#[derive(Debug, Clone)]
pub struct FixedHost {
    ip: IpAddr,
    local: Vec<IpAddr>,
}

impl FixedHost {
    /// Creates a new `FixedHost`.
    ///
    /// # Arguments
    /// * `ip` - The address of the host.
    /// * `local` - Other addresses bound to the host, besides `ip`.
    pub fn new(ip: IpAddr, local: Vec<IpAddr>) -> Self {
        Self { ip, local }
    }
}

impl HostAddress for FixedHost {
    fn host_ip(&self) -> io::Result<IpAddr> {
        Ok(self.ip)
    }

    fn is_local(&self, address: &str) -> bool {
        resolve(address)
            .into_iter()
            .any(|ip| ip == self.ip || self.local.contains(&ip))
    }
}

/// Resolves an ip or a host name, an unresolvable name has no addresses.
fn resolve(address: &str) -> Vec<IpAddr> {
    match (address, 0).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            debug!(address = address, error:% = e; "address does not resolve");
            Vec::new()
        }
    }
}

/// Finds this host in the ip list.
///
/// # Arguments
/// * `ips` - The worker addresses, in task order.
/// * `host` - This host.
///
/// # Returns
/// The index of the first entry resolving to this host's address, or an error naming the
/// address and the list.
pub fn assign_task_id(ips: &[String], host: &dyn HostAddress) -> Result<usize> {
    let address = host.host_ip()?;

    ips.iter()
        .position(|ip| resolve(ip).contains(&address))
        .ok_or_else(|| WorkerErr::AddressResolution {
            address: address.to_string(),
            ips: ips.to_vec(),
        })
}
