//! Whether the workers share this machine and how many devices each one drives.

use std::{env, io, process::Command};

use log::{debug, info};
use worker::HostAddress;

use crate::{configs::RunConfig, error::OrchestratorError};

/// Counts the accelerator devices of this machine.
pub trait DeviceInventory: Send + Sync {
    fn device_count(&self) -> io::Result<usize>;
}

/// The devices of the real machine.
///
/// `CUDA_VISIBLE_DEVICES` wins when it is set, then `nvidia-smi`, then a single device.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl DeviceInventory for SystemDevices {
    fn device_count(&self) -> io::Result<usize> {
        if let Ok(visible) = env::var("CUDA_VISIBLE_DEVICES") {
            let count = visible.split(',').filter(|d| !d.trim().is_empty()).count();
            if count > 0 {
                debug!(count = count; "devices from CUDA_VISIBLE_DEVICES");
                return Ok(count);
            }
        }

        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=index", "--format=csv,noheader"])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let count = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .count();
                debug!(count = count; "devices from nvidia-smi");
                Ok(count.max(1))
            }
            _ => {
                debug!("no accelerator inventory found, assuming a single device");
                Ok(1)
            }
        }
    }
}

/// A fixed amount of devices.
#[derive(Debug, Clone, Copy)]
pub struct FixedDevices(pub usize);

impl DeviceInventory for FixedDevices {
    fn device_count(&self) -> io::Result<usize> {
        Ok(self.0)
    }
}

/// Where the workers of a run live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Every worker runs on this machine.
    pub all_local: bool,
    pub devices_per_worker: usize,
}

impl Topology {
    pub fn total_devices(&self, worker_count: usize) -> usize {
        self.devices_per_worker * worker_count
    }
}

/// Resolves the topology of a run.
///
/// When every address of the ip list belongs to this machine, the local devices are split
/// evenly across the workers. Otherwise each host drives `config.local_device_count`.
///
/// # Arguments
/// * `config` - The run's config.
/// * `host` - This machine's addresses.
/// * `devices` - This machine's device inventory.
///
/// # Returns
/// The topology, or a configuration error if the local devices don't split evenly.
pub fn resolve(
    config: &RunConfig,
    host: &dyn HostAddress,
    devices: &dyn DeviceInventory,
) -> Result<Topology, OrchestratorError> {
    let worker_count = config.worker_count();
    let all_local = config.ips.iter().all(|ip| host.is_local(ip));

    if !all_local {
        info!(
            workers = worker_count,
            devices_per_worker = config.local_device_count;
            "workers run on separate hosts"
        );
        return Ok(Topology {
            all_local,
            devices_per_worker: config.local_device_count,
        });
    }

    let total = devices.device_count()?;
    if total % worker_count != 0 || total < worker_count {
        return Err(OrchestratorError::Configuration(format!(
            "{total} local device(s) can't be split evenly across {worker_count} workers"
        )));
    }

    let devices_per_worker = total / worker_count;
    info!(
        workers = worker_count,
        devices = total,
        devices_per_worker = devices_per_worker,
        ignored_local_device_count = config.local_device_count;
        "every worker is local, devices are detected"
    );

    Ok(Topology {
        all_local,
        devices_per_worker,
    })
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use worker::FixedHost;

    use super::*;

    fn config(ips: &[&str]) -> RunConfig {
        RunConfig {
            ips: ips.iter().map(|s| s.to_string()).collect(),
            local_device_count: 3,
            ..Default::default()
        }
    }

    fn host() -> FixedHost {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        FixedHost::new(ip, vec!["127.0.0.1".parse().unwrap()])
    }

    #[test]
    fn local_devices_are_split_evenly() {
        let topology = resolve(&config(&["127.0.0.1", "192.0.2.1"]), &host(), &FixedDevices(4))
            .unwrap();

        assert_eq!(
            topology,
            Topology {
                all_local: true,
                devices_per_worker: 2
            }
        );
        assert_eq!(topology.total_devices(2), 4);
    }

    #[test]
    fn uneven_local_devices_are_rejected() {
        let result = resolve(&config(&["127.0.0.1"; 3]), &host(), &FixedDevices(4));
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));

        let result = resolve(&config(&["127.0.0.1"; 3]), &host(), &FixedDevices(0));
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    }

    #[test]
    fn remote_hosts_use_the_configured_devices() {
        let topology =
            resolve(&config(&["192.0.2.1", "198.51.100.4"]), &host(), &FixedDevices(8)).unwrap();

        assert!(!topology.all_local);
        assert_eq!(topology.devices_per_worker, 3);
    }
}
