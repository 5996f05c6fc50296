/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Coordinator discovery over multicast DNS.
//!
//! The coordinator registers `_cuemesh._tcp.local.` so agents on the same
//! LAN can find it without configuration; manual host:port entry stays
//! available when multicast is filtered.

use crate::error::DiscoveryResult;
use gethostname::gethostname;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::net::IpAddr;
use tokio::{select, sync::mpsc};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{info, instrument, warn};

pub const SERVICE_TYPE: &str = "_cuemesh._tcp.local.";
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCoordinator {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    pub controller_id: String,
    pub show_title: String,
}

/// mDNS advertisement of a running coordinator. Dropping the handle
/// unregisters the service.
pub struct CoordinatorAdvertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl CoordinatorAdvertisement {
    #[instrument]
    pub fn start(controller_id: &str, port: u16, show_title: &str) -> DiscoveryResult<Self> {
        let instance = format!("CueMesh-{}", &controller_id[..8.min(controller_id.len())]);
        let hostname = gethostname().to_string_lossy().to_string();
        let host = format!("{hostname}.local.");

        let properties = [
            ("controller_id", controller_id),
            ("show_title", show_title),
            ("version", PROTOCOL_VERSION),
        ];

        let daemon = ServiceDaemon::new()?;
        let service = ServiceInfo::new(SERVICE_TYPE, &instance, &host, "", port, &properties[..])?
            .enable_addr_auto();
        let fullname = service.get_fullname().to_owned();
        daemon.register(service)?;

        info!("mDNS advertisement started as '{instance}' on port {port}");

        Ok(Self { daemon, fullname })
    }

    pub fn stop(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("Could not unregister mDNS service: {e}");
        }
        self.daemon.shutdown().ok();
    }
}

/// Browses for coordinators and forwards every resolved one to `found_tx`
/// until shutdown is requested.
#[instrument(skip(subsys, found_tx))]
pub async fn browse_coordinators(
    subsys: SubsystemHandle,
    found_tx: mpsc::Sender<DiscoveredCoordinator>,
) -> DiscoveryResult<()> {
    let daemon = ServiceDaemon::new()?;
    let events = daemon.browse(SERVICE_TYPE)?;

    info!("mDNS browser started.");

    loop {
        select! {
            event = events.recv_async() => match event {
                Ok(ServiceEvent::ServiceResolved(service)) => {
                    if let Some(coordinator) = coordinator_from_service(&service) {
                        info!(
                            "Discovered coordinator '{}' at {}:{}",
                            coordinator.controller_id, coordinator.host, coordinator.port
                        );
                        found_tx.send(coordinator).await.ok();
                    }
                }
                Ok(_) => (),
                Err(e) => {
                    warn!("mDNS browser channel closed: {e}");
                    break;
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    daemon.shutdown().ok();
    info!("mDNS browser stopped.");

    Ok(())
}

fn coordinator_from_service(service: &ServiceInfo) -> Option<DiscoveredCoordinator> {
    let host = *service.get_addresses().iter().next()?;
    Some(DiscoveredCoordinator {
        name: service.get_fullname().to_owned(),
        host,
        port: service.get_port(),
        controller_id: service
            .get_property_val_str("controller_id")
            .unwrap_or_default()
            .to_owned(),
        show_title: service
            .get_property_val_str("show_title")
            .unwrap_or_default()
            .to_owned(),
    })
}
