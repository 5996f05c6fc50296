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

use cuemesh::{
    config::Config,
    coordinator::{api::CoordinatorEvent, start_coordinator},
    discovery::CoordinatorAdvertisement,
    error::CueMeshError,
    telemetry,
};
use miette::Result;
use std::time::Duration;
use tokio::{select, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let config = Config::load().await?;

    info!("Starting {} coordinator …", config.instance_name());

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new(
            "cuemesh-coordinator",
            move |s| async move {
                let (events_tx, mut events_rx) = mpsc::channel(256);
                let coordinator_api = start_coordinator(&s, config.clone(), events_tx).await?;

                let advertisement = if config.coordinator.advertise {
                    match CoordinatorAdvertisement::start(
                        coordinator_api.controller_id(),
                        coordinator_api.port(),
                        &config.coordinator.show_title,
                    ) {
                        Ok(it) => Some(it),
                        Err(e) => {
                            warn!("Discovery unavailable, agents must be pointed here manually: {e}");
                            None
                        }
                    }
                } else {
                    None
                };

                loop {
                    select! {
                        Some(event) = events_rx.recv() => log_event(event),
                        _ = s.on_shutdown_requested() => break,
                    }
                }

                if let Some(advertisement) = advertisement {
                    advertisement.stop();
                }

                Ok::<(), CueMeshError>(())
            },
        ));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}

fn log_event(event: CoordinatorEvent) {
    match event {
        CoordinatorEvent::Hello(s) => {
            info!("Agent connected: {} ({}) [{}]", s.agent_id, s.hostname, s.status);
        }
        CoordinatorEvent::SessionChanged(s) => {
            info!(
                "Agent {}: status={} state={} drift={:.0}ms",
                s.agent_id, s.status, s.state, s.drift_ms
            );
        }
        CoordinatorEvent::Ready { agent_id, cue_id } => {
            info!("Agent {agent_id} ready for cue {cue_id}");
        }
        CoordinatorEvent::Drift { agent_id, report } => {
            debug!(
                "Agent {agent_id}: drift {:.1}ms action {}",
                report.drift_ms, report.action
            );
        }
        CoordinatorEvent::Log { agent_id, record } => {
            info!("[{agent_id}] {}: {}", record.level, record.message);
        }
        CoordinatorEvent::Disconnected { agent_id } => {
            info!("Agent disconnected: {agent_id}");
        }
    }
}
