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
    agent::{AgentEvent, run_agent},
    config::Config,
    error::CueMeshError,
    player::mpv::MpvPlayer,
    telemetry,
};
use miette::Result;
use std::time::Duration;
use tokio::{select, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let config = Config::load().await?;

    info!("Starting {} agent …", config.instance_name());

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("cuemesh-agent", move |s| async move {
            let player = MpvPlayer::spawn().await?;

            let (events_tx, mut events_rx) = mpsc::channel(256);
            s.start(SubsystemBuilder::new("events", move |s| async move {
                loop {
                    select! {
                        Some(event) = events_rx.recv() => match event {
                            AgentEvent::StateChanged(state) => debug!("State event: {state}"),
                            AgentEvent::Testscreen(on) => info!("Test screen: {on}"),
                        },
                        _ = s.on_shutdown_requested() => break,
                    }
                }
                Ok::<(), CueMeshError>(())
            }));

            run_agent(s, config, player, events_tx).await?;
            Ok::<(), CueMeshError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}
