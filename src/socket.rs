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

use crate::config::SocketConfig;
use socket2::{SockRef, TcpKeepalive};
use std::{io, net::IpAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::instrument;

#[instrument]
pub async fn init_tcp_listener(bind_addr: IpAddr, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((bind_addr, port)).await
}

#[instrument(skip(config))]
pub async fn connect_tcp(host: &str, port: u16, config: &SocketConfig) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    apply_keepalive(&stream, config)?;
    Ok(stream)
}

/// Dead-peer detection on the control channel: kernel keepalive probes stand
/// in for application-level pings, the user timeout closes the connection
/// once the peer has been silent past the configured limit.
pub fn apply_keepalive(stream: &TcpStream, config: &SocketConfig) -> io::Result<()> {
    let sock = SockRef::from(stream);

    let mut tcp_keepalive = TcpKeepalive::new();
    if let Some(keepalive) = config.keepalive_time {
        tcp_keepalive = tcp_keepalive.with_time(keepalive);
    }
    if let Some(keepalive) = config.keepalive_interval {
        tcp_keepalive = tcp_keepalive.with_interval(keepalive);
    }
    if let Some(retries) = config.keepalive_retries {
        tcp_keepalive = tcp_keepalive.with_retries(retries);
    }

    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&tcp_keepalive)?;
    #[cfg(target_os = "linux")]
    sock.set_tcp_user_timeout(config.user_timeout)?;
    sock.set_tcp_nodelay(true)?;

    Ok(())
}
