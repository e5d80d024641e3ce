use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::BufReader,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};
use tracing::debug;

use crate::{
    config::{load_config, Config},
    protocol::{read_message, write_message, Request, Response, CONNECT_TIMEOUT},
};

/// Talks to the daemon of one storage root.
pub struct DaemonClient {
    address: SocketAddr,
}

impl DaemonClient {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::for_config(&load_config(root))
    }

    /// A daemon bound to every interface is still reached through loopback.
    pub fn for_config(config: &Config) -> Self {
        let ip = match config.bind_ip {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        Self::new(SocketAddr::new(ip, config.port))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.request(&Request::Ping).await, Ok(Response::Pong))
    }

    /// Sends one request and waits for its response. Error responses become errors.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        match self.request(request).await? {
            Response::Error { message, .. } => Err(anyhow!(message)),
            response => Ok(response),
        }
    }

    pub async fn request(&self, request: &Request) -> Result<Response> {
        let (mut reader, _writer) = self.send(request).await?;
        read_message(&mut reader)
            .await?
            .ok_or_else(|| anyhow!("Daemon closed the connection without answering"))
    }

    /// Sends one request and hands every response to `on_response` until the daemon closes the
    /// connection. Used for foreground tracking.
    pub async fn stream(
        &self,
        request: &Request,
        mut on_response: impl FnMut(Response) -> Result<()>,
    ) -> Result<()> {
        // The write half stays open, the daemon takes its closing as the client giving up.
        let (mut reader, _writer) = self.send(request).await?;
        while let Some(response) = read_message(&mut reader).await? {
            on_response(response)?;
        }
        Ok(())
    }

    async fn send(&self, request: &Request) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| anyhow!("Timed out connecting to the daemon on {}", self.address))?
            .with_context(|| {
                format!(
                    "Daemon is not reachable on {}. Start it with `trakd start`",
                    self.address
                )
            })?;
        let (reader, mut writer) = stream.into_split();
        debug!(?request, "Sending request to {}", self.address);
        write_message(&mut writer, request).await?;
        Ok((BufReader::new(reader), writer))
    }
}
