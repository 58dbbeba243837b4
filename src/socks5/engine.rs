//! SOCKS5 reverse proxy engine
//!
//! Per connection: blacklist check straight after accept, handshake raced
//! against a fixed timeout, credential verification feeding the safety
//! registry, then CONNECT through the relay engine or UDP ASSOCIATE
//! through the three-way UDP relay.

use anyhow::{anyhow, bail, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnTuning, CredentialStore, Socks5ProxyConfig};
use crate::core::safety::{SafetyRecord, SafetyRegistry};
use crate::core::copy_bidirectional_idle;
use crate::listener;
use crate::logger::log;
use crate::socks5::protocol::{
    self, Address, Socks5Cmd, METHOD_NONE, METHOD_NO_ACCEPTABLE, METHOD_USERPASS,
    REP_COMMAND_NOT_SUPPORTED, REP_HOST_UNREACHABLE, REP_SUCCESS,
};
use crate::socks5::udp;

/// Time allowed for the whole handshake, subnegotiation included
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// One SOCKS5 reverse proxy listener
pub struct Socks5ProxyEngine {
    name: String,
    listen_address: String,
    listen_port: u16,
    registry: SafetyRegistry,
    credentials: CredentialStore,
    supported_methods: Vec<u8>,
    tuning: ConnTuning,
    shutdown: CancellationToken,
}

impl Socks5ProxyEngine {
    pub fn new(cfg: &Socks5ProxyConfig, tuning: ConnTuning, shutdown: CancellationToken) -> Self {
        let credentials = CredentialStore::from_credentials(&cfg.users);
        let supported_methods = if cfg.supported_methods.is_empty() {
            if credentials.is_empty() {
                vec![METHOD_NONE]
            } else {
                vec![METHOD_USERPASS]
            }
        } else {
            cfg.supported_methods.clone()
        };

        Self {
            name: cfg.name.clone(),
            listen_address: cfg.listen_address.clone(),
            listen_port: cfg.listen_port,
            registry: SafetyRegistry::new(cfg.ip_blacklist_minutes),
            credentials,
            supported_methods,
            tuning,
            shutdown,
        }
    }

    pub fn registry(&self) -> &SafetyRegistry {
        &self.registry
    }

    /// Run the accept loop until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener =
            listener::bind(&self.listen_address, self.listen_port, self.tuning.tcp_backlog)?;
        let local_addr = listener.local_addr()?;
        log::info!(
            name = %self.name,
            address = %local_addr,
            methods = ?self.supported_methods,
            "SOCKS5 reverse proxy listening"
        );

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = self.shutdown.cancelled() => {
                    self.registry.abort_all();
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = engine.client_join(stream, peer).await {
                            log::debug!(peer = %peer, error = %e, "Connection error");
                        }
                        log::connection(&peer.to_string(), "closed");
                    });
                }
                Err(e) => {
                    log::error!(name = %self.name, error = %e, "Failed to accept connection");
                    tokio::time::sleep(listener::ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn client_join(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        log::connection(&peer.to_string(), "new");
        listener::tune_stream(&stream, self.tuning.tcp_nodelay);

        // Blacklisted IPs are closed before a single handshake byte is read
        let Some(record) = self.registry.check(peer.ip()) else {
            return Ok(());
        };

        let token = CancellationToken::new();
        let _conn_guard = record.attach(token.clone());
        let local_ip = stream.local_addr()?.ip();

        tokio::select! {
            result = self.serve(stream, peer, local_ip, &record, token.clone()) => result,
            _ = token.cancelled() => {
                log::debug!(peer = %peer, "connection aborted by safety registry");
                Ok(())
            }
        }
    }

    /// Handshake and command dispatch for one connection
    async fn serve<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        local_ip: std::net::IpAddr,
        record: &Arc<SafetyRecord>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // The whole handshake races a fixed timeout
        let (cmd, target) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.handshake(&mut stream, peer, record),
        )
        .await
        .map_err(|_| anyhow!("handshake timeout"))??;

        let cmd = match Socks5Cmd::try_from(cmd) {
            Ok(cmd) => cmd,
            Err(_) => {
                let bound = Address::IPv4([0, 0, 0, 0], 0);
                protocol::write_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, &bound).await?;
                bail!("unsupported command: {}", cmd);
            }
        };

        match cmd {
            Socks5Cmd::Connect => self.handle_connect(stream, peer, target, record).await,
            Socks5Cmd::UdpAssociate => {
                udp::run_udp_associate(
                    stream,
                    peer.ip(),
                    &target,
                    local_ip,
                    self.tuning.idle_timeout,
                    Some(Arc::clone(record)),
                    cancel,
                )
                .await
            }
        }
    }

    /// Method negotiation and credential check. Returns the raw command
    /// byte and requested address.
    async fn handshake<S>(
        &self,
        stream: &mut S,
        peer: SocketAddr,
        record: &Arc<SafetyRecord>,
    ) -> Result<(u8, Address)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let offered = protocol::read_greeting(stream).await?;
        let method = protocol::select_method(&self.supported_methods, &offered);
        protocol::write_method_selection(stream, method).await?;
        if method == METHOD_NO_ACCEPTABLE {
            bail!("no acceptable auth method");
        }

        if method == METHOD_USERPASS {
            let (username, password) = protocol::read_userpass(stream).await?;
            if self.credentials.verify(&username, &password) {
                log::authentication(&peer.to_string(), true);
                self.registry.record_success(record);
                protocol::write_auth_status(stream, true).await?;
            } else {
                log::authentication(&peer.to_string(), false);
                self.registry.record_failure(record);
                protocol::write_auth_status(stream, false).await?;
                bail!("invalid credentials for user '{}'", username);
            }
        }

        let (cmd, addr) = protocol::read_request(stream).await?;
        Ok((cmd, addr))
    }

    /// CONNECT: open the backend and hand both streams to the relay engine
    async fn handle_connect<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        target: Address,
        record: &Arc<SafetyRecord>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let backend = match self.connect_backend(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                log::debug!(peer = %peer, target = %target, error = %e, "backend connect failed");
                let bound = Address::IPv4([0, 0, 0, 0], 0);
                protocol::write_reply(&mut stream, REP_HOST_UNREACHABLE, &bound).await?;
                return Ok(());
            }
        };

        let bound = Address::from(backend.local_addr()?);
        protocol::write_reply(&mut stream, REP_SUCCESS, &bound).await?;
        log::debug!(peer = %peer, target = %target, "connect established");

        let outcome = copy_bidirectional_idle(
            stream,
            backend,
            self.tuning.idle_timeout,
            Some(Arc::clone(record)),
        )
        .await?;
        if outcome.completed {
            log::trace!(peer = %peer, up = outcome.a_to_b, down = outcome.b_to_a, "relay finished");
        } else {
            log::debug!(peer = %peer, up = outcome.a_to_b, down = outcome.b_to_a, "relay idle timeout");
        }
        Ok(())
    }

    async fn connect_backend(&self, target: &Address) -> Result<TcpStream> {
        let addr = target.to_socket_addr().await?;
        let stream = tokio::time::timeout(self.tuning.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("backend connect timeout"))??;
        if self.tuning.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(stream)
    }
}
