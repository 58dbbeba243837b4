//! HTTP reverse proxy engine
//!
//! Per connection: read the request head, route by Host to a configured
//! site, open one backend connection, then relay at message granularity —
//! applying header-rewrite templates and watching auth-designated
//! exchanges — or downgrade to a raw TCP splice when the site carries no
//! auth and no rewrite rules, or when the client asks for a protocol
//! upgrade.

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnTuning, HttpProxyConfig, SiteConfig};
use crate::core::safety::{SafetyRecord, SafetyRegistry};
use crate::core::template::{RequestContext, Template, VarRegistry};
use crate::core::{copy_bidirectional_idle, RelayOutcome};
use crate::http::message::{
    read_request_head, read_response_head, relay_body, request_body_framing,
    response_body_framing, simple_response, RequestHead,
};
use crate::listener;
use crate::logger::log;

/// A site with its header-rewrite templates parsed once at startup
struct SiteRuntime {
    cfg: Arc<SiteConfig>,
    templates: Vec<(String, Template)>,
}

impl SiteRuntime {
    fn new(cfg: Arc<SiteConfig>) -> Self {
        let templates = cfg
            .set_headers
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name.clone(), Template::parse(value)))
            .collect();
        Self { cfg, templates }
    }
}

/// One HTTP reverse proxy listener
pub struct HttpProxyEngine {
    name: String,
    listen_address: String,
    listen_port: u16,
    sites: HashMap<String, Arc<SiteRuntime>>,
    registry: SafetyRegistry,
    vars: Arc<VarRegistry>,
    tuning: ConnTuning,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    client_count: AtomicUsize,
}

impl HttpProxyEngine {
    pub fn new(
        cfg: &HttpProxyConfig,
        tuning: ConnTuning,
        vars: Arc<VarRegistry>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let tls = if cfg.is_https() {
            let cert = cfg
                .cert_file
                .as_ref()
                .ok_or_else(|| anyhow!("https listener '{}' missing cert_file", cfg.name))?;
            let key = cfg
                .key_file
                .as_ref()
                .ok_or_else(|| anyhow!("https listener '{}' missing key_file", cfg.name))?;
            Some(crate::tls::build_acceptor(cert, key)?)
        } else {
            None
        };

        let sites = cfg
            .site_map()
            .into_iter()
            .map(|(domain, site)| (domain, Arc::new(SiteRuntime::new(site))))
            .collect();

        Ok(Self {
            name: cfg.name.clone(),
            listen_address: cfg.listen_address.clone(),
            listen_port: cfg.listen_port,
            sites,
            registry: SafetyRegistry::new(cfg.ip_blacklist_minutes),
            vars,
            tuning,
            tls,
            shutdown,
            client_count: AtomicUsize::new(0),
        })
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
            tls = self.tls.is_some(),
            sites = self.sites.len(),
            "HTTP reverse proxy listening"
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

    /// Handle one accepted connection
    async fn client_join(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        log::connection(&peer.to_string(), "new");
        listener::tune_stream(&stream, self.tuning.tcp_nodelay);

        let joined = self.client_count.fetch_add(1, Ordering::Relaxed) + 1;
        log::trace!(peer = %peer, clients = joined, "client join");
        let _count_guard = scopeguard::guard(Arc::clone(self), |engine| {
            let left = engine.client_count.fetch_sub(1, Ordering::Relaxed) - 1;
            log::trace!(clients = left, "client exit");
        });

        // Blacklisted IPs are dropped before any handshake work
        let Some(record) = self.registry.check(peer.ip()) else {
            return Ok(());
        };

        let token = CancellationToken::new();
        let _conn_guard = record.attach(token.clone());

        if let Some(tls) = self.tls.clone() {
            let tls_stream = match tokio::time::timeout(
                self.tuning.tls_handshake_timeout,
                tls.accept(stream),
            )
            .await
            {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    log::debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return Ok(());
                }
                Err(_) => {
                    log::debug!(peer = %peer, "TLS handshake timeout");
                    return Ok(());
                }
            };
            let peer_cert = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec());

            tokio::select! {
                result = self.serve_connection(tls_stream, peer, true, peer_cert, &record) => result,
                _ = token.cancelled() => {
                    log::debug!(peer = %peer, "connection aborted by safety registry");
                    Ok(())
                }
            }
        } else {
            tokio::select! {
                result = self.serve_connection(stream, peer, false, None, &record) => result,
                _ = token.cancelled() => {
                    log::debug!(peer = %peer, "connection aborted by safety registry");
                    Ok(())
                }
            }
        }
    }

    /// Route the first request and drive the site exchange loop
    async fn serve_connection<S>(
        &self,
        mut client: S,
        peer: SocketAddr,
        tls: bool,
        peer_cert: Option<Vec<u8>>,
        record: &Arc<SafetyRecord>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client_buf = BytesMut::with_capacity(self.tuning.buffer_size);

        let Some(request) = read_request_head(
            &mut client,
            &mut client_buf,
            self.tuning.max_header_size,
        )
        .await?
        else {
            return Ok(());
        };

        // Fail the connection outright on a missing Host or unknown domain
        let Some(host) = request.host() else {
            log::error!(peer = %peer, target = %request.target, "request without host header");
            return Ok(());
        };
        let Some(site) = self.sites.get(&host) else {
            log::error!(peer = %peer, host = %host, "no site matches requested host");
            return Ok(());
        };
        let site = Arc::clone(site);

        // One backend connection for the lifetime of this client connection
        let backend_addr = (site.cfg.host.as_str(), site.cfg.port);
        let backend = match tokio::time::timeout(
            self.tuning.connect_timeout,
            TcpStream::connect(backend_addr),
        )
        .await
        {
            Ok(Ok(stream)) => {
                if self.tuning.tcp_nodelay {
                    let _ = stream.set_nodelay(true);
                }
                stream
            }
            Ok(Err(e)) => {
                log::error!(peer = %peer, site = %site.cfg.domain, error = %e, "backend connect failed");
                let _ = client.write_all(&simple_response(503, "Service Unavailable")).await;
                return Ok(());
            }
            Err(_) => {
                log::error!(peer = %peer, site = %site.cfg.domain, "backend connect timeout");
                let _ = client.write_all(&simple_response(503, "Service Unavailable")).await;
                return Ok(());
            }
        };

        self.serve_site(client, backend, request, client_buf, &site, peer, tls, peer_cert, record)
            .await
    }

    /// Per-message relay loop for one routed connection
    #[allow(clippy::too_many_arguments)]
    async fn serve_site<S>(
        &self,
        mut client: S,
        mut backend: TcpStream,
        mut request: RequestHead,
        mut client_buf: BytesMut,
        site: &SiteRuntime,
        peer: SocketAddr,
        tls: bool,
        peer_cert: Option<Vec<u8>>,
        record: &Arc<SafetyRecord>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut backend_buf = BytesMut::with_capacity(self.tuning.buffer_size);

        self.apply_set_headers(&mut request, site, peer, tls, peer_cert.as_deref());
        self.forward_request(&mut client, &mut backend, &mut client_buf, &request)
            .await?;

        // A site with no auth and no rewrite rules needs no further HTTP
        // parsing: hand both sockets to the relay engine
        if site.cfg.is_plain_passthrough() {
            log::debug!(peer = %peer, site = %site.cfg.domain, "plain site, switching to tcp splice");
            return self
                .raw_splice(client, backend, client_buf, record, peer)
                .await;
        }

        loop {
            record.extend(crate::core::safety::BASE_PENALTY);

            if request.is_upgrade() {
                log::debug!(peer = %peer, site = %site.cfg.domain, "protocol upgrade, switching to tcp splice");
                return self
                    .raw_splice(client, backend, client_buf, record, peer)
                    .await;
            }

            // Relay the backend's response for the current request
            let response = read_response_head(
                &mut backend,
                &mut backend_buf,
                self.tuning.max_header_size,
            )
            .await?;
            client.write_all(&response.encode()).await?;
            let framing = response_body_framing(
                &response,
                &request.method,
                site.cfg.skip_body_for_head_response,
            );
            relay_body(&mut backend, &mut client, &mut backend_buf, framing).await?;

            // Infer auth outcome from how the backend answered
            if site.cfg.auth_enabled() {
                match auth_outcome(&site.cfg, &request, response.status) {
                    Some(true) => {
                        log::debug!(peer = %peer, site = %site.cfg.domain, target = %request.target, "auth rule passed");
                        self.registry.record_success(record);
                    }
                    Some(false) => {
                        log::warn!(peer = %peer, site = %site.cfg.domain, target = %request.target, "auth rule failed");
                        self.registry.record_failure(record);
                        if record.is_blacklisted() {
                            return Ok(());
                        }
                    }
                    // No matching rule: authorization implicitly granted
                    None => {}
                }
            }

            if !request.keep_alive() {
                log::trace!(peer = %peer, site = %site.cfg.domain, "keep-alive off, closing");
                return Ok(());
            }

            // Await the next pipelined request, bounded by the idle timeout
            let next = tokio::time::timeout(
                self.tuning.idle_timeout,
                read_request_head(&mut client, &mut client_buf, self.tuning.max_header_size),
            )
            .await
            .map_err(|_| anyhow!("idle timeout waiting for next request"))??;
            let Some(next) = next else {
                return Ok(());
            };
            request = next;

            self.apply_set_headers(&mut request, site, peer, tls, peer_cert.as_deref());
            self.forward_request(&mut client, &mut backend, &mut client_buf, &request)
                .await?;
        }
    }

    /// Send the (rewritten) request head and stream its body to the backend
    async fn forward_request<S>(
        &self,
        client: &mut S,
        backend: &mut TcpStream,
        client_buf: &mut BytesMut,
        request: &RequestHead,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        backend.write_all(&request.encode()).await?;
        relay_body(client, backend, client_buf, request_body_framing(request)).await?;
        Ok(())
    }

    /// Flush buffered bytes and splice the two sockets without further parsing
    async fn raw_splice<S>(
        &self,
        client: S,
        mut backend: TcpStream,
        client_buf: BytesMut,
        record: &Arc<SafetyRecord>,
        peer: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !client_buf.is_empty() {
            log::debug!(peer = %peer, bytes = client_buf.len(), "flushing buffered bytes to backend");
            backend.write_all(&client_buf).await?;
        }
        let outcome: RelayOutcome = copy_bidirectional_idle(
            client,
            backend,
            self.tuning.idle_timeout,
            Some(Arc::clone(record)),
        )
        .await?;
        if outcome.completed {
            log::trace!(peer = %peer, up = outcome.a_to_b, down = outcome.b_to_a, "splice finished");
        } else {
            log::debug!(peer = %peer, up = outcome.a_to_b, down = outcome.b_to_a, "splice idle timeout");
        }
        Ok(())
    }

    /// Render and apply the site's header-rewrite templates. A template
    /// whose variables do not all resolve leaves the header untouched.
    fn apply_set_headers(
        &self,
        request: &mut RequestHead,
        site: &SiteRuntime,
        peer: SocketAddr,
        tls: bool,
        peer_cert: Option<&[u8]>,
    ) {
        if site.templates.is_empty() {
            return;
        }
        let rendered: Vec<(String, String)> = {
            let ctx = RequestContext {
                peer_addr: peer,
                tls,
                peer_cert_der: peer_cert,
                headers: &request.headers,
            };
            site.templates
                .iter()
                .filter_map(|(name, template)| {
                    template
                        .render(&self.vars, &ctx)
                        .map(|value| (name.clone(), value))
                })
                .collect()
        };
        for (name, value) in rendered {
            request.set_header(&name, value);
        }
    }
}

/// First matching auth rule's verdict: `None` when no rule applies
/// (implicit allow), `Some(passed)` otherwise.
fn auth_outcome(site: &SiteConfig, request: &RequestHead, status: u16) -> Option<bool> {
    for rule in &site.auth_rules {
        if rule.target.is_empty() {
            continue;
        }
        if !rule.method.eq_ignore_ascii_case(&request.method) {
            continue;
        }
        if rule.target == "/" {
            if request.target != "/" {
                continue;
            }
        } else if !request.target.starts_with(&rule.target) {
            continue;
        }
        return Some(status == rule.result);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthRule;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_site(
        domain: &str,
        backend: SocketAddr,
        auth_rules: Vec<AuthRule>,
        set_headers: BTreeMap<String, String>,
    ) -> SiteConfig {
        SiteConfig {
            name: domain.to_string(),
            domain: domain.to_string(),
            host: backend.ip().to_string(),
            port: backend.port(),
            skip_body_for_head_response: false,
            requires_auth: !auth_rules.is_empty(),
            auth_rules,
            set_headers,
            options: BTreeMap::new(),
        }
    }

    fn test_engine(sites: Vec<SiteConfig>) -> Arc<HttpProxyEngine> {
        let cfg = HttpProxyConfig {
            enable: true,
            protocol: "http".to_string(),
            name: "test".to_string(),
            listen_address: "127.0.0.1".to_string(),
            listen_port: 1,
            ip_blacklist_minutes: 1440,
            cert_file: None,
            key_file: None,
            sites,
        };
        Arc::new(
            HttpProxyEngine::new(
                &cfg,
                ConnTuning::default(),
                Arc::new(VarRegistry::builtin()),
                CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    fn request_head(method: &str, target: &str) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: 1,
            headers: vec![],
        }
    }

    #[test]
    fn test_auth_outcome_first_matching_rule_wins() {
        let backend: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let site = test_site(
            "x",
            backend,
            vec![
                AuthRule {
                    method: "POST".to_string(),
                    target: "/api/login".to_string(),
                    result: 200,
                },
                AuthRule {
                    method: "POST".to_string(),
                    target: "/api".to_string(),
                    result: 204,
                },
            ],
            BTreeMap::new(),
        );

        // First rule matches and decides, second is never consulted
        let req = request_head("POST", "/api/login");
        assert_eq!(auth_outcome(&site, &req, 200), Some(true));
        assert_eq!(auth_outcome(&site, &req, 401), Some(false));

        // Only the second rule matches here
        let req = request_head("POST", "/api/other");
        assert_eq!(auth_outcome(&site, &req, 204), Some(true));
        assert_eq!(auth_outcome(&site, &req, 200), Some(false));
    }

    #[test]
    fn test_auth_outcome_default_allow() {
        let backend: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let site = test_site(
            "x",
            backend,
            vec![AuthRule {
                method: "POST".to_string(),
                target: "/login".to_string(),
                result: 200,
            }],
            BTreeMap::new(),
        );

        // Method mismatch: no rule applies, implicitly granted
        let req = request_head("GET", "/login");
        assert_eq!(auth_outcome(&site, &req, 500), None);

        // Path mismatch
        let req = request_head("POST", "/other");
        assert_eq!(auth_outcome(&site, &req, 500), None);
    }

    #[test]
    fn test_auth_outcome_root_requires_exact_match() {
        let backend: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let site = test_site(
            "x",
            backend,
            vec![AuthRule {
                method: "GET".to_string(),
                target: "/".to_string(),
                result: 200,
            }],
            BTreeMap::new(),
        );

        assert_eq!(auth_outcome(&site, &request_head("GET", "/"), 200), Some(true));
        // "/" must match exactly, not as a prefix
        assert_eq!(auth_outcome(&site, &request_head("GET", "/page"), 200), None);
    }

    /// Backend that answers every request with a fixed small response and
    /// then copies whatever else arrives into a byte log.
    async fn spawn_echo_backend() -> (SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Read the first request head
            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            loop {
                let n = stream.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();

            // Everything after the first exchange is logged raw
            let mut rest = Vec::new();
            loop {
                match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => rest.extend_from_slice(&tmp[..n]),
                }
            }
            let _ = tx.send(rest);
        });

        (addr, rx)
    }

    #[tokio::test]
    async fn test_plain_site_downgrades_to_raw_splice() {
        let (backend_addr, backend_log) = spawn_echo_backend().await;
        let engine = test_engine(vec![test_site(
            "plain.example.com",
            backend_addr,
            vec![],
            BTreeMap::new(),
        )]);

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let record = engine.registry.check("203.0.113.99".parse().unwrap()).unwrap();
        let peer: SocketAddr = "203.0.113.99:5555".parse().unwrap();

        let serve = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .serve_connection(server_side, peer, false, None, &record)
                    .await
            }
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: plain.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        // First exchange comes back parsed-and-relayed
        // (40 bytes: status line + Content-Length header + blank + "ok")
        let mut response = vec![0u8; 40];
        client.read_exact(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));
        assert!(response.ends_with(b"ok"));

        // A malformed second "request" must be forwarded unparsed, not
        // rejected: the connection is a raw splice now
        client.write_all(b"!!this is not http at all!!").await.unwrap();
        drop(client);

        serve.await.unwrap().unwrap();
        let rest = backend_log.await.unwrap();
        assert_eq!(rest, b"!!this is not http at all!!");
    }

    #[tokio::test]
    async fn test_unknown_host_closes_without_response() {
        let engine = test_engine(vec![]);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let record = engine.registry.check("203.0.113.98".parse().unwrap()).unwrap();
        let peer: SocketAddr = "203.0.113.98:5555".parse().unwrap();

        let serve = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .serve_connection(server_side, peer, false, None, &record)
                    .await
            }
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: nobody.example.com\r\n\r\n")
            .await
            .unwrap();

        serve.await.unwrap().unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty(), "unknown domain must close with no response");
    }

    #[tokio::test]
    async fn test_backend_down_yields_503() {
        // Reserve a port and close it so connects are refused
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let engine = test_engine(vec![test_site(
            "down.example.com",
            dead_addr,
            vec![],
            BTreeMap::new(),
        )]);
        let (mut client, server_side) = tokio::io::duplex(4096);
        let record = engine.registry.check("203.0.113.97".parse().unwrap()).unwrap();
        let peer: SocketAddr = "203.0.113.97:5555".parse().unwrap();

        let serve = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .serve_connection(server_side, peer, false, None, &record)
                    .await
            }
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: down.example.com\r\n\r\n")
            .await
            .unwrap();

        serve.await.unwrap().unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 503"));
    }

    #[tokio::test]
    async fn test_rewritten_headers_reach_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 2048];
            loop {
                let n = stream.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let _ = tx.send(buf);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let mut set_headers = BTreeMap::new();
        set_headers.insert("X-Real-IP".to_string(), "$remote_addr".to_string());
        set_headers.insert("X-Missing".to_string(), "${no_such_var}".to_string());
        // An auth rule keeps the site in message-granularity mode
        let engine = test_engine(vec![test_site(
            "hdr.example.com",
            backend_addr,
            vec![AuthRule {
                method: "POST".to_string(),
                target: "/login".to_string(),
                result: 200,
            }],
            set_headers,
        )]);

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let record = engine.registry.check("198.51.100.7".parse().unwrap()).unwrap();
        let peer: SocketAddr = "198.51.100.7:41000".parse().unwrap();

        let serve = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .serve_connection(server_side, peer, false, None, &record)
                    .await
            }
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: hdr.example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let seen = rx.await.unwrap();
        let seen_text = String::from_utf8_lossy(&seen);
        assert!(seen_text.contains("X-Real-IP: 198.51.100.7"));
        // Unresolvable template leaves the header unset
        assert!(!seen_text.contains("X-Missing"));

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_feeds_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 2048];
            loop {
                let n = stream.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            // The backend rejects the designated login request
            stream
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let engine = test_engine(vec![test_site(
            "auth.example.com",
            backend_addr,
            vec![AuthRule {
                method: "POST".to_string(),
                target: "/login".to_string(),
                result: 200,
            }],
            BTreeMap::new(),
        )]);

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let record = engine.registry.check("198.51.100.8".parse().unwrap()).unwrap();
        let peer: SocketAddr = "198.51.100.8:41001".parse().unwrap();

        let serve = tokio::spawn({
            let engine = Arc::clone(&engine);
            let record = Arc::clone(&record);
            async move {
                engine
                    .serve_connection(server_side, peer, false, None, &record)
                    .await
            }
        });

        client
            .write_all(
                b"POST /login HTTP/1.1\r\nHost: auth.example.com\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        serve.await.unwrap().unwrap();

        assert_eq!(record.failures(), 1);
    }
}
