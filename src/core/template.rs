//! Header value templating
//!
//! Templates mix literal text with `$name` / `${name}` placeholders that
//! resolve against a registry of variable providers. Rendering is
//! all-or-nothing per header: if any referenced variable is absent the
//! whole value is discarded and the header is not set, so a partially
//! substituted value never reaches the backend.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Request-scoped inputs the variable providers draw from
pub struct RequestContext<'a> {
    pub peer_addr: SocketAddr,
    /// Whether the client connection is TLS-wrapped
    pub tls: bool,
    /// DER-encoded TLS peer certificate, when one was presented
    pub peer_cert_der: Option<&'a [u8]>,
    /// Request header fields in arrival order
    pub headers: &'a [(String, String)],
}

impl<'a> RequestContext<'a> {
    /// Case-insensitive header lookup (first occurrence)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A named variable resolvable from the current request
pub trait VarProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String>;
}

struct HttpHost;

impl VarProvider for HttpHost {
    fn name(&self) -> &'static str {
        "http_host"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        ctx.header("host").map(str::to_string)
    }
}

struct HttpUpgrade;

impl VarProvider for HttpUpgrade {
    fn name(&self) -> &'static str {
        "http_upgrade"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        ctx.header("upgrade").map(str::to_string)
    }
}

struct HttpConnection;

impl VarProvider for HttpConnection {
    fn name(&self) -> &'static str {
        "http_connection"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        ctx.header("connection").map(str::to_string)
    }
}

struct RemoteAddr;

impl VarProvider for RemoteAddr {
    fn name(&self) -> &'static str {
        "remote_addr"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        Some(ctx.peer_addr.ip().to_string())
    }
}

struct RemotePort;

impl VarProvider for RemotePort {
    fn name(&self) -> &'static str {
        "remote_port"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        Some(ctx.peer_addr.port().to_string())
    }
}

struct ProxyAddXForwardedFor;

impl VarProvider for ProxyAddXForwardedFor {
    fn name(&self) -> &'static str {
        "proxy_add_x_forwarded_for"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        let mut result = ctx
            .header("x-forwarded-for")
            .map(str::to_string)
            .unwrap_or_default();
        // Trim trailing whitespace and a dangling comma before appending
        while result.ends_with(|c: char| c.is_ascii_whitespace()) {
            result.pop();
        }
        if result.ends_with(',') {
            result.pop();
        }
        if !result.is_empty() {
            result.push_str(", ");
        }
        result.push_str(&ctx.peer_addr.ip().to_string());
        Some(result)
    }
}

struct HttpXForwardedProto;

impl VarProvider for HttpXForwardedProto {
    fn name(&self) -> &'static str {
        "http_x_forwarded_proto"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        Some(if ctx.tls { "https" } else { "http" }.to_string())
    }
}

struct SslClientCert;

impl VarProvider for SslClientCert {
    fn name(&self) -> &'static str {
        "ssl_client_cert"
    }
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        let der = ctx.peer_cert_der?;
        let encoded = BASE64.encode(der);
        let mut pem = String::with_capacity(encoded.len() + 64);
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        for chunk in encoded.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        Some(pem)
    }
}

/// Registry of variable providers, keyed case-insensitively by name.
/// Built once at startup from the fixed built-in list.
pub struct VarRegistry {
    providers: HashMap<&'static str, Box<dyn VarProvider>>,
}

impl VarRegistry {
    /// Registry with all built-in providers
    pub fn builtin() -> Self {
        let list: Vec<Box<dyn VarProvider>> = vec![
            Box::new(HttpHost),
            Box::new(HttpUpgrade),
            Box::new(HttpConnection),
            Box::new(RemoteAddr),
            Box::new(RemotePort),
            Box::new(ProxyAddXForwardedFor),
            Box::new(HttpXForwardedProto),
            Box::new(SslClientCert),
        ];
        let mut providers = HashMap::with_capacity(list.len());
        for provider in list {
            providers.insert(provider.name(), provider);
        }
        Self { providers }
    }

    /// Resolve a variable by (case-insensitive) name
    pub fn resolve(&self, name: &str, ctx: &RequestContext<'_>) -> Option<String> {
        if name.is_empty() {
            return None;
        }
        let lowered = name.to_ascii_lowercase();
        self.providers
            .get(lowered.as_str())
            .and_then(|p| p.resolve(ctx))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for VarRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

/// A parsed header value template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template. `${name}` ends at the matching `}`; a bare
    /// `$name` extends to the next `$`. An unterminated `${` is kept as
    /// literal text.
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut chunks = input.split('$');

        if let Some(first) = chunks.next() {
            if !first.is_empty() {
                segments.push(Segment::Literal(first.to_string()));
            }
        }

        for chunk in chunks {
            if let Some(rest) = chunk.strip_prefix('{') {
                if let Some(end) = rest.find('}') {
                    segments.push(Segment::Var(rest[..end].to_string()));
                    let tail = &rest[end + 1..];
                    if !tail.is_empty() {
                        segments.push(Segment::Literal(tail.to_string()));
                    }
                } else {
                    segments.push(Segment::Literal(format!("${}", chunk)));
                }
            } else {
                segments.push(Segment::Var(chunk.to_string()));
            }
        }

        Self { segments }
    }

    /// Whether the template references any variable
    pub fn has_vars(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Var(_)))
    }

    /// Render the template. Returns `None` if any referenced variable is
    /// absent; callers must then leave the header unset.
    pub fn render(&self, registry: &VarRegistry, ctx: &RequestContext<'_>) -> Option<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(name) => out.push_str(&registry.resolve(name, ctx)?),
            }
        }
        Some(out)
    }
}
