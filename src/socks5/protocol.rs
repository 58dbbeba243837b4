//! SOCKS5 wire protocol
//!
//! Method negotiation and username/password subnegotiation (RFC 1928 /
//! RFC 1929), request/reply framing, the address codec shared with the
//! UDP relay, and the UDP-over-TCP extension framing used when a client
//! cannot bind a real UDP port.

use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::lookup_host;

/// Protocol version
pub const SOCKS_VERSION: u8 = 0x05;
/// Username/password subnegotiation version
pub const USERPASS_VERSION: u8 = 0x01;

/// Auth method: no authentication
pub const METHOD_NONE: u8 = 0x00;
/// Auth method: username/password
pub const METHOD_USERPASS: u8 = 0x02;
/// No acceptable method
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Reply codes
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// SOCKS5 command types accepted by this proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Cmd {
    /// TCP connect
    Connect = 1,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for Socks5Cmd {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Socks5Cmd::Connect),
            3 => Ok(Socks5Cmd::UdpAssociate),
            _ => Err("unsupported socks5 command"),
        }
    }
}

/// Address decode result
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Successfully decoded, with bytes consumed
    Ok(T, usize),
    /// Need more data
    NeedMoreData,
    /// Invalid data
    Invalid(&'static str),
}

/// Target address in SOCKS5 address-type encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => Address::IPv6(v6.ip().octets(), v6.port()),
        }
    }
}

impl Address {
    /// Decode an ATYP-prefixed address from a buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }

        let atyp = buf[0];
        match atyp {
            ATYP_IPV4 => {
                // 1 (type) + 4 (ip) + 2 (port) = 7 bytes
                if buf.len() < 7 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                DecodeResult::Ok(Address::IPv4(ip, port), 7)
            }
            ATYP_IPV6 => {
                // 1 (type) + 16 (ip) + 2 (port) = 19 bytes
                if buf.len() < 19 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                DecodeResult::Ok(Address::IPv6(ip, port), 19)
            }
            ATYP_DOMAIN => {
                // 1 (type) + 1 (len) + len (domain) + 2 (port)
                if buf.len() < 2 {
                    return DecodeResult::NeedMoreData;
                }
                let domain_len = buf[1] as usize;
                let total_len = 1 + 1 + domain_len + 2;
                if buf.len() < total_len {
                    return DecodeResult::NeedMoreData;
                }
                let domain = match std::str::from_utf8(&buf[2..2 + domain_len]) {
                    Ok(s) => s.to_string(),
                    Err(_) => return DecodeResult::Invalid("invalid domain encoding"),
                };
                let port = u16::from_be_bytes([buf[2 + domain_len], buf[3 + domain_len]]);
                DecodeResult::Ok(Address::Domain(domain, port), total_len)
            }
            _ => DecodeResult::Invalid("invalid address type"),
        }
    }

    /// Encode the address to a buffer, returning the bytes written
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start_len = buf.len();
        match self {
            Address::IPv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::IPv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf.len() - start_len
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Resolve to a socket address
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)),
            Address::IPv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)),
            Address::Domain(domain, port) => {
                let addr_str = format!("{}:{}", domain, port);
                let mut addrs = lookup_host(&addr_str).await?;
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}

/// Read the client greeting and return the offered auth methods
pub async fn read_greeting<S>(stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        anyhow::bail!("unsupported socks version: {}", head[0]);
    }
    let n_methods = head[1] as usize;
    let mut methods = vec![0u8; n_methods];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Pick the auth method: the first listener-supported method the client
/// also offered, preferring username/password when both sides allow it
pub fn select_method(supported: &[u8], offered: &[u8]) -> u8 {
    for method in supported {
        if offered.contains(method) {
            return *method;
        }
    }
    METHOD_NO_ACCEPTABLE
}

/// Write the method selection reply
pub async fn write_method_selection<S>(stream: &mut S, method: u8) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, method]).await?;
    Ok(())
}

/// Read an RFC 1929 username/password subnegotiation record
pub async fn read_userpass<S>(stream: &mut S) -> anyhow::Result<(String, String)>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != USERPASS_VERSION {
        anyhow::bail!("unsupported auth subnegotiation version: {}", head[0]);
    }
    let mut username = vec![0u8; head[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    Ok((
        String::from_utf8(username)?,
        String::from_utf8(password)?,
    ))
}

/// Write the username/password auth status (0 = success)
pub async fn write_auth_status<S>(stream: &mut S, success: bool) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let status = if success { 0x00 } else { 0x01 };
    stream.write_all(&[USERPASS_VERSION, status]).await?;
    Ok(())
}

/// Read the command request: VER CMD RSV ATYP ADDR PORT
pub async fn read_request<S>(stream: &mut S) -> anyhow::Result<(u8, Address)>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        anyhow::bail!("unsupported socks version: {}", head[0]);
    }
    let cmd = head[1];

    let addr = match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&buf[..4]);
            Address::IPv4(ip, u16::from_be_bytes([buf[4], buf[5]]))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            Address::IPv6(ip, u16::from_be_bytes([buf[16], buf[17]]))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Address::Domain(String::from_utf8(domain)?, u16::from_be_bytes(port))
        }
        other => anyhow::bail!("invalid address type: {}", other),
    };

    Ok((cmd, addr))
}

/// Write a reply: VER REP RSV ATYP BND.ADDR BND.PORT
pub async fn write_reply<S>(stream: &mut S, rep: u8, bound: &Address) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(22);
    buf.push(SOCKS_VERSION);
    buf.push(rep);
    buf.push(0x00);
    bound.encode(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

/// One UDP payload carried over the TCP extension channel
///
/// Layout (extension of the standard SOCKS5 UDP request header):
///
/// ```text
/// +------+--------+--------+----------+----------+----------+
/// | RSV  | FRAG   | ATYP   | DST.ADDR | DST.PORT |   DATA   |
/// | 2 B  | 1 B    | 1 B    | variable | 2 B      | variable |
/// +------+--------+--------+----------+----------+----------+
/// ```
///
/// RSV carries the byte length of DATA so successive records can be
/// framed on a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtFrame {
    pub addr: Address,
    pub payload: Bytes,
}

impl ExtFrame {
    /// Minimum frame: 2 (len) + 1 (frag) + 7 (IPv4 addr) = 10 bytes
    pub const MIN_SIZE: usize = 10;

    /// Decode one frame from the accumulation buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.len() < Self::MIN_SIZE {
            return DecodeResult::NeedMoreData;
        }

        let payload_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        // buf[2] is FRAG; fragmentation is not supported
        if buf[2] != 0 {
            return DecodeResult::Invalid("fragmented udp records are not supported");
        }

        let (addr, addr_len) = match Address::decode(&buf[3..]) {
            DecodeResult::Ok(addr, len) => (addr, len),
            DecodeResult::NeedMoreData => return DecodeResult::NeedMoreData,
            DecodeResult::Invalid(msg) => return DecodeResult::Invalid(msg),
        };

        let total_len = 3 + addr_len + payload_len;
        if buf.len() < total_len {
            return DecodeResult::NeedMoreData;
        }

        let payload = Bytes::copy_from_slice(&buf[3 + addr_len..total_len]);
        DecodeResult::Ok(ExtFrame { addr, payload }, total_len)
    }

    /// Encode a frame for the extension channel
    pub fn encode(addr: &Address, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + payload.len());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.push(0x00); // FRAG
        addr.encode(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    /// Drain every complete frame from the accumulation buffer.
    /// Returns `Err` on malformed input; the caller should drop the
    /// connection.
    pub fn drain(buf: &mut BytesMut) -> Result<Vec<ExtFrame>, &'static str> {
        let mut frames = Vec::new();
        loop {
            match Self::decode(buf) {
                DecodeResult::Ok(frame, consumed) => {
                    let _ = buf.split_to(consumed);
                    frames.push(frame);
                }
                DecodeResult::NeedMoreData => return Ok(frames),
                DecodeResult::Invalid(msg) => return Err(msg),
            }
        }
    }
}

/// Standard SOCKS5 UDP datagram header (RSV = 0) used on the native UDP
/// channel. Returns the target address and payload offset.
pub fn parse_udp_datagram(buf: &[u8]) -> Result<(Address, usize), &'static str> {
    if buf.len() < 4 {
        return Err("udp datagram too short");
    }
    if buf[0] != 0 || buf[1] != 0 {
        return Err("udp datagram reserved bytes must be zero");
    }
    if buf[2] != 0 {
        return Err("fragmented udp datagrams are not supported");
    }
    match Address::decode(&buf[3..]) {
        DecodeResult::Ok(addr, consumed) => Ok((addr, 3 + consumed)),
        DecodeResult::NeedMoreData => Err("udp datagram truncated"),
        DecodeResult::Invalid(msg) => Err(msg),
    }
}

/// Wrap a payload in the standard SOCKS5 UDP datagram header
pub fn encode_udp_datagram(addr: &Address, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24 + payload.len());
    buf.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV RSV FRAG
    addr.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_try_from() {
        assert_eq!(Socks5Cmd::try_from(1), Ok(Socks5Cmd::Connect));
        assert_eq!(Socks5Cmd::try_from(3), Ok(Socks5Cmd::UdpAssociate));
        assert!(Socks5Cmd::try_from(2).is_err()); // BIND unsupported
        assert!(Socks5Cmd::try_from(0).is_err());
    }

    #[test]
    fn test_address_decode_ipv4() {
        let buf = [1, 192, 168, 1, 1, 0x1F, 0x90];
        match Address::decode(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 7);
                assert!(matches!(addr, Address::IPv4([192, 168, 1, 1], 8080)));
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_address_decode_domain() {
        let mut buf = vec![3, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&[0x00, 0x50]);

        match Address::decode(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 15);
                assert!(matches!(addr, Address::Domain(ref d, 80) if d == "example.com"));
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_address_decode_need_more_data() {
        assert!(matches!(
            Address::decode(&[1, 192, 168]),
            DecodeResult::NeedMoreData
        ));
        assert!(matches!(
            Address::decode(&[4, 0, 0, 0]),
            DecodeResult::NeedMoreData
        ));
        assert!(matches!(
            Address::decode(&[3, 11, b'e', b'x']),
            DecodeResult::NeedMoreData
        ));
    }

    #[test]
    fn test_address_decode_invalid_atyp() {
        assert!(matches!(
            Address::decode(&[99, 0, 0, 0, 0, 0, 0]),
            DecodeResult::Invalid(_)
        ));
    }

    #[test]
    fn test_address_encode_decode_roundtrip() {
        let addresses = vec![
            Address::IPv4([192, 168, 1, 1], 8080),
            Address::IPv6([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443),
            Address::Domain("example.com".to_string(), 80),
        ];

        for original in addresses {
            let mut buf = Vec::new();
            original.encode(&mut buf);
            match Address::decode(&buf) {
                DecodeResult::Ok(decoded, _) => assert_eq!(original, decoded),
                _ => panic!("Failed to decode address"),
            }
        }
    }

    #[test]
    fn test_address_from_socket_addr() {
        let v4: SocketAddr = "192.0.2.1:8080".parse().unwrap();
        assert!(matches!(Address::from(v4), Address::IPv4([192, 0, 2, 1], 8080)));

        let v6: SocketAddr = "[::1]:443".parse().unwrap();
        assert!(matches!(Address::from(v6), Address::IPv6(_, 443)));
    }

    #[test]
    fn test_select_method() {
        assert_eq!(
            select_method(&[METHOD_USERPASS], &[METHOD_NONE, METHOD_USERPASS]),
            METHOD_USERPASS
        );
        assert_eq!(select_method(&[METHOD_NONE], &[METHOD_NONE]), METHOD_NONE);
        assert_eq!(
            select_method(&[METHOD_USERPASS], &[METHOD_NONE]),
            METHOD_NO_ACCEPTABLE
        );
        assert_eq!(select_method(&[], &[METHOD_NONE]), METHOD_NO_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_greeting_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS])
            .await
            .unwrap();

        let methods = read_greeting(&mut server).await.unwrap();
        assert_eq!(methods, vec![METHOD_NONE, METHOD_USERPASS]);
    }

    #[tokio::test]
    async fn test_greeting_rejects_wrong_version() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x04, 1, METHOD_NONE]).await.unwrap();
        assert!(read_greeting(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_userpass_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut record = vec![USERPASS_VERSION, 5];
        record.extend_from_slice(b"alice");
        record.push(6);
        record.extend_from_slice(b"secret");
        client.write_all(&record).await.unwrap();

        let (username, password) = read_userpass(&mut server).await.unwrap();
        assert_eq!(username, "alice");
        assert_eq!(password, "secret");
    }

    #[tokio::test]
    async fn test_request_roundtrip_domain() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut request = vec![SOCKS_VERSION, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&[0x01, 0xBB]);
        client.write_all(&request).await.unwrap();

        let (cmd, addr) = read_request(&mut server).await.unwrap();
        assert_eq!(cmd, 1);
        assert!(matches!(addr, Address::Domain(ref d, 443) if d == "example.com"));
    }

    #[tokio::test]
    async fn test_reply_format() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bound = Address::IPv4([127, 0, 0, 1], 1080);
        write_reply(&mut client, REP_SUCCESS, &bound).await.unwrap();
        drop(client);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![5, 0, 0, 1, 127, 0, 0, 1, 0x04, 0x38]);
    }

    #[test]
    fn test_ext_frame_roundtrip() {
        let addr = Address::Domain("udp.example.com".to_string(), 53);
        let payload = b"dns query payload";
        let encoded = ExtFrame::encode(&addr, payload);

        // Length field is exactly the payload length, regardless of
        // address-type length
        assert_eq!(
            u16::from_be_bytes([encoded[0], encoded[1]]) as usize,
            payload.len()
        );

        match ExtFrame::decode(&encoded) {
            DecodeResult::Ok(frame, consumed) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(frame.addr, addr);
                assert_eq!(frame.payload.as_ref(), payload);
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_ext_frame_roundtrip_ipv6() {
        let addr = Address::IPv6([0xfe; 16], 9999);
        let payload = vec![0xAAu8; 300];
        let encoded = ExtFrame::encode(&addr, &payload);
        assert_eq!(u16::from_be_bytes([encoded[0], encoded[1]]), 300);

        match ExtFrame::decode(&encoded) {
            DecodeResult::Ok(frame, _) => {
                assert_eq!(frame.addr, addr);
                assert_eq!(frame.payload.as_ref(), &payload[..]);
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_ext_frame_empty_payload() {
        let addr = Address::IPv4([8, 8, 8, 8], 53);
        let encoded = ExtFrame::encode(&addr, b"");
        match ExtFrame::decode(&encoded) {
            DecodeResult::Ok(frame, consumed) => {
                assert_eq!(consumed, encoded.len());
                assert!(frame.payload.is_empty());
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_ext_frame_need_more_data() {
        let addr = Address::IPv4([8, 8, 8, 8], 53);
        let encoded = ExtFrame::encode(&addr, b"hello");
        for cut in 0..encoded.len() {
            assert!(
                matches!(ExtFrame::decode(&encoded[..cut]), DecodeResult::NeedMoreData),
                "prefix of {} bytes must ask for more data",
                cut
            );
        }
    }

    #[test]
    fn test_ext_frame_rejects_fragments() {
        let addr = Address::IPv4([8, 8, 8, 8], 53);
        let mut encoded = ExtFrame::encode(&addr, b"hello");
        encoded[2] = 1; // FRAG
        assert!(matches!(ExtFrame::decode(&encoded), DecodeResult::Invalid(_)));
    }

    #[test]
    fn test_ext_frame_drain_multiple() {
        let addr_a = Address::IPv4([1, 1, 1, 1], 53);
        let addr_b = Address::IPv4([8, 8, 8, 8], 53);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ExtFrame::encode(&addr_a, b"first"));
        buf.extend_from_slice(&ExtFrame::encode(&addr_b, b"second"));
        // Plus a partial third frame
        let third = ExtFrame::encode(&addr_a, b"third");
        buf.extend_from_slice(&third[..4]);

        let frames = ExtFrame::drain(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.as_ref(), b"first");
        assert_eq!(frames[1].payload.as_ref(), b"second");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_udp_datagram_roundtrip() {
        let addr = Address::IPv4([203, 0, 113, 7], 5353);
        let packet = encode_udp_datagram(&addr, b"payload");
        let (decoded, offset) = parse_udp_datagram(&packet).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(&packet[offset..], b"payload");
    }

    #[test]
    fn test_udp_datagram_rejects_nonzero_rsv() {
        let addr = Address::IPv4([203, 0, 113, 7], 5353);
        let mut packet = encode_udp_datagram(&addr, b"payload");
        packet[0] = 1;
        assert!(parse_udp_datagram(&packet).is_err());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(
            Address::IPv4([192, 168, 1, 1], 8080).to_string(),
            "192.168.1.1:8080"
        );
        assert_eq!(
            Address::Domain("example.com".to_string(), 80).to_string(),
            "example.com:80"
        );
    }

    #[tokio::test]
    async fn test_to_socket_addr_ipv4() {
        let addr = Address::IPv4([127, 0, 0, 1], 8080);
        let socket_addr = addr.to_socket_addr().await.unwrap();
        assert_eq!(socket_addr.to_string(), "127.0.0.1:8080");
    }
}
