//! UDP ASSOCIATE relay
//!
//! Binds an ephemeral UDP socket and races three activities until the
//! first completes: the native UDP relay, the TCP-framed extension
//! channel for clients that cannot bind a real UDP port, and the idle
//! watchdog. Replies to the frontend go out on whichever channel last
//! carried frontend data.

use anyhow::Result;
use bytes::BytesMut;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::safety::{SafetyRecord, BASE_PENALTY};
use crate::logger::log;
use crate::socks5::protocol::{
    self, encode_udp_datagram, parse_udp_datagram, Address, ExtFrame, REP_SUCCESS,
};

/// Which channel last delivered frontend-bound data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Tcp,
    Udp,
}

/// Cap on buffered extension-channel bytes awaiting a complete frame
const EXT_BUFFER_LIMIT: usize = 256 * 1024;

fn declared_endpoint(addr: &Address) -> Option<SocketAddr> {
    match addr {
        Address::IPv4(ip, port) if *port != 0 => {
            Some(SocketAddr::new(IpAddr::V4((*ip).into()), *port))
        }
        Address::IPv6(ip, port) if *port != 0 => {
            Some(SocketAddr::new(IpAddr::V6((*ip).into()), *port))
        }
        _ => None,
    }
}

/// Whether a datagram came from the negotiated frontend endpoint
fn is_from_frontend(sender: SocketAddr, client_ip: IpAddr, declared: Option<SocketAddr>) -> bool {
    match declared {
        Some(endpoint) => sender == endpoint,
        None => sender.ip() == client_ip,
    }
}

/// Run one UDP association over its TCP control connection.
///
/// `declared` is the frontend UDP endpoint from the UDP ASSOCIATE request
/// (often zero when the client cannot predict it), `bind_ip` the local
/// address the ephemeral socket binds on.
pub async fn run_udp_associate<S>(
    control: S,
    client_ip: IpAddr,
    declared: &Address,
    bind_ip: IpAddr,
    idle_timeout: Duration,
    safety: Option<Arc<SafetyRecord>>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let bound = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
    let bound_addr = bound.local_addr()?;

    let (mut control_rd, mut control_wr) = tokio::io::split(control);
    protocol::write_reply(&mut control_wr, REP_SUCCESS, &Address::from(bound_addr)).await?;
    log::debug!(client = %client_ip, bound = %bound_addr, "udp association established");

    let mut frontend_udp = declared_endpoint(declared);
    let mut last_channel = Channel::Tcp;
    let mut deadline = Instant::now() + idle_timeout;

    let mut udp_buf = vec![0u8; 64 * 1024];
    let mut tcp_buf = vec![0u8; 8 * 1024];
    let mut ext_buf = BytesMut::with_capacity(8 * 1024);

    loop {
        tokio::select! {
            // Native UDP channel
            result = bound.recv_from(&mut udp_buf) => {
                let (n, sender) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::debug!(client = %client_ip, error = %e, "udp recv error");
                        break;
                    }
                };
                deadline = Instant::now() + idle_timeout;
                if let Some(record) = &safety {
                    record.extend(BASE_PENALTY);
                }

                if is_from_frontend(sender, client_ip, frontend_udp) {
                    // Frontend datagram: unwrap the SOCKS5 UDP header and
                    // forward the payload to its target
                    frontend_udp = Some(sender);
                    last_channel = Channel::Udp;
                    match parse_udp_datagram(&udp_buf[..n]) {
                        Ok((target, offset)) => {
                            match target.to_socket_addr().await {
                                Ok(target_addr) => {
                                    if let Err(e) =
                                        bound.send_to(&udp_buf[offset..n], target_addr).await
                                    {
                                        log::debug!(client = %client_ip, target = %target, error = %e, "udp forward error");
                                    }
                                }
                                Err(e) => {
                                    log::debug!(client = %client_ip, target = %target, error = %e, "udp target resolve failed");
                                }
                            }
                        }
                        Err(msg) => {
                            log::debug!(client = %client_ip, error = msg, "invalid udp datagram from frontend");
                        }
                    }
                } else {
                    // Backend datagram: wrap and return on the channel the
                    // frontend last used
                    let from = Address::from(sender);
                    if last_channel == Channel::Udp {
                        if let Some(frontend) = frontend_udp {
                            let packet = encode_udp_datagram(&from, &udp_buf[..n]);
                            if let Err(e) = bound.send_to(&packet, frontend).await {
                                log::debug!(client = %client_ip, error = %e, "udp reply error");
                                break;
                            }
                        }
                    } else {
                        let frame = ExtFrame::encode(&from, &udp_buf[..n]);
                        if let Err(e) = control_wr.write_all(&frame).await {
                            log::debug!(client = %client_ip, error = %e, "extension channel write error");
                            break;
                        }
                    }
                }
            }

            // TCP extension channel carrying framed UDP payloads
            result = control_rd.read(&mut tcp_buf) => {
                let n = match result {
                    Ok(0) => {
                        log::debug!(client = %client_ip, "udp client disconnected");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        log::debug!(client = %client_ip, error = %e, "extension channel read error");
                        break;
                    }
                };
                deadline = Instant::now() + idle_timeout;
                if let Some(record) = &safety {
                    record.extend(BASE_PENALTY);
                }

                if ext_buf.len() + n > EXT_BUFFER_LIMIT {
                    log::warn!(client = %client_ip, "extension channel buffer exceeded limit");
                    break;
                }
                ext_buf.extend_from_slice(&tcp_buf[..n]);

                let frames = match ExtFrame::drain(&mut ext_buf) {
                    Ok(frames) => frames,
                    Err(msg) => {
                        log::debug!(client = %client_ip, error = msg, "invalid extension frame");
                        break;
                    }
                };
                for frame in frames {
                    last_channel = Channel::Tcp;
                    match frame.addr.to_socket_addr().await {
                        Ok(target_addr) => {
                            if let Err(e) = bound.send_to(&frame.payload, target_addr).await {
                                log::debug!(client = %client_ip, target = %frame.addr, error = %e, "udp forward error");
                            }
                        }
                        Err(e) => {
                            log::debug!(client = %client_ip, target = %frame.addr, error = %e, "udp target resolve failed");
                        }
                    }
                }
            }

            // Idle watchdog
            _ = tokio::time::sleep_until(deadline) => {
                log::debug!(client = %client_ip, "udp association idle timeout");
                break;
            }

            // Forced abort (blacklist escalation or shutdown)
            _ = cancel.cancelled() => {
                log::debug!(client = %client_ip, "udp association aborted");
                break;
            }
        }
    }

    let _ = control_wr.shutdown().await;
    Ok(())
}
