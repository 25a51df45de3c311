//! PROXY protocol header recognition
//!
//! Supports v1 (text) and v2 (binary) headers. A connection whose first
//! bytes match neither preamble is treated as header-less and the sniffed
//! bytes are handed back to the caller for replay.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";
const V1_PREFIX: &[u8] = b"PROXY ";

/// v1 headers are at most 107 bytes including CRLF
const MAX_V1_HEADER: usize = 107;

/// Bound on the v2 header including TLV payload
const MAX_V2_HEADER: usize = 16 + 4096;

/// Outcome of inspecting the buffered connection prefix
#[derive(Debug, PartialEq, Eq)]
pub enum ProxyHeader {
    /// Prefix is still compatible with a header; read more bytes
    NeedMore,
    /// Prefix matches neither preamble; the connection carries no header
    NotProxy,
    /// A complete header was parsed. `source` is the declared real peer,
    /// `None` for LOCAL / UNKNOWN headers.
    Parsed {
        source: Option<SocketAddr>,
        consumed: usize,
    },
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Inspect the start of a connection for a PROXY protocol header.
pub fn try_parse(buf: &[u8]) -> io::Result<ProxyHeader> {
    if buf.is_empty() || V2_SIGNATURE.starts_with(buf) {
        return Ok(ProxyHeader::NeedMore);
    }
    if buf.len() >= V2_SIGNATURE.len() && buf[..12] == V2_SIGNATURE {
        return parse_v2(buf);
    }
    if V1_PREFIX.starts_with(buf) {
        return Ok(ProxyHeader::NeedMore);
    }
    if buf.len() >= V1_PREFIX.len() && &buf[..6] == V1_PREFIX {
        return parse_v1(buf);
    }
    Ok(ProxyHeader::NotProxy)
}

fn parse_v2(buf: &[u8]) -> io::Result<ProxyHeader> {
    if buf.len() < 16 {
        return Ok(ProxyHeader::NeedMore);
    }
    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 2 {
        return Err(invalid("unsupported proxy protocol version"));
    }
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if 16 + len > MAX_V2_HEADER {
        return Err(invalid("proxy protocol v2 header too large"));
    }
    if buf.len() < 16 + len {
        return Ok(ProxyHeader::NeedMore);
    }
    let consumed = 16 + len;

    match ver_cmd & 0x0F {
        // LOCAL: health checks and the like, no address information
        0x0 => Ok(ProxyHeader::Parsed {
            source: None,
            consumed,
        }),
        0x1 => {
            let addrs = &buf[16..consumed];
            let source = match buf[13] >> 4 {
                // AF_UNSPEC
                0x0 => None,
                // AF_INET
                0x1 => {
                    if addrs.len() < 12 {
                        return Err(invalid("truncated proxy protocol v2 ipv4 block"));
                    }
                    let ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
                    let port = u16::from_be_bytes([addrs[8], addrs[9]]);
                    Some(SocketAddr::new(IpAddr::V4(ip), port))
                }
                // AF_INET6
                0x2 => {
                    if addrs.len() < 36 {
                        return Err(invalid("truncated proxy protocol v2 ipv6 block"));
                    }
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&addrs[..16]);
                    let port = u16::from_be_bytes([addrs[32], addrs[33]]);
                    Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
                }
                _ => return Err(invalid("unsupported proxy protocol address family")),
            };
            Ok(ProxyHeader::Parsed { source, consumed })
        }
        _ => Err(invalid("unsupported proxy protocol command")),
    }
}

fn parse_v1(buf: &[u8]) -> io::Result<ProxyHeader> {
    let end = match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => pos,
        None => {
            if buf.len() >= MAX_V1_HEADER {
                return Err(invalid("proxy protocol v1 header too long"));
            }
            return Ok(ProxyHeader::NeedMore);
        }
    };
    let consumed = end + 2;
    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| invalid("proxy protocol v1 header is not ascii"))?;

    let mut fields = line.split(' ');
    let _ = fields.next(); // "PROXY"
    let proto = fields
        .next()
        .ok_or_else(|| invalid("proxy protocol v1 missing protocol"))?;
    if proto == "UNKNOWN" {
        return Ok(ProxyHeader::Parsed {
            source: None,
            consumed,
        });
    }
    if proto != "TCP4" && proto != "TCP6" {
        return Err(invalid("unsupported proxy protocol v1 protocol"));
    }

    let src_ip: IpAddr = fields
        .next()
        .ok_or_else(|| invalid("proxy protocol v1 missing source address"))?
        .parse()
        .map_err(|_| invalid("bad proxy protocol v1 source address"))?;
    let _dst_ip = fields
        .next()
        .ok_or_else(|| invalid("proxy protocol v1 missing destination address"))?;
    let src_port: u16 = fields
        .next()
        .ok_or_else(|| invalid("proxy protocol v1 missing source port"))?
        .parse()
        .map_err(|_| invalid("bad proxy protocol v1 source port"))?;

    Ok(ProxyHeader::Parsed {
        source: Some(SocketAddr::new(src_ip, src_port)),
        consumed,
    })
}

/// Read a PROXY protocol header from the start of `stream`.
///
/// Returns the declared source address (when the header carries one) and any
/// over-read bytes, which belong to the application stream and must be
/// replayed ahead of it. A header-less connection returns `(None, sniffed)`.
pub async fn read_proxy_header<S>(stream: &mut S) -> io::Result<(Option<SocketAddr>, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    loop {
        match try_parse(&buf)? {
            ProxyHeader::Parsed { source, consumed } => {
                let remainder = buf.split_off(consumed).freeze();
                return Ok((source, remainder));
            }
            ProxyHeader::NotProxy => return Ok((None, buf.freeze())),
            ProxyHeader::NeedMore => {}
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            // Peer went away before the header was decidable
            return Ok((None, buf.freeze()));
        }
    }
}
