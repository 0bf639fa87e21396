//! SOCKS5 wire codec: method negotiation, requests, replies, and the
//! FWD_UDP frame envelope.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[rustfmt::skip]
pub mod consts {
    pub const SOCKS5_VERSION: u8 = 0x05;

    pub const AUTH_METHOD_NONE: u8 = 0x00;

    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_FWD_UDP: u8 = 0x05;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const REP_SUCCEEDED: u8 = 0x00;
    pub const REP_CONNECTION_REFUSED: u8 = 0x05;
    pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;
}

/// Errors that can occur while decoding a SOCKS request or frame.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("client with version={0} is not SOCKSv5")]
    Version(u8),
    #[error("unsupported SOCKS command: {0}")]
    Command(u8),
    #[error("invalid SOCKS address type: {0}")]
    AddressType(u8),
    #[error("invalid domain name: {0}")]
    DomainName(#[from] std::string::FromUtf8Error),
    #[error("address truncated")]
    Truncated,
    #[error("empty domain name")]
    EmptyDomain,
    #[error("FWD_UDP frame length out of range: {0}")]
    FrameLength(u16),
}

impl Error {
    /// The reply byte a request-phase failure maps to; `None` means close
    /// without replying.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            Self::Command(_) => Some(consts::REP_COMMAND_NOT_SUPPORTED),
            Self::AddressType(_) | Self::DomainName(_) | Self::Truncated | Self::EmptyDomain => {
                Some(consts::REP_ADDRESS_NOT_SUPPORTED)
            }
            Self::Io(_) | Self::Version(_) | Self::FrameLength(_) => None,
        }
    }
}

/// Commands this proxy serves. Everything else is rejected with
/// command-not-supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    FwdUdp,
}

/// A destination as the peer sent it: domains verbatim, IP addresses in
/// their canonical textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

/// Complete the method negotiation. The reply is always no-auth; tun2socks
/// never offers anything else.
pub async fn negotiate<RW>(stream: &mut RW) -> Result<(), Error>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let (version, nmethods) = (header[0], header[1]);
    if version != consts::SOCKS5_VERSION {
        return Err(Error::Version(version));
    }
    let mut methods = vec![0u8; usize::from(nmethods)];
    stream.read_exact(&mut methods).await?;
    stream
        .write_all(&[consts::SOCKS5_VERSION, consts::AUTH_METHOD_NONE])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Read the 4-byte request header and its address. Works on a buffered
/// stream so bytes the peer pipelined after the negotiation are consumed
/// without another network read.
pub async fn read_request<R>(stream: &mut R) -> Result<(Command, TargetAddr), Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let (version, cmd, _reserved, atyp) = (header[0], header[1], header[2], header[3]);
    if version != consts::SOCKS5_VERSION {
        return Err(Error::Version(version));
    }
    let command = match cmd {
        consts::CMD_CONNECT => Command::Connect,
        consts::CMD_FWD_UDP => Command::FwdUdp,
        other => return Err(Error::Command(other)),
    };
    // Pull the exact address length off the wire, then hand the whole
    // request to the shared buffer parser.
    let mut buf = BytesMut::from(&header[..]);
    let remaining = match atyp {
        consts::ATYP_IPV4 => 4 + 2,
        consts::ATYP_IPV6 => 16 + 2,
        consts::ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            buf.put_u8(len);
            usize::from(len) + 2
        }
        other => return Err(Error::AddressType(other)),
    };
    let mut rest = vec![0u8; remaining];
    stream.read_exact(&mut rest).await?;
    buf.put_slice(&rest);
    let (addr, _) = parse_address(&buf, 3)?;
    Ok((command, addr))
}

/// Parse an ATYP-prefixed address from `buf` starting at `atyp_offset`.
/// Returns the address and the offset one past the port, so callers can
/// locate a payload following the address (FWD_UDP frames).
pub fn parse_address(buf: &[u8], atyp_offset: usize) -> Result<(TargetAddr, usize), Error> {
    let atyp = *buf.get(atyp_offset).ok_or(Error::Truncated)?;
    match atyp {
        consts::ATYP_IPV4 => {
            let end = atyp_offset + 1 + 4 + 2;
            if buf.len() < end {
                return Err(Error::Truncated);
            }
            let octets: [u8; 4] = buf[atyp_offset + 1..atyp_offset + 5]
                .try_into()
                .expect("slice with incorrect length (this is a bug)");
            let port = u16::from_be_bytes([buf[end - 2], buf[end - 1]]);
            Ok((
                TargetAddr {
                    host: Ipv4Addr::from(octets).to_string(),
                    port,
                },
                end,
            ))
        }
        consts::ATYP_DOMAIN => {
            let len = usize::from(*buf.get(atyp_offset + 1).ok_or(Error::Truncated)?);
            if len == 0 {
                return Err(Error::EmptyDomain);
            }
            let start = atyp_offset + 2;
            let end = start + len + 2;
            if buf.len() < end {
                return Err(Error::Truncated);
            }
            let host = String::from_utf8(buf[start..start + len].to_vec())?;
            let port = u16::from_be_bytes([buf[end - 2], buf[end - 1]]);
            Ok((TargetAddr { host, port }, end))
        }
        consts::ATYP_IPV6 => {
            let end = atyp_offset + 1 + 16 + 2;
            if buf.len() < end {
                return Err(Error::Truncated);
            }
            let octets: [u8; 16] = buf[atyp_offset + 1..atyp_offset + 17]
                .try_into()
                .expect("slice with incorrect length (this is a bug)");
            let port = u16::from_be_bytes([buf[end - 2], buf[end - 1]]);
            Ok((
                TargetAddr {
                    host: Ipv6Addr::from(octets).to_string(),
                    port,
                },
                end,
            ))
        }
        other => Err(Error::AddressType(other)),
    }
}

/// Encode an address the way `parse_address` reads it, picking the ATYP
/// from the host's textual form.
pub fn encode_address(addr: &TargetAddr, buf: &mut BytesMut) {
    match addr.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.put_u8(consts::ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.put_u8(consts::ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        Err(_) => {
            buf.put_u8(consts::ATYP_DOMAIN);
            buf.put_u8(addr.host.len() as u8);
            buf.put_slice(addr.host.as_bytes());
        }
    }
    buf.put_u16(addr.port);
}

/// The canonical 10-byte reply with an unspecified bound address.
#[must_use]
pub fn encode_reply(rep: u8) -> [u8; 10] {
    [
        consts::SOCKS5_VERSION,
        rep,
        0x00,
        consts::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Write the canonical reply and flush.
pub async fn write_reply<W>(stream: &mut W, rep: u8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(rep)).await?;
    stream.flush().await
}

/// Read one length-prefixed FWD_UDP frame payload. The length must be in
/// `1..=MAX_UDP_FRAME`; anything else aborts the connection.
pub async fn read_udp_frame<R>(stream: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u16().await?;
    if len == 0 || len > config::MAX_UDP_FRAME {
        return Err(Error::FrameLength(len));
    }
    let mut payload = vec![0u8; usize::from(len)];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}
