//! Client side of the SOCKS5 handshake (RFC 1928) with username/password
//! subnegotiation (RFC 1929). Only the subset the probe workflow needs:
//! CONNECT with a domain-name target, replies accepted for IPv4, IPv6 and
//! domain-name bound addresses.

use crate::error::ProbeError;
use crate::proxy::ProxyServer;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAINNAME: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the full SOCKS5 handshake on `stream`, leaving it connected to
/// `host:port` through the proxy. Every protocol mismatch, authentication
/// failure or I/O error comes back as `ProxyBroken`; the caller marks the
/// endpoint Unresponsive and moves on.
pub async fn establish<S>(
    stream: &mut S,
    server: &ProxyServer,
    host: &str,
    port: u16,
) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_timed(stream, &greeting(server.has_credentials())).await?;

    let mut ack = [0u8; 2];
    read_timed(stream, &mut ack).await?;
    if ack[0] != SOCKS_VERSION {
        return Err(ProbeError::ProxyBroken(format!(
            "greeting answered with version {}",
            ack[0]
        )));
    }
    match ack[1] {
        AUTH_NONE => {}
        AUTH_USERNAME_PASSWORD => {
            if !server.has_credentials() {
                return Err(ProbeError::ProxyBroken(
                    "proxy demands credentials we do not have".to_string(),
                ));
            }
            write_timed(stream, &auth_request(&server.username, &server.password)).await?;
            let mut auth_ack = [0u8; 2];
            read_timed(stream, &mut auth_ack).await?;
            if auth_ack[0] != 0x01 {
                return Err(ProbeError::ProxyBroken(format!(
                    "unsupported auth reply version {}",
                    auth_ack[0]
                )));
            }
            if auth_ack[1] != 0x00 {
                return Err(ProbeError::ProxyBroken("authentication rejected".to_string()));
            }
        }
        method => {
            return Err(ProbeError::ProxyBroken(format!(
                "unsupported auth method {}",
                method
            )));
        }
    }

    write_timed(stream, &connect_request(host, port)?).await?;

    let mut head = [0u8; 4];
    read_timed(stream, &mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProbeError::ProxyBroken(format!(
            "connect answered with version {}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(ProbeError::ProxyBroken(format!(
            "connect rejected, reply code {}",
            head[1]
        )));
    }
    // Drain the bound-address tail; its content is irrelevant to the tunnel.
    match head[3] {
        ATYP_IPV4 => {
            let mut tail = [0u8; 6];
            read_timed(stream, &mut tail).await?;
        }
        ATYP_DOMAINNAME => {
            let mut len = [0u8; 1];
            read_timed(stream, &mut len).await?;
            let mut tail = vec![0u8; len[0] as usize + 2];
            read_timed(stream, &mut tail).await?;
        }
        ATYP_IPV6 => {
            let mut tail = [0u8; 18];
            read_timed(stream, &mut tail).await?;
        }
        atyp => {
            return Err(ProbeError::ProxyBroken(format!(
                "connect answered with address type {}",
                atyp
            )));
        }
    }
    Ok(())
}

/// Method-selection greeting: no-auth only, or no-auth plus username/password
/// when the endpoint carries credentials.
pub fn greeting(with_auth: bool) -> Vec<u8> {
    if with_auth {
        vec![SOCKS_VERSION, 2, AUTH_NONE, AUTH_USERNAME_PASSWORD]
    } else {
        vec![SOCKS_VERSION, 1, AUTH_NONE]
    }
}

/// RFC 1929 subnegotiation request.
pub fn auth_request(username: &str, password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(0x01);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    buf
}

/// CONNECT request with a domain-name target, port big-endian.
pub fn connect_request(host: &str, port: u16) -> Result<Vec<u8>, ProbeError> {
    if host.len() > u8::MAX as usize {
        return Err(ProbeError::ProxyBroken(format!(
            "hostname too long for SOCKS5: {}",
            host
        )));
    }
    let mut buf = Vec::with_capacity(7 + host.len());
    buf.push(SOCKS_VERSION);
    buf.push(CMD_CONNECT);
    buf.push(0x00);
    buf.push(ATYP_DOMAINNAME);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

async fn write_timed<S>(stream: &mut S, buf: &[u8]) -> Result<(), ProbeError>
where
    S: AsyncWrite + Unpin,
{
    tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(buf))
        .await
        .map_err(|_| ProbeError::ProxyBroken("socks5 write timed out".to_string()))?
        .map_err(|e| ProbeError::ProxyBroken(e.to_string()))
}

async fn read_timed<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), ProbeError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(READ_TIMEOUT, stream.read_exact(buf))
        .await
        .map_err(|_| ProbeError::ProxyBroken("socks5 read timed out".to_string()))?
        .map_err(|e| ProbeError::ProxyBroken(e.to_string()))?;
    Ok(())
}
