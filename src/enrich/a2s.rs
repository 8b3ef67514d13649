//! Source Engine query client (A2S_INFO).
//!
//! One request/one reply over UDP, with the challenge handshake newer
//! servers demand: a reply of type `A` carries a 4-byte token the client
//! must append to a repeated request. The whole exchange runs under a
//! single deadline so a silent server costs one timeout, not several.

use super::ServerProber;
use crate::types::{ServerInfo, ServerOs};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::UdpSocket;

const RESPONSE_PREAMBLE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const INFO_REQUEST_TYPE: u8 = 0x54; // 'T'
const INFO_REPLY: u8 = 0x49; // 'I'
const CHALLENGE_REPLY: u8 = 0x41; // 'A'
const INFO_REQUEST_PAYLOAD: &[u8] = b"Source Engine Query\0";

/// Servers normally challenge once; more than this is a broken peer.
const MAX_CHALLENGE_ROUNDS: usize = 3;

/// UDP prober speaking the Source Engine query protocol.
pub struct A2sProber {
    timeout: Duration,
    buffer_size: u16,
}

impl A2sProber {
    pub fn new(timeout: Duration, buffer_size: u16) -> Self {
        Self {
            timeout,
            buffer_size,
        }
    }

    async fn exchange(&self, ip: &str, port: u16) -> Result<ServerInfo> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind query socket")?;
        socket
            .connect((ip, port))
            .await
            .with_context(|| format!("cannot reach {}:{}", ip, port))?;

        let mut buf = vec![0u8; self.buffer_size as usize];
        let mut request = info_request(None);

        for _ in 0..MAX_CHALLENGE_ROUNDS {
            socket
                .send(&request)
                .await
                .context("failed to send info request")?;
            let len = socket
                .recv(&mut buf)
                .await
                .context("failed to receive info reply")?;
            let datagram = &buf[..len];

            if datagram.len() < 5 || datagram[..4] != RESPONSE_PREAMBLE {
                anyhow::bail!("malformed reply header from {}:{}", ip, port);
            }

            match datagram[4] {
                CHALLENGE_REPLY => {
                    let challenge: [u8; 4] = datagram
                        .get(5..9)
                        .ok_or_else(|| anyhow::anyhow!("short challenge reply"))?
                        .try_into()?;
                    request = info_request(Some(challenge));
                }
                INFO_REPLY => return parse_info(&datagram[5..]),
                other => anyhow::bail!("unexpected reply type 0x{:02x}", other),
            }
        }

        anyhow::bail!("server kept demanding challenges")
    }
}

#[async_trait]
impl ServerProber for A2sProber {
    async fn probe(&self, ip: &str, port: u16) -> Result<ServerInfo> {
        match tokio::time::timeout(self.timeout, self.exchange(ip, port)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "query to {}:{} timed out after {:?}",
                ip,
                port,
                self.timeout
            ),
        }
    }
}

fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut request = Vec::with_capacity(4 + 1 + INFO_REQUEST_PAYLOAD.len() + 4);
    request.extend_from_slice(&RESPONSE_PREAMBLE);
    request.push(INFO_REQUEST_TYPE);
    request.extend_from_slice(INFO_REQUEST_PAYLOAD);
    if let Some(challenge) = challenge {
        request.extend_from_slice(&challenge);
    }
    request
}

/// Decode an A2S_INFO reply body (everything after the type byte).
fn parse_info(payload: &[u8]) -> Result<ServerInfo> {
    let mut reader = PayloadReader::new(payload);

    let _protocol = reader.read_u8()?;
    let name = reader.read_cstring()?;
    let map = reader.read_cstring()?;
    let _folder = reader.read_cstring()?;
    let game = reader.read_cstring()?;
    let _app_id = reader.read_u16_le()?;
    let players = reader.read_u8()?;
    let max_players = reader.read_u8()?;
    let _bots = reader.read_u8()?;
    let _server_type = reader.read_u8()?;
    let environment = match reader.read_u8()? {
        b'l' => ServerOs::Linux,
        b'w' => ServerOs::Windows,
        b'm' | b'o' => ServerOs::Mac,
        other => anyhow::bail!("unknown environment byte 0x{:02x}", other),
    };
    let _visibility = reader.read_u8()?;
    let _vac = reader.read_u8()?;
    let version = reader.read_cstring()?;
    // extra data flag and its fields are ignored

    Ok(ServerInfo {
        name,
        map,
        game,
        version,
        players,
        max_players,
        environment,
    })
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| anyhow::anyhow!("truncated info reply"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow::anyhow!("unterminated string in info reply"))?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}
