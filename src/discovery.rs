//! Device discovery (spec section 4.3): broadcast an `emotivaPing`, collect
//! the `emotivaTransponder` reply, retry with jittered exponential backoff.

use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;

use crate::codec::{self, InboundFrame};
use crate::config::EngineConfig;
use crate::error::{DiscoveryError, TransportError};
use crate::model::{DeviceDescriptor, EndpointRole, ProtocolVersion};
use crate::transport::SocketManager;

const DEFAULT_LEGACY_PROTOCOL: ProtocolVersion = ProtocolVersion::V2_0;
const DEFAULT_LEGACY_KEEPALIVE_MS: u32 = 10_000;

/// Run the discovery handshake against `config.host`, retrying with
/// exponential backoff (`retry_base_ms * 2^attempt`, capped at
/// `retry_max_ms`, jittered +/-25%) up to `max_retries` times.
pub async fn discover(
    sockets: &SocketManager,
    config: &EngineConfig,
) -> Result<DeviceDescriptor, DiscoveryError> {
    let ping = codec::serialize_ping(config.protocol_pref.0);
    let wait = Duration::from_millis(config.ack_timeout_ms as u64);
    let mut attempt: u32 = 0;

    loop {
        sockets
            .send(EndpointRole::DiscoverReq, &ping, None)
            .await
            .map_err(DiscoveryError::Transport)?;

        match sockets.recv(EndpointRole::DiscoverResp, wait).await {
            Ok(datagram) => {
                if datagram.from.ip() != config.host {
                    tracing::debug!(from = %datagram.from, expected = %config.host, "ignoring discovery reply from unexpected host");
                    // Treat as a miss for this attempt's receive window, but
                    // don't burn a retry slot on it.
                    continue;
                }
                return parse_transponder_reply(&datagram.bytes, config);
            }
            Err(TransportError::RecvTimeout(_)) => {
                if attempt + 1 >= config.max_retries as u32 {
                    return Err(DiscoveryError::Timeout);
                }
                tokio::time::sleep(backoff_for(config, attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(DiscoveryError::Transport(e)),
        }
    }
}

/// Jittered exponential backoff slept between retransmissions, separate
/// from the fixed `ack_timeout_ms` receive window — the same split
/// `protocol.rs` uses between `await_ack`'s fixed deadline and
/// `backoff_for`'s sleep between retries.
fn backoff_for(config: &EngineConfig, attempt: u32) -> Duration {
    let base = config.retry_base_ms as u64;
    let max = config.retry_max_ms as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max);
    let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered = (capped as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(1.0) as u64)
}

fn parse_transponder_reply(
    bytes: &[u8],
    config: &EngineConfig,
) -> Result<DeviceDescriptor, DiscoveryError> {
    let frame = codec::parse_inbound(bytes, config.max_xml_bytes as usize)
        .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
    let transponder = match frame {
        InboundFrame::Transponder(t) => t,
        other => {
            return Err(DiscoveryError::Malformed(format!(
                "expected emotivaTransponder, got {other:?}"
            )))
        }
    };

    Ok(DeviceDescriptor {
        model: transponder.model,
        revision: transponder.revision,
        name: transponder.name,
        protocol_version: transponder.protocol_version.unwrap_or(DEFAULT_LEGACY_PROTOCOL),
        control_port: transponder
            .control_port
            .ok_or_else(|| DiscoveryError::Malformed("missing control port".into()))?,
        notify_port: transponder
            .notify_port
            .ok_or_else(|| DiscoveryError::Malformed("missing notify port".into()))?,
        keepalive_interval_ms: transponder
            .keepalive_interval_ms
            .unwrap_or(DEFAULT_LEGACY_KEEPALIVE_MS),
    })
}

/// Resolve a configured host into the [`IpAddr`] discovery matches replies
/// against. Kept as a free function so the controller can validate
/// configuration before binding any sockets.
pub fn resolve_host(host: IpAddr) -> IpAddr {
    host
}
