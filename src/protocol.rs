//! Protocol engine (spec section 4.4): command send/ack correlation,
//! subscribe/unsubscribe/update round-trips, retry with backoff, and the
//! `max_concurrent_commands` bound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;

use crate::codec::{self, InboundFrame, SetFrameKind};
use crate::config::EngineConfig;
use crate::error::{CodecError, ProtocolError, TransportError};
use crate::model::{AckResult, AckStatus, Command, DeviceDescriptor, PropertyAck};
use crate::model::EndpointRole;
use crate::transport::SocketManager;

/// The subset of `EngineConfig` the protocol engine needs, plus the
/// destination addresses resolved by discovery.
pub struct ProtocolEngine {
    sockets: Arc<SocketManager>,
    control_dest: SocketAddr,
    protocol_pref: crate::model::ProtocolVersion,
    ack_timeout_ms: u32,
    max_retries: u8,
    retry_base_ms: u32,
    retry_max_ms: u32,
    max_xml_bytes: usize,
    concurrency: Arc<Semaphore>,
}

impl ProtocolEngine {
    pub fn new(
        sockets: Arc<SocketManager>,
        descriptor: &DeviceDescriptor,
        config: &EngineConfig,
    ) -> Self {
        let control_dest = SocketAddr::new(config.host, descriptor.control_port);
        Self {
            sockets,
            control_dest,
            protocol_pref: descriptor.protocol_version,
            ack_timeout_ms: config.ack_timeout_ms,
            max_retries: config.max_retries,
            retry_base_ms: config.retry_base_ms,
            retry_max_ms: config.retry_max_ms,
            max_xml_bytes: config.max_xml_bytes as usize,
            concurrency: Arc::new(Semaphore::new(config.max_concurrent_commands as usize)),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.retry_base_ms as u64;
        let max = self.retry_max_ms as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(max);
        let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
        let millis = (capped as f64) * (1.0 + jitter);
        Duration::from_millis(millis.max(1.0) as u64)
    }

    /// Send one command and wait for its ack/nak, retrying on timeout.
    /// Holds one permit from the `max_concurrent_commands` semaphore for the
    /// whole round-trip (invariant I2).
    pub async fn send_command(&self, command: Command) -> Result<AckResult, ProtocolError> {
        let results = self.send_commands_inner(std::slice::from_ref(&command)).await?;
        results
            .into_iter()
            .find(|r| r.name == command.name)
            .ok_or_else(|| ProtocolError::UnexpectedResponse(format!("no ack for {:?}", command.name)))
    }

    /// Send a batch of commands in one `emotivaControl` frame.
    pub async fn send_commands(&self, commands: &[Command]) -> Result<Vec<AckResult>, ProtocolError> {
        self.send_commands_inner(commands).await
    }

    async fn send_commands_inner(&self, commands: &[Command]) -> Result<Vec<AckResult>, ProtocolError> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .expect("semaphore never closed while engine is alive");

        if !commands.iter().any(|c| c.ack_required) {
            // Fire-and-forget: no ack expected, send once without retry.
            let frame = codec::serialize_control(commands);
            self.sockets
                .send(EndpointRole::Control, &frame, Some(self.control_dest))
                .await?;
            return Ok(commands
                .iter()
                .map(|c| AckResult {
                    name: c.name.clone(),
                    status: AckStatus::Ack,
                })
                .collect());
        }

        let frame = codec::serialize_control(commands);
        let expected: std::collections::BTreeSet<&str> =
            commands.iter().map(|c| c.name.as_str()).collect();

        let mut attempt = 0u32;
        loop {
            self.sockets
                .send(EndpointRole::Control, &frame, Some(self.control_dest))
                .await?;

            match self.await_ack(&expected).await {
                Ok(results) => return Ok(results),
                Err(ProtocolError::Transport(TransportError::RecvTimeout(_))) => {
                    if attempt + 1 >= self.max_retries as u32 {
                        return Err(ProtocolError::AckTimeout(commands_summary(commands)));
                    }
                    tokio::time::sleep(self.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read control-channel datagrams until we see an `emotivaAck` whose
    /// names are a superset of `expected`, buffering (and discarding after
    /// 200ms) anything that doesn't match — spec 4.4's unmatched-response
    /// handling.
    async fn await_ack(&self, expected: &std::collections::BTreeSet<&str>) -> Result<Vec<AckResult>, ProtocolError> {
        let deadline = Duration::from_millis(self.ack_timeout_ms as u64);
        let start = tokio::time::Instant::now();
        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(ProtocolError::Transport(TransportError::RecvTimeout(EndpointRole::Control)));
            }
            let datagram = self.sockets.recv(EndpointRole::Control, remaining).await?;
            let frame = match codec::parse_inbound(&datagram.bytes, self.max_xml_bytes) {
                Ok(frame) => frame,
                Err(CodecError::UnknownRoot(root)) => {
                    tracing::debug!(root, "unrecognised control-channel root element, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match frame {
                InboundFrame::Ack(results) => {
                    let names: std::collections::BTreeSet<&str> =
                        results.iter().map(|r| r.name.as_str()).collect();
                    if expected.is_subset(&names) {
                        if let Some(nak) = results.iter().find(|r| r.status == AckStatus::Nak) {
                            return Err(ProtocolError::Nak(nak.name.clone()));
                        }
                        return Ok(results);
                    }
                    tracing::debug!("ack frame did not cover expected command set, discarding");
                }
                other => {
                    tracing::debug!(?other, "unmatched control-channel frame, discarding (200ms buffer window)");
                    tokio::time::sleep(Duration::from_millis(200).min(remaining)).await;
                }
            }
        }
    }

    /// Subscribe to a set of property names. Replies acked per-property.
    pub async fn subscribe(&self, names: &[String]) -> Result<Vec<PropertyAck>, ProtocolError> {
        self.name_set_roundtrip(SetFrameKind::Subscription, names).await
    }

    pub async fn unsubscribe(&self, names: &[String]) -> Result<Vec<PropertyAck>, ProtocolError> {
        self.name_set_roundtrip(SetFrameKind::Unsubscribe, names).await
    }

    pub async fn request_update(&self, names: &[String]) -> Result<Vec<PropertyAck>, ProtocolError> {
        self.name_set_roundtrip(SetFrameKind::Update, names).await
    }

    async fn name_set_roundtrip(
        &self,
        kind: SetFrameKind,
        names: &[String],
    ) -> Result<Vec<PropertyAck>, ProtocolError> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .expect("semaphore never closed while engine is alive");

        let frame = codec::serialize_name_set(kind, self.protocol_pref, names);
        let expected: std::collections::BTreeSet<&str> = names.iter().map(|s| s.as_str()).collect();

        let mut attempt = 0u32;
        loop {
            self.sockets
                .send(EndpointRole::Control, &frame, Some(self.control_dest))
                .await?;

            match self.await_name_set(kind, &expected).await {
                Ok(acks) => return Ok(acks),
                Err(ProtocolError::Transport(TransportError::RecvTimeout(_))) => {
                    if attempt + 1 >= self.max_retries as u32 {
                        return Err(ProtocolError::AckTimeout(format!("{kind:?} of {names:?}")));
                    }
                    tokio::time::sleep(self.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn await_name_set(
        &self,
        kind: SetFrameKind,
        expected: &std::collections::BTreeSet<&str>,
    ) -> Result<Vec<PropertyAck>, ProtocolError> {
        let deadline = Duration::from_millis(self.ack_timeout_ms as u64);
        let start = tokio::time::Instant::now();
        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(ProtocolError::Transport(TransportError::RecvTimeout(EndpointRole::Control)));
            }
            let datagram = self.sockets.recv(EndpointRole::Control, remaining).await?;
            let frame = match codec::parse_inbound(&datagram.bytes, self.max_xml_bytes) {
                Ok(frame) => frame,
                Err(CodecError::UnknownRoot(root)) => {
                    tracing::debug!(root, "unrecognised control-channel root element, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let acks = match (kind, frame) {
                (SetFrameKind::Subscription, InboundFrame::Subscription(a)) => a,
                (SetFrameKind::Unsubscribe, InboundFrame::Unsubscribe(a)) => a,
                (SetFrameKind::Update, InboundFrame::Update(a)) => a,
                (_, other) => {
                    tracing::debug!(?other, "unmatched control-channel frame during name-set round trip, discarding");
                    tokio::time::sleep(Duration::from_millis(200).min(remaining)).await;
                    continue;
                }
            };
            let names: std::collections::BTreeSet<&str> = acks.iter().map(|a| a.name.as_str()).collect();
            if expected.is_subset(&names) {
                return Ok(acks);
            }
            tracing::debug!("name-set response did not cover expected set, discarding");
        }
    }
}

fn commands_summary(commands: &[Command]) -> String {
    commands.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolVersion;
    use std::net::{IpAddr, Ipv4Addr};

    fn descriptor(control_port: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            model: "XMC-2".into(),
            revision: "3.1".into(),
            name: "Theater".into(),
            protocol_version: ProtocolVersion::V3_1,
            control_port,
            notify_port: control_port + 1,
            keepalive_interval_ms: 10_000,
        }
    }

    async fn engine_over_loopback(ports: (u16, u16)) -> (ProtocolEngine, Arc<SocketManager>, SocketAddr) {
        let sockets = Arc::new(SocketManager::new());
        sockets.start(ports.0, ports.1, None, None).await.unwrap();
        let control_port = sockets.local_port(EndpointRole::Control).await.unwrap();
        let mut cfg = EngineConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        cfg.ack_timeout_ms = 300;
        cfg.max_retries = 2;
        cfg.retry_base_ms = 20;
        let descriptor = descriptor(control_port);
        let engine = ProtocolEngine::new(Arc::clone(&sockets), &descriptor, &cfg);
        let dest: SocketAddr = (IpAddr::V4(Ipv4Addr::LOCALHOST), control_port).into();
        (engine, sockets, dest)
    }

    #[tokio::test]
    async fn send_command_receives_ack() {
        let (engine, sockets, dest) = engine_over_loopback((19000, 19001)).await;
        let responder = tokio::spawn(async move {
            let dg = sockets.recv(EndpointRole::Control, Duration::from_secs(1)).await.unwrap();
            assert!(String::from_utf8_lossy(&dg.bytes).contains("power_on"));
            let scratch = tokio::net::UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
            scratch
                .send_to(br#"<emotivaAck><power_on status="ack"/></emotivaAck>"#, dest)
                .await
                .unwrap();
        });
        let result = engine.send_command(Command::new("power_on", "1", true)).await.unwrap();
        assert_eq!(result.status, AckStatus::Ack);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn nak_is_surfaced_as_error() {
        let (engine, sockets, dest) = engine_over_loopback((19010, 19011)).await;
        tokio::spawn(async move {
            sockets.recv(EndpointRole::Control, Duration::from_secs(1)).await.unwrap();
            let scratch = tokio::net::UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
            scratch
                .send_to(br#"<emotivaAck><volume status="nak"/></emotivaAck>"#, dest)
                .await
                .unwrap();
        });
        let err = engine
            .send_command(Command::new("volume", "-20", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Nak(name) if name == "volume"));
    }

    #[tokio::test]
    async fn fire_and_forget_command_does_not_wait_for_ack() {
        let (engine, _sockets, _dest) = engine_over_loopback((19020, 19021)).await;
        let result = engine
            .send_command(Command::new("zone2_power", "1", false))
            .await
            .unwrap();
        assert_eq!(result.status, AckStatus::Ack);
    }

    #[tokio::test]
    async fn ack_timeout_retries_then_fails() {
        let (engine, _sockets, _dest) = engine_over_loopback((19030, 19031)).await;
        let err = engine
            .send_command(Command::new("power_on", "1", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AckTimeout(_)));
    }

    #[tokio::test]
    async fn subscribe_roundtrip() {
        let (engine, sockets, dest) = engine_over_loopback((19040, 19041)).await;
        tokio::spawn(async move {
            sockets.recv(EndpointRole::Control, Duration::from_secs(1)).await.unwrap();
            let scratch = tokio::net::UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
            scratch
                .send_to(
                    br#"<emotivaSubscription protocol="3.1"><property name="volume" value="-40.0" visible="true" status="ack"/></emotivaSubscription>"#,
                    dest,
                )
                .await
                .unwrap();
        });
        let acks = engine.subscribe(&["volume".to_string()]).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, AckStatus::Ack);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let (engine, _sockets, _dest) = engine_over_loopback((19050, 19051)).await;
        assert_eq!(engine.concurrency.available_permits(), 5);
    }
}
