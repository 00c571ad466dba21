//! IPv4 tracker: ICMP echo probing of missing devices
//!
//! `run` opens a raw ICMP socket and reports the source address of every
//! fresh echo reply. `ping` sends a short burst of echo requests to each
//! Ethernet/WiFi interface of the given devices; the replies flow back
//! through the receive loop.

use anyhow::Context;
use async_trait::async_trait;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::{util, Packet};
use pnet::transport::TransportChannelType::Layer4;
use pnet::transport::TransportProtocol::Ipv4;
use pnet::transport::{icmp_packet_iter, transport_channel, TransportReceiver, TransportSender};
use presence_core::{Device, Interface, InterfaceType};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::tracker::{parse_settings, Reporter, Tracker, TrackerError, TrackerSettings};

pub const TRACKER_NAME: &str = "ipv4";

/// Type, code, checksum, identifier and sequence number
pub const ICMP_HEADER_SIZE: usize = 8;

/// Replies lagging the current sequence by more than this are stale
pub const MAX_SEQUENCE_LAG: u16 = 2;

const PING_PAYLOAD: &[u8] = b"presence-probe";
const RECEIVE_BUFFER_SIZE: usize = 32 * 1024;
const RECEIVE_POLL: Duration = Duration::from_millis(500);

/// Settings read from `[trackers.ipv4]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpSettings {
    /// Echo requests sent to each interface per ping
    pub packet_count: u32,
    /// Delay between two rounds of echo requests
    pub packet_delay_ms: u64,
    /// Time left for late replies once the last round is sent
    pub drain_timeout_ms: u64,
}

impl Default for IcmpSettings {
    fn default() -> Self {
        Self {
            packet_count: 5,
            packet_delay_ms: 100,
            drain_timeout_ms: 500,
        }
    }
}

/// Fields of an accepted echo reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
}

/// Why an inbound ICMP packet was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discarded {
    /// Shorter than an ICMP echo header
    Truncated(usize),
    /// Some other ICMP message type
    NotEchoReply(u8),
    /// Echo reply to another process on this host
    ForeignIdentifier(u16),
    /// Echo reply to a ping older than the last few
    StaleSequence(u16),
}

/// Build an ICMP echo request with a valid checksum
pub fn echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload.len()];
    if let Some(mut echo) = MutableEchoRequestPacket::new(&mut buffer) {
        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_icmp_code(IcmpCode::new(0));
        echo.set_identifier(identifier);
        echo.set_sequence_number(sequence);
        echo.set_payload(payload);
        let checksum = util::checksum(echo.packet(), 1);
        echo.set_checksum(checksum);
    }
    buffer
}

/// Parse an ICMP message, keeping only echo replies
pub fn parse_echo_reply(data: &[u8]) -> Result<EchoReply, Discarded> {
    if data.len() < ICMP_HEADER_SIZE {
        return Err(Discarded::Truncated(data.len()));
    }
    let reply = EchoReplyPacket::new(data).ok_or(Discarded::Truncated(data.len()))?;
    let icmp_type = reply.get_icmp_type();
    if icmp_type != IcmpTypes::EchoReply {
        return Err(Discarded::NotEchoReply(icmp_type.0));
    }
    Ok(EchoReply {
        identifier: reply.get_identifier(),
        sequence: reply.get_sequence_number(),
    })
}

/// Parse an inbound ICMP message and keep it only if it answers one of
/// the recent pings sent with `identifier`, `current` being the last
/// sequence number used
pub fn accept_reply(data: &[u8], identifier: u16, current: u16) -> Result<EchoReply, Discarded> {
    let reply = parse_echo_reply(data)?;
    if reply.identifier != identifier {
        return Err(Discarded::ForeignIdentifier(reply.identifier));
    }
    if !is_fresh_sequence(current, reply.sequence) {
        return Err(Discarded::StaleSequence(reply.sequence));
    }
    Ok(reply)
}

/// Whether a reply carrying `received` belongs to one of the last few pings.
///
/// Wrapping arithmetic keeps this valid across the u16 rollover; a reply
/// ahead of `current` wraps to a huge lag and is rejected as well.
pub fn is_fresh_sequence(current: u16, received: u16) -> bool {
    current.wrapping_sub(received) <= MAX_SEQUENCE_LAG
}

/// Send errors that only mean the target is not around right now
fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if [libc::EHOSTUNREACH, libc::ENETUNREACH, libc::EHOSTDOWN].contains(&code)
    )
}

/// IPv4 addresses to probe: Ethernet and WiFi interfaces only
fn ping_targets(devices: &[Device]) -> Vec<(&str, Ipv4Addr)> {
    devices
        .iter()
        .flat_map(|d| {
            d.interfaces
                .iter()
                .filter(|itf| itf.kind.is_ip())
                .filter_map(move |itf| itf.ipv4_address.map(|ip| (d.identifier.as_str(), ip)))
        })
        .collect()
}

/// ICMP echo tracker
pub struct IcmpTracker {
    settings: IcmpSettings,
    identifier: u16,
    sequence: Arc<AtomicU16>,
    sender: Mutex<Option<TransportSender>>,
    /// Held for a whole ping batch
    ping_lock: Mutex<()>,
}

impl IcmpTracker {
    pub fn new(settings: IcmpSettings) -> Self {
        Self {
            settings,
            identifier: std::process::id() as u16,
            sequence: Arc::new(AtomicU16::new(0)),
            sender: Mutex::new(None),
            ping_lock: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &TrackerSettings) -> Result<Arc<dyn Tracker>, TrackerError> {
        let settings: IcmpSettings = parse_settings(TRACKER_NAME, settings)?;
        Ok(Arc::new(Self::new(settings)))
    }

    pub fn settings(&self) -> &IcmpSettings {
        &self.settings
    }
}

#[async_trait]
impl Tracker for IcmpTracker {
    async fn run(&self, reporter: Reporter, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("Starting: ipv4 tracker");
        let (tx, mut rx) = transport_channel(
            RECEIVE_BUFFER_SIZE,
            Layer4(Ipv4(IpNextHeaderProtocols::Icmp)),
        )
        .context("Failed to open raw ICMP socket")?;
        *self.sender.lock().await = Some(tx);

        let identifier = self.identifier;
        let sequence = Arc::clone(&self.sequence);
        let receiver = tokio::task::spawn_blocking(move || {
            receive_loop(&mut rx, identifier, &sequence, &reporter, &cancel)
        });
        let outcome = receiver.await;

        // Dropping the sender closes our half of the socket
        *self.sender.lock().await = None;
        info!("Stopped: ipv4 tracker");

        outcome
            .context("ICMP receive task panicked")?
            .context("Failed reading from ICMP socket")
    }

    async fn ping(&self, devices: &[Device]) {
        // one batch at a time, so the sequence doesn't move under a batch
        let _batch = self.ping_lock.lock().await;
        let targets = ping_targets(devices);
        if targets.is_empty() {
            debug!(devices = devices.len(), "No IPv4 interface to ping");
            return;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let packet = echo_request(self.identifier, sequence, PING_PAYLOAD);
        let count = self.settings.packet_count;
        debug!(
            devices = devices.len(),
            targets = targets.len(),
            sequence,
            "Sending ping packets"
        );

        for round in 1..=count {
            {
                let mut guard = self.sender.lock().await;
                let Some(sender) = guard.as_mut() else {
                    warn!("ipv4 tracker is not running, ping skipped");
                    return;
                };
                for (device, ip) in &targets {
                    trace!(device = %device, ip = %ip, round, count, "Sending ping packet");
                    if let Err(e) = send_echo(sender, &packet, *ip) {
                        if is_unreachable(&e) {
                            debug!(
                                device = %device, ip = %ip, error = %e,
                                "Ping target unreachable"
                            );
                        } else {
                            warn!(device = %device, ip = %ip, error = %e, "Ping failed");
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(self.settings.packet_delay_ms)).await;
        }

        tokio::time::sleep(Duration::from_millis(self.settings.drain_timeout_ms)).await;
        debug!(sequence, "Done sending ping packets");
    }
}

fn send_echo(sender: &mut TransportSender, packet: &[u8], ip: Ipv4Addr) -> io::Result<()> {
    let icmp = IcmpPacket::new(packet)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "echo request too short"))?;
    sender.send_to(icmp, IpAddr::V4(ip)).map(|_| ())
}

/// Blocking receive loop, returns once `cancel` fires or the socket fails
fn receive_loop(
    rx: &mut TransportReceiver,
    identifier: u16,
    sequence: &AtomicU16,
    reporter: &Reporter,
    cancel: &CancellationToken,
) -> io::Result<()> {
    debug!("Receiving ping packets");
    let mut packets = icmp_packet_iter(rx);

    while !cancel.is_cancelled() {
        let (reply, source, current) = match packets.next_with_timeout(RECEIVE_POLL) {
            Ok(Some((packet, IpAddr::V4(source)))) => {
                let current = sequence.load(Ordering::SeqCst);
                (accept_reply(packet.packet(), identifier, current), source, current)
            }
            Ok(Some(_)) | Ok(None) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        match reply {
            Ok(reply) => debug!(source = %source, sequence = reply.sequence, "Got reply"),
            Err(Discarded::Truncated(len)) => {
                debug!(source = %source, len, "Discarding truncated ICMP packet");
                continue;
            }
            Err(Discarded::NotEchoReply(icmp_type)) => {
                trace!(source = %source, icmp_type, "Ignoring ICMP message");
                continue;
            }
            Err(Discarded::ForeignIdentifier(other)) => {
                trace!(source = %source, identifier = other, "Echo reply for another process");
                continue;
            }
            Err(Discarded::StaleSequence(received)) => {
                trace!(
                    source = %source,
                    sequence = received,
                    expected = current,
                    "Ignoring echo reply with stale sequence"
                );
                continue;
            }
        }

        let interface = Interface::with_ipv4(InterfaceType::Unknown, source);
        if reporter.blocking_report(interface, None).is_err() {
            debug!("Detection queue closed, stopping receive loop");
            break;
        }
    }

    debug!("Done receiving ping packets");
    Ok(())
}
