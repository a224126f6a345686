//! Decoded mesh packet descriptor.
//!
//! The traffic manager never touches raw radio frames. The routing pipeline
//! hands it this already-parsed view of a packet: addressing, hop fields, and
//! either the decoded application data or a marker that the payload could not
//! be decrypted.

use serde::{Deserialize, Serialize};

/// Mesh node identifier. `0` is never a valid node.
pub type NodeId = u32;

/// Destination address used for broadcast packets.
pub const BROADCAST_ADDR: NodeId = 0xFFFF_FFFF;

/// Application port a decoded payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum PortNum {
    /// Plain text chat.
    TextMessage,
    /// Position report.
    Position,
    /// Node identity / user info.
    NodeInfo,
    /// Routing maintenance (ACK/NAK, route errors).
    Routing,
    /// Remote administration.
    Admin,
    /// Shared map waypoint.
    Waypoint,
    /// Store and forward.
    StoreForward,
    /// Device or environment telemetry.
    Telemetry,
    /// Route discovery.
    Traceroute,
    /// Neighbor table report.
    NeighborInfo,
    /// Any port this module has no special handling for.
    Other(u32),
}

impl PortNum {
    /// Short name used in action logs.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::TextMessage => Some("text"),
            Self::Position => Some("position"),
            Self::NodeInfo => Some("nodeinfo"),
            Self::Routing => Some("routing"),
            Self::Admin => Some("admin"),
            Self::Waypoint => Some("waypoint"),
            Self::StoreForward => Some("store-forward"),
            Self::Telemetry => Some("telemetry"),
            Self::Traceroute => Some("traceroute"),
            Self::NeighborInfo => Some("neighborinfo"),
            Self::Other(_) => None,
        }
    }

    /// Routing and admin traffic keeps the mesh working and is never throttled.
    pub fn is_mesh_control(&self) -> bool {
        matches!(self, Self::Routing | Self::Admin)
    }
}

impl From<u32> for PortNum {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::TextMessage,
            3 => Self::Position,
            4 => Self::NodeInfo,
            5 => Self::Routing,
            6 => Self::Admin,
            8 => Self::Waypoint,
            65 => Self::StoreForward,
            67 => Self::Telemetry,
            70 => Self::Traceroute,
            71 => Self::NeighborInfo,
            other => Self::Other(other),
        }
    }
}

impl From<PortNum> for u32 {
    fn from(port: PortNum) -> Self {
        match port {
            PortNum::TextMessage => 1,
            PortNum::Position => 3,
            PortNum::NodeInfo => 4,
            PortNum::Routing => 5,
            PortNum::Admin => 6,
            PortNum::Waypoint => 8,
            PortNum::StoreForward => 65,
            PortNum::Telemetry => 67,
            PortNum::Traceroute => 70,
            PortNum::NeighborInfo => 71,
            PortNum::Other(value) => value,
        }
    }
}

impl std::fmt::Display for PortNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "port={}", u32::from(*self)),
        }
    }
}

/// Position report coordinates in 1e-7 degree units.
///
/// Either coordinate may be missing in a malformed or partial report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude × 1e7.
    #[serde(default)]
    pub latitude_i: Option<i32>,
    /// Longitude × 1e7.
    #[serde(default)]
    pub longitude_i: Option<i32>,
}

impl Position {
    /// Position with both coordinates present.
    pub fn new(latitude_i: i32, longitude_i: i32) -> Self {
        Self {
            latitude_i: Some(latitude_i),
            longitude_i: Some(longitude_i),
        }
    }

    /// Both coordinates, if the report carries them.
    pub fn coordinates(&self) -> Option<(i32, i32)> {
        Some((self.latitude_i?, self.longitude_i?))
    }
}

/// Application data of a packet that was successfully decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedData {
    /// Application port.
    pub port: PortNum,
    /// Sender asks the destination to answer.
    #[serde(default)]
    pub want_response: bool,
    /// Decoded position, for position reports that parsed cleanly.
    #[serde(default)]
    pub position: Option<Position>,
}

/// Payload of a mesh packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Payload decrypted and decoded.
    Decoded(DecodedData),
    /// Payload still opaque (unknown channel key, corruption).
    Encrypted,
}

/// A mesh packet as seen by the traffic manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    /// Originating node.
    pub from: NodeId,
    /// Destination node or [`BROADCAST_ADDR`].
    pub to: NodeId,
    /// Packet id assigned by the originator.
    #[serde(default)]
    pub id: u32,
    /// Channel index.
    #[serde(default)]
    pub channel: u8,
    /// Hop budget the packet was launched with.
    pub hop_start: u8,
    /// Hops remaining.
    pub hop_limit: u8,
    /// Decoded data or opaque marker.
    pub payload: Payload,
}

impl MeshPacket {
    /// Build a decoded packet with no position and no response request.
    pub fn decoded(from: NodeId, to: NodeId, port: PortNum) -> Self {
        Self {
            from,
            to,
            id: 0,
            channel: 0,
            hop_start: 3,
            hop_limit: 3,
            payload: Payload::Decoded(DecodedData {
                port,
                want_response: false,
                position: None,
            }),
        }
    }

    /// Build a position report.
    pub fn position(from: NodeId, to: NodeId, position: Position) -> Self {
        let mut packet = Self::decoded(from, to, PortNum::Position);
        if let Payload::Decoded(data) = &mut packet.payload {
            data.position = Some(position);
        }
        packet
    }

    /// Build a packet whose payload could not be decoded.
    pub fn encrypted(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            id: 0,
            channel: 0,
            hop_start: 3,
            hop_limit: 3,
            payload: Payload::Encrypted,
        }
    }

    /// Ask the destination to answer. No effect on undecoded packets.
    pub fn with_want_response(mut self) -> Self {
        if let Payload::Decoded(data) = &mut self.payload {
            data.want_response = true;
        }
        self
    }

    /// Decoded data, if any.
    pub fn decoded_data(&self) -> Option<&DecodedData> {
        match &self.payload {
            Payload::Decoded(data) => Some(data),
            Payload::Encrypted => None,
        }
    }

    /// Application port of a decoded packet.
    pub fn port(&self) -> Option<PortNum> {
        self.decoded_data().map(|data| data.port)
    }

    /// Whether the packet is addressed to everyone.
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }

    /// Hops already travelled, if the hop fields are trustworthy.
    ///
    /// Packets from legacy firmware carry `hop_start == 0`, and a limit above
    /// the start value can only come from a corrupt header.
    pub fn hops_away(&self) -> Option<u8> {
        if self.hop_start == 0 || self.hop_start < self.hop_limit {
            return None;
        }
        Some(self.hop_start - self.hop_limit)
    }
}
