//! Datagram framing for the direct peer path
//!
//! Packet format (16-byte header):
//! - version: 1 byte
//! - type: 1 byte
//! - flags: 2 bytes (big-endian)
//! - sequence: 4 bytes (big-endian)
//! - token: 8 bytes (big-endian, pairs a datagram with one handshake)
//!
//! This framing is internal to the peer-link transport and is not part of
//! the crate's external contract.

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest UDP payload on IPv4 (65535 minus IP and UDP headers)
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Maximum payload one packet can carry; larger application messages do
/// not fit in a single datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Connectivity probe for a candidate pair
    Probe = 0x01,
    /// Acknowledgement of a probe
    ProbeAck = 0x02,
    /// Application data
    Data = 0x03,
    /// Keep-alive for an established direct path
    KeepAlive = 0x04,
    /// Orderly close of the direct path
    Close = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Probe),
            0x02 => Ok(PacketType::ProbeAck),
            0x03 => Ok(PacketType::Data),
            0x04 => Ok(PacketType::KeepAlive),
            0x05 => Ok(PacketType::Close),
            _ => Err(()),
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// Payload belongs to the reliable channel class
    pub reliable: bool,
}

impl PacketFlags {
    pub fn to_u16(self) -> u16 {
        if self.reliable {
            0x0001
        } else {
            0
        }
    }

    pub fn from_u16(value: u16) -> Self {
        Self {
            reliable: (value & 0x0001) != 0,
        }
    }
}

/// One direct-path datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub sequence: u32,
    pub token: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn probe(sequence: u32, token: u64) -> Self {
        Self::control(PacketType::Probe, sequence, token)
    }

    pub fn probe_ack(sequence: u32, token: u64) -> Self {
        Self::control(PacketType::ProbeAck, sequence, token)
    }

    pub fn keep_alive(sequence: u32, token: u64) -> Self {
        Self::control(PacketType::KeepAlive, sequence, token)
    }

    pub fn close(sequence: u32, token: u64) -> Self {
        Self::control(PacketType::Close, sequence, token)
    }

    pub fn data(sequence: u32, token: u64, reliable: bool, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Data,
            flags: PacketFlags { reliable },
            sequence,
            token,
            payload,
        }
    }

    fn control(packet_type: PacketType, sequence: u32, token: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            flags: PacketFlags::default(),
            sequence,
            token,
            payload: Vec::new(),
        }
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.version);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.flags.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.token.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a packet from bytes; `None` for short, unknown or
    /// wrong-version datagrams
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        if data[0] != PROTOCOL_VERSION {
            return None;
        }

        let packet_type = PacketType::try_from(data[1]).ok()?;
        let flags = PacketFlags::from_u16(u16::from_be_bytes([data[2], data[3]]));
        let sequence = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let token = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);

        Some(Self {
            version: data[0],
            packet_type,
            flags,
            sequence,
            token,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet_round_trip() {
        let packet = Packet::data(42, 0xDEADBEEF, true, vec![1, 2, 3]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);

        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.flags.reliable);
    }

    #[test]
    fn test_control_packets_have_empty_payload() {
        for packet in [
            Packet::probe(1, 7),
            Packet::probe_ack(2, 7),
            Packet::keep_alive(3, 7),
            Packet::close(4, 7),
        ] {
            let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
            assert_eq!(parsed.token, 7);
            assert!(parsed.payload.is_empty());
        }
    }

    #[test]
    fn test_reject_short_and_unknown() {
        assert!(Packet::from_bytes(&[1, 2, 3]).is_none());

        let mut bytes = Packet::probe(0, 0).to_bytes();
        bytes[1] = 0xFF; // unknown type
        assert!(Packet::from_bytes(&bytes).is_none());

        let mut bytes = Packet::probe(0, 0).to_bytes();
        bytes[0] = 9; // wrong version
        assert!(Packet::from_bytes(&bytes).is_none());
    }
}
