//! Wire formats: direct-path datagram framing and signaling messages

mod packet;
mod signal;

pub use packet::{
    Packet, PacketFlags, PacketType, HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION,
};
pub use signal::{HandshakeMessage, SignalMessage};
