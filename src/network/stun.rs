//! Minimal STUN (RFC 5389) binding client for candidate gathering
//!
//! Discovers the server-reflexive address of the peer-link UDP socket so it
//! can be offered as a candidate alongside local interface addresses.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use super::error::NetworkError;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// One STUN binding transaction over a borrowed socket
pub struct BindingRequest {
    transaction_id: [u8; 12],
}

impl BindingRequest {
    pub fn new() -> Self {
        Self {
            transaction_id: rand::random(),
        }
    }

    /// Encode the request message (header only, no attributes)
    pub fn encode(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(20);
        msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&self.transaction_id);
        msg
    }

    /// Extract the mapped address from a binding response to this
    /// transaction
    pub fn decode_response(&self, data: &[u8]) -> Result<SocketAddr, NetworkError> {
        if data.len() < 20 {
            return Err(NetworkError::StunFailed("response too short".to_string()));
        }
        if u16::from_be_bytes([data[0], data[1]]) != BINDING_RESPONSE {
            return Err(NetworkError::StunFailed("not a binding response".to_string()));
        }
        if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
            return Err(NetworkError::StunFailed("bad magic cookie".to_string()));
        }
        if data[8..20] != self.transaction_id {
            return Err(NetworkError::StunFailed(
                "transaction id mismatch".to_string(),
            ));
        }

        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let body_end = (20 + msg_len).min(data.len());
        let mut offset = 20;
        while offset + 4 <= body_end {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let value_start = offset + 4;
            if value_start + attr_len > data.len() {
                break;
            }
            let value = &data[value_start..value_start + attr_len];

            match attr_type {
                ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, true),
                ATTR_MAPPED_ADDRESS => return decode_address(value, false),
                _ => {}
            }

            // Attributes are padded to 4-byte boundaries
            offset = value_start + ((attr_len + 3) & !3);
        }

        Err(NetworkError::StunFailed(
            "no mapped address in response".to_string(),
        ))
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a (XOR-)MAPPED-ADDRESS attribute. Only IPv4 is supported; the
/// peer-link candidates are IPv4-only as well.
fn decode_address(value: &[u8], xored: bool) -> Result<SocketAddr, NetworkError> {
    if value.len() < 8 {
        return Err(NetworkError::StunFailed("address attribute too short".to_string()));
    }
    if value[1] != 0x01 {
        return Err(NetworkError::StunFailed(format!(
            "unsupported address family: {}",
            value[1]
        )));
    }

    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut raw_ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        raw_ip ^= MAGIC_COOKIE;
    }

    Ok(SocketAddr::new(Ipv4Addr::from(raw_ip).into(), port))
}

/// Ask `server` (host:port) for the reflexive address of `socket`
pub async fn discover_mapped_address(
    socket: &UdpSocket,
    server: &str,
    timeout_ms: u64,
) -> Result<SocketAddr, NetworkError> {
    let server_addr: SocketAddr = tokio::net::lookup_host(server)
        .await
        .map_err(|e| NetworkError::StunFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| NetworkError::StunFailed("no address for STUN server".to_string()))?;

    debug!("Sending STUN binding request to {}", server_addr);

    let request = BindingRequest::new();
    socket
        .send_to(&request.encode(), server_addr)
        .await
        .map_err(|e| NetworkError::StunFailed(format!("send failed: {}", e)))?;

    let mut buf = [0u8; 576];
    let (len, _) = timeout(
        Duration::from_millis(timeout_ms),
        socket.recv_from(&mut buf),
    )
    .await
    .map_err(|_| NetworkError::StunFailed("timeout".to_string()))?
    .map_err(|e| NetworkError::StunFailed(format!("receive failed: {}", e)))?;

    let mapped = request.decode_response(&buf[..len])?;
    info!("STUN discovered reflexive address {}", mapped);
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_binding_request() {
        let request = BindingRequest::new();
        let msg = request.encode();

        assert_eq!(msg.len(), 20);
        assert_eq!(&msg[0..2], &[0x00, 0x01]);
        assert_eq!(&msg[2..4], &[0x00, 0x00]);
        assert_eq!(&msg[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&msg[8..20], &request.transaction_id);
    }

    #[test]
    fn test_decode_xor_mapped_response() {
        let request = BindingRequest::new();

        // Binding response carrying XOR-MAPPED-ADDRESS for 192.168.1.100:5000
        let mut response = Vec::new();
        response.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        response.extend_from_slice(&12u16.to_be_bytes());
        response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&request.transaction_id);
        response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        response.extend_from_slice(&8u16.to_be_bytes());
        response.push(0x00);
        response.push(0x01);
        response.extend_from_slice(&(5000u16 ^ 0x2112).to_be_bytes());
        let ip = u32::from(Ipv4Addr::new(192, 168, 1, 100)) ^ MAGIC_COOKIE;
        response.extend_from_slice(&ip.to_be_bytes());

        let addr = request.decode_response(&response).unwrap();
        assert_eq!(addr.port(), 5000);
        assert_eq!(addr.ip().to_string(), "192.168.1.100");
    }

    #[test]
    fn test_decode_rejects_foreign_transaction() {
        let request = BindingRequest::new();
        let other = BindingRequest::new();

        let mut response = Vec::new();
        response.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&other.transaction_id);

        assert!(request.decode_response(&response).is_err());
    }
}
