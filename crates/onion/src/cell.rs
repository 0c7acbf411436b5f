//! Onion cell codec
//!
//! Every link carries fixed 514-byte cells: `u32 circuit_id || u8 command
//! || 509-byte payload`, zero-padded. RELAY payloads hold a length-framed
//! encrypted blob; the inner relay cell is a fixed 459-byte plaintext so
//! that three AEAD layers still fit the payload.

use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{OnionError, Result};

/// Total cell size on every link.
pub const CELL_SIZE: usize = 514;

/// Payload area of a cell.
pub const CELL_PAYLOAD_SIZE: usize = 509;

/// Largest blob a RELAY payload can frame (2 bytes go to the length).
pub const MAX_BLOB_SIZE: usize = CELL_PAYLOAD_SIZE - 2;

/// Inner relay-cell plaintext size. Each onion layer adds a 16-byte tag;
/// with three hops the outermost blob is exactly `MAX_BLOB_SIZE`.
pub const RELAY_INNER_SIZE: usize = MAX_BLOB_SIZE - 3 * 16;

/// Relay-cell header: cmd, reserved, stream id, digest, data length.
const RELAY_HEADER_SIZE: usize = 1 + 2 + 2 + 4 + 2;

/// Application bytes carried by one RELAY_DATA cell.
pub const MAX_RELAY_DATA: usize = RELAY_INNER_SIZE - RELAY_HEADER_SIZE;

/// Cell commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    RelayEarly = 9,
}

impl CellCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            9 => Some(CellCommand::RelayEarly),
            _ => None,
        }
    }
}

/// Commands inside a RELAY cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Extend = 6,
    Extended = 7,
    Drop = 10,
}

impl RelayCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            10 => Some(RelayCommand::Drop),
            _ => None,
        }
    }
}

/// One fixed-size cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circuit_id: u32,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; CELL_SIZE]> {
        if self.payload.len() > CELL_PAYLOAD_SIZE {
            return Err(OnionError::MalformedCell(format!(
                "payload of {} exceeds {CELL_PAYLOAD_SIZE}",
                self.payload.len()
            )));
        }

        let mut buf = [0u8; CELL_SIZE];
        buf[..4].copy_from_slice(&self.circuit_id.to_be_bytes());
        buf[4] = self.command as u8;
        buf[5..5 + self.payload.len()].copy_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CELL_SIZE {
            return Err(OnionError::MalformedCell(format!(
                "cell must be {CELL_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let circuit_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let command = CellCommand::from_u8(bytes[4])
            .ok_or_else(|| OnionError::MalformedCell(format!("unknown command {}", bytes[4])))?;

        Ok(Self {
            circuit_id,
            command,
            payload: bytes[5..].to_vec(),
        })
    }
}

/// Read one cell from `stream`.
pub async fn read_cell<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Cell> {
    let mut buf = [0u8; CELL_SIZE];
    stream.read_exact(&mut buf).await?;
    Cell::from_bytes(&buf)
}

/// Write one cell to `stream`.
pub async fn write_cell<S: AsyncWrite + Unpin>(stream: &mut S, cell: &Cell) -> Result<()> {
    let bytes = cell.to_bytes()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Frame an encrypted blob into a full cell payload: `u16 len || blob`,
/// zero-padded.
pub fn frame_blob(blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() > MAX_BLOB_SIZE {
        return Err(OnionError::MalformedCell(format!(
            "blob of {} exceeds {MAX_BLOB_SIZE}",
            blob.len()
        )));
    }
    let mut payload = vec![0u8; CELL_PAYLOAD_SIZE];
    payload[..2].copy_from_slice(&(blob.len() as u16).to_be_bytes());
    payload[2..2 + blob.len()].copy_from_slice(blob);
    Ok(payload)
}

/// Recover the blob from a framed cell payload.
pub fn unframe_blob(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() != CELL_PAYLOAD_SIZE {
        return Err(OnionError::MalformedCell(format!(
            "relay payload must be {CELL_PAYLOAD_SIZE} bytes, got {}",
            payload.len()
        )));
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if len > MAX_BLOB_SIZE {
        return Err(OnionError::MalformedCell(format!("blob length {len} invalid")));
    }
    Ok(payload[2..2 + len].to_vec())
}

/// Decrypted inner relay cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub stream_id: u16,
    pub digest: u32,
    pub data: Vec<u8>,
}

impl RelayCell {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            stream_id,
            digest: 0,
            data,
        }
    }

    /// Fixed-size plaintext: header, data, zero padding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_RELAY_DATA {
            return Err(OnionError::MalformedCell(format!(
                "relay data of {} exceeds {MAX_RELAY_DATA}",
                self.data.len()
            )));
        }

        let mut buf = vec![0u8; RELAY_INNER_SIZE];
        buf[0] = self.command as u8;
        // bytes 1..3 reserved
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.digest.to_be_bytes());
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[11..11 + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RELAY_INNER_SIZE {
            return Err(OnionError::MalformedCell(format!(
                "relay cell must be {RELAY_INNER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let command = RelayCommand::from_u8(bytes[0]).ok_or_else(|| {
            OnionError::MalformedCell(format!("unknown relay command {}", bytes[0]))
        })?;
        let stream_id = u16::from_be_bytes([bytes[3], bytes[4]]);
        let digest = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let data_len = u16::from_be_bytes([bytes[9], bytes[10]]) as usize;
        if data_len > MAX_RELAY_DATA {
            return Err(OnionError::MalformedCell(format!(
                "relay data length {data_len} invalid"
            )));
        }

        Ok(Self {
            command,
            stream_id,
            digest,
            data: bytes[11..11 + data_len].to_vec(),
        })
    }

    /// The encoded form with the digest field zeroed; what hop digests
    /// are computed over.
    pub fn digest_input(&self) -> Result<Vec<u8>> {
        let mut bytes = self.encode()?;
        bytes[5..9].fill(0);
        Ok(bytes)
    }
}

/// RELAY_EXTEND body: the next relay's address and the client's fresh
/// ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendPayload {
    pub addr: SocketAddrV4,
    pub ephemeral_der: Vec<u8>,
}

impl ExtendPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 2 + 2 + self.ephemeral_der.len());
        buf.extend_from_slice(&self.addr.ip().octets());
        buf.extend_from_slice(&self.addr.port().to_be_bytes());
        buf.extend_from_slice(&(self.ephemeral_der.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.ephemeral_der);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(OnionError::MalformedCell("extend payload too short".into()));
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        let key_len = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
        if bytes.len() != 8 + key_len {
            return Err(OnionError::MalformedCell(
                "extend payload length mismatch".into(),
            ));
        }

        Ok(Self {
            addr: SocketAddrV4::new(ip, port),
            ephemeral_der: bytes[8..].to_vec(),
        })
    }
}

/// Length-framed key material inside CREATE/CREATED payloads.
pub fn encode_key_payload(der: &[u8]) -> Result<Vec<u8>> {
    if der.len() > CELL_PAYLOAD_SIZE - 2 {
        return Err(OnionError::MalformedCell("key too large for cell".into()));
    }
    let mut payload = vec![0u8; CELL_PAYLOAD_SIZE];
    payload[..2].copy_from_slice(&(der.len() as u16).to_be_bytes());
    payload[2..2 + der.len()].copy_from_slice(der);
    Ok(payload)
}

pub fn decode_key_payload(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 2 {
        return Err(OnionError::MalformedCell("key payload too short".into()));
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + len {
        return Err(OnionError::MalformedCell("key length overruns payload".into()));
    }
    Ok(payload[2..2 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_roundtrip() {
        let cell = Cell::new(0x1234, CellCommand::Relay, vec![1, 2, 3]);
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), CELL_SIZE);

        let decoded = Cell::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.circuit_id, 0x1234);
        assert_eq!(decoded.command, CellCommand::Relay);
        // Payload comes back zero-padded to full size
        assert_eq!(decoded.payload.len(), CELL_PAYLOAD_SIZE);
        assert_eq!(&decoded.payload[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_cell_rejects_oversize_payload() {
        let cell = Cell::new(1, CellCommand::Relay, vec![0u8; CELL_PAYLOAD_SIZE + 1]);
        assert!(cell.to_bytes().is_err());
    }

    #[test]
    fn test_cell_rejects_wrong_size_buffer() {
        assert!(Cell::from_bytes(&[0u8; CELL_SIZE - 1]).is_err());
        assert!(Cell::from_bytes(&[0u8; CELL_SIZE + 1]).is_err());
    }

    #[test]
    fn test_cell_rejects_unknown_command() {
        let mut bytes = Cell::new(1, CellCommand::Padding, vec![])
            .to_bytes()
            .unwrap();
        bytes[4] = 0x77;
        assert!(Cell::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_relay_cell_roundtrip() {
        let mut cell = RelayCell::new(RelayCommand::Data, 7, b"hello".to_vec());
        cell.digest = 0xDEADBEEF;

        let bytes = cell.encode().unwrap();
        assert_eq!(bytes.len(), RELAY_INNER_SIZE);

        let decoded = RelayCell::decode(&bytes).unwrap();
        assert_eq!(decoded, cell);
    }

    #[test]
    fn test_relay_cell_rejects_oversize_data() {
        let cell = RelayCell::new(RelayCommand::Data, 1, vec![0u8; MAX_RELAY_DATA + 1]);
        assert!(cell.encode().is_err());
    }

    #[test]
    fn test_digest_input_zeroes_digest_only() {
        let mut cell = RelayCell::new(RelayCommand::Extend, 0, vec![9, 9]);
        cell.digest = 0xFFFF_FFFF;

        let input = cell.digest_input().unwrap();
        assert_eq!(&input[5..9], &[0, 0, 0, 0]);

        let mut plain = cell.clone();
        plain.digest = 0;
        assert_eq!(input, plain.encode().unwrap());
    }

    #[test]
    fn test_blob_framing_roundtrip() {
        let blob = vec![0xAB; 100];
        let payload = frame_blob(&blob).unwrap();
        assert_eq!(payload.len(), CELL_PAYLOAD_SIZE);
        assert_eq!(unframe_blob(&payload).unwrap(), blob);
    }

    #[test]
    fn test_blob_framing_max_size() {
        let blob = vec![1u8; MAX_BLOB_SIZE];
        let payload = frame_blob(&blob).unwrap();
        assert_eq!(unframe_blob(&payload).unwrap(), blob);

        assert!(frame_blob(&vec![1u8; MAX_BLOB_SIZE + 1]).is_err());
    }

    #[test]
    fn test_extend_payload_roundtrip() {
        let extend = ExtendPayload {
            addr: SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 51823),
            ephemeral_der: vec![4u8; 91],
        };
        let bytes = extend.encode();
        assert_eq!(ExtendPayload::decode(&bytes).unwrap(), extend);
    }

    #[test]
    fn test_extend_payload_rejects_bad_lengths() {
        assert!(ExtendPayload::decode(&[1, 2, 3]).is_err());

        let extend = ExtendPayload {
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
            ephemeral_der: vec![0u8; 10],
        };
        let mut bytes = extend.encode();
        bytes.pop();
        assert!(ExtendPayload::decode(&bytes).is_err());
    }

    #[test]
    fn test_key_payload_roundtrip() {
        let der = vec![0x30, 0x59, 0x02];
        let payload = encode_key_payload(&der).unwrap();
        assert_eq!(payload.len(), CELL_PAYLOAD_SIZE);
        assert_eq!(decode_key_payload(&payload).unwrap(), der);
    }

    #[test]
    fn test_three_layers_fill_the_payload_exactly() {
        // inner plaintext + 3 tags + length framing == full payload
        assert_eq!(RELAY_INNER_SIZE + 3 * 16 + 2, CELL_PAYLOAD_SIZE);
    }

    #[tokio::test]
    async fn test_cell_io_over_duplex() {
        let (mut left, mut right) = tokio::io::duplex(2048);
        let cell = Cell::new(99, CellCommand::Create, vec![7u8; 20]);

        write_cell(&mut left, &cell).await.unwrap();
        let read = read_cell(&mut right).await.unwrap();
        assert_eq!(read.circuit_id, 99);
        assert_eq!(read.command, CellCommand::Create);
        assert_eq!(&read.payload[..20], &[7u8; 20]);
    }
}
