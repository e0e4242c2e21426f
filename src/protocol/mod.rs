//! Wire protocol definitions.
//!
//! All packets, client and cluster alike, are length-prefixed: a 4-byte
//! big-endian payload length followed by that many payload bytes. A client
//! payload begins with a 1-byte operation code and a 4-byte big-endian
//! request id; responses additionally carry a 1-byte status immediately
//! after the request id. Cluster traffic reuses the framing with a separate
//! operation space.

pub mod buffer;
pub mod pool;
pub mod value;

pub use buffer::PacketBuffer;
pub use value::TaggedValue;

use crate::core::error::StrataError;

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Minimum payload length: operation byte plus request id.
pub const MIN_PAYLOAD_LEN: usize = 5;

/// Maximum payload length accepted on receive.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Protocol version carried by `Login`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Client operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Login = 0,
    GetString = 1,
    SetString = 2,
    GetList = 3,
    AddList = 4,
    RemoveList = 5,
    ContainsList = 6,
    Exists = 7,
    Delete = 8,
    GetObjectBinary = 9,
    SetObjectBinary = 10,
    GetStats = 11,
    GetBytes = 12,
    SetBytes = 13,
    SetCounter = 14,
    IncrementCounter = 15,
    Bulk = 16,
    GetMapValue = 17,
    SetMapValue = 18,
    GetMap = 19,
    SetMap = 20,
    Subscribe = 21,
    Unsubscribe = 22,
    Publish = 23,
}

impl TryFrom<u8> for Operation {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Login),
            1 => Ok(Self::GetString),
            2 => Ok(Self::SetString),
            3 => Ok(Self::GetList),
            4 => Ok(Self::AddList),
            5 => Ok(Self::RemoveList),
            6 => Ok(Self::ContainsList),
            7 => Ok(Self::Exists),
            8 => Ok(Self::Delete),
            9 => Ok(Self::GetObjectBinary),
            10 => Ok(Self::SetObjectBinary),
            11 => Ok(Self::GetStats),
            12 => Ok(Self::GetBytes),
            13 => Ok(Self::SetBytes),
            14 => Ok(Self::SetCounter),
            15 => Ok(Self::IncrementCounter),
            16 => Ok(Self::Bulk),
            17 => Ok(Self::GetMapValue),
            18 => Ok(Self::SetMapValue),
            19 => Ok(Self::GetMap),
            20 => Ok(Self::SetMap),
            21 => Ok(Self::Subscribe),
            22 => Ok(Self::Unsubscribe),
            23 => Ok(Self::Publish),
            other => Err(other),
        }
    }
}

/// Cluster operation codes.
///
/// Cluster messages share the client framing but use their own operation
/// space; every message carries a request id for correlation over the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClusterOperation {
    Handshake = 0,
    Alive = 1,
    Election = 2,
    Victory = 3,
    Sync = 4,
    Replicate = 5,
    ReplicateBatch = 6,
}

impl TryFrom<u8> for ClusterOperation {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Alive),
            2 => Ok(Self::Election),
            3 => Ok(Self::Victory),
            4 => Ok(Self::Sync),
            5 => Ok(Self::Replicate),
            6 => Ok(Self::ReplicateBatch),
            other => Err(other),
        }
    }
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

impl TryFrom<u8> for Status {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self, StrataError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Error),
            other => Err(StrataError::malformed(format!(
                "unknown status byte: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_round_trip() {
        for code in 0u8..=23 {
            let op = Operation::try_from(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(Operation::try_from(24).is_err());
    }

    #[test]
    fn test_cluster_operation_round_trip() {
        for code in 0u8..=6 {
            let op = ClusterOperation::try_from(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(ClusterOperation::try_from(7).is_err());
    }

    #[test]
    fn test_status_from_byte() {
        assert_eq!(Status::try_from(0).unwrap(), Status::Ok);
        assert_eq!(Status::try_from(1).unwrap(), Status::Error);
        assert!(Status::try_from(2).is_err());
    }
}
