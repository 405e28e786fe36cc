use bincode::{Decode, Encode};

use crate::AnnotationRecord;

pub const SNAPSHOT_FILE_MAGIC: [u8; 4] = *b"GBAN";
pub const SNAPSHOT_FILE_VERSION: u32 = 1;
const SNAPSHOT_HEADER_LEN: usize = SNAPSHOT_FILE_MAGIC.len() + std::mem::size_of::<u32>();

/// Annotations a host keeps for one map session.
#[derive(Clone, Debug, Default, PartialEq, Encode, Decode, serde::Serialize, serde::Deserialize)]
pub struct AnnotationSnapshot {
    pub annotations: Vec<AnnotationRecord>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotDecodeError {
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid snapshot data")]
    InvalidData,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode snapshot: {0}")]
pub struct SnapshotEncodeError(#[from] bincode::error::EncodeError);

pub fn encode_snapshot(data: &AnnotationSnapshot) -> Result<Vec<u8>, SnapshotEncodeError> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&SNAPSHOT_FILE_MAGIC);
    payload.extend_from_slice(&SNAPSHOT_FILE_VERSION.to_le_bytes());
    let body = bincode::encode_to_vec(data, bincode::config::standard())?;
    payload.extend_from_slice(&body);
    Ok(payload)
}

pub fn decode_snapshot(payload: &[u8]) -> Result<AnnotationSnapshot, SnapshotDecodeError> {
    if !(payload.len() >= SNAPSHOT_HEADER_LEN && payload.starts_with(&SNAPSHOT_FILE_MAGIC)) {
        return Err(SnapshotDecodeError::InvalidData);
    }
    let version = u32::from_le_bytes(
        payload[SNAPSHOT_FILE_MAGIC.len()..SNAPSHOT_HEADER_LEN]
            .try_into()
            .map_err(|_| SnapshotDecodeError::InvalidData)?,
    );
    let body = &payload[SNAPSHOT_HEADER_LEN..];
    match version {
        1 => bincode::decode_from_slice(body, bincode::config::standard())
            .map(|(data, _)| data)
            .map_err(|_| SnapshotDecodeError::InvalidData),
        _ => Err(SnapshotDecodeError::UnsupportedVersion(version)),
    }
}
