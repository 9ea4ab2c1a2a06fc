//! The stable binary operation codec.
//!
//! Every operation encodes as a little-endian u16 type id followed by its
//! fields. Queries prefix their fields with a single consistency ordinal
//! byte; TTL commands append a mode ordinal byte and an i64 TTL in
//! milliseconds. Object-valued fields (keys, values, payloads) use the
//! object codec (bincode), which is self-delimiting.
//!
//! Ids are frozen: map operations occupy 440–448, group operations
//! 460–464.

use std::io::{Cursor, Read};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::group::ops::{self as group_ops, AckRequest, GroupOperation, JoinRequest, LeaveRequest, SubmitRequest};
use crate::group::{DeliveryPolicy, DispatchPolicy};
use crate::map::ops::{self as map_ops, MapOperation, TtlRequest};
use crate::rsm::{ConsistencyLevel, Mode, StateMachineError};

fn write_field<T: Serialize + ?Sized>(
    buffer: &mut Vec<u8>,
    value: &T,
) -> Result<(), StateMachineError> {
    bincode::serialize_into(&mut *buffer, value).map_err(Into::into)
}

fn read_field<T: DeserializeOwned>(
    cursor: &mut Cursor<&[u8]>,
) -> Result<T, StateMachineError> {
    bincode::deserialize_from(cursor).map_err(Into::into)
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, StateMachineError> {
    let mut byte = [0u8; 1];
    cursor
        .read_exact(&mut byte)
        .map_err(|e| StateMachineError::Serialization(e.to_string()))?;
    Ok(byte[0])
}

fn read_consistency(cursor: &mut Cursor<&[u8]>) -> Result<ConsistencyLevel, StateMachineError> {
    let ordinal = read_byte(cursor)?;
    ConsistencyLevel::from_ordinal(ordinal).ok_or_else(|| {
        StateMachineError::Serialization(format!("invalid consistency ordinal: {}", ordinal))
    })
}

fn read_mode(cursor: &mut Cursor<&[u8]>) -> Result<Mode, StateMachineError> {
    let ordinal = read_byte(cursor)?;
    Mode::from_ordinal(ordinal).ok_or_else(|| {
        StateMachineError::Serialization(format!("invalid mode ordinal: {}", ordinal))
    })
}

fn write_ttl_fields(
    buffer: &mut Vec<u8>,
    request: &TtlRequest,
) -> Result<(), StateMachineError> {
    write_field(buffer, &request.key)?;
    write_field(buffer, &request.value)?;
    buffer.push(request.mode.ordinal());
    write_field(buffer, &request.ttl_ms)
}

fn read_ttl_fields(cursor: &mut Cursor<&[u8]>) -> Result<TtlRequest, StateMachineError> {
    let key = read_field(cursor)?;
    let value = read_field(cursor)?;
    let mode = read_mode(cursor)?;
    let ttl_ms = read_field(cursor)?;
    Ok(TtlRequest {
        key,
        value,
        mode,
        ttl_ms,
    })
}

/// Encode a map operation.
pub fn encode_map(operation: &MapOperation) -> Result<Vec<u8>, StateMachineError> {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&operation.type_id().to_le_bytes());
    match operation {
        MapOperation::ContainsKey { key, consistency }
        | MapOperation::Get { key, consistency } => {
            buffer.push(consistency.ordinal());
            write_field(&mut buffer, key)?;
        }
        MapOperation::GetOrDefault {
            key,
            default,
            consistency,
        } => {
            buffer.push(consistency.ordinal());
            write_field(&mut buffer, key)?;
            write_field(&mut buffer, default)?;
        }
        MapOperation::Put(request) | MapOperation::PutIfAbsent(request) => {
            write_ttl_fields(&mut buffer, request)?;
        }
        MapOperation::Remove { key, value } => {
            write_field(&mut buffer, key)?;
            write_field(&mut buffer, value)?;
        }
        MapOperation::IsEmpty { consistency } | MapOperation::Size { consistency } => {
            buffer.push(consistency.ordinal());
        }
        MapOperation::Clear => {}
    }
    Ok(buffer)
}

/// Decode a map operation.
pub fn decode_map(bytes: &[u8]) -> Result<MapOperation, StateMachineError> {
    let (id, rest) = split_id(bytes)?;
    let mut cursor = Cursor::new(rest);
    let operation = match id {
        map_ops::ids::CONTAINS_KEY => {
            let consistency = read_consistency(&mut cursor)?;
            MapOperation::ContainsKey {
                key: read_field(&mut cursor)?,
                consistency,
            }
        }
        map_ops::ids::GET => {
            let consistency = read_consistency(&mut cursor)?;
            MapOperation::Get {
                key: read_field(&mut cursor)?,
                consistency,
            }
        }
        map_ops::ids::GET_OR_DEFAULT => {
            let consistency = read_consistency(&mut cursor)?;
            MapOperation::GetOrDefault {
                key: read_field(&mut cursor)?,
                default: read_field(&mut cursor)?,
                consistency,
            }
        }
        map_ops::ids::PUT => MapOperation::Put(read_ttl_fields(&mut cursor)?),
        map_ops::ids::PUT_IF_ABSENT => MapOperation::PutIfAbsent(read_ttl_fields(&mut cursor)?),
        map_ops::ids::REMOVE => MapOperation::Remove {
            key: read_field(&mut cursor)?,
            value: read_field(&mut cursor)?,
        },
        map_ops::ids::IS_EMPTY => MapOperation::IsEmpty {
            consistency: read_consistency(&mut cursor)?,
        },
        map_ops::ids::SIZE => MapOperation::Size {
            consistency: read_consistency(&mut cursor)?,
        },
        map_ops::ids::CLEAR => MapOperation::Clear,
        id => return Err(StateMachineError::UnknownOperation(id)),
    };
    Ok(operation)
}

/// Encode a group operation.
pub fn encode_group(operation: &GroupOperation) -> Result<Vec<u8>, StateMachineError> {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&operation.type_id().to_le_bytes());
    match operation {
        GroupOperation::Join(request) => {
            write_field(&mut buffer, &request.member_id)?;
            write_field(&mut buffer, &request.persist)?;
        }
        GroupOperation::Leave(request) => {
            write_field(&mut buffer, &request.member_id)?;
        }
        GroupOperation::Listen => {}
        GroupOperation::Submit(request) => {
            write_field(&mut buffer, &request.member)?;
            buffer.push(request.dispatch.ordinal());
            buffer.push(request.delivery.ordinal());
            write_field(&mut buffer, &request.id)?;
            write_field(&mut buffer, &request.message_type)?;
            write_field(&mut buffer, &request.payload)?;
        }
        GroupOperation::Ack(request) => {
            write_field(&mut buffer, &request.member)?;
            write_field(&mut buffer, &request.id)?;
            write_field(&mut buffer, &request.succeeded)?;
        }
    }
    Ok(buffer)
}

/// Decode a group operation.
pub fn decode_group(bytes: &[u8]) -> Result<GroupOperation, StateMachineError> {
    let (id, rest) = split_id(bytes)?;
    let mut cursor = Cursor::new(rest);
    let operation = match id {
        group_ops::ids::JOIN => GroupOperation::Join(JoinRequest {
            member_id: read_field(&mut cursor)?,
            persist: read_field(&mut cursor)?,
        }),
        group_ops::ids::LEAVE => GroupOperation::Leave(LeaveRequest {
            member_id: read_field(&mut cursor)?,
        }),
        group_ops::ids::LISTEN => GroupOperation::Listen,
        group_ops::ids::SUBMIT => {
            let member = read_field(&mut cursor)?;
            let dispatch_ordinal = read_byte(&mut cursor)?;
            let dispatch = DispatchPolicy::from_ordinal(dispatch_ordinal).ok_or_else(|| {
                StateMachineError::Serialization(format!(
                    "invalid dispatch ordinal: {}",
                    dispatch_ordinal
                ))
            })?;
            let delivery_ordinal = read_byte(&mut cursor)?;
            let delivery = DeliveryPolicy::from_ordinal(delivery_ordinal).ok_or_else(|| {
                StateMachineError::Serialization(format!(
                    "invalid delivery ordinal: {}",
                    delivery_ordinal
                ))
            })?;
            GroupOperation::Submit(SubmitRequest {
                member,
                dispatch,
                delivery,
                id: read_field(&mut cursor)?,
                message_type: read_field(&mut cursor)?,
                payload: read_field(&mut cursor)?,
            })
        }
        group_ops::ids::ACK => GroupOperation::Ack(AckRequest {
            member: read_field(&mut cursor)?,
            id: read_field(&mut cursor)?,
            succeeded: read_field(&mut cursor)?,
        }),
        id => return Err(StateMachineError::UnknownOperation(id)),
    };
    Ok(operation)
}

fn split_id(bytes: &[u8]) -> Result<(u16, &[u8]), StateMachineError> {
    if bytes.len() < 2 {
        return Err(StateMachineError::Serialization(
            "operation shorter than its type id".to_string(),
        ));
    }
    let id = u16::from_le_bytes([bytes[0], bytes[1]]);
    Ok((id, &bytes[2..]))
}
