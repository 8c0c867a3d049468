use bytes::Bytes;

use super::error::RpcError;
use crate::bencode::{decode, encode, Dict, Value};

const KEY_TID: &[u8] = b"t";
const KEY_TYPE: &[u8] = b"y";
const KEY_METHOD: &[u8] = b"q";
const KEY_ARGS: &[u8] = b"a";
const KEY_RESPONSE: &[u8] = b"r";
const KEY_ERROR: &[u8] = b"e";

/// Body of a KRPC envelope, selected by its `y` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Query { method: String, args: Dict },
    Response(Dict),
    Error(String),
    /// A `y` value we do not understand; kept so the matching transaction
    /// can be failed.
    Unknown(Bytes),
}

/// A decoded KRPC envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcMessage {
    /// Echoed verbatim in replies. Our own requests always use one byte.
    pub transaction_id: Bytes,
    pub kind: MessageKind,
}

impl KrpcMessage {
    pub fn query(transaction_id: u8, method: &str, args: Dict) -> Self {
        Self {
            transaction_id: Bytes::copy_from_slice(&[transaction_id]),
            kind: MessageKind::Query {
                method: method.to_string(),
                args,
            },
        }
    }

    pub fn response(transaction_id: Bytes, payload: Dict) -> Self {
        Self {
            transaction_id,
            kind: MessageKind::Response(payload),
        }
    }

    pub fn error(transaction_id: Bytes, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            kind: MessageKind::Error(message.into()),
        }
    }

    /// Single-byte transaction id, if the peer echoed one of ours.
    pub fn short_transaction_id(&self) -> Option<u8> {
        match self.transaction_id.as_ref() {
            [id] => Some(*id),
            _ => None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, RpcError> {
        let dict = decode(data)?
            .into_dict()
            .ok_or_else(|| RpcError::InvalidMessage("expected dict".into()))?;

        let transaction_id = dict
            .get(KEY_TID)
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| RpcError::InvalidMessage("missing transaction id".into()))?;

        let msg_type = dict
            .get(KEY_TYPE)
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| RpcError::InvalidMessage("missing message type".into()))?;

        let kind = match msg_type.as_ref() {
            b"q" => {
                let method = dict
                    .get(KEY_METHOD)
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::InvalidMessage("missing method name".into()))?
                    .to_string();
                let args = match dict.get(KEY_ARGS) {
                    Some(Value::Dict(args)) => args.clone(),
                    None => Dict::new(),
                    Some(_) => return Err(RpcError::InvalidMessage("args not a dict".into())),
                };
                MessageKind::Query { method, args }
            }
            b"r" => {
                let payload = dict
                    .get(KEY_RESPONSE)
                    .and_then(Value::as_dict)
                    .cloned()
                    .ok_or_else(|| RpcError::InvalidMessage("missing response dict".into()))?;
                MessageKind::Response(payload)
            }
            b"e" => MessageKind::Error(error_text(dict.get(KEY_ERROR))),
            _ => MessageKind::Unknown(msg_type),
        };

        Ok(Self {
            transaction_id,
            kind,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = Dict::new();
        dict.insert(
            Bytes::from_static(KEY_TID),
            Value::Bytes(self.transaction_id.clone()),
        );

        match &self.kind {
            MessageKind::Query { method, args } => {
                dict.insert(Bytes::from_static(KEY_TYPE), Value::string("q"));
                dict.insert(Bytes::from_static(KEY_METHOD), Value::string(method));
                dict.insert(Bytes::from_static(KEY_ARGS), Value::Dict(args.clone()));
            }
            MessageKind::Response(payload) => {
                dict.insert(Bytes::from_static(KEY_TYPE), Value::string("r"));
                dict.insert(
                    Bytes::from_static(KEY_RESPONSE),
                    Value::Dict(payload.clone()),
                );
            }
            MessageKind::Error(message) => {
                dict.insert(Bytes::from_static(KEY_TYPE), Value::string("e"));
                dict.insert(Bytes::from_static(KEY_ERROR), Value::string(message));
            }
            MessageKind::Unknown(msg_type) => {
                dict.insert(Bytes::from_static(KEY_TYPE), Value::Bytes(msg_type.clone()));
            }
        }

        encode(&Value::Dict(dict))
    }
}

/// Error payloads come as a bare string, a numeric code, or the BEP-5
/// `[code, message]` pair.
fn error_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
        Some(Value::Integer(code)) => format!("error code {}", code),
        Some(Value::List(items)) => match (items.first(), items.get(1)) {
            (_, Some(msg)) if msg.as_bytes().is_some() => error_text(Some(msg)),
            (Some(Value::Integer(code)), _) => format!("error code {}", code),
            _ => "unknown error".to_string(),
        },
        _ => "unknown error".to_string(),
    }
}
