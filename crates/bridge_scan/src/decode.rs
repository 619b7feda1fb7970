//! Call-input decoding against the diamond contract ABI.

use alloy_dyn_abi::{DynSolValue, JsonAbiExt};
use alloy_json_abi::{Function, JsonAbi};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("input is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("input has no function selector ({0} bytes)")]
    NoSelector(usize),
    #[error("no function with selector 0x{0}")]
    UnknownSelector(String),
    #[error("abi decode: {0}")]
    Abi(#[from] alloy_dyn_abi::Error),
    #[error("abi json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns raw call input into named parameters.
pub trait InputDecoder: Send + Sync {
    fn decode(&self, input: &str) -> Result<Map<String, Value>, DecodeError>;
}

/// Decoder over every function in a JSON ABI, keyed by selector.
pub struct AbiDecoder {
    functions: HashMap<[u8; 4], Function>,
}

impl AbiDecoder {
    pub fn new(abi: &JsonAbi) -> Self {
        let functions = abi
            .functions()
            .map(|f| (f.selector().0, f.clone()))
            .collect();
        Self { functions }
    }

    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let abi: JsonAbi = serde_json::from_str(json)?;
        Ok(Self::new(&abi))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

impl InputDecoder for AbiDecoder {
    fn decode(&self, input: &str) -> Result<Map<String, Value>, DecodeError> {
        let bytes = hex::decode(input.trim().trim_start_matches("0x"))?;
        if bytes.len() < 4 {
            return Err(DecodeError::NoSelector(bytes.len()));
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&bytes[..4]);
        let func = self
            .functions
            .get(&selector)
            .ok_or_else(|| DecodeError::UnknownSelector(hex::encode(selector)))?;
        let values = func.abi_decode_input(&bytes[4..])?;
        let params = func
            .inputs
            .iter()
            .zip(values.iter())
            .enumerate()
            .map(|(i, (param, value))| {
                let name = if param.name.is_empty() {
                    format!("arg{i}")
                } else {
                    param.name.clone()
                };
                (name, sol_to_json(value))
            })
            .collect();
        Ok(params)
    }
}

/// Integers become decimal strings so wide values never lose precision.
fn sol_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Address(a) => Value::String(a.to_checksum(None)),
        DynSolValue::Function(f) => Value::String(f.to_string()),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(sol_to_json).collect())
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
