use serde::{Deserialize, Serialize};

use crate::errors::TypeError;
use crate::grpc::DataTypeProto;

/// Primitive element types a tensor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    Str,
}

impl DType {
    /// Fixed per-element wire size. String elements are addressed
    /// indirectly, so they count as one pointer.
    pub fn size_of(self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 | DType::Bool => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 => 8,
            DType::Str => std::mem::size_of::<*const u8>(),
        }
    }

    pub fn to_proto(self) -> DataTypeProto {
        match self {
            DType::Int8 => DataTypeProto::DtInt8,
            DType::Int16 => DataTypeProto::DtInt16,
            DType::Int32 => DataTypeProto::DtInt32,
            DType::Int64 => DataTypeProto::DtInt64,
            DType::UInt8 => DataTypeProto::DtUint8,
            DType::UInt16 => DataTypeProto::DtUint16,
            DType::UInt32 => DataTypeProto::DtUint32,
            DType::UInt64 => DataTypeProto::DtUint64,
            DType::Float32 => DataTypeProto::DtFloat,
            DType::Float64 => DataTypeProto::DtDouble,
            DType::Bool => DataTypeProto::DtBool,
            DType::Str => DataTypeProto::DtString,
        }
    }

    pub fn from_proto(proto: i32) -> Result<Self, TypeError> {
        match DataTypeProto::try_from(proto) {
            Ok(DataTypeProto::DtInt8) => Ok(DType::Int8),
            Ok(DataTypeProto::DtInt16) => Ok(DType::Int16),
            Ok(DataTypeProto::DtInt32) => Ok(DType::Int32),
            Ok(DataTypeProto::DtInt64) => Ok(DType::Int64),
            Ok(DataTypeProto::DtUint8) => Ok(DType::UInt8),
            Ok(DataTypeProto::DtUint16) => Ok(DType::UInt16),
            Ok(DataTypeProto::DtUint32) => Ok(DType::UInt32),
            Ok(DataTypeProto::DtUint64) => Ok(DType::UInt64),
            Ok(DataTypeProto::DtFloat) => Ok(DType::Float32),
            Ok(DataTypeProto::DtDouble) => Ok(DType::Float64),
            Ok(DataTypeProto::DtBool) => Ok(DType::Bool),
            Ok(DataTypeProto::DtString) => Ok(DType::Str),
            Err(_) => Err(TypeError::UnknownDType(proto)),
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::Int8 => "i8",
            DType::Int16 => "i16",
            DType::Int32 => "i32",
            DType::Int64 => "i64",
            DType::UInt8 => "u8",
            DType::UInt16 => "u16",
            DType::UInt32 => "u32",
            DType::UInt64 => "u64",
            DType::Float32 => "f32",
            DType::Float64 => "f64",
            DType::Bool => "bool",
            DType::Str => "string",
        };
        f.write_str(name)
    }
}
