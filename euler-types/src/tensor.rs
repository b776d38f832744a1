use crate::dtype::DType;
use crate::errors::TypeError;
use crate::grpc::TensorProto;
use crate::shape::TensorShape;

/// Owned element storage. Sharing happens one level up: contexts hold
/// `Arc<Tensor>`, so aliases are reference clones and drop is exactly-once.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::I8(_) => DType::Int8,
            TensorData::I16(_) => DType::Int16,
            TensorData::I32(_) => DType::Int32,
            TensorData::I64(_) => DType::Int64,
            TensorData::U8(_) => DType::UInt8,
            TensorData::U16(_) => DType::UInt16,
            TensorData::U32(_) => DType::UInt32,
            TensorData::U64(_) => DType::UInt64,
            TensorData::F32(_) => DType::Float32,
            TensorData::F64(_) => DType::Float64,
            TensorData::Bool(_) => DType::Bool,
            TensorData::Str(_) => DType::Str,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::I8(v) => v.len(),
            TensorData::I16(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::U16(v) => v.len(),
            TensorData::U32(v) => v.len(),
            TensorData::U64(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeroed(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Int8 => TensorData::I8(vec![0; len]),
            DType::Int16 => TensorData::I16(vec![0; len]),
            DType::Int32 => TensorData::I32(vec![0; len]),
            DType::Int64 => TensorData::I64(vec![0; len]),
            DType::UInt8 => TensorData::U8(vec![0; len]),
            DType::UInt16 => TensorData::U16(vec![0; len]),
            DType::UInt32 => TensorData::U32(vec![0; len]),
            DType::UInt64 => TensorData::U64(vec![0; len]),
            DType::Float32 => TensorData::F32(vec![0.0; len]),
            DType::Float64 => TensorData::F64(vec![0.0; len]),
            DType::Bool => TensorData::Bool(vec![false; len]),
            DType::Str => TensorData::Str(vec![String::new(); len]),
        }
    }
}

/// A dense buffer with a shape and an element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: TensorShape,
    data: TensorData,
}

/// Element types that can live inside a `Tensor`.
pub trait TensorValue: Sized + Clone + Default {
    const DTYPE: DType;

    fn slice(tensor: &Tensor) -> Option<&[Self]>;
    fn slice_mut(tensor: &mut Tensor) -> Option<&mut [Self]>;
    fn wrap(values: Vec<Self>) -> TensorData;
}

macro_rules! impl_tensor_value {
    ($ty:ty, $variant:ident, $dtype:expr) => {
        impl TensorValue for $ty {
            const DTYPE: DType = $dtype;

            fn slice(tensor: &Tensor) -> Option<&[Self]> {
                match &tensor.data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(tensor: &mut Tensor) -> Option<&mut [Self]> {
                match &mut tensor.data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }
        }
    };
}

impl_tensor_value!(i8, I8, DType::Int8);
impl_tensor_value!(i16, I16, DType::Int16);
impl_tensor_value!(i32, I32, DType::Int32);
impl_tensor_value!(i64, I64, DType::Int64);
impl_tensor_value!(u8, U8, DType::UInt8);
impl_tensor_value!(u16, U16, DType::UInt16);
impl_tensor_value!(u32, U32, DType::UInt32);
impl_tensor_value!(u64, U64, DType::UInt64);
impl_tensor_value!(f32, F32, DType::Float32);
impl_tensor_value!(f64, F64, DType::Float64);
impl_tensor_value!(bool, Bool, DType::Bool);
impl_tensor_value!(String, Str, DType::Str);

impl Tensor {
    /// A zero-initialised tensor of the given shape and element type.
    pub fn zeroed(shape: TensorShape, dtype: DType) -> Self {
        let len = shape.num_elements();
        Self {
            shape,
            data: TensorData::zeroed(dtype, len),
        }
    }

    /// Wraps a value vector. The vector length must equal the shape's
    /// element count.
    pub fn from_vec<T: TensorValue>(shape: impl Into<TensorShape>, values: Vec<T>) -> Self {
        let shape = shape.into();
        debug_assert_eq!(shape.num_elements(), values.len());
        Self {
            shape,
            data: T::wrap(values),
        }
    }

    pub fn scalar<T: TensorValue>(value: T) -> Self {
        Self::from_vec(TensorShape::scalar(), vec![value])
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Byte size of the dense representation.
    pub fn total_bytes(&self) -> usize {
        self.num_elements() * self.dtype().size_of()
    }

    pub fn values<T: TensorValue>(&self) -> Result<&[T], TypeError> {
        T::slice(self).ok_or(TypeError::DTypeMismatch {
            expected: T::DTYPE,
            actual: self.dtype(),
        })
    }

    pub fn values_mut<T: TensorValue>(&mut self) -> Result<&mut [T], TypeError> {
        let actual = self.dtype();
        T::slice_mut(self).ok_or(TypeError::DTypeMismatch {
            expected: T::DTYPE,
            actual,
        })
    }

    pub fn scalar_value<T: TensorValue>(&self) -> Result<T, TypeError> {
        let values = self.values::<T>()?;
        if values.len() != 1 {
            return Err(TypeError::NotScalar(self.shape.to_string()));
        }
        Ok(values[0].clone())
    }

    /// Encodes into the wire form. Element order is row-major; strings are
    /// length-prefixed with a little-endian u32.
    pub fn encode(&self, name: impl Into<String>) -> TensorProto {
        let mut content = Vec::with_capacity(self.total_bytes());
        macro_rules! extend_le {
            ($values:expr) => {
                for v in $values {
                    content.extend_from_slice(&v.to_le_bytes());
                }
            };
        }
        match &self.data {
            TensorData::I8(v) => extend_le!(v),
            TensorData::I16(v) => extend_le!(v),
            TensorData::I32(v) => extend_le!(v),
            TensorData::I64(v) => extend_le!(v),
            TensorData::U8(v) => content.extend_from_slice(v),
            TensorData::U16(v) => extend_le!(v),
            TensorData::U32(v) => extend_le!(v),
            TensorData::U64(v) => extend_le!(v),
            TensorData::F32(v) => extend_le!(v),
            TensorData::F64(v) => extend_le!(v),
            TensorData::Bool(v) => content.extend(v.iter().map(|b| u8::from(*b))),
            TensorData::Str(v) => {
                for s in v {
                    content.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    content.extend_from_slice(s.as_bytes());
                }
            }
        }
        TensorProto {
            name: name.into(),
            dtype: self.dtype().to_proto() as i32,
            tensor_shape: Some(self.shape.to_proto()),
            tensor_content: content,
        }
    }

    pub fn from_proto(proto: &TensorProto) -> Result<Self, TypeError> {
        let dtype = DType::from_proto(proto.dtype)?;
        let shape = proto
            .tensor_shape
            .as_ref()
            .map(TensorShape::from_proto)
            .unwrap_or_default();
        let num = shape.num_elements();
        let content = &proto.tensor_content;

        if dtype != DType::Str && content.len() != num * dtype.size_of() {
            return Err(TypeError::ContentSizeMismatch {
                expected: num * dtype.size_of(),
                actual: content.len(),
            });
        }

        macro_rules! decode_le {
            ($ty:ty, $variant:ident) => {{
                const W: usize = std::mem::size_of::<$ty>();
                let values = content
                    .chunks_exact(W)
                    .map(|c| <$ty>::from_le_bytes(c.try_into().expect("chunk width")))
                    .collect::<Vec<_>>();
                TensorData::$variant(values)
            }};
        }

        let data = match dtype {
            DType::Int8 => TensorData::I8(content.iter().map(|b| *b as i8).collect()),
            DType::Int16 => decode_le!(i16, I16),
            DType::Int32 => decode_le!(i32, I32),
            DType::Int64 => decode_le!(i64, I64),
            DType::UInt8 => TensorData::U8(content.clone()),
            DType::UInt16 => decode_le!(u16, U16),
            DType::UInt32 => decode_le!(u32, U32),
            DType::UInt64 => decode_le!(u64, U64),
            DType::Float32 => decode_le!(f32, F32),
            DType::Float64 => decode_le!(f64, F64),
            DType::Bool => TensorData::Bool(content.iter().map(|b| *b != 0).collect()),
            DType::Str => {
                let mut values = Vec::with_capacity(num);
                let mut rest = content.as_slice();
                for _ in 0..num {
                    if rest.len() < 4 {
                        return Err(TypeError::InvalidProto(
                            "truncated string length".to_string(),
                        ));
                    }
                    let len =
                        u32::from_le_bytes(rest[..4].try_into().expect("length prefix")) as usize;
                    rest = &rest[4..];
                    if rest.len() < len {
                        return Err(TypeError::InvalidProto(
                            "truncated string payload".to_string(),
                        ));
                    }
                    let s = String::from_utf8_lossy(&rest[..len]).into_owned();
                    values.push(s);
                    rest = &rest[len..];
                }
                TensorData::Str(values)
            }
        };

        Ok(Self { shape, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zeroed_matches_shape() {
        let t = Tensor::zeroed(vec![2, 3].into(), DType::Int64);
        assert_eq!(t.num_elements(), 6);
        assert_eq!(t.dtype(), DType::Int64);
        assert_eq!(t.values::<i64>().unwrap(), &[0; 6]);
    }

    #[test]
    fn dtype_mismatch_is_reported() {
        let t = Tensor::from_vec(vec![2], vec![1i32, 2]);
        let err = t.values::<f32>().unwrap_err();
        assert!(matches!(err, TypeError::DTypeMismatch { .. }));
    }

    #[test]
    fn string_roundtrip_with_embedded_nul() {
        let t = Tensor::from_vec(
            vec![3],
            vec!["a\0b".to_string(), String::new(), "xyz".to_string()],
        );
        let decoded = Tensor::from_proto(&t.encode("s")).unwrap();
        assert_eq!(decoded, t);
    }

    #[test]
    fn truncated_string_content_is_rejected() {
        let mut proto = Tensor::from_vec(vec![1], vec!["hello".to_string()]).encode("s");
        proto.tensor_content.truncate(6);
        assert!(Tensor::from_proto(&proto).is_err());
    }

    #[test]
    fn content_size_is_checked() {
        let mut proto = Tensor::from_vec(vec![2], vec![1i64, 2]).encode("t");
        proto.tensor_content.pop();
        assert!(matches!(
            Tensor::from_proto(&proto),
            Err(TypeError::ContentSizeMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn roundtrip_i64(values in proptest::collection::vec(any::<i64>(), 0..64)) {
            let t = Tensor::from_vec(vec![values.len()], values);
            let decoded = Tensor::from_proto(&t.encode("t")).unwrap();
            prop_assert_eq!(decoded, t);
        }

        #[test]
        fn roundtrip_f32(values in proptest::collection::vec(any::<f32>(), 0..64)) {
            let t = Tensor::from_vec(vec![values.len()], values);
            let decoded = Tensor::from_proto(&t.encode("t")).unwrap();
            let orig = t.values::<f32>().unwrap();
            let back = decoded.values::<f32>().unwrap();
            prop_assert_eq!(orig.len(), back.len());
            for (a, b) in orig.iter().zip(back) {
                prop_assert!(a.to_bits() == b.to_bits());
            }
        }

        #[test]
        fn roundtrip_strings(values in proptest::collection::vec(".*", 0..16)) {
            let t = Tensor::from_vec(vec![values.len()], values);
            let decoded = Tensor::from_proto(&t.encode("t")).unwrap();
            prop_assert_eq!(decoded, t);
        }

        #[test]
        fn roundtrip_bool(values in proptest::collection::vec(any::<bool>(), 0..64)) {
            let t = Tensor::from_vec(vec![values.len()], values);
            let decoded = Tensor::from_proto(&t.encode("t")).unwrap();
            prop_assert_eq!(decoded, t);
        }
    }
}
