//! Tensors over power-of-two rings and the elementwise algebra on them.
//!
//! All arithmetic is carried out modulo `2^k` for `k` in {32, 64, 128} using
//! the wrapping semantics of the matching unsigned word type. Signed values
//! are a convention on top of this: two's complement, with secrets expected
//! to stay within `[-2^(k-2), 2^(k-2))` so that comparisons and truncations
//! remain meaningful.
//!
//! A [`RingTensor`] combines a reference-counted word buffer with a shape and
//! an element type describing how the buffer is to be interpreted by the
//! protocol (public value, private value of one party, additive share, ...).
//! Retagging via [`RingTensor::as_type`] never copies the buffer and keeps
//! its identity, which the Beaver cache relies on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Elementwise loops switch to rayon above this many elements.
const PAR_THRESHOLD: usize = 1 << 12;

/// The ring `Z_2^k`, identified by its bit width `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RingField {
    /// The ring of 32-bit words, modulus `2^32`.
    F32,
    /// The ring of 64-bit words, modulus `2^64`.
    F64,
    /// The ring of 128-bit words, modulus `2^128`.
    F128,
}

impl RingField {
    /// The bit width `k` of the ring.
    pub fn bits(self) -> u32 {
        match self {
            RingField::F32 => 32,
            RingField::F64 => 64,
            RingField::F128 => 128,
        }
    }

    /// The byte size of one ring element.
    pub fn size_of_elem(self) -> usize {
        self.bits() as usize / 8
    }
}

impl fmt::Display for RingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.bits())
    }
}

/// How a buffer of ring words is to be interpreted by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// A public value, identical on every party.
    Pub,
    /// A value held in the clear by exactly one party; the other parties
    /// carry a placeholder of the same shape.
    Priv(usize),
    /// An additive share: the shares of all parties sum to the secret.
    Arith,
    /// A boolean share of a single bit, XOR-shared in bit 0 of each word.
    /// Bits above bit 0 are unspecified.
    Bit,
    /// An untagged ring element, used for intermediate values only.
    Raw,
}

/// The element type of a tensor: a ring field plus a share [`Kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EltType {
    /// The ring the words live in.
    pub field: RingField,
    /// The protocol interpretation of the words.
    pub kind: Kind,
}

impl EltType {
    /// A public tensor type.
    pub fn public(field: RingField) -> Self {
        EltType { field, kind: Kind::Pub }
    }

    /// A private tensor type owned by the party with the given rank.
    pub fn private(field: RingField, owner: usize) -> Self {
        EltType { field, kind: Kind::Priv(owner) }
    }

    /// An additive-share tensor type.
    pub fn arith(field: RingField) -> Self {
        EltType { field, kind: Kind::Arith }
    }

    /// A single-bit boolean-share tensor type.
    pub fn bit(field: RingField) -> Self {
        EltType { field, kind: Kind::Bit }
    }

    /// An untagged ring tensor type.
    pub fn raw(field: RingField) -> Self {
        EltType { field, kind: Kind::Raw }
    }
}

/// The dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Creates a shape from its dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimensions of the shape.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// The number of elements a tensor of this shape holds.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// The dimensions as a matrix, if the shape is 2-dimensional.
    pub fn as_matrix(&self) -> Option<(usize, usize)> {
        match self.0[..] {
            [rows, cols] => Some((rows, cols)),
            _ => None,
        }
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Errors raised by the ring algebra.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The shapes of two operands do not agree.
    ShapeMismatch(Shape, Shape),
    /// The ring fields of two operands do not agree.
    FieldMismatch(RingField, RingField),
    /// A buffer length does not match the number of elements of a shape.
    LengthMismatch {
        /// Elements expected from the shape.
        expected: usize,
        /// Elements actually present in the buffer.
        actual: usize,
    },
    /// A matrix operation was applied to tensors that are not 2-dimensional
    /// or whose inner dimensions disagree.
    NotAMatrixProduct(Shape, Shape),
    /// A shift-amount vector has an unsupported length.
    BadShiftLen(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ShapeMismatch(a, b) => write!(f, "shape mismatch: {a} vs {b}"),
            Error::FieldMismatch(a, b) => write!(f, "ring field mismatch: {a} vs {b}"),
            Error::LengthMismatch { expected, actual } => {
                write!(f, "buffer holds {actual} elements, shape wants {expected}")
            }
            Error::NotAMatrixProduct(a, b) => {
                write!(f, "shapes {a} and {b} do not form a matrix product")
            }
            Error::BadShiftLen(n) => {
                write!(f, "shift vector of length {n} matches neither 1 nor numel")
            }
        }
    }
}

impl std::error::Error for Error {}

/// One word of a power-of-two ring.
///
/// Everything the kernels need from u32/u64/u128, monomorphized three times.
/// Shifts saturate: shifting by the full width or more yields 0 (or the sign
/// fill for [`RingElem::sar`]), so factors like `2^(k-m)` are total for every
/// `m <= k`.
pub(crate) trait RingElem: Copy + Send + Sync + Eq + fmt::Debug + 'static {
    /// The bit width of the ring.
    const BITS: u32;
    /// The additive identity.
    const ZERO: Self;
    /// The multiplicative identity.
    const ONE: Self;

    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn neg(self) -> Self;
    /// Left shift, 0 once `s >= BITS`.
    fn shl(self, s: u32) -> Self;
    /// Logical right shift, 0 once `s >= BITS`.
    fn shr(self, s: u32) -> Self;
    /// Arithmetic right shift replicating bit `BITS - 1`.
    fn sar(self, s: u32) -> Self;
    fn from_u128(v: u128) -> Self;
    fn to_u128(self) -> u128;
    fn sample(rng: &mut dyn RngCore) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;

    fn wrap_vec(v: Vec<Self>) -> RingBuffer;
    fn unwrap_slice(buf: &RingBuffer) -> Option<&[Self]>;
}

macro_rules! impl_ring_elem {
    ($t:ty, $signed:ty, $variant:ident, $bits:expr) => {
        impl RingElem for $t {
            const BITS: u32 = $bits;
            const ZERO: Self = 0;
            const ONE: Self = 1;

            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }

            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }

            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }

            fn neg(self) -> Self {
                self.wrapping_neg()
            }

            fn shl(self, s: u32) -> Self {
                if s >= Self::BITS {
                    0
                } else {
                    self << s
                }
            }

            fn shr(self, s: u32) -> Self {
                if s >= Self::BITS {
                    0
                } else {
                    self >> s
                }
            }

            fn sar(self, s: u32) -> Self {
                let signed = self as $signed;
                let s = s.min(Self::BITS - 1);
                (signed >> s) as $t
            }

            fn from_u128(v: u128) -> Self {
                v as $t
            }

            fn to_u128(self) -> u128 {
                self as u128
            }

            fn sample(rng: &mut dyn RngCore) -> Self {
                let mut bytes = [0u8; ($bits / 8) as usize];
                rng.fill_bytes(&mut bytes);
                <$t>::from_le_bytes(bytes)
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut arr = [0u8; ($bits / 8) as usize];
                arr.copy_from_slice(bytes);
                <$t>::from_le_bytes(arr)
            }

            fn wrap_vec(v: Vec<Self>) -> RingBuffer {
                RingBuffer::$variant(v)
            }

            fn unwrap_slice(buf: &RingBuffer) -> Option<&[Self]> {
                match buf {
                    RingBuffer::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_ring_elem!(u32, i32, F32, 32);
impl_ring_elem!(u64, i64, F64, 64);
impl_ring_elem!(u128, i128, F128, 128);

/// Runs a block with the word type of a [`RingField`] bound to an alias,
/// monomorphizing the block once per supported width.
macro_rules! dispatch_field {
    ($field:expr, |$t:ident| $body:block) => {
        match $field {
            $crate::ring::RingField::F32 => {
                type $t = u32;
                $body
            }
            $crate::ring::RingField::F64 => {
                type $t = u64;
                $body
            }
            $crate::ring::RingField::F128 => {
                type $t = u128;
                $body
            }
        }
    };
}

pub(crate) use dispatch_field;

/// A flat buffer of ring words, tagged with its width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingBuffer {
    /// 32-bit words.
    F32(Vec<u32>),
    /// 64-bit words.
    F64(Vec<u64>),
    /// 128-bit words.
    F128(Vec<u128>),
}

impl RingBuffer {
    /// The ring field of the buffer.
    pub fn field(&self) -> RingField {
        match self {
            RingBuffer::F32(_) => RingField::F32,
            RingBuffer::F64(_) => RingField::F64,
            RingBuffer::F128(_) => RingField::F128,
        }
    }

    /// The number of elements in the buffer.
    pub fn len(&self) -> usize {
        match self {
            RingBuffer::F32(v) => v.len(),
            RingBuffer::F64(v) => v.len(),
            RingBuffer::F128(v) => v.len(),
        }
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A buffer of zeros.
    pub fn zeros(field: RingField, numel: usize) -> Self {
        dispatch_field!(field, |T| { T::wrap_vec(vec![T::ZERO; numel]) })
    }

    /// A buffer of ones.
    pub fn ones(field: RingField, numel: usize) -> Self {
        dispatch_field!(field, |T| { T::wrap_vec(vec![T::ONE; numel]) })
    }

    /// A buffer of uniformly random ring elements drawn from `rng`.
    pub fn sample(field: RingField, numel: usize, rng: &mut dyn RngCore) -> Self {
        dispatch_field!(field, |T| {
            T::wrap_vec((0..numel).map(|_| T::sample(rng)).collect())
        })
    }

    /// Builds a buffer from values reduced modulo the ring size.
    pub fn from_u128_slice(field: RingField, vals: &[u128]) -> Self {
        dispatch_field!(field, |T| {
            T::wrap_vec(vals.iter().map(|&v| T::from_u128(v)).collect())
        })
    }

    /// The buffer widened to `u128` values, element by element.
    pub fn to_u128_vec(&self) -> Vec<u128> {
        match self {
            RingBuffer::F32(v) => v.iter().map(|&x| x as u128).collect(),
            RingBuffer::F64(v) => v.iter().map(|&x| x as u128).collect(),
            RingBuffer::F128(v) => v.clone(),
        }
    }

    /// Serializes the buffer to little-endian bytes, `size_of_elem` per word.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.field().size_of_elem());
        dispatch_field!(self.field(), |T| {
            for &w in T::unwrap_slice(self).expect("field matches") {
                w.write_le(&mut out);
            }
        });
        out
    }

    /// Parses a little-endian byte buffer, `None` if the length is not a
    /// multiple of the element size.
    pub fn from_le_bytes(field: RingField, bytes: &[u8]) -> Option<Self> {
        let size = field.size_of_elem();
        if bytes.len() % size != 0 {
            return None;
        }
        Some(dispatch_field!(field, |T| {
            T::wrap_vec(bytes.chunks_exact(size).map(T::read_le).collect())
        }))
    }

    /// Concatenates two buffers of the same field.
    pub(crate) fn concat(&self, other: &RingBuffer) -> Result<RingBuffer, Error> {
        if self.field() != other.field() {
            return Err(Error::FieldMismatch(self.field(), other.field()));
        }
        Ok(dispatch_field!(self.field(), |T| {
            let mut v = T::unwrap_slice(self).expect("field matches").to_vec();
            v.extend_from_slice(T::unwrap_slice(other).expect("field matches"));
            T::wrap_vec(v)
        }))
    }

    /// Splits the buffer into its first `mid` elements and the rest.
    pub(crate) fn split_at(&self, mid: usize) -> (RingBuffer, RingBuffer) {
        dispatch_field!(self.field(), |T| {
            let v = T::unwrap_slice(self).expect("field matches");
            (T::wrap_vec(v[..mid].to_vec()), T::wrap_vec(v[mid..].to_vec()))
        })
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// A ring buffer plus the stable identity used as a cache key.
#[derive(Debug)]
struct TensorBuf {
    id: u64,
    data: RingBuffer,
}

impl TensorBuf {
    fn new(data: RingBuffer) -> Self {
        TensorBuf {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data,
        }
    }
}

/// An immutable N-dimensional tensor of ring words with a share tag.
///
/// Cloning and retagging share the underlying buffer; the buffer id is
/// assigned once at construction and identifies the buffer for the lifetime
/// of the tensor (and all retagged views of it).
#[derive(Debug, Clone)]
pub struct RingTensor {
    buf: Arc<TensorBuf>,
    ty: EltType,
    shape: Shape,
}

impl RingTensor {
    /// Wraps a buffer into a tensor, verifying field and element count.
    pub fn new(data: RingBuffer, ty: EltType, shape: Shape) -> Result<Self, Error> {
        if data.field() != ty.field {
            return Err(Error::FieldMismatch(data.field(), ty.field));
        }
        if data.len() != shape.numel() {
            return Err(Error::LengthMismatch {
                expected: shape.numel(),
                actual: data.len(),
            });
        }
        Ok(RingTensor {
            buf: Arc::new(TensorBuf::new(data)),
            ty,
            shape,
        })
    }

    /// An all-zero tensor, also used as the placeholder on parties that do
    /// not own a private value.
    pub fn placeholder(ty: EltType, shape: Shape) -> Self {
        let data = RingBuffer::zeros(ty.field, shape.numel());
        RingTensor::new(data, ty, shape).expect("zeros match shape")
    }

    /// Retags the tensor without copying the buffer. The field must stay the
    /// same; only the share kind may change.
    pub fn as_type(&self, ty: EltType) -> Result<Self, Error> {
        if ty.field != self.ty.field {
            return Err(Error::FieldMismatch(self.ty.field, ty.field));
        }
        Ok(RingTensor {
            buf: Arc::clone(&self.buf),
            ty,
            shape: self.shape.clone(),
        })
    }

    /// Reinterprets the tensor with a new shape of the same element count.
    pub fn reshape(&self, shape: Shape) -> Result<Self, Error> {
        if shape.numel() != self.numel() {
            return Err(Error::LengthMismatch {
                expected: shape.numel(),
                actual: self.numel(),
            });
        }
        Ok(RingTensor {
            buf: Arc::clone(&self.buf),
            ty: self.ty,
            shape,
        })
    }

    /// The element type of the tensor.
    pub fn elt_type(&self) -> EltType {
        self.ty
    }

    /// The ring field of the tensor.
    pub fn field(&self) -> RingField {
        self.ty.field
    }

    /// The share kind of the tensor.
    pub fn kind(&self) -> Kind {
        self.ty.kind
    }

    /// The shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// The stable identity of the backing buffer, shared by all retagged
    /// views. Used as the Beaver-cache key.
    pub fn buffer_id(&self) -> u64 {
        self.buf.id
    }

    /// The backing word buffer.
    pub fn data(&self) -> &RingBuffer {
        &self.buf.data
    }

    /// The buffer widened to `u128` values (mostly for tests and debugging).
    pub fn to_u128_vec(&self) -> Vec<u128> {
        self.buf.data.to_u128_vec()
    }
}

fn zip_words<T: RingElem>(a: &[T], b: &[T], f: impl Fn(T, T) -> T + Sync + Send) -> Vec<T> {
    if a.len() >= PAR_THRESHOLD {
        a.par_iter().zip(b.par_iter()).map(|(&x, &y)| f(x, y)).collect()
    } else {
        a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
    }
}

fn map_words<T: RingElem>(a: &[T], f: impl Fn(T) -> T + Sync + Send) -> Vec<T> {
    if a.len() >= PAR_THRESHOLD {
        a.par_iter().map(|&x| f(x)).collect()
    } else {
        a.iter().map(|&x| f(x)).collect()
    }
}

fn check_binop(x: &RingTensor, y: &RingTensor) -> Result<(), Error> {
    if x.field() != y.field() {
        return Err(Error::FieldMismatch(x.field(), y.field()));
    }
    if x.shape() != y.shape() {
        return Err(Error::ShapeMismatch(x.shape().clone(), y.shape().clone()));
    }
    Ok(())
}

macro_rules! ring_binop_fn {
    ($(#[$meta:meta])* $name:ident, $op:ident) => {
        $(#[$meta])*
        pub fn $name(x: &RingTensor, y: &RingTensor) -> Result<RingTensor, Error> {
            check_binop(x, y)?;
            let data = dispatch_field!(x.field(), |T| {
                let a = T::unwrap_slice(x.data()).expect("field checked");
                let b = T::unwrap_slice(y.data()).expect("field checked");
                T::wrap_vec(zip_words(a, b, |x, y| x.$op(y)))
            });
            RingTensor::new(data, EltType::raw(x.field()), x.shape().clone())
        }
    };
}

ring_binop_fn!(
    /// Elementwise sum modulo `2^k`.
    ring_add,
    add
);
ring_binop_fn!(
    /// Elementwise difference modulo `2^k`.
    ring_sub,
    sub
);
ring_binop_fn!(
    /// Elementwise product modulo `2^k`.
    ring_mul,
    mul
);

/// Elementwise negation modulo `2^k`.
pub fn ring_neg(x: &RingTensor) -> Result<RingTensor, Error> {
    let data = dispatch_field!(x.field(), |T| {
        let a = T::unwrap_slice(x.data()).expect("field matches");
        T::wrap_vec(map_words(a, |x| x.neg()))
    });
    RingTensor::new(data, EltType::raw(x.field()), x.shape().clone())
}

/// Adds a public scalar (reduced modulo `2^k`) to every element.
pub fn ring_add_scalar(x: &RingTensor, v: u128) -> Result<RingTensor, Error> {
    let data = dispatch_field!(x.field(), |T| {
        let a = T::unwrap_slice(x.data()).expect("field matches");
        let v = T::from_u128(v);
        T::wrap_vec(map_words(a, |x| x.add(v)))
    });
    RingTensor::new(data, EltType::raw(x.field()), x.shape().clone())
}

/// Multiplies every element by a public scalar (reduced modulo `2^k`).
pub fn ring_mul_scalar(x: &RingTensor, v: u128) -> Result<RingTensor, Error> {
    let data = dispatch_field!(x.field(), |T| {
        let a = T::unwrap_slice(x.data()).expect("field matches");
        let v = T::from_u128(v);
        T::wrap_vec(map_words(a, |x| x.mul(v)))
    });
    RingTensor::new(data, EltType::raw(x.field()), x.shape().clone())
}

/// A shift vector must hold one broadcast amount or one amount per element.
fn check_shift_len(bits: &[u32], numel: usize) -> Result<(), Error> {
    match bits.len() {
        1 => Ok(()),
        n if n == numel => Ok(()),
        n => Err(Error::BadShiftLen(n)),
    }
}

macro_rules! ring_shift_fn {
    ($(#[$meta:meta])* $name:ident, $op:ident) => {
        $(#[$meta])*
        pub fn $name(x: &RingTensor, bits: &[u32]) -> Result<RingTensor, Error> {
            check_shift_len(bits, x.numel())?;
            let data = dispatch_field!(x.field(), |T| {
                let a = T::unwrap_slice(x.data()).expect("field matches");
                if bits.len() == 1 {
                    let s = bits[0];
                    T::wrap_vec(map_words(a, |x| x.$op(s)))
                } else {
                    T::wrap_vec(
                        a.iter()
                            .zip(bits.iter())
                            .map(|(&x, &s)| x.$op(s))
                            .collect(),
                    )
                }
            });
            RingTensor::new(data, EltType::raw(x.field()), x.shape().clone())
        }
    };
}

ring_shift_fn!(
    /// Elementwise left shift. `bits` holds one broadcast amount or one
    /// amount per element.
    ring_lshift,
    shl
);
ring_shift_fn!(
    /// Elementwise logical right shift.
    ring_rshift,
    shr
);
ring_shift_fn!(
    /// Elementwise arithmetic right shift (two's-complement sign fill).
    ring_arshift,
    sar
);

/// Keeps bits `[lo, hi)` of every element and clears the rest. `hi` is
/// clamped to the ring width.
pub fn ring_bitmask(x: &RingTensor, lo: u32, hi: u32) -> Result<RingTensor, Error> {
    let data = dispatch_field!(x.field(), |T| {
        let a = T::unwrap_slice(x.data()).expect("field matches");
        let hi = hi.min(T::BITS);
        T::wrap_vec(map_words(a, |x| x.shr(lo).shl(lo).shl(T::BITS - hi).shr(T::BITS - hi)))
    });
    RingTensor::new(data, EltType::raw(x.field()), x.shape().clone())
}

/// A tensor of ones.
pub fn ring_ones(field: RingField, shape: Shape) -> RingTensor {
    let data = RingBuffer::ones(field, shape.numel());
    RingTensor::new(data, EltType::raw(field), shape).expect("ones match shape")
}

/// A tensor of zeros.
pub fn ring_zeros(field: RingField, shape: Shape) -> RingTensor {
    RingTensor::placeholder(EltType::raw(field), shape)
}

/// The 2-D matrix product `x . y` modulo `2^k`.
pub fn ring_mmul(x: &RingTensor, y: &RingTensor) -> Result<RingTensor, Error> {
    if x.field() != y.field() {
        return Err(Error::FieldMismatch(x.field(), y.field()));
    }
    let ((m, k), (k2, n)) = match (x.shape().as_matrix(), y.shape().as_matrix()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(Error::NotAMatrixProduct(x.shape().clone(), y.shape().clone())),
    };
    if k != k2 {
        return Err(Error::NotAMatrixProduct(x.shape().clone(), y.shape().clone()));
    }
    let data = dispatch_field!(x.field(), |T| {
        let a = T::unwrap_slice(x.data()).expect("field checked");
        let b = T::unwrap_slice(y.data()).expect("field checked");
        let row = |i: usize| {
            let mut out = vec![T::ZERO; n];
            for p in 0..k {
                let aip = a[i * k + p];
                let brow = &b[p * n..(p + 1) * n];
                for (o, &bpj) in out.iter_mut().zip(brow) {
                    *o = o.add(aip.mul(bpj));
                }
            }
            out
        };
        let flat: Vec<T> = if m * n >= PAR_THRESHOLD {
            (0..m).into_par_iter().flat_map_iter(row).collect()
        } else {
            (0..m).flat_map(row).collect()
        };
        T::wrap_vec(flat)
    });
    RingTensor::new(data, EltType::raw(x.field()), Shape::new(vec![m, n]))
}
