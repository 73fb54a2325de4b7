//! Typed, position-based argument containers.
//!
//! [`ArgArray`] is the uniform argument vehicle for in-process typed calls,
//! the generic dispatch gateway, and remote transport. Producers append with
//! the type-checked `add_*` family, consumers read sequentially with `get_*`
//! (advancing a cursor), and `set_*` overwrites in place for out-parameters.
//! The type discriminants are stable and part of the wire ABI.

use std::ffi::c_char;

use crate::{Error, Result};

/// Wire-stable argument type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u32)]
pub enum ArgType {
    /// Untyped bytes, no validation.
    Raw = 0,
    /// `i8` scalar.
    Int8 = 1,
    /// `i8` array.
    Int8Array = 2,
    /// `i16` scalar.
    Int16 = 3,
    /// `i16` array.
    Int16Array = 4,
    /// `i32` scalar.
    Int32 = 5,
    /// `i32` array.
    Int32Array = 6,
    /// `i64` scalar.
    Int64 = 7,
    /// `i64` array.
    Int64Array = 8,
    /// `u8` scalar.
    UInt8 = 9,
    /// `u8` array.
    UInt8Array = 10,
    /// `u16` scalar.
    UInt16 = 11,
    /// `u16` array.
    UInt16Array = 12,
    /// `u32` scalar.
    UInt32 = 13,
    /// `u32` array.
    UInt32Array = 14,
    /// `u64` scalar.
    UInt64 = 15,
    /// `u64` array.
    UInt64Array = 16,
    /// `f32` scalar.
    Float32 = 17,
    /// `f32` array.
    Float32Array = 18,
    /// `f64` scalar.
    Float64 = 19,
    /// `f64` array.
    Float64Array = 20,
    /// Boolean stored as a single byte, 0 or 1.
    Bool = 21,
    /// Boolean array, one byte per element.
    BoolArray = 22,
    /// C `char` scalar.
    Char = 23,
    /// C `char` array.
    CharArray = 24,
    /// C `unsigned char` scalar.
    UChar = 25,
    /// C `unsigned char` array.
    UCharArray = 26,
    /// NUL-terminated string.
    String = 27,
    /// Opaque buffer.
    Buffer = 28,
    /// Client-tagged custom type, optionally validated.
    Custom = 29,
}

/// Validator callback for [`ArgType::Custom`] payloads.
pub type ValidatorFn = fn(buf: &[u8], custom_id: u32) -> bool;

/// Serializer callback: encodes a value into owned bytes.
pub type SerializerFn<T> = fn(value: &T, custom_id: u32) -> Result<Vec<u8>>;

/// Deserializer callback: decodes a value from stored bytes.
pub type DeserializerFn<T> = fn(buf: &[u8], custom_id: u32) -> Result<T>;

/// A single typed argument.
///
/// The contents are owned by the argument; out-parameters are written back
/// through [`Arg::data_mut`].
#[derive(Debug, Clone)]
pub struct Arg {
    bytes: Vec<u8>,
    ty: ArgType,
    custom_type_id: u32,
}

impl Arg {
    /// Creates an argument holding a copy of `buf`.
    pub fn new(buf: &[u8], ty: ArgType, custom_type_id: u32) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            bytes: buf.to_vec(),
            ty,
            custom_type_id,
        })
    }

    /// Creates an argument taking ownership of `bytes`.
    pub fn from_vec(bytes: Vec<u8>, ty: ArgType, custom_type_id: u32) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            bytes,
            ty,
            custom_type_id,
        })
    }

    /// Returns the argument bytes.
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the argument bytes mutably (for out-parameters).
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Returns the size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the argument type.
    pub fn arg_type(&self) -> ArgType {
        self.ty
    }

    /// Returns the custom type id (meaningful for [`ArgType::Custom`]).
    pub fn custom_type_id(&self) -> u32 {
        self.custom_type_id
    }
}

/// Growable, cursor-carrying vector of typed arguments.
#[derive(Debug, Default)]
pub struct ArgArray {
    args: Vec<Arg>,
    /// Read cursor for the sequential `get_*`/`set_*` families.
    position: usize,
}

/// Generates the scalar and array `add`/`get`/`set` methods for one numeric
/// type, the way the C library stamps them out of an X-macro.
macro_rules! numeric_arg_fns {
    ($t:ty, $scalar:ident, $array:ident,
     $add:ident, $add_arr:ident, $get:ident, $get_arr:ident, $set:ident, $set_arr:ident) => {
        /// Appends a scalar argument.
        pub fn $add(&mut self, value: $t) -> Result<()> {
            self.push(Arg::from_vec(
                value.to_ne_bytes().to_vec(),
                ArgType::$scalar,
                0,
            )?)
        }

        /// Appends an array argument.
        pub fn $add_arr(&mut self, values: &[$t]) -> Result<()> {
            if values.is_empty() {
                return Err(Error::InvalidArgument);
            }
            let mut bytes = Vec::with_capacity(values.len() * size_of::<$t>());
            for v in values {
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
            self.push(Arg::from_vec(bytes, ArgType::$array, 0)?)
        }

        /// Reads the next argument as a scalar, advancing the cursor.
        pub fn $get(&mut self) -> Result<$t> {
            let arg = self.peek_typed(ArgType::$scalar)?;
            let bytes: [u8; size_of::<$t>()] =
                arg.data().try_into().map_err(|_| Error::InvalidArgument)?;
            self.position += 1;
            Ok(<$t>::from_ne_bytes(bytes))
        }

        /// Reads the next argument as an array, advancing the cursor.
        pub fn $get_arr(&mut self) -> Result<Vec<$t>> {
            let arg = self.peek_typed(ArgType::$array)?;
            if arg.size() % size_of::<$t>() != 0 {
                return Err(Error::InvalidArgument);
            }
            let values = arg
                .data()
                .chunks_exact(size_of::<$t>())
                .map(|c| <$t>::from_ne_bytes(c.try_into().unwrap()))
                .collect();
            self.position += 1;
            Ok(values)
        }

        /// Overwrites the argument at the cursor with a scalar, advancing.
        ///
        /// The slot must already hold an argument of the same type and size.
        pub fn $set(&mut self, value: $t) -> Result<()> {
            self.overwrite(ArgType::$scalar, &value.to_ne_bytes(), 0)
        }

        /// Overwrites the argument at the cursor with an array, advancing.
        pub fn $set_arr(&mut self, values: &[$t]) -> Result<()> {
            let mut bytes = Vec::with_capacity(values.len() * size_of::<$t>());
            for v in values {
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
            self.overwrite(ArgType::$array, &bytes, 0)
        }
    };
}

impl ArgArray {
    /// Creates an empty array with room for `initial_capacity` arguments.
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            args: Vec::with_capacity(initial_capacity),
            position: 0,
        }
    }

    /// Wraps existing arguments; the cursor starts at the beginning.
    pub fn from_args(args: Vec<Arg>) -> Self {
        Self { args, position: 0 }
    }

    /// Drops all contained arguments and resets the cursor.
    pub fn clear(&mut self) {
        self.args.clear();
        self.position = 0;
    }

    /// Returns the number of contained arguments.
    pub fn count(&self) -> usize {
        self.args.len()
    }

    /// Returns the current cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor.
    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Resets the cursor to the beginning.
    pub fn reset_position(&mut self) {
        self.position = 0;
    }

    /// Returns the number of arguments from the cursor to the end.
    pub fn remaining_count(&self) -> usize {
        self.args.len().saturating_sub(self.position)
    }

    /// Returns the arguments from the cursor to the end, without advancing.
    pub fn remaining(&self) -> &[Arg] {
        &self.args[self.position.min(self.args.len())..]
    }

    /// Returns all contained arguments.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Returns all contained arguments mutably.
    pub fn args_mut(&mut self) -> &mut [Arg] {
        &mut self.args
    }

    fn push(&mut self, arg: Arg) -> Result<()> {
        self.args.push(arg);
        Ok(())
    }

    /// Returns the argument at the cursor if it has the expected type.
    ///
    /// [`Error::OutOfRange`] past the end, [`Error::InvalidArgument`] on a
    /// type mismatch; the cursor does not move on either.
    fn peek_typed(&self, expected: ArgType) -> Result<&Arg> {
        let arg = self.args.get(self.position).ok_or(Error::OutOfRange)?;
        if arg.arg_type() != expected {
            return Err(Error::InvalidArgument);
        }
        Ok(arg)
    }

    /// Replaces the bytes of the argument at the cursor, advancing.
    ///
    /// Pre-existing type and size must match the replacement.
    fn overwrite(&mut self, expected: ArgType, bytes: &[u8], custom_id: u32) -> Result<()> {
        let idx = self.position;
        let arg = self.args.get_mut(idx).ok_or(Error::OutOfRange)?;
        if arg.arg_type() != expected || arg.custom_type_id() != custom_id {
            return Err(Error::InvalidArgument);
        }
        if arg.size() != bytes.len() {
            return Err(Error::InvalidArgument);
        }
        arg.bytes.clear();
        arg.bytes.extend_from_slice(bytes);
        self.position += 1;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Raw / buffer / string / custom
    // -----------------------------------------------------------------

    /// Appends untyped bytes without validation.
    pub fn add_raw(&mut self, buf: &[u8]) -> Result<()> {
        self.push(Arg::new(buf, ArgType::Raw, 0)?)
    }

    /// Reads the next argument as untyped bytes, advancing the cursor.
    pub fn get_raw(&mut self) -> Result<&[u8]> {
        let idx = self.position;
        let arg = self.args.get(idx).ok_or(Error::OutOfRange)?;
        self.position += 1;
        Ok(arg.data())
    }

    /// Overwrites the argument at the cursor with untyped bytes, advancing.
    /// Only the size must match.
    pub fn set_raw(&mut self, buf: &[u8]) -> Result<()> {
        let idx = self.position;
        let arg = self.args.get_mut(idx).ok_or(Error::OutOfRange)?;
        if arg.size() != buf.len() {
            return Err(Error::InvalidArgument);
        }
        arg.bytes.clear();
        arg.bytes.extend_from_slice(buf);
        self.position += 1;
        Ok(())
    }

    /// Appends an opaque buffer.
    pub fn add_buffer(&mut self, buf: &[u8]) -> Result<()> {
        self.push(Arg::new(buf, ArgType::Buffer, 0)?)
    }

    /// Reads the next argument as an opaque buffer, advancing the cursor.
    pub fn get_buffer(&mut self) -> Result<&[u8]> {
        self.peek_typed(ArgType::Buffer)?;
        let idx = self.position;
        self.position += 1;
        Ok(self.args[idx].data())
    }

    /// Overwrites the buffer argument at the cursor, advancing.
    pub fn set_buffer(&mut self, buf: &[u8]) -> Result<()> {
        self.overwrite(ArgType::Buffer, buf, 0)
    }

    /// Appends a NUL-terminated copy of `s`.
    pub fn add_string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument);
        }
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.push(Arg::from_vec(bytes, ArgType::String, 0)?)
    }

    /// Reads the next argument as a string, advancing the cursor.
    ///
    /// The stored bytes must be NUL-terminated valid UTF-8.
    pub fn get_string(&mut self) -> Result<String> {
        let arg = self.peek_typed(ArgType::String)?;
        let bytes = arg.data();
        let Some((&0, content)) = bytes.split_last() else {
            return Err(Error::InvalidArgument);
        };
        let s = std::str::from_utf8(content).map_err(|_| Error::InvalidArgument)?;
        let s = s.to_owned();
        self.position += 1;
        Ok(s)
    }

    /// Overwrites the string argument at the cursor, advancing. The
    /// NUL-terminated replacement must have the same total size.
    pub fn set_string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument);
        }
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.overwrite(ArgType::String, &bytes, 0)
    }

    /// Appends a custom-typed payload after running `validator` over it.
    pub fn add_custom(
        &mut self,
        custom_id: u32,
        buf: &[u8],
        validator: Option<ValidatorFn>,
    ) -> Result<()> {
        if let Some(validate) = validator
            && !validate(buf, custom_id)
        {
            return Err(Error::InvalidArgument);
        }
        self.push(Arg::new(buf, ArgType::Custom, custom_id)?)
    }

    /// Reads the next argument as a custom payload, advancing the cursor.
    ///
    /// The stored custom id must equal `expected_id` and `validator` (if
    /// any) must accept the payload.
    pub fn get_custom(
        &mut self,
        expected_id: u32,
        validator: Option<ValidatorFn>,
    ) -> Result<&[u8]> {
        let arg = self.peek_typed(ArgType::Custom)?;
        if arg.custom_type_id() != expected_id {
            return Err(Error::InvalidArgument);
        }
        if let Some(validate) = validator
            && !validate(arg.data(), expected_id)
        {
            return Err(Error::InvalidArgument);
        }
        let idx = self.position;
        self.position += 1;
        Ok(self.args[idx].data())
    }

    /// Overwrites the custom argument at the cursor, advancing.
    pub fn set_custom(
        &mut self,
        expected_id: u32,
        buf: &[u8],
        validator: Option<ValidatorFn>,
    ) -> Result<()> {
        if let Some(validate) = validator
            && !validate(buf, expected_id)
        {
            return Err(Error::InvalidArgument);
        }
        self.overwrite(ArgType::Custom, buf, expected_id)
    }

    /// Serializes `value` with `serializer` and appends the result under
    /// the given type and custom id.
    pub fn add_serialized<T>(
        &mut self,
        ty: ArgType,
        custom_id: u32,
        value: &T,
        serializer: SerializerFn<T>,
    ) -> Result<()> {
        let bytes = serializer(value, custom_id)?;
        self.push(Arg::from_vec(bytes, ty, custom_id)?)
    }

    /// Reads the next argument through `deserializer`, advancing the cursor.
    pub fn get_serialized<T>(
        &mut self,
        expected_ty: ArgType,
        expected_custom_id: u32,
        deserializer: DeserializerFn<T>,
    ) -> Result<T> {
        let arg = self.peek_typed(expected_ty)?;
        if arg.custom_type_id() != expected_custom_id {
            return Err(Error::InvalidArgument);
        }
        let value = deserializer(arg.data(), expected_custom_id)?;
        self.position += 1;
        Ok(value)
    }

    /// Re-serializes `value` into the argument at the cursor, advancing.
    pub fn set_serialized<T>(
        &mut self,
        expected_ty: ArgType,
        expected_custom_id: u32,
        value: &T,
        serializer: SerializerFn<T>,
    ) -> Result<()> {
        let bytes = serializer(value, expected_custom_id)?;
        self.overwrite(expected_ty, &bytes, expected_custom_id)
    }

    // -----------------------------------------------------------------
    // Bool (validated 0/1 representation)
    // -----------------------------------------------------------------

    /// Appends a boolean (stored as one byte, 0 or 1).
    pub fn add_bool(&mut self, value: bool) -> Result<()> {
        self.push(Arg::from_vec(vec![u8::from(value)], ArgType::Bool, 0)?)
    }

    /// Appends a boolean array (one byte per element).
    pub fn add_bool_array(&mut self, values: &[bool]) -> Result<()> {
        if values.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let bytes = values.iter().map(|&v| u8::from(v)).collect();
        self.push(Arg::from_vec(bytes, ArgType::BoolArray, 0)?)
    }

    /// Reads the next argument as a boolean, advancing the cursor.
    pub fn get_bool(&mut self) -> Result<bool> {
        let arg = self.peek_typed(ArgType::Bool)?;
        let value = match arg.data() {
            [0] => false,
            [1] => true,
            _ => return Err(Error::InvalidArgument),
        };
        self.position += 1;
        Ok(value)
    }

    /// Reads the next argument as a boolean array, advancing the cursor.
    pub fn get_bool_array(&mut self) -> Result<Vec<bool>> {
        let arg = self.peek_typed(ArgType::BoolArray)?;
        let mut values = Vec::with_capacity(arg.size());
        for &b in arg.data() {
            match b {
                0 => values.push(false),
                1 => values.push(true),
                _ => return Err(Error::InvalidArgument),
            }
        }
        self.position += 1;
        Ok(values)
    }

    /// Overwrites the boolean argument at the cursor, advancing.
    pub fn set_bool(&mut self, value: bool) -> Result<()> {
        self.overwrite(ArgType::Bool, &[u8::from(value)], 0)
    }

    /// Overwrites the boolean-array argument at the cursor, advancing.
    pub fn set_bool_array(&mut self, values: &[bool]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().map(|&v| u8::from(v)).collect();
        self.overwrite(ArgType::BoolArray, &bytes, 0)
    }

    // -----------------------------------------------------------------
    // Numeric scalars and arrays
    // -----------------------------------------------------------------

    numeric_arg_fns!(i8, Int8, Int8Array,
        add_i8, add_i8_array, get_i8, get_i8_array, set_i8, set_i8_array);
    numeric_arg_fns!(i16, Int16, Int16Array,
        add_i16, add_i16_array, get_i16, get_i16_array, set_i16, set_i16_array);
    numeric_arg_fns!(i32, Int32, Int32Array,
        add_i32, add_i32_array, get_i32, get_i32_array, set_i32, set_i32_array);
    numeric_arg_fns!(i64, Int64, Int64Array,
        add_i64, add_i64_array, get_i64, get_i64_array, set_i64, set_i64_array);
    numeric_arg_fns!(u8, UInt8, UInt8Array,
        add_u8, add_u8_array, get_u8, get_u8_array, set_u8, set_u8_array);
    numeric_arg_fns!(u16, UInt16, UInt16Array,
        add_u16, add_u16_array, get_u16, get_u16_array, set_u16, set_u16_array);
    numeric_arg_fns!(u32, UInt32, UInt32Array,
        add_u32, add_u32_array, get_u32, get_u32_array, set_u32, set_u32_array);
    numeric_arg_fns!(u64, UInt64, UInt64Array,
        add_u64, add_u64_array, get_u64, get_u64_array, set_u64, set_u64_array);
    numeric_arg_fns!(f32, Float32, Float32Array,
        add_f32, add_f32_array, get_f32, get_f32_array, set_f32, set_f32_array);
    numeric_arg_fns!(f64, Float64, Float64Array,
        add_f64, add_f64_array, get_f64, get_f64_array, set_f64, set_f64_array);

    // C char / unsigned char keep their own wire types.
    numeric_arg_fns!(c_char, Char, CharArray,
        add_char, add_char_array, get_char, get_char_array, set_char, set_char_array);
    numeric_arg_fns!(u8, UChar, UCharArray,
        add_uchar, add_uchar_array, get_uchar, get_uchar_array, set_uchar, set_uchar_array);

    // -----------------------------------------------------------------
    // Ranged copies
    // -----------------------------------------------------------------

    /// Appends a deep copy of `count` arguments of `src` starting at
    /// `start_idx` (the source cursor is ignored).
    pub fn add_range(&mut self, src: &ArgArray, start_idx: usize, count: usize) -> Result<()> {
        let end = start_idx.checked_add(count).ok_or(Error::InvalidArgument)?;
        if end > src.args.len() {
            return Err(Error::OutOfRange);
        }
        self.args.extend(src.args[start_idx..end].iter().cloned());
        Ok(())
    }

    /// Appends a deep copy of the arguments after `src`'s cursor.
    pub fn add_remaining(&mut self, src: &ArgArray) -> Result<()> {
        self.add_range(src, src.position, src.remaining_count())
    }

    /// Appends a deep copy of all of `src`'s arguments.
    pub fn add_all(&mut self, src: &ArgArray) -> Result<()> {
        self.add_range(src, 0, src.args.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_is_identity() {
        let mut args = ArgArray::new(4);
        args.add_i32(-42).unwrap();
        args.add_u64(7).unwrap();
        args.add_f32_array(&[1.0, 2.5]).unwrap();
        args.add_string("model.pb").unwrap();
        args.add_bool(true).unwrap();

        assert_eq!(args.get_i32().unwrap(), -42);
        assert_eq!(args.get_u64().unwrap(), 7);
        assert_eq!(args.get_f32_array().unwrap(), vec![1.0, 2.5]);
        assert_eq!(args.get_string().unwrap(), "model.pb");
        assert!(args.get_bool().unwrap());
    }

    #[test]
    fn type_mismatch_does_not_advance() {
        let mut args = ArgArray::new(1);
        args.add_i32(1).unwrap();

        assert!(matches!(args.get_u32(), Err(Error::InvalidArgument)));
        assert_eq!(args.position(), 0);
        assert_eq!(args.get_i32().unwrap(), 1);
    }

    #[test]
    fn get_past_end_is_out_of_range() {
        let mut args = ArgArray::new(1);
        args.add_i8(1).unwrap();
        args.get_i8().unwrap();

        assert!(matches!(args.get_i8(), Err(Error::OutOfRange)));
        assert_eq!(args.position(), 1);
    }

    #[test]
    fn bool_wire_value_is_validated() {
        let mut args = ArgArray::from_args(vec![
            Arg::from_vec(vec![2], ArgType::Bool, 0).unwrap(),
        ]);
        assert!(matches!(args.get_bool(), Err(Error::InvalidArgument)));
    }

    #[test]
    fn string_requires_nul_termination() {
        let mut args = ArgArray::from_args(vec![
            Arg::new(b"no-nul", ArgType::String, 0).unwrap(),
        ]);
        assert!(matches!(args.get_string(), Err(Error::InvalidArgument)));
    }

    #[test]
    fn set_requires_matching_type_and_size() {
        let mut args = ArgArray::new(2);
        args.add_i32(0).unwrap();
        args.add_buffer(&[0u8; 8]).unwrap();

        args.reset_position();
        args.set_i32(99).unwrap();
        assert!(matches!(
            args.set_buffer(&[0u8; 4]),
            Err(Error::InvalidArgument)
        ));
        args.set_buffer(&[1u8; 8]).unwrap();

        args.reset_position();
        assert_eq!(args.get_i32().unwrap(), 99);
        assert_eq!(args.get_buffer().unwrap(), &[1u8; 8]);
    }

    #[test]
    fn custom_validator_gates_add_and_get() {
        fn even_len(buf: &[u8], _id: u32) -> bool {
            buf.len() % 2 == 0
        }

        let mut args = ArgArray::new(1);
        assert!(args.add_custom(7, &[1, 2, 3], Some(even_len)).is_err());
        args.add_custom(7, &[1, 2, 3, 4], Some(even_len)).unwrap();

        assert!(matches!(
            args.get_custom(8, Some(even_len)),
            Err(Error::InvalidArgument)
        ));
        assert_eq!(args.get_custom(7, Some(even_len)).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn serialized_roundtrip() {
        #[derive(Debug, PartialEq)]
        struct Point {
            x: i32,
            y: i32,
        }

        fn ser(p: &Point, _id: u32) -> Result<Vec<u8>> {
            let mut out = p.x.to_ne_bytes().to_vec();
            out.extend_from_slice(&p.y.to_ne_bytes());
            Ok(out)
        }

        fn de(buf: &[u8], _id: u32) -> Result<Point> {
            if buf.len() != 8 {
                return Err(Error::InvalidArgument);
            }
            Ok(Point {
                x: i32::from_ne_bytes(buf[..4].try_into().unwrap()),
                y: i32::from_ne_bytes(buf[4..].try_into().unwrap()),
            })
        }

        let mut args = ArgArray::new(1);
        let point = Point { x: 3, y: -9 };
        args.add_serialized(ArgType::Custom, 42, &point, ser).unwrap();

        let back: Point = args.get_serialized(ArgType::Custom, 42, de).unwrap();
        assert_eq!(back, point);
    }

    #[test]
    fn ranged_copies() {
        let mut src = ArgArray::new(3);
        src.add_i32(1).unwrap();
        src.add_i32(2).unwrap();
        src.add_i32(3).unwrap();
        src.get_i32().unwrap();

        let mut rest = ArgArray::new(2);
        rest.add_remaining(&src).unwrap();
        assert_eq!(rest.count(), 2);
        assert_eq!(rest.get_i32().unwrap(), 2);

        let mut all = ArgArray::new(3);
        all.add_all(&src).unwrap();
        assert_eq!(all.count(), 3);

        let mut out_of_range = ArgArray::new(1);
        assert!(out_of_range.add_range(&src, 2, 2).is_err());
    }

    #[test]
    fn array_size_must_be_elem_multiple() {
        let mut args = ArgArray::from_args(vec![
            Arg::from_vec(vec![0u8; 6], ArgType::Int32Array, 0).unwrap(),
        ]);
        assert!(matches!(args.get_i32_array(), Err(Error::InvalidArgument)));
    }

    #[test]
    fn wire_discriminants_are_stable() {
        assert_eq!(ArgType::Raw as u32, 0);
        assert_eq!(ArgType::Float64Array as u32, 20);
        assert_eq!(ArgType::String as u32, 27);
        assert_eq!(ArgType::Buffer as u32, 28);
        assert_eq!(ArgType::Custom as u32, 29);
    }
}
