use crate::{Family, Identity, ItemId, Timestamp};
use bincode::{
    config::{standard, Config},
    de::Decode as BincodeDecode,
    decode_from_slice,
    enc::Encode as BincodeEncode,
    encode_to_vec,
    error::{DecodeError, EncodeError},
};
use std::fmt;
use std::marker::PhantomData;
use std::ops::RangeInclusive;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("failed to bincode-encode: {0}")]
    BincodeEncodeFailed(#[from] EncodeError),
    #[error("failed to bincode-decode: {0}")]
    BincodeDecodeFailed(#[from] DecodeError),
    #[error("decode missing suffix bytes")]
    DecodeMissingSuffix,
    #[error("decode ran out of bytes")]
    DecodeNotEnoughBytes,
    #[error("string contained a null byte, which is not allowed")]
    StringContainedNull,
    #[error("string was not terminated with null byte")]
    UnterminatedString,
    #[error("could not convert from utf8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("could not get array from slice: {0}")]
    BadSlice(#[from] std::array::TryFromSliceError),
    #[error("wrong static prefix. expected {1:?}, found {0:?}")]
    WrongStaticPrefix(String, String), // found, expected
    #[error("unknown family tag {0}")]
    UnknownFamily(u8),
    #[error("unexpected extra bytes ({0} bytes) left after decoding")]
    DecodeTooManyBytes(usize),
}

fn bincode_conf() -> impl Config {
    standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<{ 2_usize.pow(20) }>() // 1MB
}

pub trait DbBytes {
    fn to_db_bytes(&self) -> Result<Vec<u8>, EncodingError>;
    fn from_db_bytes(bytes: &[u8]) -> Result<(Self, usize), EncodingError>
    where
        Self: Sized;
}

#[derive(PartialEq)]
pub struct DbConcat<P: DbBytes, S: DbBytes> {
    pub prefix: P,
    pub suffix: S,
}

impl<P: DbBytes, S: DbBytes> DbConcat<P, S> {
    pub fn from_pair(prefix: P, suffix: S) -> Self {
        Self { prefix, suffix }
    }
}

impl<P: DbBytes + fmt::Debug, S: DbBytes + fmt::Debug> fmt::Debug for DbConcat<P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbConcat<{:?} || {:?}>", self.prefix, self.suffix)
    }
}

impl<P: DbBytes, S: DbBytes> DbBytes for DbConcat<P, S> {
    fn to_db_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut combined = self.prefix.to_db_bytes()?;
        combined.append(&mut self.suffix.to_db_bytes()?);
        Ok(combined)
    }
    fn from_db_bytes(bytes: &[u8]) -> Result<(Self, usize), EncodingError>
    where
        Self: Sized,
    {
        let (prefix, eaten) = P::from_db_bytes(bytes)?;
        let Some(suffix_bytes) = bytes.get(eaten..) else {
            return Err(EncodingError::DecodeMissingSuffix);
        };
        if suffix_bytes.is_empty() {
            return Err(EncodingError::DecodeMissingSuffix);
        };
        let (suffix, also_eaten) = S::from_db_bytes(suffix_bytes)?;
        Ok((Self { prefix, suffix }, eaten + also_eaten))
    }
}

/// Inclusive byte range between two encoded keys
pub fn key_range<K: DbBytes>(low: &K, high: &K) -> Result<RangeInclusive<Vec<u8>>, EncodingError> {
    Ok(low.to_db_bytes()?..=high.to_db_bytes()?)
}

pub trait StaticStr {
    fn static_str() -> &'static str;
}

#[derive(PartialEq)]
pub struct DbStaticStr<S: StaticStr> {
    marker: PhantomData<S>,
}
impl<S: StaticStr> Default for DbStaticStr<S> {
    fn default() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}
impl<S: StaticStr> fmt::Debug for DbStaticStr<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbStaticStr({:?})", S::static_str())
    }
}
impl<S: StaticStr> DbBytes for DbStaticStr<S> {
    fn to_db_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        S::static_str().to_string().to_db_bytes()
    }
    fn from_db_bytes(bytes: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (prefix, eaten) = String::from_db_bytes(bytes)?;
        if prefix != S::static_str() {
            return Err(EncodingError::WrongStaticPrefix(
                prefix,
                S::static_str().to_string(),
            ));
        }
        Ok((
            Self {
                marker: PhantomData,
            },
            eaten,
        ))
    }
}

/// marker trait: impl on a type to indicate that that DbBytes should use bincode on it
pub trait UseBincodePlz {}

impl<T> DbBytes for T
where
    T: BincodeEncode + BincodeDecode<()> + UseBincodePlz + Sized + fmt::Debug,
{
    fn to_db_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        log::trace!("bincode to_db_bytes: {self:?}");
        Ok(encode_to_vec(self, bincode_conf())?)
    }
    fn from_db_bytes(bytes: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok(decode_from_slice(bytes, bincode_conf())?)
    }
}

/// Lexicographic-sort-friendly null-terminating serialization for String
///
/// Null bytes technically can appear within utf-8 strings. Currently we will just bail in that case.
impl DbBytes for String {
    fn to_db_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut v = self.as_bytes().to_vec();
        if v.contains(&0x00) {
            return Err(EncodingError::StringContainedNull);
        }
        v.push(0x00);
        Ok(v)
    }
    fn from_db_bytes(bytes: &[u8]) -> Result<(Self, usize), EncodingError> {
        for (i, byte) in bytes.iter().enumerate() {
            if *byte == 0x00 {
                let (string_bytes, _) = bytes.split_at(i);
                let s = std::str::from_utf8(string_bytes)?;
                return Ok((s.to_string(), i + 1)); // +1 for the null byte
            }
        }
        Err(EncodingError::UnterminatedString)
    }
}

/// Fixed-width big-endian encoding for integer newtypes, so byte order is
/// numeric order
macro_rules! big_endian_key {
    ($t:ty, $inner:ty, $from_raw:expr, $to_raw:expr) => {
        impl DbBytes for $t {
            fn to_db_bytes(&self) -> Result<Vec<u8>, EncodingError> {
                let to_raw: fn(&$t) -> $inner = $to_raw;
                Ok(to_raw(self).to_be_bytes().to_vec())
            }
            fn from_db_bytes(bytes: &[u8]) -> Result<(Self, usize), EncodingError> {
                const N: usize = std::mem::size_of::<$inner>();
                let Some(head) = bytes.get(..N) else {
                    return Err(EncodingError::DecodeNotEnoughBytes);
                };
                let from_raw: fn($inner) -> $t = $from_raw;
                Ok((from_raw(<$inner>::from_be_bytes(head.try_into()?)), N))
            }
        }
    };
}

big_endian_key!(Identity, u64, Identity, |i| i.0);
big_endian_key!(ItemId, u64, ItemId, |i| i.0);
big_endian_key!(Timestamp, u64, Timestamp::from_raw_u64, |t| t.to_raw_u64());
big_endian_key!(CommentOrder, u32, CommentOrder, |o| o.0);

impl DbBytes for Family {
    fn to_db_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let tag = match self {
            Family::A => b'a',
            Family::B => b'b',
        };
        Ok(vec![tag])
    }
    fn from_db_bytes(bytes: &[u8]) -> Result<(Self, usize), EncodingError> {
        match bytes.first() {
            Some(b'a') => Ok((Family::A, 1)),
            Some(b'b') => Ok((Family::B, 1)),
            Some(other) => Err(EncodingError::UnknownFamily(*other)),
            None => Err(EncodingError::DecodeNotEnoughBytes),
        }
    }
}

/// Comment position within its item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommentOrder(pub u32);

pub fn db_complete<T: DbBytes>(bytes: &[u8]) -> Result<T, EncodingError> {
    let (t, n) = T::from_db_bytes(bytes)?;
    if n < bytes.len() {
        return Err(EncodingError::DecodeTooManyBytes(bytes.len() - n));
    }
    Ok(t)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_string_serialized_lexicographic_sort() -> Result<(), EncodingError> {
        let aa = "aa".to_string().to_db_bytes()?;
        let b = "b".to_string().to_db_bytes()?;
        assert!(b > aa);
        Ok(())
    }

    #[test]
    fn test_timestamp_bytes_sort_like_time() -> Result<(), EncodingError> {
        let early = Timestamp::from_raw_u64(255).to_db_bytes()?;
        let late = Timestamp::from_raw_u64(256).to_db_bytes()?;
        assert!(late > early);
        Ok(())
    }

    #[test]
    fn test_concat_key_sorts_by_prefix_then_suffix() -> Result<(), EncodingError> {
        type Key = DbConcat<Identity, DbConcat<Timestamp, ItemId>>;
        let k = |who, at, id| {
            Key::from_pair(
                Identity(who),
                DbConcat::from_pair(Timestamp::from_raw_u64(at), ItemId(id)),
            )
            .to_db_bytes()
        };
        assert!(k(1, 900, 1)? < k(2, 0, 0)?);
        assert!(k(1, 10, 99)? < k(1, 11, 0)?);
        assert!(k(1, 10, 5)? < k(1, 10, 6)?);
        Ok(())
    }

    #[test]
    fn test_concat_decode_consumes_everything() -> Result<(), EncodingError> {
        type Key = DbConcat<Identity, DbConcat<Family, CommentOrder>>;
        let original = Key::from_pair(Identity(7), DbConcat::from_pair(Family::B, CommentOrder(3)));
        let bytes = original.to_db_bytes()?;
        assert_eq!(bytes.len(), 8 + 1 + 4);
        let restored = db_complete::<Key>(&bytes)?;
        assert_eq!(restored, original);
        Ok(())
    }

    #[test]
    fn test_truncated_key_fails() -> Result<(), EncodingError> {
        let bytes = Identity(7).to_db_bytes()?;
        type Key = DbConcat<Identity, Family>;
        assert!(matches!(
            Key::from_db_bytes(&bytes),
            Err(EncodingError::DecodeMissingSuffix)
        ));
        assert!(matches!(
            Timestamp::from_db_bytes(&bytes[..5]),
            Err(EncodingError::DecodeNotEnoughBytes)
        ));
        Ok(())
    }

    #[test]
    fn test_family_tags() -> Result<(), EncodingError> {
        assert_eq!(Family::A.to_db_bytes()?, b"a");
        assert_eq!(Family::B.to_db_bytes()?, b"b");
        assert_eq!(db_complete::<Family>(b"b")?, Family::B);
        Ok(())
    }

    #[test]
    fn test_unknown_family_tag() {
        assert!(matches!(
            Family::from_db_bytes(b"z"),
            Err(EncodingError::UnknownFamily(b'z'))
        ));
    }

    #[test]
    fn test_static_prefix() -> Result<(), EncodingError> {
        #[derive(Debug, PartialEq)]
        struct AStaticPrefix {}
        impl StaticStr for AStaticPrefix {
            fn static_str() -> &'static str {
                "a static prefix"
            }
        }
        #[derive(Debug, PartialEq)]
        struct OtherPrefix {}
        impl StaticStr for OtherPrefix {
            fn static_str() -> &'static str {
                "other"
            }
        }

        let serialized = DbStaticStr::<AStaticPrefix>::default().to_db_bytes()?;
        assert!(serialized.starts_with("a static prefix".as_bytes()));
        assert!(db_complete::<DbStaticStr<AStaticPrefix>>(&serialized).is_ok());
        assert!(matches!(
            db_complete::<DbStaticStr<OtherPrefix>>(&serialized),
            Err(EncodingError::WrongStaticPrefix(_, _))
        ));
        Ok(())
    }
}
