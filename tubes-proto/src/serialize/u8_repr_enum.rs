//! Provides the [`U8ReprEnum`] trait, which is made to be implemented by enums that can be
//! converted into or parsed from an [`u8`] value, for easy serialization and deserialization.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Allows a type to be converted into or parsed from an [`u8`] representation.
pub trait U8ReprEnum: Sized + Copy {
    /// A human-readable name of the type, used in error messages.
    const NAME: &'static str;

    /// Parses an `u8` into the enum variant it represents. If the `u8` represents a variant in
    /// this enum, then `Some` is returned with said variant. Otherwise, `None` is returned.
    fn from_u8(value: u8) -> Option<Self>;

    /// Converts this enum into its `u8` representation.
    fn into_u8(self) -> u8;
}

/// Reads a byte and parses it as a variant of `T`, failing with [`ErrorKind::InvalidData`] if
/// the byte doesn't represent any variant.
pub async fn read_u8_repr<T: U8ReprEnum, R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<T> {
    let value = reader.read_u8().await?;
    T::from_u8(value).ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("Invalid {} type byte, {value}", T::NAME)))
}
