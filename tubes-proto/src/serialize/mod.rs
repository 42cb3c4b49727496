//! Defines the [`ByteRead`] and [`ByteWrite`] traits and implements them for the types tube
//! messages are made of.
//!
//! This includes `()`, [`bool`], [`u8`], [`u16`], [`u32`], [`u64`], [`str`] (write-only),
//! [`String`], `[T]` (write-only), [`Vec<T>`], [`BTreeMap<String, String>`](std::collections::BTreeMap),
//! [`SocketAddr`](std::net::SocketAddr), [`Option<T>`], [`Result<T, E>`], tuples and [`Blob`].
//!
//! # Serialization of [`Option<T>`] and [`Result<T, E>`]
//! A presence byte comes first, 1 if `Some` (or `Ok`) and 0 if `None` (or `Err`). If the value
//! has contents, the serialization of `T` (or `E`) follows.
//!
//! # Serialization of strings, lists and maps
//! [`String`] and [`str`] start with an [`u16`] indicating the length of the string in bytes,
//! followed by said amount of bytes. Lists start with an [`u16`] indicating the amount of
//! elements. Maps are serialized as a list of key-value pairs, in key order.
//!
//! Binary payloads that may exceed 64KB, such as the bodies of bus messages, are wrapped in
//! [`Blob`], which uses an [`u32`] length instead and is bounded by [`MAX_BLOB_LENGTH`].
//!
//! # Serialization of tuples
//! [`ByteRead`] and [`ByteWrite`] are also implemented for tuples of up to 4 elements, which
//! allows writing several fields at once:
//! ```ignore
//! (self.tube_id, self.kind, self.service.as_str()).write(writer).await?;
//! ```

use std::io::{self, Error, ErrorKind};

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod blob;
pub mod enums;
pub mod lists;
pub mod map;
pub mod net;
pub mod primitives;
pub mod string;
pub mod tuples;
pub mod u8_repr_enum;

pub use blob::*;
pub use u8_repr_enum::*;

/// Serializes a type into bytes, writing it to an [`AsyncWrite`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteWrite {
    /// Serializes this instance into bytes, writing those bytes into a writer.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were written.
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()>;
}

/// Deserializes a type from raw bytes, reading it from an [`AsyncRead`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteRead: Sized {
    /// Deserializes bytes into an instance of this type by reading bytes from a reader.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were read.
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self>;
}

/// Serializes a value into a new buffer, as used for the payloads of the messaging session.
pub fn to_bytes<T: ByteWrite + ?Sized>(value: &T) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();

    // Writing into a Vec never waits, so the future is always ready on its first poll.
    match value.write(&mut buf).now_or_never() {
        Some(result) => result.map(|()| buf),
        None => Err(Error::new(ErrorKind::WouldBlock, "In-memory serialization did not complete")),
    }
}

/// Deserializes a value from a payload of the messaging session. The whole payload must be
/// consumed, trailing bytes are treated as invalid data.
pub fn from_bytes<T: ByteRead>(bytes: &[u8]) -> io::Result<T> {
    let mut reader = bytes;
    let value = match T::read(&mut reader).now_or_never() {
        Some(result) => result?,
        None => return Err(Error::new(ErrorKind::WouldBlock, "In-memory deserialization did not complete")),
    };

    if !reader.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, format!("{} trailing bytes after message", reader.len())));
    }

    Ok(value)
}
