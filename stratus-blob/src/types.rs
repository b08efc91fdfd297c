use bytes::Bytes;
use futures_core::Stream;
use std::pin::Pin;

/// Stream of blob content bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A readable blob: a pull-based byte stream plus its total size.
///
/// The consumer drives the stream; not polling pauses the producer and
/// dropping it stops the read altogether.
pub struct ReadSource {
    pub stream: ByteStream,
    pub size_bytes: u64,
}
