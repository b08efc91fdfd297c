use flate2::{Decompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};

use crate::error::{ContentError, ContentResult};
use crate::types::{ContentHash, MagicHash};

/// Message carried by the corrupt-deflate error
pub const BAD_DEFLATE: &str = "bad deflate";

const INFLATE_BUF: usize = 16 * 1024;

/// Digest totals of a finished upload stream
#[derive(Debug, Clone, PartialEq)]
pub struct HashSnapshot {
    pub content_hash: ContentHash,
    pub magic_hash: MagicHash,
    pub crc32: u32,
    pub inflated_size: u64,
    pub deflated_size: u64,
}

/// Streaming digest pipeline over a zlib-deflated upload.
///
/// Consumes the deflated bytes exactly as they arrive on the wire and
/// keeps all digests over the *inflated* output plus both size totals, so
/// an upload is verified while it flows rather than after a second pass.
pub struct HashPipeline {
    sha: Sha1,
    magic: Sha1,
    crc: crc32fast::Hasher,
    inflate: Decompress,
    scratch: Vec<u8>,
    inflated_size: u64,
    deflated_size: u64,
    stream_done: bool,
    snapshot: Option<HashSnapshot>,
}

impl HashPipeline {
    /// Create a pipeline; `salt` seeds the magic hash
    pub fn new(salt: &[u8]) -> Self {
        let mut magic = Sha1::new();
        magic.update(salt);
        Self {
            sha: Sha1::new(),
            magic,
            crc: crc32fast::Hasher::new(),
            inflate: Decompress::new(true),
            scratch: vec![0u8; INFLATE_BUF],
            inflated_size: 0,
            deflated_size: 0,
            stream_done: false,
            snapshot: None,
        }
    }

    /// Feed a chunk of deflated bytes.
    ///
    /// Malformed zlib data and bytes past the end of the stream fail with
    /// `UploadCorrupt("bad deflate")`.
    pub fn add_data(&mut self, data: &[u8]) -> ContentResult<()> {
        self.deflated_size += data.len() as u64;
        let mut input = data;
        while !input.is_empty() {
            if self.stream_done {
                return Err(ContentError::UploadCorrupt(BAD_DEFLATE));
            }
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress(input, &mut self.scratch, FlushDecompress::None)
                .map_err(|_| ContentError::UploadCorrupt(BAD_DEFLATE))?;
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;

            let inflated = &self.scratch[..produced];
            self.sha.update(inflated);
            self.magic.update(inflated);
            self.crc.update(inflated);
            self.inflated_size += produced as u64;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => self.stream_done = true,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        return Err(ContentError::UploadCorrupt(BAD_DEFLATE));
                    }
                }
            }
        }
        Ok(())
    }

    /// Seal the pipeline and compute the final digests.
    ///
    /// Size and hash hint mismatches are for the caller to judge; a
    /// truncated stream simply yields totals that won't match the hints.
    pub fn finish(&mut self) -> ContentResult<HashSnapshot> {
        let snapshot = HashSnapshot {
            content_hash: ContentHash::from_digest(self.sha.clone().finalize().into()),
            magic_hash: MagicHash(format!(
                "sha1:{}",
                hex::encode(self.magic.clone().finalize())
            )),
            crc32: self.crc.clone().finalize(),
            inflated_size: self.inflated_size,
            deflated_size: self.deflated_size,
        };
        self.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The digest totals; only present once `finish` has run
    pub fn snapshot(&self) -> Option<&HashSnapshot> {
        self.snapshot.as_ref()
    }

    /// Deflated bytes consumed so far (partial until `finish`)
    pub fn deflated_size(&self) -> u64 {
        self.deflated_size
    }

    /// Inflated bytes produced so far (partial until `finish`)
    pub fn inflated_size(&self) -> u64 {
        self.inflated_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    const SALT: &[u8] = b"test salt";

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn crc32(data: &[u8]) -> u32 {
        let mut h = crc32fast::Hasher::new();
        h.update(data);
        h.finalize()
    }

    #[test]
    fn test_digests_match_reference() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let deflated = deflate(&data);

        let mut pipeline = HashPipeline::new(SALT);
        pipeline.add_data(&deflated).unwrap();
        let snap = pipeline.finish().unwrap();

        assert_eq!(snap.content_hash, ContentHash::of(&data));
        assert_eq!(snap.magic_hash, MagicHash::of(SALT, &data));
        assert_eq!(snap.crc32, crc32(&data));
        assert_eq!(snap.inflated_size, data.len() as u64);
        assert_eq!(snap.deflated_size, deflated.len() as u64);
    }

    #[test]
    fn test_incremental_feeding_matches_one_shot() {
        let data = vec![42u8; 200_000];
        let deflated = deflate(&data);

        let mut whole = HashPipeline::new(SALT);
        whole.add_data(&deflated).unwrap();
        let whole = whole.finish().unwrap();

        let mut chunked = HashPipeline::new(SALT);
        for part in deflated.chunks(777) {
            chunked.add_data(part).unwrap();
        }
        let chunked = chunked.finish().unwrap();

        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_empty_payload() {
        let deflated = deflate(b"");
        let mut pipeline = HashPipeline::new(SALT);
        pipeline.add_data(&deflated).unwrap();
        let snap = pipeline.finish().unwrap();

        assert_eq!(snap.content_hash, ContentHash::empty_file());
        assert_eq!(snap.crc32, 0);
        assert_eq!(snap.inflated_size, 0);
    }

    #[test]
    fn test_garbage_input_is_corrupt() {
        let mut pipeline = HashPipeline::new(SALT);
        let err = pipeline
            .add_data(b"Neque porro quisquam est qui dolorem ipsum")
            .unwrap_err();
        assert!(matches!(err, ContentError::UploadCorrupt(m) if m == BAD_DEFLATE));
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let mut deflated = deflate(b"payload");
        deflated.extend_from_slice(b"10");

        let mut pipeline = HashPipeline::new(SALT);
        let err = pipeline.add_data(&deflated).unwrap_err();
        assert!(matches!(err, ContentError::UploadCorrupt(m) if m == BAD_DEFLATE));
    }

    #[test]
    fn test_truncated_stream_yields_short_totals() {
        let data = vec![7u8; 50_000];
        let deflated = deflate(&data);

        let mut pipeline = HashPipeline::new(SALT);
        pipeline.add_data(&deflated[..deflated.len() / 2]).unwrap();
        let snap = pipeline.finish().unwrap();

        assert!(snap.deflated_size < deflated.len() as u64);
        assert_ne!(snap.content_hash, ContentHash::of(&data));
    }
}
