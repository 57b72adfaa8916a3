use crate::{
    error::H2Error,
    types::{ErrorType, Headers},
};
use bytes::Bytes;
use log::trace;

/// Per-field overhead RFC 7540 §10.5.1 charges against
/// SETTINGS_MAX_HEADER_LIST_SIZE.
const FIELD_OVERHEAD: usize = 32;

/// Adapter around the `hpack` crate holding both directions of the
/// compression context. The decoder is driven only from the inbound demux
/// task and the encoder only under the session lock, so the struct needs no
/// synchronization of its own.
pub struct HeaderCodec {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    /// Peer-mandated table size not yet signaled in an outgoing block.
    pending_size_update: Option<u32>,
    local_table_size: u32,
    max_header_list_size: u32,
}

impl std::fmt::Debug for HeaderCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderCodec")
            .field("pending_size_update", &self.pending_size_update)
            .field("local_table_size", &self.local_table_size)
            .finish()
    }
}

impl HeaderCodec {
    pub fn new(max_header_list_size: u32) -> Self {
        Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            pending_size_update: None,
            local_table_size: 4096,
            max_header_list_size,
        }
    }

    /// Encode a header list into one block. A pending dynamic-table size
    /// update is signaled at the front of the block, as RFC 7541 §4.2
    /// requires after the peer shrinks SETTINGS_HEADER_TABLE_SIZE.
    pub fn encode(&mut self, headers: &Headers) -> Bytes {
        let block = self
            .encoder
            .encode(headers.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes())));
        match self.pending_size_update.take() {
            Some(size) => {
                let mut prefixed = Vec::with_capacity(block.len() + 5);
                put_size_update(size, &mut prefixed);
                prefixed.extend(block);
                prefixed.into()
            }
            None => block.into(),
        }
    }

    /// Decode a complete header block. Failures are connection errors of
    /// type COMPRESSION_ERROR and are fatal: the dynamic table cannot be
    /// trusted afterwards. The block is always decoded in full before the
    /// list-size limit is enforced, so the table stays consistent even for a
    /// rejected block.
    pub fn decode(&mut self, fragment: &[u8]) -> Result<Headers, H2Error> {
        let mut headers = Headers::new();
        let mut list_size = 0usize;
        self.decoder
            .decode_with_cb(fragment, |key, value| {
                list_size += key.len() + value.len() + FIELD_OVERHEAD;
                headers.push((
                    String::from_utf8_lossy(&key).to_string(),
                    String::from_utf8_lossy(&value).to_string(),
                ));
            })
            .map_err(|err| {
                H2Error::connection(
                    ErrorType::CompressionError,
                    format!("header block decode failed: {err:?}"),
                )
            })?;
        if list_size as u64 > u64::from(self.max_header_list_size) {
            return Err(H2Error::connection(
                ErrorType::CompressionError,
                format!(
                    "header list of {list_size} bytes exceeds the {} byte limit",
                    self.max_header_list_size
                ),
            ));
        }
        Ok(headers)
    }

    /// Honor an incoming SETTINGS_HEADER_TABLE_SIZE from the peer: the next
    /// encoded block will lead with a table-size update.
    pub fn set_remote_table_size(&mut self, size: u32) {
        trace!("peer header table size -> {size}");
        self.pending_size_update = Some(size);
    }

    /// Apply the table size this endpoint advertised to the decoder.
    pub fn set_local_table_size(&mut self, size: u32) {
        self.local_table_size = size;
        self.decoder.set_max_table_size(size as usize);
    }

    pub fn local_table_size(&self) -> u32 {
        self.local_table_size
    }
}

/// Dynamic-table size update instruction: `001` pattern with a 5-bit prefix
/// integer (RFC 7541 §5.1, §6.3).
fn put_size_update(mut value: u32, out: &mut Vec<u8>) {
    if value < 31 {
        out.push(0x20 | value as u8);
        return;
    }
    out.push(0x3f);
    value -= 31;
    while value >= 128 {
        out.push((value % 128) as u8 | 0x80);
        value /= 128;
    }
    out.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_headers() -> Headers {
        vec![
            (":method".to_owned(), "GET".to_owned()),
            (":scheme".to_owned(), "https".to_owned()),
            (":authority".to_owned(), "example.com".to_owned()),
            (":path".to_owned(), "/".to_owned()),
        ]
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut ours = HeaderCodec::new(u32::MAX);
        let mut theirs = HeaderCodec::new(u32::MAX);
        let block = ours.encode(&request_headers());
        assert_eq!(theirs.decode(&block).unwrap(), request_headers());
    }

    #[test]
    fn state_carries_across_blocks() {
        let mut encoder = HeaderCodec::new(u32::MAX);
        let mut decoder = HeaderCodec::new(u32::MAX);
        for _ in 0..3 {
            let block = encoder.encode(&request_headers());
            assert_eq!(decoder.decode(&block).unwrap(), request_headers());
        }
    }

    #[test]
    fn table_size_update_prefixes_next_block() {
        let mut codec = HeaderCodec::new(u32::MAX);
        codec.set_remote_table_size(0);
        let block = codec.encode(&request_headers());
        assert_eq!(block[0], 0x20);
        // consumed: second block carries no update
        let block = codec.encode(&request_headers());
        assert_ne!(block[0] & 0xe0, 0x20);
    }

    #[test]
    fn size_update_integer_encoding() {
        let mut out = Vec::new();
        put_size_update(30, &mut out);
        assert_eq!(out, vec![0x3e]);

        out.clear();
        put_size_update(4096, &mut out);
        assert_eq!(out, vec![0x3f, 0xe1, 0x1f]);
    }

    #[test]
    fn size_update_accepted_by_decoder() {
        let mut encoder = HeaderCodec::new(u32::MAX);
        let mut decoder = HeaderCodec::new(u32::MAX);
        encoder.set_remote_table_size(256);
        let block = encoder.encode(&request_headers());
        assert_eq!(decoder.decode(&block).unwrap(), request_headers());
    }

    #[test]
    fn malformed_block_is_compression_error() {
        let mut codec = HeaderCodec::new(u32::MAX);
        // indexed header field with index 0 is always invalid
        let err = codec.decode(&[0x80]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorType::CompressionError));
        assert!(err.is_connection_error());
    }

    #[test]
    fn header_list_size_limit_enforced() {
        let mut encoder = HeaderCodec::new(u32::MAX);
        let mut decoder = HeaderCodec::new(64);
        let block = encoder.encode(&request_headers());
        let err = decoder.decode(&block).unwrap_err();
        assert_eq!(err.code(), Some(ErrorType::CompressionError));
    }
}
