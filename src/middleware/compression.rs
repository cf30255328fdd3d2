//! Content negotiation and transparent decompression.

use std::io::{Read, Write};

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use http::HeaderValue;

use crate::error::{Error, Result};
use crate::middleware::{Middleware, Next};
use crate::request::{Body, Request};
use crate::response::Response;

/// Compression negotiation configuration.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Codings advertised via `Accept-Encoding`.
    pub accept: Vec<String>,
    /// Gzip outgoing buffered bodies at or above this many bytes.
    /// `None` never compresses requests.
    pub request_threshold: Option<usize>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            accept: vec!["gzip".into(), "deflate".into(), "br".into()],
            request_threshold: None,
        }
    }
}

/// Middleware negotiating `Accept-Encoding` and transparently decoding
/// `gzip`/`deflate`/`br` response bodies. Decoded responses lose their
/// `Content-Encoding` and `Content-Length` headers so downstream
/// consumers see plain bytes.
#[derive(Debug)]
pub struct CompressionMiddleware {
    config: CompressionConfig,
}

impl CompressionMiddleware {
    /// Create the middleware.
    #[must_use]
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    fn maybe_compress_request(&self, req: &mut Request) -> Result<()> {
        let Some(threshold) = self.config.request_threshold else {
            return Ok(());
        };
        if req.headers().contains_key(CONTENT_ENCODING) {
            return Ok(());
        }
        let Some(bytes) = req.body().to_bytes().transpose()? else {
            return Ok(());
        };
        if bytes.len() < threshold {
            return Ok(());
        }
        let mut encoder = flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        encoder
            .write_all(&bytes)
            .and_then(|()| encoder.finish())
            .map(|packed| {
                req.set_body(Body::Bytes(Bytes::from(packed)));
                req.headers_mut().insert(
                    CONTENT_ENCODING,
                    HeaderValue::from_static("gzip"),
                );
            })
            // Compression failure keeps the original body.
            .or(Ok(()))
    }
}

#[async_trait::async_trait]
impl Middleware for CompressionMiddleware {
    async fn handle(&self, mut req: Request, next: Next) -> Result<Response> {
        if !req.headers().contains_key(ACCEPT_ENCODING)
            && !self.config.accept.is_empty()
        {
            let value = self.config.accept.join(", ");
            req.headers_mut()
                .insert(ACCEPT_ENCODING, HeaderValue::from_str(&value)?);
        }
        self.maybe_compress_request(&mut req)?;

        let mut response = next.run(req).await?;
        let encoding = response
            .header(CONTENT_ENCODING.as_str())
            .map(|v| v.trim().to_ascii_lowercase());
        let Some(encoding) = encoding else { return Ok(response) };
        if !matches!(encoding.as_str(), "gzip" | "deflate" | "br") {
            return Ok(response);
        }

        let packed = response.bytes().await?;
        let decoded = decode(&encoding, &packed)?;
        let mut rebuilt = Response::new(
            response.status(),
            response.url().clone(),
            response.headers().clone(),
            response.version(),
            Bytes::from(decoded),
        );
        rebuilt.headers_mut().remove(CONTENT_ENCODING);
        rebuilt.headers_mut().remove(CONTENT_LENGTH);
        rebuilt.set_timings(response.timings());
        rebuilt.set_connection(response.connection().clone());
        rebuilt.set_redirects(response.redirects().to_vec());
        rebuilt.set_retry_count(response.retry_count());
        Ok(rebuilt)
    }

    fn name(&self) -> &'static str {
        "compression"
    }
}

fn decode(encoding: &str, packed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        "gzip" => {
            flate2::read::GzDecoder::new(packed)
                .read_to_end(&mut out)
                .map_err(|e| Error::parse("gzip", e))?;
        }
        "deflate" => {
            // Servers send both zlib-wrapped and raw deflate.
            if flate2::read::ZlibDecoder::new(packed)
                .read_to_end(&mut out)
                .is_err()
            {
                out.clear();
                flate2::read::DeflateDecoder::new(packed)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::parse("deflate", e))?;
            }
        }
        "br" => {
            brotli::Decompressor::new(packed, 4096)
                .read_to_end(&mut out)
                .map_err(|e| Error::parse("brotli", e))?;
        }
        _ => unreachable!("filtered before decode"),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decodes_gzip() {
        let packed = gzip(b"hello gzip");
        assert_eq!(decode("gzip", &packed).unwrap(), b"hello gzip");
    }

    #[test]
    fn decodes_zlib_and_raw_deflate() {
        let mut zlib = flate2::write::ZlibEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        zlib.write_all(b"zlib wrapped").unwrap();
        let packed = zlib.finish().unwrap();
        assert_eq!(decode("deflate", &packed).unwrap(), b"zlib wrapped");

        let mut raw = flate2::write::DeflateEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        raw.write_all(b"raw deflate").unwrap();
        let packed = raw.finish().unwrap();
        assert_eq!(decode("deflate", &packed).unwrap(), b"raw deflate");
    }

    #[test]
    fn decodes_brotli() {
        let mut packed = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut packed, 4096, 5, 22);
            writer.write_all(b"brotli body").unwrap();
        }
        assert_eq!(decode("br", &packed).unwrap(), b"brotli body");
    }

    #[test]
    fn corrupt_input_is_a_parse_error() {
        assert!(matches!(
            decode("gzip", b"not gzip"),
            Err(Error::Parse { what: "gzip", .. })
        ));
    }
}
