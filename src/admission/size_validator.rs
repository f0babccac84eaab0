//! Header- and body-size admission checks. A cap of zero or negative
//! disables that check.

use super::{AdmissionRequest, Validator, Verdict};
use crate::config::SizeLimitConfig;
use crate::errors::AdmissionError;
use async_trait::async_trait;

/// Per-header bookkeeping overhead counted toward the header-size cap
/// (covers the `: ` separator and CRLF).
const HEADER_ENTRY_OVERHEAD: u64 = 4;

pub struct SizeValidator {
    config: SizeLimitConfig,
}

impl SizeValidator {
    pub fn new(config: SizeLimitConfig) -> Self {
        Self { config }
    }

    /// Sum of `name.len() + value.len() + overhead` over every header,
    /// plus the request line (`method + uri + protocol + 4`).
    pub fn header_byte_size<'a>(
        method: &str,
        uri: &str,
        protocol: &str,
        headers: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> u64 {
        let request_line = (method.len() + uri.len() + protocol.len() + 4) as u64;
        let header_bytes: u64 = headers
            .map(|(name, value)| (name.len() + value.len()) as u64 + HEADER_ENTRY_OVERHEAD)
            .sum();
        request_line + header_bytes
    }

    fn check_headers(&self, size: u64) -> Result<(), AdmissionError> {
        if self.config.max_header_size > 0 && size > self.config.max_header_size as u64 {
            return Err(AdmissionError::HeadersTooLarge {
                size,
                max: self.config.max_header_size as u64,
            });
        }
        Ok(())
    }

    fn check_body(&self, size: u64) -> Result<(), AdmissionError> {
        if self.config.max_body_size > 0 && size > self.config.max_body_size as u64 {
            return Err(AdmissionError::PayloadTooLarge {
                size,
                max: self.config.max_body_size as u64,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Validator for SizeValidator {
    async fn validate(&self, request: &AdmissionRequest<'_>) -> Verdict {
        if let Err(err) = self.check_headers(request.header_byte_size) {
            return Verdict::Deny(err);
        }
        if let Some(size) = request.declared_body_size {
            if let Err(err) = self.check_body(size) {
                return Verdict::Deny(err);
            }
        }
        Verdict::Allow
    }
}

/// Wraps a body stream/reader so the cap is also enforced against the
/// actual bytes read, not just the declared `Content-Length` (which a
/// client could lie about or omit).
pub struct BodySizeGuard {
    max_body_size: Option<u64>,
    seen: u64,
}

impl BodySizeGuard {
    pub fn new(config: &SizeLimitConfig) -> Self {
        Self {
            max_body_size: (config.max_body_size > 0).then_some(config.max_body_size as u64),
            seen: 0,
        }
    }

    /// Call after reading each chunk; returns an error the first time the
    /// running total exceeds the cap.
    pub fn observe(&mut self, chunk_len: usize) -> Result<(), AdmissionError> {
        self.seen += chunk_len as u64;
        if let Some(max) = self.max_body_size {
            if self.seen > max {
                return Err(AdmissionError::PayloadTooLarge {
                    size: self.seen,
                    max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_at_exact_cap_is_allowed() {
        let config = SizeLimitConfig {
            max_body_size: 10,
            max_header_size: 0,
        };
        let mut guard = BodySizeGuard::new(&config);
        assert!(guard.observe(10).is_ok());
    }

    #[test]
    fn body_one_byte_over_cap_is_rejected() {
        let config = SizeLimitConfig {
            max_body_size: 10,
            max_header_size: 0,
        };
        let mut guard = BodySizeGuard::new(&config);
        assert!(guard.observe(11).is_err());
    }

    #[test]
    fn zero_cap_disables_check() {
        let config = SizeLimitConfig {
            max_body_size: 0,
            max_header_size: 0,
        };
        let mut guard = BodySizeGuard::new(&config);
        assert!(guard.observe(usize::MAX / 2).is_ok());
    }

    #[test]
    fn header_overhead_matches_formula() {
        let headers = vec![("Content-Type", "application/json")];
        let size = SizeValidator::header_byte_size(
            "POST",
            "/v1/chat/completions",
            "HTTP/1.1",
            headers.into_iter(),
        );
        let expected_request_line = "POST".len() + "/v1/chat/completions".len() + "HTTP/1.1".len() + 4;
        let expected_headers = "Content-Type".len() + "application/json".len() + 4;
        assert_eq!(size as usize, expected_request_line + expected_headers);
    }
}
