//! ApiVersions response clamping.
//!
//! A client uses the highest version both it and the broker support. For the
//! APIs the relay rewrites, the broker's advertised range is narrowed to what
//! the matching rewriter decodes, so a newer broker cannot lead the client
//! into a response the relay would have to refuse.

use kafka_protocol::messages::{ApiKey, ApiVersionsResponse};
use kafka_protocol::protocol::{Message, VersionRange};
use tracing::{debug, warn};

use crate::broker::BrokerRegistry;
use crate::error::Result;

use super::{decode_response, encode_response, ResponseRewriter, RewriteOutcome};

/// Caps the advertised versions of the rewritten APIs.
#[derive(Debug, Clone, Default)]
pub struct ApiVersionsRewriter {
    /// `(api_key, min_version, max_version)` the relay can rewrite.
    limits: Vec<(i16, i16, i16)>,
}

impl ApiVersionsRewriter {
    /// Cap each listed API at its decodable range.
    pub fn new(limits: impl IntoIterator<Item = (ApiKey, VersionRange)>) -> Self {
        Self {
            limits: limits
                .into_iter()
                .map(|(api, range)| (api as i16, range.min, range.max))
                .collect(),
        }
    }

    fn limit(&self, api_key: i16) -> Option<(i16, i16)> {
        self.limits
            .iter()
            .find(|(key, _, _)| *key == api_key)
            .map(|(_, min, max)| (*min, *max))
    }
}

impl ResponseRewriter for ApiVersionsRewriter {
    fn api_key(&self) -> ApiKey {
        ApiKey::ApiVersions
    }

    fn name(&self) -> &'static str {
        "ApiVersions"
    }

    fn versions(&self) -> VersionRange {
        ApiVersionsResponse::VERSIONS
    }

    fn rewrite(
        &self,
        version: i16,
        frame: &[u8],
        _registry: &BrokerRegistry,
    ) -> Result<RewriteOutcome> {
        let range = self.versions();
        if version < range.min || version > range.max {
            warn!(
                version,
                max = range.max,
                "ApiVersions response too new to clamp, forwarding unmodified"
            );
            return Ok(RewriteOutcome::passthrough());
        }

        let (header, mut response) = match decode_response::<ApiVersionsResponse>(frame, version) {
            Ok(decoded) => decoded,
            Err(e) => {
                // A broker that does not know the requested version answers
                // with an error at v0 so the client can retry lower.
                return match decode_response::<ApiVersionsResponse>(frame, 0) {
                    Ok((_, fallback)) if fallback.error_code != 0 => {
                        debug!(
                            error_code = fallback.error_code,
                            "ApiVersions error response, forwarding unmodified"
                        );
                        Ok(RewriteOutcome::passthrough())
                    }
                    _ => Err(e),
                };
            }
        };
        if response.error_code != 0 {
            return Ok(RewriteOutcome::passthrough());
        }

        let mut clamped = 0;
        for api in &mut response.api_keys {
            let Some((min, max)) = self.limit(api.api_key) else {
                continue;
            };
            let narrowed = (api.min_version.max(min), api.max_version.min(max));
            if narrowed != (api.min_version, api.max_version) {
                debug!(
                    api_key = api.api_key,
                    broker_max = api.max_version,
                    max = narrowed.1,
                    "narrowed advertised versions"
                );
                api.min_version = narrowed.0;
                api.max_version = narrowed.1;
                clamped += 1;
            }
        }

        if clamped == 0 {
            return Ok(RewriteOutcome::passthrough());
        }
        Ok(RewriteOutcome {
            frame: Some(encode_response(&header, &response, version)?),
            rewritten: clamped,
            misses: 0,
        })
    }
}
