//! HMAC signature sub-validator

use hmac::{Hmac, Mac};
use moray_core::RequestContext;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Authorization scheme carried by signed requests
pub const SCHEME: &str = "HMAC-SHA256";

/// Header whose value is folded into the string-to-sign
pub const HEADER_SIGN_DATE: &str = "X-Sign-Date";

/// HMAC signature verification spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureSpec {
    /// Shared secrets keyed by access key id
    #[serde(default, rename = "accessKeys")]
    pub access_keys: HashMap<String, String>,
}

/// Compute the request signature a client must send.
///
/// The string-to-sign is `method`, `path`, and the `X-Sign-Date` value
/// joined by newlines; the signature is its hex-encoded HMAC-SHA256 under
/// the access key's secret.
pub fn sign(secret: &str, method: &str, path: &str, date: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(string_to_sign(method, path, date).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn string_to_sign(method: &str, path: &str, date: &str) -> String {
    format!("{method}\n{path}\n{date}")
}

/// Verifies `Authorization: HMAC-SHA256 Credential=<id>,Signature=<hex>`
/// against the configured access keys
#[derive(Debug)]
pub(super) struct SignatureValidator {
    access_keys: HashMap<String, String>,
}

impl SignatureValidator {
    pub(super) fn new(spec: SignatureSpec) -> Self {
        Self {
            access_keys: spec.access_keys,
        }
    }

    pub(super) fn validate(&self, ctx: &RequestContext) -> bool {
        let Some(auth) = ctx.header(http::header::AUTHORIZATION.as_str()) else {
            return false;
        };
        let Some((access_key_id, signature)) = parse_authorization(auth) else {
            debug!(header = auth, "malformed signature authorization header");
            return false;
        };
        let Some(secret) = self.access_keys.get(access_key_id) else {
            return false;
        };
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };

        let date = ctx.header(HEADER_SIGN_DATE).unwrap_or_default();
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(string_to_sign(ctx.method(), ctx.path(), date).as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

fn parse_authorization(auth: &str) -> Option<(&str, &str)> {
    let rest = auth.strip_prefix(SCHEME)?.trim_start();
    let mut access_key_id = None;
    let mut signature = None;
    for part in rest.split(',') {
        match part.trim().split_once('=') {
            Some(("Credential", v)) => access_key_id = Some(v),
            Some(("Signature", v)) => signature = Some(v),
            _ => return None,
        }
    }
    Some((access_key_id?, signature?))
}
