//! OAuth2 sub-validator: self-encoded JWT or token introspection

use super::jwt::{self, JwtSpec};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use moray_core::{Error, RequestContext, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

const BEARER_PREFIX: &str = "Bearer ";

/// OAuth2 verification spec; exactly one of the two modes should be set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuth2Spec {
    /// Self-encoded access token: a JWT that must carry a `scope` claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtSpec>,

    /// Remote token introspection endpoint
    #[serde(
        default,
        rename = "tokenIntrospect",
        skip_serializing_if = "Option::is_none"
    )]
    pub token_introspect: Option<TokenIntrospectSpec>,
}

/// Token introspection endpoint spec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenIntrospectSpec {
    /// Introspection endpoint URL
    #[serde(rename = "endPoint")]
    pub end_point: String,

    /// Client id sent as a form parameter
    #[serde(default, rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Client secret sent as a form parameter
    #[serde(
        default,
        rename = "clientSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_secret: Option<String>,

    /// Pre-assembled `user:password` credentials; when set, sent as a
    /// Basic Authorization header instead of the client id/secret form
    /// parameters
    #[serde(
        default,
        rename = "basicAuth",
        skip_serializing_if = "Option::is_none"
    )]
    pub basic_auth: Option<String>,

    /// Skip TLS certificate verification towards the endpoint
    #[serde(default, rename = "insecureTls")]
    pub insecure_tls: bool,
}

pub(super) fn check_spec(spec: &OAuth2Spec) -> Result<()> {
    if let Some(jwt) = &spec.jwt {
        jwt::check_spec(jwt)?;
    }
    if let Some(ti) = &spec.token_introspect {
        if ti.end_point.is_empty() {
            return Err(Error::Spec("tokenIntrospect endPoint is required".into()));
        }
    }
    if spec.jwt.is_none() && spec.token_introspect.is_none() {
        return Err(Error::Spec(
            "oauth2 requires either jwt or tokenIntrospect".into(),
        ));
    }
    Ok(())
}

#[derive(Debug)]
pub(super) struct OAuth2Validator {
    jwt: Option<jwt::JwtValidator>,
    introspect: Option<IntrospectValidator>,
}

impl OAuth2Validator {
    pub(super) fn new(spec: OAuth2Spec) -> Result<Self> {
        check_spec(&spec)?;
        Ok(Self {
            jwt: spec.jwt.map(jwt::JwtValidator::new).transpose()?,
            introspect: spec
                .token_introspect
                .map(IntrospectValidator::new)
                .transpose()?,
        })
    }

    pub(super) async fn validate(&self, ctx: &RequestContext) -> bool {
        if let Some(jwt) = &self.jwt {
            let Some(claims) = jwt.validate(ctx) else {
                return false;
            };
            // An access token without a scope grants nothing.
            return matches!(claims.get("scope"), Some(serde_json::Value::String(s)) if !s.is_empty());
        }
        if let Some(introspect) = &self.introspect {
            return introspect.validate(ctx).await;
        }
        false
    }
}

#[derive(Debug)]
struct IntrospectValidator {
    spec: TokenIntrospectSpec,
    client: reqwest::Client,
}

impl IntrospectValidator {
    fn new(spec: TokenIntrospectSpec) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(spec.insecure_tls)
            .build()
            .map_err(|e| Error::Spec(format!("tokenIntrospect client: {e}")))?;
        Ok(Self { spec, client })
    }

    /// POST the bearer token to the endpoint; accept iff `active == true`.
    /// Endpoint failures reject the request (fail closed).
    async fn validate(&self, ctx: &RequestContext) -> bool {
        let Some(token) = ctx
            .header(http::header::AUTHORIZATION.as_str())
            .and_then(|auth| auth.strip_prefix(BEARER_PREFIX))
        else {
            return false;
        };

        let mut form = vec![("token", token.to_string())];
        let mut request = self.client.post(&self.spec.end_point);
        if let Some(basic_auth) = &self.spec.basic_auth {
            request = request.header(
                http::header::AUTHORIZATION,
                format!("Basic {}", BASE64.encode(basic_auth)),
            );
        } else {
            if let Some(client_id) = &self.spec.client_id {
                form.push(("client_id", client_id.clone()));
            }
            if let Some(client_secret) = &self.spec.client_secret {
                form.push(("client_secret", client_secret.clone()));
            }
        }

        let response = match request.form(&form).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(endpoint = %self.spec.end_point, error = %e, "token introspection failed");
                return false;
            }
        };
        let body: serde_json::Value = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(endpoint = %self.spec.end_point, error = %e, "bad introspection response");
                return false;
            }
        };

        body.get("active") == Some(&serde_json::Value::Bool(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_spec_requires_a_mode() {
        assert!(check_spec(&OAuth2Spec::default()).is_err());
    }

    #[test]
    fn test_check_spec_requires_endpoint() {
        let spec = OAuth2Spec {
            jwt: None,
            token_introspect: Some(TokenIntrospectSpec {
                end_point: String::new(),
                client_id: None,
                client_secret: None,
                basic_auth: None,
                insecure_tls: false,
            }),
        };
        assert!(check_spec(&spec).is_err());
    }
}
