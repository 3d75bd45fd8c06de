//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outgoing requests always sign `(request-target) host date digest`.
//! Incoming requests are verified against headers captured at receipt,
//! so verification can run later on a queue worker.

use crate::error::{AppError, SignatureError};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// `Date` header format (RFC 7231 IMF-fixdate)
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Request headers captured at receipt, keyed by lower-cased name.
///
/// Repeated headers are joined with `", "`.
pub type CapturedHeaders = BTreeMap<String, String>;

/// Copy request headers into a serializable map.
pub fn capture_headers(headers: &http::HeaderMap) -> CapturedHeaders {
    let mut captured = CapturedHeaders::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        captured
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    captured
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request
///
/// Creates HTTP Signature header for outgoing requests.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PKCS#8 PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     Some(&body),
///     &private_key,
///     "https://my.server/actors/me#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(method, url, body, private_key_pem, key_id, Utc::now())
}

/// [`sign_request`] with an explicit `Date`.
pub fn sign_request_at(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    date: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = request_host(&parsed_url)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let date = date.format(HTTP_DATE_FORMAT).to_string();
    let digest = body.map(generate_digest);

    // 2. Build signing string
    let mut signing_parts = vec![
        format!(
            "(request-target): {} {}",
            method.to_lowercase(),
            path_and_query
        ),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    // 3. Sign with RSA-SHA256
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| SignatureError::InvalidKey(format!("private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    // 4. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// `host` as it appears in the Host header (port kept when non-default).
fn request_host(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Everything a verifier needs about a received request.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    /// Path and query as received
    pub path: &'a str,
    pub headers: &'a CapturedHeaders,
    /// Digest computed from the raw body bytes, if a body was received
    pub body_digest: Option<&'a str>,
}

impl SignedRequest<'_> {
    fn header(&self, name: &'static str) -> Result<&str, SignatureError> {
        self.headers
            .get(name)
            .map(String::as_str)
            .ok_or(SignatureError::MissingHeader(name))
    }
}

/// Verify an HTTP request signature
///
/// # Arguments
/// * `request` - Captured request data
/// * `public_key_pem` - RSA public key in SPKI PEM format
/// * `now` - Verification time
/// * `max_skew_seconds` - Accepted distance between `Date` and `now`
///
/// # Errors
/// A [`SignatureError`] naming the failed check. The `Digest` header is
/// compared against `request.body_digest` before the signature itself,
/// and the date window is enforced even when the signature is valid.
pub fn verify_signature(
    request: &SignedRequest<'_>,
    public_key_pem: &str,
    now: DateTime<Utc>,
    max_skew_seconds: i64,
) -> Result<(), SignatureError> {
    // 1. Parse Signature header
    let parsed = parse_signature_header(request.header("signature")?)?;

    // 2. Validate algorithm and required signed headers.
    if !parsed.algorithm.eq_ignore_ascii_case("rsa-sha256")
        && !parsed.algorithm.eq_ignore_ascii_case("hs2019")
    {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.algorithm));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(SignatureError::UnsignedHeader(required));
        }
    }

    if request.body_digest.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(SignatureError::UnsignedHeader("digest"));
    }

    // 3. Verify Date is inside the window.
    let date = DateTime::parse_from_rfc2822(request.header("date")?)
        .map_err(|_| SignatureError::Malformed("invalid Date header".to_string()))?;
    let skew_seconds = now.timestamp() - date.timestamp();
    if skew_seconds.abs() > max_skew_seconds {
        return Err(SignatureError::StaleDate { skew_seconds });
    }

    // 4. If body present, bind the Digest header to the received bytes.
    if let Some(body_digest) = request.body_digest {
        if !digest_header_matches(request.header("digest")?, body_digest) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    // 5. Reconstruct signing string.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", request.method.to_lowercase(), request.path),
            name => request
                .headers
                .get(name)
                .cloned()
                .ok_or_else(|| SignatureError::Malformed(format!("signed header {name} absent")))?,
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Malformed("signature is not base64".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::BadSignature)?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::BadSignature)
}

/// Whether a `Digest` header carries `expected` among its entries.
///
/// Accepts `SHA-256=...` alone or in a comma-separated list with other
/// algorithms; the algorithm name is case-insensitive.
pub fn digest_header_matches(header_value: &str, expected: &str) -> bool {
    let Some((_, expected_hash)) = expected.split_once('=') else {
        return false;
    };
    header_value.split(',').any(|entry| {
        entry
            .trim()
            .split_once('=')
            .is_some_and(|(algorithm, hash)| {
                algorithm.eq_ignore_ascii_case("sha-256") && hash == expected_hash
            })
    })
}

/// Extract keyId from captured headers.
pub fn extract_signature_key_id(headers: &CapturedHeaders) -> Result<String, SignatureError> {
    let signature_header = headers
        .get("signature")
        .ok_or(SignatureError::MissingHeader("signature"))?;

    Ok(parse_signature_header(signature_header)?.key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
/// `algorithm` defaults to `hs2019` and `headers` to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');

            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| SignatureError::Malformed("missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| SignatureError::Malformed("missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Generate an RSA key pair.
///
/// # Returns
/// `(private PKCS#8 PEM, public SPKI PEM)`
pub fn generate_key_pair(bits: usize) -> Result<(String, String), AppError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let mut rng = rand::thread_rng();
    let private_key = rsa::RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("RSA key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("PEM encoding failed: {}", e)))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("PEM encoding failed: {}", e)))?;

    Ok((private_key_pem, public_key_pem))
}
