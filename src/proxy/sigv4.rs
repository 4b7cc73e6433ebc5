//! Minimal AWS SigV4 request signer.
//!
//! Supports header-based `Authorization: AWS4-HMAC-SHA256 ...` signing of a
//! request whose body is fully available (the placeholder/streaming path is
//! not used for AWS requests since a signature covers the whole body).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Short-lived AWS credentials used to sign one request.
#[derive(Clone)]
pub struct AwsCredentials {
    /// AWS access key id.
    pub access_key_id: String,
    /// AWS secret access key.
    pub secret_access_key: String,
    /// Session token, for STS-issued temporary credentials.
    pub session_token: Option<String>,
}

/// Everything needed to compute a SigV4 signature for one request.
pub struct SignableRequest<'a> {
    /// HTTP method, upper-case (`"GET"`, `"POST"`, ...).
    pub method: &'a str,
    /// Request path, already percent-encoded.
    pub path: &'a str,
    /// Raw (unsorted) query string, without the leading `?`.
    pub query: &'a str,
    /// Target host, e.g. `"dynamodb.us-east-1.amazonaws.com"`.
    pub host: &'a str,
    /// Region inferred from the host (e.g. `"us-east-1"`).
    pub region: &'a str,
    /// AWS service name (e.g. `"execute-api"`, `"dynamodb"`).
    pub service: &'a str,
    /// Request body bytes.
    pub body: &'a [u8],
}

/// Computed `Authorization` header value plus the companion headers that
/// must also be set (`x-amz-date`, `x-amz-content-sha256`, and, if present,
/// `x-amz-security-token`).
pub struct SignedHeaders {
    /// Value for the `Authorization` header.
    pub authorization: String,
    /// Value for the `x-amz-date` header.
    pub amz_date: String,
    /// Value for the `x-amz-content-sha256` header.
    pub content_sha256: String,
    /// Value for `x-amz-security-token`, when the credentials carry one.
    pub security_token: Option<String>,
}

/// Sign `req` with `creds`, returning the headers to attach.
#[must_use]
pub fn sign(req: &SignableRequest<'_>, creds: &AwsCredentials) -> SignedHeaders {
    let now = OffsetDateTime::now_utc();
    let amz_date = format_amz_date(now);
    let date_stamp = &amz_date[..8];

    let content_sha256 = hex(&Sha256::digest(req.body));

    let canonical_headers = format!(
        "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
        req.host, content_sha256, amz_date
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method, req.path, req.query, canonical_headers, signed_headers, content_sha256
    );

    let credential_scope = format!("{date_stamp}/{}/{}/aws4_request", req.region, req.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex(&Sha256::digest(canonical_request.as_bytes()))
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, date_stamp, req.region, req.service);
    let signature = hex(&hmac(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        creds.access_key_id
    );

    SignedHeaders {
        authorization,
        amz_date,
        content_sha256,
        security_token: creds.session_token.clone(),
    }
}

fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn format_amz_date(t: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_the_same_instant_and_inputs() {
        let creds = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        };
        let req = SignableRequest {
            method: "GET",
            path: "/",
            query: "",
            host: "examplebucket.s3.amazonaws.com",
            region: "us-east-1",
            service: "s3",
            body: b"",
        };

        let s1 = sign(&req, &creds);
        let s2 = sign(&req, &creds);
        // Both signed within the same wall-clock second should match; if the
        // clock ticked between calls this assertion still holds for the date.
        assert_eq!(s1.amz_date[..8], s2.amz_date[..8]);
        assert!(s1.authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    }

    #[test]
    fn session_token_is_carried_through_when_present() {
        let creds = AwsCredentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("sessiontoken".to_string()),
        };
        let req = SignableRequest {
            method: "GET",
            path: "/",
            query: "",
            host: "host.amazonaws.com",
            region: "us-east-1",
            service: "execute-api",
            body: b"",
        };
        let signed = sign(&req, &creds);
        assert_eq!(signed.security_token.as_deref(), Some("sessiontoken"));
    }
}
