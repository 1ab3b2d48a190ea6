use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

type HmacSha256 = Hmac<Sha256>;

const AMZ_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

#[derive(Debug, Clone)]
pub struct SigV4Error(pub String);

impl std::fmt::Display for SigV4Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sigv4: {}", self.0)
    }
}

impl std::error::Error for SigV4Error {}

/// AWS Signature Version 4 over one Bedrock invocation. Produces the
/// headers to attach; the caller owns the request itself.
pub struct SigV4Signer<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

impl SigV4Signer<'_> {
    pub fn sign_headers(
        &self,
        host: &str,
        path: &str,
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Result<Vec<(String, String)>, SigV4Error> {
        let amz_date = now
            .format(AMZ_FORMAT)
            .map_err(|err| SigV4Error(format!("format amz date: {err}")))?;
        let date = now
            .format(DATE_FORMAT)
            .map_err(|err| SigV4Error(format!("format date: {err}")))?;

        let payload_hash = hex(&Sha256::digest(payload));

        let mut canonical_headers: BTreeMap<&str, String> = BTreeMap::new();
        canonical_headers.insert("host", host.to_string());
        canonical_headers.insert("x-amz-date", amz_date.clone());

        let signed_headers = canonical_headers
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .join(";");
        let canonical_header_block: String = canonical_headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();

        let canonical_request = format!(
            "POST\n{}\n\n{}\n{}\n{}",
            canonical_uri(path),
            canonical_header_block,
            signed_headers,
            payload_hash
        );

        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex(&Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let k_region = hmac(&k_date, self.region.as_bytes())?;
        let k_service = hmac(&k_region, self.service.as_bytes())?;
        let k_signing = hmac(&k_service, b"aws4_request")?;
        let signature = hex(&hmac(&k_signing, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );

        Ok(vec![
            ("x-amz-date".to_string(), amz_date),
            ("authorization".to_string(), authorization),
        ])
    }
}

fn canonical_uri(path: &str) -> String {
    // Bedrock model ids carry ':' which must be double-encoded in the
    // canonical URI.
    path.split('/')
        .map(|segment| segment.replace(':', "%3A"))
        .collect::<Vec<_>>()
        .join("/")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigV4Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| SigV4Error(format!("hmac key: {err}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn signature_is_deterministic_for_fixed_time() {
        let signer = SigV4Signer {
            access_key: "AKIDEXAMPLE",
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            region: "us-east-1",
            service: "bedrock",
        };
        let now = datetime!(2024-01-15 12:00:00 UTC);
        let first = signer
            .sign_headers("bedrock-runtime.us-east-1.amazonaws.com", "/model/anthropic.claude-3-sonnet-v1:0/invoke", b"{}", now)
            .unwrap();
        let second = signer
            .sign_headers("bedrock-runtime.us-east-1.amazonaws.com", "/model/anthropic.claude-3-sonnet-v1:0/invoke", b"{}", now)
            .unwrap();
        assert_eq!(first, second);
        assert!(first[1].1.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240115/"));
    }

    #[test]
    fn model_colon_is_double_encoded() {
        assert_eq!(
            canonical_uri("/model/anthropic.claude-v1:0/invoke"),
            "/model/anthropic.claude-v1%3A0/invoke"
        );
    }
}
