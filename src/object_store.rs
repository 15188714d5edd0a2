//! S3-compatible object store adapter.
//!
//! Key-addressed blobs with per-object user metadata, used for raw
//! documents, checkpoints, the federal pre-parse cache, and workflow
//! scratch state. Requests are signed with AWS Signature V4 using
//! pure-Rust primitives (`hmac`, `sha2`) so the adapter works against any
//! S3-compatible endpoint (MinIO, LocalStack, AWS itself) without a
//! vendor SDK.
//!
//! Semantics: `put` is idempotent (last write wins), `get` on a missing
//! key returns `None`, `list` pages through `ListObjectsV2` continuation
//! tokens. User metadata travels as `x-amz-meta-*` headers.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{Credentials, ObjectStoreConfig};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "object-store";

pub struct ObjectStore {
    client: reqwest::Client,
    scheme: String,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    timeout_secs: u64,
}

impl ObjectStore {
    pub fn new(config: &ObjectStoreConfig, creds: &Credentials) -> Result<Self> {
        let (scheme, host) = split_endpoint(&config.endpoint);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build object store client: {e}")))?;
        Ok(Self {
            client,
            scheme,
            host,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            access_key: creds.object_store_access_key.clone(),
            secret_key: creds.object_store_secret_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// Store a blob under `key` with user metadata. Last write wins.
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let uri = self.object_uri(key);
        let payload_hash = hex_sha256(bytes);

        let mut amz_headers: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{k}"), sanitize_header_value(v)))
            .collect();
        let signed = self.sign("PUT", &uri, "", &payload_hash, &mut amz_headers);

        let url = format!("{}://{}{}", self.scheme, self.host, uri);
        let mut request = self.client.put(&url).body(bytes.to_vec());
        for (name, value) in &signed {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_transport(SERVICE, self.timeout_secs, e))?;
        self.expect_success(response, key, "PUT").await?;
        Ok(())
    }

    /// Fetch a blob and its user metadata. `None` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BTreeMap<String, String>)>> {
        let uri = self.object_uri(key);
        let payload_hash = hex_sha256(b"");
        let mut extra = Vec::new();
        let signed = self.sign("GET", &uri, "", &payload_hash, &mut extra);

        let url = format!("{}://{}{}", self.scheme, self.host, uri);
        let mut request = self.client.get(&url);
        for (name, value) in &signed {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_transport(SERVICE, self.timeout_secs, e))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = self.expect_success(response, key, "GET").await?;

        let metadata = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str().strip_prefix("x-amz-meta-")?;
                Some((name.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();

        let bytes = response.bytes().await.map_err(|e| Error::Api {
            service: SERVICE.to_string(),
            message: format!("body read failed for {key}: {e}"),
        })?;
        Ok(Some((bytes.to_vec(), metadata)))
    }

    /// List keys under a prefix, following continuation tokens.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(ref token) = continuation_token {
                params.push(("continuation-token".to_string(), token.clone()));
            }
            params.sort_by(|a, b| a.0.cmp(&b.0));
            let query: String = params
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");

            let uri = format!("/{}", uri_encode_path(&self.bucket));
            let payload_hash = hex_sha256(b"");
            let mut extra = Vec::new();
            let signed = self.sign("GET", &uri, &query, &payload_hash, &mut extra);

            let url = format!("{}://{}{}?{}", self.scheme, self.host, uri, query);
            let mut request = self.client.get(&url);
            for (name, value) in &signed {
                request = request.header(name, value);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::from_transport(SERVICE, self.timeout_secs, e))?;
            let response = self.expect_success(response, prefix, "LIST").await?;
            let xml = response.text().await.map_err(|e| Error::Api {
                service: SERVICE.to_string(),
                message: format!("list body read failed: {e}"),
            })?;

            let (batch, truncated, next_token) = parse_list_response(&xml);
            keys.extend(batch);

            if truncated {
                continuation_token = next_token;
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }

    /// Delete a blob. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let uri = self.object_uri(key);
        let payload_hash = hex_sha256(b"");
        let mut extra = Vec::new();
        let signed = self.sign("DELETE", &uri, "", &payload_hash, &mut extra);

        let url = format!("{}://{}{}", self.scheme, self.host, uri);
        let mut request = self.client.delete(&url);
        for (name, value) in &signed {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_transport(SERVICE, self.timeout_secs, e))?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        self.expect_success(response, key, "DELETE").await?;
        Ok(())
    }

    /// Serialize `value` as JSON and store it.
    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::Validation(format!(
            "failed to serialize {key}: {e}"
        )))?;
        self.put(key, &bytes, metadata).await
    }

    /// Fetch and deserialize a JSON blob. `None` when the key is absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            None => Ok(None),
            Some((bytes, _)) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Validation(format!("failed to parse {key} as JSON: {e}"))
                })?;
                Ok(Some(value))
            }
        }
    }

    fn object_uri(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            uri_encode_path(&self.bucket),
            key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
        )
    }

    /// Build SigV4 headers for a request. `amz_headers` receives the
    /// date/content-sha256 headers and returns the full signed set.
    fn sign(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_query: &str,
        payload_hash: &str,
        amz_headers: &mut Vec<(String, String)>,
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.append(amz_headers);
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".to_string(), authorization));
        out
    }

    async fn expect_success(
        &self,
        response: reqwest::Response,
        key: &str,
        op: &str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Api {
            service: SERVICE.to_string(),
            message: format!(
                "{op} {key} failed (HTTP {status}): {}",
                body.chars().take(300).collect::<String>()
            ),
        })
    }
}

// ============ Canonical key layout (authoritative) ============

/// Canonical object keys. Fetchers and the orchestrator build keys only
/// through these so the storage check in validation agrees with writers.
pub mod keys {
    pub fn federal_part_xml(title: u32, part: &str) -> String {
        format!("federal/cfr/title-{title}/part-{part}.xml")
    }

    pub fn federal_checkpoint(title: u32) -> String {
        format!("federal/checkpoints/cfr-title-{title}.json")
    }

    pub fn federal_cache_manifest() -> String {
        "cache/federal/manifest.json".to_string()
    }

    pub fn federal_title_manifest(title: u32) -> String {
        format!("cache/federal/title-{title}/manifest.json")
    }

    pub fn federal_cached_part(title: u32, part: &str) -> String {
        format!("cache/federal/title-{title}/part-{part}.json")
    }

    pub fn statute_section_html(code: &str, chapter: &str, section: &str) -> String {
        format!("texas/statutes/{code}/chapter-{chapter}/{section}.html")
    }

    pub fn tac_section_html(title: u32, chapter: &str, section: &str) -> String {
        format!("texas/tac/title-{title}/chapter-{chapter}/{section}.html")
    }

    pub fn texas_checkpoint(pipeline: &str) -> String {
        format!("texas/checkpoints/{pipeline}.json")
    }

    pub fn county_section_html(county_id: &str, chapter: &str, section: &str) -> String {
        format!("counties/{county_id}/chapter-{chapter}/{section}.html")
    }

    pub fn county_checkpoint() -> String {
        "counties/checkpoints/county.json".to_string()
    }

    pub fn municipal_section_json(jurisdiction: &str, chapter: &str, section: &str) -> String {
        format!("municipal/{jurisdiction}/chapter-{chapter}/{section}.json")
    }

    pub fn municipal_raw_page(jurisdiction: &str) -> String {
        format!("municipal/{jurisdiction}/raw/page.md")
    }

    pub fn municipal_checkpoint() -> String {
        "municipal/checkpoints/municipal.json".to_string()
    }

    pub fn workflow_step(workflow: &str, instance: &str, step: &str) -> String {
        format!("workflows/{workflow}/{instance}/{step}.json")
    }

    /// Prefix that must be non-empty for a jurisdiction to count as stored.
    pub fn jurisdiction_prefix(source_type: crate::models::SourceType, identifier: &str) -> String {
        match source_type {
            crate::models::SourceType::Federal => format!("federal/cfr/{identifier}/"),
            crate::models::SourceType::State => format!("texas/{identifier}/"),
            crate::models::SourceType::County => format!("counties/{identifier}/"),
            crate::models::SourceType::Municipal => format!("municipal/{identifier}/"),
        }
    }
}

// ============ SigV4 primitives ============

fn split_endpoint(endpoint: &str) -> (String, String) {
    let (scheme, rest) = endpoint
        .split_once("://")
        .unwrap_or(("https", endpoint));
    (scheme.to_string(), rest.trim_end_matches('/').to_string())
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding used in SigV4 canonical requests.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

fn uri_encode_path(s: &str) -> String {
    s.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Header values must be single-line; metadata occasionally carries
/// headings with embedded newlines.
fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

// ============ ListObjectsV2 XML ============

fn parse_list_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;

    #[test]
    fn canonical_keys_match_the_layout() {
        assert_eq!(
            keys::federal_part_xml(21, "117"),
            "federal/cfr/title-21/part-117.xml"
        );
        assert_eq!(
            keys::federal_checkpoint(21),
            "federal/checkpoints/cfr-title-21.json"
        );
        assert_eq!(
            keys::statute_section_html("PE", "30", "30.02"),
            "texas/statutes/PE/chapter-30/30.02.html"
        );
        assert_eq!(
            keys::tac_section_html(16, "5", "5.31"),
            "texas/tac/title-16/chapter-5/5.31.html"
        );
        assert_eq!(
            keys::county_section_html("TX-48201", "10", "10-3"),
            "counties/TX-48201/chapter-10/10-3.html"
        );
        assert_eq!(
            keys::municipal_raw_page("TX-houston"),
            "municipal/TX-houston/raw/page.md"
        );
        assert_eq!(
            keys::workflow_step("cfr-title", "inst-1", "embed-batch-3"),
            "workflows/cfr-title/inst-1/embed-batch-3.json"
        );
        assert_eq!(
            keys::jurisdiction_prefix(SourceType::County, "TX-48201"),
            "counties/TX-48201/"
        );
    }

    #[test]
    fn list_response_parses_keys_and_pagination() {
        let xml = r#"<?xml version="1.0"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok123</NextContinuationToken>
  <Contents><Key>federal/cfr/title-21/part-117.xml</Key><Size>10</Size></Contents>
  <Contents><Key>federal/cfr/title-21/</Key></Contents>
  <Contents><Key>federal/cfr/title-21/part-1.xml</Key><Size>5</Size></Contents>
</ListBucketResult>"#;
        let (keys, truncated, token) = parse_list_response(xml);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], "federal/cfr/title-21/part-117.xml");
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("tok123"));
    }

    #[test]
    fn signing_key_derivation_matches_aws_reference_vector() {
        // Known vector from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn uri_encoding_is_rfc3986() {
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(uri_encode("part-117.xml"), "part-117.xml");
        assert_eq!(uri_encode_path("a b/c"), "a%20b/c");
    }

    #[test]
    fn header_values_are_single_line() {
        assert_eq!(sanitize_header_value("a\nb\rc"), "a b c");
    }

    #[test]
    fn endpoint_split() {
        assert_eq!(
            split_endpoint("https://storage.example.com/"),
            ("https".to_string(), "storage.example.com".to_string())
        );
        assert_eq!(
            split_endpoint("http://localhost:9000"),
            ("http".to_string(), "localhost:9000".to_string())
        );
    }
}
