//! S3-compatible object store (AWS S3, MinIO, GCS interop, Azure gateways)
//!
//! Uses path-style addressing (`endpoint/bucket/key`) so MinIO and other
//! self-hosted endpoints work without virtual-host DNS.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use tracing::debug;

use super::sigv4::{uri_encode, SigV4Signer};
use super::{validate_object_key, ObjectInfo, ObjectStore, StoredObject};
use crate::error::{Error, Result};

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Endpoint host[:port], optionally with an http(s):// scheme.
    /// `None` targets AWS (`s3.<region>.amazonaws.com`).
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Used when `endpoint` carries no scheme
    pub use_ssl: bool,
    /// Prepended to every object key
    pub path_prefix: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request bound including the body transfer; `None` leaves
    /// large uploads to the caller's own deadline
    pub request_timeout: Option<Duration>,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: true,
            path_prefix: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
        }
    }
}

/// S3 client speaking the REST API directly
pub struct S3ObjectStore {
    client: Client,
    signer: SigV4Signer,
    scheme: &'static str,
    host: String,
    prefix: String,
}

impl S3ObjectStore {
    /// Build a client for the given settings
    pub fn new(settings: S3Settings) -> Result<Self> {
        let (scheme, host) =
            split_endpoint(settings.endpoint.as_deref(), settings.use_ssl, &settings.region);
        if host.is_empty() {
            return Err(Error::Config("S3 endpoint host is empty".to_string()));
        }

        let mut builder = Client::builder().connect_timeout(settings.connect_timeout);
        if let Some(timeout) = settings.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        let prefix = settings
            .path_prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/", p))
            .unwrap_or_default();

        Ok(Self {
            client,
            signer: SigV4Signer::new(settings.access_key, settings.secret_key, settings.region),
            scheme,
            host,
            prefix,
        })
    }

    /// Full object key including the configured prefix
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn canonical_uri(&self, bucket: &str, key: Option<&str>) -> String {
        match key {
            Some(key) => format!(
                "/{}/{}",
                uri_encode(bucket, true),
                uri_encode(&self.full_key(key), false)
            ),
            None => format!("/{}", uri_encode(bucket, true)),
        }
    }

    async fn send(
        &self,
        method: Method,
        canonical_uri: &str,
        query: &[(String, String)],
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let signed = self.signer.sign(
            method.as_str(),
            &self.host,
            canonical_uri,
            query,
            &body,
            Utc::now(),
        );

        let mut url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);
        if !query.is_empty() {
            let qs = query
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&qs);
        }

        let mut request = self
            .client
            .request(method, &url)
            .header("authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256);
        if let Some(ct) = content_type {
            request = request.header("content-type", ct);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    async fn failure(&self, op: &str, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let code = xml_values(&body, "Code").into_iter().next().unwrap_or_default();
        Error::object_store(
            self.describe(),
            format!("{} returned {} {}", op, status, code).trim_end(),
        )
    }
}

fn split_endpoint(endpoint: Option<&str>, use_ssl: bool, region: &str) -> (&'static str, String) {
    let default_scheme = if use_ssl { "https" } else { "http" };
    match endpoint {
        Some(ep) => {
            let (scheme, host) = if let Some(host) = ep.strip_prefix("https://") {
                ("https", host)
            } else if let Some(host) = ep.strip_prefix("http://") {
                ("http", host)
            } else {
                (default_scheme, ep)
            };
            (scheme, host.trim_end_matches('/').to_string())
        }
        None => (default_scheme, format!("s3.{}.amazonaws.com", region)),
    }
}

/// Extract the text of every `<tag>...</tag>` element, in document order.
fn xml_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn parse_list_page(xml: &str) -> (Vec<ObjectInfo>, Option<String>) {
    let mut objects = Vec::new();
    for block in xml.split("<Contents>").skip(1) {
        let block = block.split("</Contents>").next().unwrap_or_default();
        let Some(key) = xml_values(block, "Key").into_iter().next() else {
            continue;
        };
        let size = xml_values(block, "Size")
            .into_iter()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let last_modified = xml_values(block, "LastModified")
            .into_iter()
            .next()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc));
        objects.push(ObjectInfo {
            key,
            size,
            last_modified,
        });
    }

    let truncated = xml_values(xml, "IsTruncated")
        .first()
        .map(|v| v == "true")
        .unwrap_or(false);
    let token = if truncated {
        xml_values(xml, "NextContinuationToken").into_iter().next()
    } else {
        None
    };
    (objects, token)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        validate_object_key(key)?;
        let uri = self.canonical_uri(bucket, Some(key));
        let size = data.len();
        let response = self.send(Method::PUT, &uri, &[], data, content_type).await?;
        if !response.status().is_success() {
            return Err(self.failure("PutObject", response).await);
        }
        debug!(endpoint = %self.host, bucket, key, size, "PutObject ok");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        let uri = self.canonical_uri(bucket, Some(key));
        let response = self.send(Method::GET, &uri, &[], Bytes::new(), None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.failure("GetObject", response).await);
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response.bytes().await?;
        Ok(Some(StoredObject { data, content_type }))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool> {
        let uri = self.canonical_uri(bucket, Some(key));
        let response = self
            .send(Method::DELETE, &uri, &[], Bytes::new(), None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(self.failure("DeleteObject", response).await);
        }
        Ok(true)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        let uri = self.canonical_uri(bucket, Some(key));
        let response = self.send(Method::HEAD, &uri, &[], Bytes::new(), None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.failure("HeadObject", response).await);
        }
        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc));
        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size,
            last_modified,
        }))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let uri = self.canonical_uri(bucket, None);
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), self.full_key(prefix)),
            ];
            if let Some(t) = token.take() {
                query.push(("continuation-token".to_string(), t));
            }

            let response = self.send(Method::GET, &uri, &query, Bytes::new(), None).await?;
            if !response.status().is_success() {
                return Err(self.failure("ListObjectsV2", response).await);
            }
            let body = response.text().await?;
            let (page, next) = parse_list_page(&body);
            objects.extend(page.into_iter().map(|mut o| {
                if let Some(stripped) = o.key.strip_prefix(&self.prefix) {
                    o.key = stripped.to_string();
                }
                o
            }));

            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn probe(&self, bucket: &str) -> Result<()> {
        let uri = self.canonical_uri(bucket, None);
        let response = self.send(Method::HEAD, &uri, &[], Bytes::new(), None).await?;
        if !response.status().is_success() {
            return Err(self.failure("HeadBucket", response).await);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3:{}://{}", self.scheme, self.host)
    }
}

// =============================================================================
// Tests
// =============================================================================
