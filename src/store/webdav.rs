use std::{path::Path, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use quick_xml::escape::unescape;
use regex::Regex;
use reqwest::{Body, Client, Method, RequestBuilder, StatusCode, header};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::{config::WebDavSettings, error::StoreError};

use super::{ObjectStore, RemoteObject, validate_name};

const CONNECT_TIMEOUT_SECS: u64 = 30;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:getcontentlength/><d:resourcetype/></d:prop></d:propfind>"#;

static RESPONSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:[A-Za-z0-9]+:)?response\b[^>]*>(.*?)</(?:[A-Za-z0-9]+:)?response>")
        .expect("valid response regex")
});

static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:[A-Za-z0-9]+:)?href\b[^>]*>\s*([^<]*?)\s*</").expect("valid href regex")
});

static LENGTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:[A-Za-z0-9]+:)?getcontentlength\b[^>]*>\s*(\d+)\s*</")
        .expect("valid length regex")
});

static COLLECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:[A-Za-z0-9]+:)?collection\b").expect("valid collection regex")
});

/// Object store speaking plain WebDAV (PUT/GET/PROPFIND/DELETE) against one collection.
#[derive(Debug, Clone)]
pub struct WebDavStore {
    client: Client,
    base: String,
    username: Option<String>,
    password: Option<String>,
}

fn request_error(err: reqwest::Error) -> StoreError {
    StoreError::Request(err.to_string())
}

impl WebDavStore {
    pub fn new(settings: &WebDavSettings) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(request_error)?;

        let mut base = settings.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(Self {
            client,
            base,
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn url(&self, name: &str) -> Result<String, StoreError> {
        validate_name(name)?;
        Ok(format!("{}{}", self.base, urlencoding::encode(name)))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }
}

#[async_trait]
impl ObjectStore for WebDavStore {
    #[instrument(skip(self, source), fields(base = %self.base))]
    async fn upload(&self, name: &str, source: &Path) -> Result<(), StoreError> {
        let url = self.url(name)?;
        let file = File::open(source).await?;
        let len = file.metadata().await?.len();

        let resp = self
            .request(Method::PUT, &url)
            .header(header::CONTENT_LENGTH, len)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(request_error)?;

        if !resp.status().is_success() {
            return Err(StoreError::Status {
                status: resp.status().as_u16(),
                name: name.to_string(),
            });
        }
        debug!(bytes = len, "uploaded");
        Ok(())
    }

    #[instrument(skip(self, dest), fields(base = %self.base))]
    async fn download(&self, name: &str, dest: &Path) -> Result<(), StoreError> {
        let url = self.url(name)?;
        let mut resp = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(request_error)?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::NotFound(name.to_string())),
            status if !status.is_success() => {
                return Err(StoreError::Status {
                    status: status.as_u16(),
                    name: name.to_string(),
                });
            }
            _ => {}
        }

        let mut out = File::create(dest).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(request_error)? {
            out.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        out.flush().await?;
        out.sync_all().await?;
        debug!(bytes, "downloaded");
        Ok(())
    }

    #[instrument(skip(self), fields(base = %self.base))]
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let propfind = Method::from_bytes(b"PROPFIND")
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let resp = self
            .request(propfind, &self.base)
            .header("Depth", "1")
            .header(header::CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                name: self.base.clone(),
            });
        }

        let body = resp.text().await.map_err(request_error)?;
        let mut objects: Vec<_> = parse_multistatus(&body)?
            .into_iter()
            .filter(|obj| obj.name.starts_with(prefix))
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    #[instrument(skip(self), fields(base = %self.base))]
    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let url = self.url(name)?;
        let resp = self
            .request(Method::DELETE, &url)
            .send()
            .await
            .map_err(request_error)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(name.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(StoreError::Status {
                status: status.as_u16(),
                name: name.to_string(),
            }),
        }
    }
}

/// Extracts the non-collection members of a PROPFIND multistatus document.
fn parse_multistatus(body: &str) -> Result<Vec<RemoteObject>, StoreError> {
    if !body.contains("multistatus") {
        return Err(StoreError::Listing("missing multistatus element".into()));
    }

    let mut objects = Vec::new();
    for response in RESPONSE.captures_iter(body) {
        let inner = &response[1];
        if COLLECTION.is_match(inner) {
            continue;
        }
        let Some(href) = HREF.captures(inner) else {
            continue;
        };
        let Some(name) = member_name(&href[1]) else {
            continue;
        };
        let size = LENGTH
            .captures(inner)
            .and_then(|caps| caps[1].parse().ok());
        objects.push(RemoteObject { name, size });
    }
    Ok(objects)
}

/// Last path segment of an `href`, with XML entities and percent-escapes decoded.
fn member_name(href: &str) -> Option<String> {
    let href = unescape(href).ok()?;
    let segment = href
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())?;
    let bytes = urlencoding::decode_binary(segment.as_bytes());
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
