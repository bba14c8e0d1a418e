//! Small JSON-over-HTTP client shared by the providers.
//!
//! Transport failures and non-2xx answers map onto the error taxonomy:
//! 404 is [`Error::NotFound`], everything else is [`Error::TransientRemote`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use constel_core::Error;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    headers: HeaderMap,
}

impl HttpClient {
    /// Client with a per-request deadline. System proxies are ignored;
    /// metadata endpoints are link-local.
    pub fn new(timeout: Duration) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(concat!("constel/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            inner,
            headers: HeaderMap::new(),
        })
    }

    /// Add a header sent with every request. `name` must be lowercase.
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {}", name))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    pub fn with_bearer(&self, token: &str) -> Result<Self> {
        self.clone()
            .with_header("authorization", &format!("Bearer {}", token))
    }

    async fn send(&self, req: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let resp = req
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| Error::TransientRemote(format!("request to {} failed: {}", url, e)))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("HTTP 404 for {}", url)).into());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TransientRemote(format!(
                "HTTP {} for {}: {}",
                status,
                url,
                body.trim()
            ))
            .into());
        }
        Ok(resp)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.send(self.inner.get(url), url).await?;
        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to parse JSON from {}", url))
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self.send(self.inner.get(url), url).await?;
        resp.text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.send(self.inner.get(url), url).await?;
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;
        Ok(bytes.to_vec())
    }

    /// Send a JSON body; the response body is discarded.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<()> {
        self.send(self.inner.request(method, url).json(body), url)
            .await?;
        Ok(())
    }
}

/// One page of a paginated list response.
pub trait Page: DeserializeOwned {
    type Item;

    /// The items of this page and the URL of the next page, if any.
    fn into_parts(self, current: &Url) -> (Vec<Self::Item>, Option<Url>);
}

/// Lazy sequence over a paginated list. Pages are fetched on demand;
/// `None` marks the end.
pub struct Pager<P: Page> {
    http: HttpClient,
    next_page: Option<Url>,
    buffer: VecDeque<P::Item>,
}

impl<P: Page> Pager<P> {
    pub fn new(http: HttpClient, first: Url) -> Self {
        Self {
            http,
            next_page: Some(first),
            buffer: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Result<Option<P::Item>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            let Some(url) = self.next_page.take() else {
                return Ok(None);
            };
            let page: P = self.http.get_json(url.as_str()).await?;
            let (items, next) = page.into_parts(&url);
            self.buffer.extend(items);
            self.next_page = next;
        }
    }

    pub async fn collect(mut self) -> Result<Vec<P::Item>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }
}

/// `url` with its `pageToken` query parameter set to `token`.
pub fn with_page_token(url: &Url, token: &str) -> Url {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "pageToken")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut next = url.clone();
    next.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair("pageToken", token);
    next
}

/// OAuth access token as returned by the Azure and GCP metadata servers.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    /// Azure reports seconds as a string, GCP as a number.
    #[serde(default, deserialize_with = "lenient_secs")]
    pub expires_in: u64,
}

fn lenient_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Number(u64),
        Text(String),
    }
    match Secs::deserialize(deserializer)? {
        Secs::Number(n) => Ok(n),
        Secs::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Caches a bearer token until shortly before it expires.
#[derive(Debug, Default)]
pub struct TokenCache {
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenCache {
    const MARGIN: Duration = Duration::from_secs(60);

    /// Return the cached token or fetch a new one from `url`.
    pub async fn get(&self, http: &HttpClient, url: &str) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expiry)) = cached.as_ref() {
            if Instant::now() < *expiry {
                return Ok(token.clone());
            }
        }
        let fresh: AccessToken = http
            .get_json(url)
            .await
            .context("Failed to fetch access token")?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(Self::MARGIN);
        *cached = Some((fresh.access_token.clone(), Instant::now() + lifetime));
        Ok(fresh.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Deserialize)]
    struct NumberPage {
        #[serde(default)]
        items: Vec<u32>,
        #[serde(rename = "nextPageToken")]
        next_page_token: Option<String>,
    }

    impl Page for NumberPage {
        type Item = u32;

        fn into_parts(self, current: &Url) -> (Vec<u32>, Option<Url>) {
            let next = self
                .next_page_token
                .map(|token| with_page_token(current, &token));
            (self.items, next)
        }
    }

    fn client() -> HttpClient {
        HttpClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_pager_follows_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/numbers"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [3]
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/numbers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [1, 2],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/numbers?filter=x", server.uri())).unwrap();
        let mut pager: Pager<NumberPage> = Pager::new(client(), url);
        assert_eq!(pager.next().await.unwrap(), Some(1));
        assert_eq!(pager.next().await.unwrap(), Some(2));
        assert_eq!(pager.next().await.unwrap(), Some(3));
        assert_eq!(pager.next().await.unwrap(), None);
        assert_eq!(pager.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = client()
            .get_text(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(
            constel_core::error::find(&err),
            Some(Error::NotFound(_))
        ));

        let err = client()
            .get_text(&format!("{}/broken", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(
            constel_core::error::find(&err),
            Some(Error::TransientRemote(_))
        ));
        assert!(format!("{}", err).contains("busy"));
    }

    #[tokio::test]
    async fn test_token_cache_reuses_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "expires_in": "3599",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = TokenCache::default();
        let http = client();
        let url = format!("{}/token", server.uri());
        assert_eq!(cache.get(&http, &url).await.unwrap(), "abc");
        assert_eq!(cache.get(&http, &url).await.unwrap(), "abc");
    }

    #[test]
    fn test_with_page_token_replaces_existing() {
        let url = Url::parse("http://x/list?filter=a&pageToken=old").unwrap();
        let next = with_page_token(&url, "new");
        assert_eq!(next.as_str(), "http://x/list?filter=a&pageToken=new");
    }
}
