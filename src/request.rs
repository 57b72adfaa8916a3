use crate::types::Headers;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

static REQUEST_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: usize,
    pub url: Url,
    /// Pseudo-headers first, in the order they will be encoded.
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        let mut full_headers = vec![
            (":method".to_owned(), method.to_string()),
            (":scheme".to_owned(), url.scheme().to_owned()),
            (
                ":authority".to_owned(),
                if let Some(port) = url.port() {
                    format!("{}:{}", url.host_str().expect("URL cannot be a base"), port)
                } else {
                    url.host_str().expect("URL cannot be a base").to_owned()
                },
            ),
            (":path".to_owned(), target(&url)),
        ];
        if let Some(headers) = headers {
            full_headers.extend(headers);
        }
        Self {
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
            url,
            headers: full_headers,
            body: body.into(),
        }
    }

    #[inline]
    pub fn get(url: Url, headers: Option<Headers>) -> Self {
        Self::new(Method::Get, url, headers, Bytes::new())
    }

    #[inline]
    pub fn post(url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, headers, body)
    }

    #[cfg(feature = "json")]
    pub fn post_json(url: Url, body: &impl serde::Serialize) -> anyhow::Result<Self> {
        let mut request = Self::new(Method::Post, url, None, serde_json::to_vec(body)?);
        request
            .headers
            .push(("content-type".to_owned(), "application/json".to_owned()));
        Ok(request)
    }

    pub fn pseudo(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_ref())
    }

    /// True when the caller already manages the connection-level headers
    /// that an HTTP/1.1 upgrade would otherwise inject.
    pub fn has_connection_headers(&self) -> bool {
        self.headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("connection") || k.eq_ignore_ascii_case("upgrade"))
    }
}

/// Path plus query, the way it goes into `:path` and the h1 request line.
fn target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_headers_lead() {
        let request = Request::get("https://example.com:8443/a/b?q=1".try_into().unwrap(), None);
        assert_eq!(request.pseudo(":method"), Some("GET"));
        assert_eq!(request.pseudo(":scheme"), Some("https"));
        assert_eq!(request.pseudo(":authority"), Some("example.com:8443"));
        assert_eq!(request.pseudo(":path"), Some("/a/b?q=1"));
    }

    #[test]
    fn ids_are_distinct() {
        let url: Url = "https://example.com/".try_into().unwrap();
        let a = Request::get(url.clone(), None);
        let b = Request::get(url, None);
        assert_ne!(a.id, b.id);
    }
}
