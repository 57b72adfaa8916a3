use crate::types::Headers;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Response {
    pub headers: Headers,
    pub body: Bytes,
    /// Fields from a trailing header block, kept apart from `headers`.
    pub trailers: Headers,
}

impl Response {
    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        find(&self.headers, key.as_ref())
    }

    pub fn trailer(&self, key: impl AsRef<str>) -> Option<&str> {
        find(&self.trailers, key.as_ref())
    }

    pub fn status(&self) -> u16 {
        self.header(":status")
            .expect("no status in response")
            .parse()
            .expect("non-number status")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

fn find<'a>(headers: &'a Headers, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_ref())
}
