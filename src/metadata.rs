//! Headers-stream encoding
//!
//! The headers stream of every entry holds a `CacheMetadata` record encoded
//! with MessagePack. It carries everything needed to rebuild the request and
//! the response except the body and side data, which live in their own
//! streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheStorageError;
use crate::types::{FetchRequest, HeaderList, Response, ResponseType};

/// Encoding format version
const METADATA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub method: String,
    pub headers: HeaderList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub status: u16,
    pub status_text: String,
    pub response_type: ResponseType,
    pub headers: HeaderList,
    pub url_list: Vec<String>,
    pub response_time: DateTime<Utc>,
    pub cors_exposed_header_names: Vec<String>,
}

/// Everything stored in the headers stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    version: u8,
    /// Full request URL; the entry key drops the fragment
    pub url: String,
    pub request: RequestMetadata,
    pub response: ResponseMetadata,
    /// When the entry was written; orders query results
    pub entry_time: DateTime<Utc>,
}

impl CacheMetadata {
    pub fn new(request: &FetchRequest, response: &Response, entry_time: DateTime<Utc>) -> Self {
        Self {
            version: METADATA_VERSION,
            url: request.url.clone(),
            request: RequestMetadata {
                method: request.method.clone(),
                headers: request.headers.clone(),
            },
            response: ResponseMetadata {
                status: response.status,
                status_text: response.status_text.clone(),
                response_type: response.response_type,
                headers: response.headers.clone(),
                url_list: response.url_list.clone(),
                response_time: response.response_time,
                cors_exposed_header_names: response.cors_exposed_header_names.clone(),
            },
            entry_time,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheStorageError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheStorageError> {
        let metadata: CacheMetadata = rmp_serde::from_slice(bytes)?;
        if metadata.version != METADATA_VERSION {
            return Err(CacheStorageError::storage(format!(
                "unsupported metadata version {} (expected {})",
                metadata.version, METADATA_VERSION
            )));
        }
        Ok(metadata)
    }

    /// Rebuild the stored request
    pub fn to_request(&self) -> FetchRequest {
        FetchRequest {
            url: self.url.clone(),
            method: self.request.method.clone(),
            headers: self.request.headers.clone(),
        }
    }

    /// Rebuild the stored response without body or side data
    pub fn to_response(&self) -> Response {
        Response {
            url_list: self.response.url_list.clone(),
            status: self.response.status,
            status_text: self.response.status_text.clone(),
            response_type: self.response.response_type,
            headers: self.response.headers.clone(),
            body: None,
            side_data: None,
            response_time: self.response.response_time,
            cors_exposed_header_names: self.response.cors_exposed_header_names.clone(),
        }
    }

    /// Header names listed by the stored response's Vary header.
    /// `None` means `Vary: *`, which never matches.
    pub fn vary_header_names(&self) -> Option<Vec<String>> {
        let mut names = Vec::new();
        for (name, value) in &self.response.headers {
            if !name.eq_ignore_ascii_case("vary") {
                continue;
            }
            for field in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                if field == "*" {
                    return None;
                }
                names.push(field.to_string());
            }
        }
        Some(names)
    }

    /// Rough in-memory footprint of the rebuilt request/response, used to
    /// bound query result sets
    pub fn estimated_size(&self) -> u64 {
        let headers = |list: &HeaderList| -> usize { list.iter().map(|(n, v)| n.len() + v.len()).sum() };
        let total = self.url.len()
            + self.request.method.len()
            + headers(&self.request.headers)
            + self.response.status_text.len()
            + headers(&self.response.headers)
            + self.response.url_list.iter().map(String::len).sum::<usize>()
            + self
                .response
                .cors_exposed_header_names
                .iter()
                .map(String::len)
                .sum::<usize>();
        total as u64
    }
}
