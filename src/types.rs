//! Request/response model stored in the cache
//!
//! - `FetchRequest`: the request half of an entry (URL, method, headers)
//! - `Response`: the response half, with its body as a `BlobHandle`
//! - `QueryParams`: matching options shared by Match, MatchAll, Keys and Delete
//! - `BatchOperation`: one Put or Delete inside a batch call

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::BlobHandle;

/// Header list preserving insertion order and duplicate names
pub type HeaderList = Vec<(String, String)>;

/// Case-insensitive header lookup returning the first value
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// The request half of a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: HeaderList,
}

impl FetchRequest {
    /// Create a GET request with no headers
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Response tainting as seen by the Fetch layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Basic,
    Cors,
    #[default]
    Default,
    Error,
    Opaque,
    OpaqueRedirect,
}

/// The response half of a cache entry
#[derive(Debug, Clone)]
pub struct Response {
    /// URLs the response was fetched through; the last one is the final URL
    pub url_list: Vec<String>,
    pub status: u16,
    pub status_text: String,
    pub response_type: ResponseType,
    pub headers: HeaderList,
    /// Response body; `None` for bodiless responses such as 204
    pub body: Option<BlobHandle>,
    /// Side data (e.g. code cache) attached to the stored entry
    pub side_data: Option<BlobHandle>,
    /// When the response was received; the side data staleness fingerprint
    pub response_time: DateTime<Utc>,
    pub cors_exposed_header_names: Vec<String>,
}

impl Response {
    /// Create a basic 200 response with the given body
    pub fn ok(body: Option<BlobHandle>) -> Self {
        Self {
            url_list: Vec::new(),
            status: 200,
            status_text: "OK".to_string(),
            response_type: ResponseType::Default,
            headers: Vec::new(),
            body,
            side_data: None,
            response_time: Utc::now(),
            cors_exposed_header_names: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_response_time(mut self, time: DateTime<Utc>) -> Self {
        self.response_time = time;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Size of the body in bytes, zero when absent
    pub fn body_size(&self) -> u64 {
        self.body.as_ref().map(|b| b.size()).unwrap_or(0)
    }
}

/// Matching options for queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    /// Drop the query string from both URLs before comparing
    pub ignore_search: bool,
    /// Match regardless of HTTP method
    pub ignore_method: bool,
    /// Skip Vary header comparison
    pub ignore_vary: bool,
    /// Carried for the cache set layer; unused here
    pub cache_name: Option<String>,
}

/// One operation of a batch call
///
/// A batch holds either any number of `Put`s or exactly one `Delete`.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Put {
        request: FetchRequest,
        response: Response,
    },
    Delete {
        request: FetchRequest,
        params: QueryParams,
    },
}

impl BatchOperation {
    pub fn is_put(&self) -> bool {
        matches!(self, BatchOperation::Put { .. })
    }
}
