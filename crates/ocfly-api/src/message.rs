// CoAP request/response values exchanged with a transport.
//
// These are framing-agnostic: a `Connection` implementation turns them
// into datagrams or TCP frames. Only the fields the SDK actually sets
// are modelled here.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── ContentFormat ───────────────────────────────────────────────────

/// CoAP Content-Format option value (the payload media type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT_PLAIN: Self = Self(0);
    pub const APP_LINK_FORMAT: Self = Self(40);
    pub const APP_OCTET_STREAM: Self = Self(42);
    pub const APP_JSON: Self = Self(50);
    pub const APP_CBOR: Self = Self(60);
    /// `application/vnd.ocf+cbor`, the default for OCF resources.
    pub const APP_OCF_CBOR: Self = Self(10000);

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "text/plain",
            40 => "application/link-format",
            42 => "application/octet-stream",
            50 => "application/json",
            60 => "application/cbor",
            10000 => "application/vnd.ocf+cbor",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            "unknown" => write!(f, "content-format {}", self.0),
            name => f.write_str(name),
        }
    }
}

// ── Method ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

// ── ResponseCode ────────────────────────────────────────────────────

/// CoAP response code (class.detail).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    UnsupportedContentFormat,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
    GatewayTimeout,
    Other(u8),
}

impl ResponseCode {
    /// Raw code byte: class in the upper 3 bits, detail in the lower 5.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0x41,
            Self::Deleted => 0x42,
            Self::Valid => 0x43,
            Self::Changed => 0x44,
            Self::Content => 0x45,
            Self::BadRequest => 0x80,
            Self::Unauthorized => 0x81,
            Self::BadOption => 0x82,
            Self::Forbidden => 0x83,
            Self::NotFound => 0x84,
            Self::MethodNotAllowed => 0x85,
            Self::NotAcceptable => 0x86,
            Self::UnsupportedContentFormat => 0x8f,
            Self::InternalServerError => 0xa0,
            Self::NotImplemented => 0xa1,
            Self::ServiceUnavailable => 0xa3,
            Self::GatewayTimeout => 0xa4,
            Self::Other(raw) => raw,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x41 => Self::Created,
            0x42 => Self::Deleted,
            0x43 => Self::Valid,
            0x44 => Self::Changed,
            0x45 => Self::Content,
            0x80 => Self::BadRequest,
            0x81 => Self::Unauthorized,
            0x82 => Self::BadOption,
            0x83 => Self::Forbidden,
            0x84 => Self::NotFound,
            0x85 => Self::MethodNotAllowed,
            0x86 => Self::NotAcceptable,
            0x8f => Self::UnsupportedContentFormat,
            0xa0 => Self::InternalServerError,
            0xa1 => Self::NotImplemented,
            0xa3 => Self::ServiceUnavailable,
            0xa4 => Self::GatewayTimeout,
            other => Self::Other(other),
        }
    }

    pub fn class(self) -> u8 {
        self.as_u8() >> 5
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    pub fn is_server_error(self) -> bool {
        self.class() == 5
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.as_u8();
        write!(f, "{}.{:02}", raw >> 5, raw & 0x1f)
    }
}

// ── Request / Response ──────────────────────────────────────────────

/// A single CoAP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub href: String,
    /// Uri-Query options, each already in `key=value` form.
    pub queries: Vec<String>,
    pub content_format: Option<ContentFormat>,
    pub accept: Option<ContentFormat>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, href: impl Into<String>) -> Self {
        Self {
            method,
            href: href.into(),
            queries: Vec::new(),
            content_format: None,
            accept: None,
            body: Vec::new(),
        }
    }

    pub fn get(href: impl Into<String>) -> Self {
        Self::new(Method::Get, href)
    }

    pub fn post(href: impl Into<String>) -> Self {
        Self::new(Method::Post, href)
    }

    pub fn delete(href: impl Into<String>) -> Self {
        Self::new(Method::Delete, href)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.queries.push(query.into());
        self
    }

    pub fn with_queries<I, S>(mut self, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queries.extend(queries.into_iter().map(Into::into));
        self
    }

    pub fn with_accept(mut self, accept: ContentFormat) -> Self {
        self.accept = Some(accept);
        self
    }

    pub fn with_body(mut self, content_format: ContentFormat, body: Vec<u8>) -> Self {
        self.content_format = Some(content_format);
        self.body = body;
        self
    }
}

/// A single CoAP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub content_format: Option<ContentFormat>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            content_format: None,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, content_format: ContentFormat, body: Vec<u8>) -> Self {
        self.content_format = Some(content_format);
        self.body = body;
        self
    }

    /// Turn a non-success response into a [`crate::Error::Status`].
    pub fn into_result(self, href: &str) -> Result<Self, crate::Error> {
        if self.code.is_success() {
            Ok(self)
        } else {
            Err(crate::Error::Status {
                code: self.code,
                href: href.to_owned(),
            })
        }
    }
}

// ── Query helpers ───────────────────────────────────────────────────

/// `if=<interface>` query option.
pub fn interface_query(interface: &str) -> String {
    format!("if={interface}")
}

/// `rt=<resource type>` query option.
pub fn resource_type_query(resource_type: &str) -> String {
    format!("rt={resource_type}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn response_code_display_uses_dotted_form() {
        assert_eq!(ResponseCode::Content.to_string(), "2.05");
        assert_eq!(ResponseCode::NotFound.to_string(), "4.04");
        assert_eq!(ResponseCode::ServiceUnavailable.to_string(), "5.03");
    }

    #[test]
    fn response_code_raw_values_survive() {
        for raw in [0x41, 0x44, 0x45, 0x83, 0x84, 0xa0, 0xa3, 0x9c] {
            assert_eq!(ResponseCode::from_u8(raw).as_u8(), raw);
        }
        assert_eq!(ResponseCode::from_u8(0x9c), ResponseCode::Other(0x9c));
    }

    #[test]
    fn non_success_response_becomes_status_error() {
        let err = Response::new(ResponseCode::Forbidden)
            .into_result("/oic/sec/pstat")
            .unwrap_err();
        assert!(err.is_forbidden());
        assert!(Response::new(ResponseCode::Changed).into_result("/x").is_ok());
    }

    #[test]
    fn request_builder_collects_queries() {
        let req = Request::get("/oic/res")
            .with_query(resource_type_query("oic.wk.d"))
            .with_queries([interface_query("oic.if.baseline")])
            .with_accept(ContentFormat::APP_OCF_CBOR);
        assert_eq!(req.queries, vec!["rt=oic.wk.d", "if=oic.if.baseline"]);
        assert_eq!(req.method.to_string(), "GET");
        assert_eq!(req.accept, Some(ContentFormat::APP_OCF_CBOR));
    }
}
