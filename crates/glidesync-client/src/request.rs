//! Request descriptions and URL validation
//!
//! Every call through the gateway is an `ApiRequest` whose path must match
//! one of the accepted shapes: the versioned JSON families
//! (`/v{1,2}/(import|table|stats|attachment)/...`) or the XML schema
//! endpoint (`/{table}.do?SCHEMA`). Anything else is rejected before a
//! single byte goes on the wire.

use glidesync_core::{GlideError, Result, guid};
use once_cell::sync::Lazy;
use regex::Regex;

pub use reqwest::Method;

static REST_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/v([12])/(import|table|stats|attachment)/([A-Za-z0-9_]+)(?:/([a-z0-9]+))?$")
        .unwrap_or_else(|e| unreachable!("invalid path pattern: {e}"))
});

static SCHEMA_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/([A-Za-z0-9_]+)\.do$")
        .unwrap_or_else(|e| unreachable!("invalid schema pattern: {e}"))
});

/// JSON endpoint family addressed by a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFamily {
    Import,
    Table,
    Stats,
    Attachment,
}

impl ApiFamily {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "import" => Some(ApiFamily::Import),
            "table" => Some(ApiFamily::Table),
            "stats" => Some(ApiFamily::Stats),
            "attachment" => Some(ApiFamily::Attachment),
            _ => None,
        }
    }
}

/// A validated request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPath {
    /// One of the JSON families.
    Rest {
        family: ApiFamily,
        version: u8,
        /// Table name, or the attachment sys_id for the attachment family.
        table: String,
        sys_id: Option<String>,
        /// Attachment file download (`/{sys_id}/file`).
        file: bool,
    },
    /// The XML schema endpoint `/{table}.do?SCHEMA`.
    Schema { table: String },
}

/// Validate a request path and break it into its slots.
pub fn parse_path(path: &str) -> Result<ParsedPath> {
    if let Some(captures) = SCHEMA_PATH.captures(path) {
        return Ok(ParsedPath::Schema {
            table: captures[1].to_string(),
        });
    }

    let captures = REST_PATH
        .captures(path)
        .ok_or_else(|| GlideError::Validation(format!("unrecognized path: {path}")))?;

    let version: u8 = captures[1]
        .parse()
        .unwrap_or_else(|_| unreachable!("pattern only admits digits"));
    let family = ApiFamily::parse(&captures[2])
        .unwrap_or_else(|| unreachable!("pattern only admits known families"));
    let table = captures[3].to_string();
    let tail = captures.get(4).map(|m| m.as_str().to_string());

    let (sys_id, file) = match (family, tail) {
        (ApiFamily::Attachment, Some(tail)) if tail == "file" => (None, true),
        (_, Some(tail)) => {
            if !guid::is_sys_id(&tail) {
                return Err(GlideError::Validation(format!(
                    "malformed sys_id in path: {tail}"
                )));
            }
            (Some(tail), false)
        }
        (_, None) => (None, false),
    };

    if family == ApiFamily::Attachment && !guid::is_sys_id(&table) {
        return Err(GlideError::Validation(format!(
            "attachment path needs a sys_id, got {table}"
        )));
    }

    Ok(ParsedPath::Rest {
        family,
        version,
        table,
        sys_id,
        file,
    })
}

/// One request through the gateway.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ID: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_table_paths() {
        assert_eq!(
            parse_path("/v2/table/u_dm_host").expect("list"),
            ParsedPath::Rest {
                family: ApiFamily::Table,
                version: 2,
                table: "u_dm_host".to_string(),
                sys_id: None,
                file: false,
            }
        );
        assert_eq!(
            parse_path(&format!("/v2/table/u_dm_host/{ID}")).expect("single"),
            ParsedPath::Rest {
                family: ApiFamily::Table,
                version: 2,
                table: "u_dm_host".to_string(),
                sys_id: Some(ID.to_string()),
                file: false,
            }
        );
    }

    #[test]
    fn test_schema_path() {
        assert_eq!(
            parse_path("/u_dm_host.do").expect("schema"),
            ParsedPath::Schema {
                table: "u_dm_host".to_string()
            }
        );
    }

    #[test]
    fn test_attachment_file_path() {
        assert_eq!(
            parse_path(&format!("/v1/attachment/{ID}/file")).expect("file"),
            ParsedPath::Rest {
                family: ApiFamily::Attachment,
                version: 1,
                table: ID.to_string(),
                sys_id: None,
                file: true,
            }
        );
        assert!(parse_path("/v1/attachment/u_dm_host/file").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_path("/v3/table/u_dm_host").is_err());
        assert!(parse_path("/v2/record/u_dm_host").is_err());
        assert!(parse_path("/v2/table/u_dm_host/not-a-guid").is_err());
        assert!(parse_path("/v2/table/u_dm_host/0123").is_err());
        assert!(parse_path("v2/table/u_dm_host").is_err());
    }
}
