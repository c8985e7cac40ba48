//! Module with the HTTP methods the engine accepts.

use std::fmt;

/// HTTP request method.
///
/// RFC 7231 section 4. Only `GET` and `POST` are supported; requests with
/// any other method are rejected during parsing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Method {
    /// GET method.
    ///
    /// RFC 7231 section 4.3.1.
    #[default]
    Get,
    /// POST method.
    ///
    /// RFC 7231 section 4.3.3.
    Post,
}

impl Method {
    /// Returns the method as string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
