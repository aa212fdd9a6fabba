//! HTTP method as a typed enum, plus the router's pseudo-methods.
//!
//! Covers RFC 9110 standard methods, WebDAV extensions (RFC 4918 / 4791 / 3253 / 5323),
//! `PURGE`, and three registration-only pseudo-methods:
//!
//! | Pseudo | Wire spelling | Meaning |
//! |---|---|---|
//! | [`Method::Any`] | `ANY` | expands over the router's Any set |
//! | [`Method::NotFound`] | `404` / `NotFound` | global 404 handler |
//! | [`Method::MethodNotAllowed`] | `405` / `MethodNotAllowed` | global 405 handler |
//!
//! The router itself works on method strings so that methods added at init
//! (e.g. `LOCK`) need no enum variant. The enum exists for the typed facade.

use std::fmt;
use std::str::FromStr;

pub const METHOD_ANY: &str = "ANY";
pub const METHOD_NOT_FOUND: &str = "404";
pub const METHOD_NOT_ALLOWED: &str = "405";

/// Methods recognised for registration unless the router is configured otherwise.
pub const DEFAULT_ALLOWED_METHODS: [&str; 9] =
    ["GET", "POST", "PUT", "DELETE", "HEAD", "PATCH", "OPTIONS", "CONNECT", "TRACE"];

/// Methods an `Any` registration expands into by default.
pub const DEFAULT_ANY_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "HEAD", "PATCH"];

/// A known HTTP method or router pseudo-method.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    // RFC 9110 ─────────────────────────────────────────────────────────────────
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
    // WebDAV RFC 4918 ──────────────────────────────────────────────────────────
    Copy,
    Lock,
    Mkcol,
    Move,
    Propfind,
    Proppatch,
    Unlock,
    // WebDAV extensions ────────────────────────────────────────────────────────
    Mkcalendar, // RFC 4791 — CalDAV
    Report,     // RFC 3253
    Search,     // RFC 5323
    // Cache invalidation ───────────────────────────────────────────────────────
    Purge, // nginx / Varnish
    // Router pseudo-methods ────────────────────────────────────────────────────
    Any,
    NotFound,
    MethodNotAllowed,
}

impl Method {
    /// Returns the registration spelling (e.g. `"GET"`, `"ANY"`, `"404"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect          => "CONNECT",
            Self::Copy             => "COPY",
            Self::Delete           => "DELETE",
            Self::Get              => "GET",
            Self::Head             => "HEAD",
            Self::Lock             => "LOCK",
            Self::Mkcalendar       => "MKCALENDAR",
            Self::Mkcol            => "MKCOL",
            Self::Move             => "MOVE",
            Self::Options          => "OPTIONS",
            Self::Patch            => "PATCH",
            Self::Post             => "POST",
            Self::Propfind         => "PROPFIND",
            Self::Proppatch        => "PROPPATCH",
            Self::Purge            => "PURGE",
            Self::Put              => "PUT",
            Self::Report           => "REPORT",
            Self::Search           => "SEARCH",
            Self::Trace            => "TRACE",
            Self::Unlock           => "UNLOCK",
            Self::Any              => METHOD_ANY,
            Self::NotFound         => METHOD_NOT_FOUND,
            Self::MethodNotAllowed => METHOD_NOT_ALLOWED,
        }
    }

    /// True for the registration-only pseudo-methods.
    pub fn is_pseudo(self) -> bool {
        matches!(self, Self::Any | Self::NotFound | Self::MethodNotAllowed)
    }
}

/// Normalises a registration method string: real methods are uppercased,
/// pseudo-method aliases collapse onto their canonical spelling.
pub fn normalize(method: &str) -> String {
    match method {
        "NotFound" | "notfound" | METHOD_NOT_FOUND => METHOD_NOT_FOUND.to_owned(),
        "MethodNotAllowed" | "methodnotallowed" | METHOD_NOT_ALLOWED => METHOD_NOT_ALLOWED.to_owned(),
        other => other.to_ascii_uppercase(),
    }
}

/// Parses a method string. Real methods are case-sensitive per RFC 9110 §9.1;
/// pseudo-methods accept their aliases.
impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT"    => Ok(Self::Connect),
            "COPY"       => Ok(Self::Copy),
            "DELETE"     => Ok(Self::Delete),
            "GET"        => Ok(Self::Get),
            "HEAD"       => Ok(Self::Head),
            "LOCK"       => Ok(Self::Lock),
            "MKCALENDAR" => Ok(Self::Mkcalendar),
            "MKCOL"      => Ok(Self::Mkcol),
            "MOVE"       => Ok(Self::Move),
            "OPTIONS"    => Ok(Self::Options),
            "PATCH"      => Ok(Self::Patch),
            "POST"       => Ok(Self::Post),
            "PROPFIND"   => Ok(Self::Propfind),
            "PROPPATCH"  => Ok(Self::Proppatch),
            "PURGE"      => Ok(Self::Purge),
            "PUT"        => Ok(Self::Put),
            "REPORT"     => Ok(Self::Report),
            "SEARCH"     => Ok(Self::Search),
            "TRACE"      => Ok(Self::Trace),
            "UNLOCK"     => Ok(Self::Unlock),
            "ANY" | "Any" => Ok(Self::Any),
            "404" | "NotFound" => Ok(Self::NotFound),
            "405" | "MethodNotAllowed" => Ok(Self::MethodNotAllowed),
            _            => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
