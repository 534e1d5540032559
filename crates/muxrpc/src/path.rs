use std::fmt;
use std::str::FromStr;

use crate::error::PathError;

/// A parsed method path: `{service}/{method}`
///
/// Example: `echo.EchoService/UnaryEcho`
/// - `service`: `echo.EchoService`
/// - `method`: `UnaryEcho`
///
/// The dotted short form `Service.Method` is accepted as well when the path
/// contains no `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodPath {
    pub service: String,
    pub method: String,
}

impl MethodPath {
    /// Build a path from its parts, validating both.
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Result<Self, PathError> {
        let service = service.into();
        let method = method.into();

        if service.is_empty() || method.is_empty() {
            return Err(PathError::Invalid(format!(
                "service and method must both be non-empty: '{service}/{method}'"
            )));
        }
        if service.contains('/') || method.contains('/') || method.contains('.') {
            return Err(PathError::Invalid(format!(
                "service may not contain '/' and method may not contain '/' or '.': '{service}/{method}'"
            )));
        }

        Ok(MethodPath { service, method })
    }

    /// Parse a path string.
    ///
    /// Expected format: `{service}/{method}`, with an optional leading slash.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let path = path.strip_prefix('/').unwrap_or(path);

        let (service, method) = path
            .rsplit_once('/')
            .or_else(|| path.rsplit_once('.'))
            .ok_or_else(|| {
                PathError::Invalid(format!("path must contain '/' or '.': '{path}'"))
            })?;

        Self::new(service, method)
    }

    /// Returns the package part of a dotted service name, if any.
    pub fn package(&self) -> Option<&str> {
        self.service.rsplit_once('.').map(|(package, _)| package)
    }

    /// Returns the full path: `{service}/{method}`
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

impl FromStr for MethodPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
