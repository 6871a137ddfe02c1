//! Tracking URI classification.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chest_core::{Error, Result};
use url::{ParseError, Url};

/// Where tracking data goes, decided by the URI scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingUri {
    /// `file:` URI or a plain filesystem path
    Local(PathBuf),
    /// `http` or `https` tracking server
    Remote(Url),
}

impl TrackingUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(Error::Config("tracking URI is empty".to_string()));
        }

        // `file:relative/path` has no authority and is kept relative
        if let Some(rest) = uri.strip_prefix("file:") {
            if !rest.starts_with("//") {
                return Ok(TrackingUri::Local(PathBuf::from(rest)));
            }
        }

        match Url::parse(uri) {
            Ok(url) => match url.scheme().to_string().as_str() {
                "file" => url
                    .to_file_path()
                    .map(TrackingUri::Local)
                    .map_err(|_| Error::Config(format!("invalid file tracking URI '{uri}'"))),
                "http" | "https" => Ok(TrackingUri::Remote(url)),
                // Windows drive letters parse as one-letter schemes
                scheme if scheme.len() == 1 => Ok(TrackingUri::Local(PathBuf::from(uri))),
                scheme => Err(Error::Config(format!(
                    "unsupported tracking URI scheme '{scheme}' in '{uri}'"
                ))),
            },
            Err(ParseError::RelativeUrlWithoutBase) => {
                Ok(TrackingUri::Local(PathBuf::from(uri)))
            }
            Err(e) => Err(Error::Config(format!("invalid tracking URI '{uri}': {e}"))),
        }
    }

    /// Scheme used to decide whether a model registry is available
    pub fn scheme(&self) -> &str {
        match self {
            TrackingUri::Local(_) => "file",
            TrackingUri::Remote(url) => url.scheme(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, TrackingUri::Local(_))
    }
}

impl FromStr for TrackingUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TrackingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingUri::Local(path) => write!(f, "file:{}", path.display()),
            TrackingUri::Remote(url) => write!(f, "{url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_uri_is_local() {
        let uri = TrackingUri::parse("file:///tmp/mlruns").unwrap();
        assert_eq!(uri, TrackingUri::Local(PathBuf::from("/tmp/mlruns")));
        assert_eq!(uri.scheme(), "file");
    }

    #[test]
    fn test_relative_forms_are_local() {
        assert_eq!(
            TrackingUri::parse("mlruns").unwrap(),
            TrackingUri::Local(PathBuf::from("mlruns"))
        );
        assert_eq!(
            TrackingUri::parse("file:./mlruns").unwrap(),
            TrackingUri::Local(PathBuf::from("./mlruns"))
        );
    }

    #[test]
    fn test_http_is_remote() {
        let uri: TrackingUri = "https://dagshub.com/user/repo.mlflow".parse().unwrap();
        assert!(!uri.is_local());
        assert_eq!(uri.scheme(), "https");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(matches!(
            TrackingUri::parse("databricks://profile"),
            Err(Error::Config(_))
        ));
        assert!(TrackingUri::parse("  ").is_err());
    }
}
