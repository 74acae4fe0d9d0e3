// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::error::FcpError;

/// A key URI such as `CHK@`, `KSK@name` or `SSK@<hash>/path`.
///
/// The client treats URIs as opaque strings; the node parses them.  Only the
/// key type prefix is looked at, to decide whether an insert target is
/// content addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyUri(String);

impl KeyUri {
    pub fn new<S: Into<String>>(uri: S) -> KeyUri {
        let uri = uri.into();
        match uri.strip_prefix("freenet:") {
            Some(rest) => KeyUri(rest.to_string()),
            None => KeyUri(uri),
        }
    }

    /// The URI asking the node to compute a content hash key.
    pub fn chk() -> KeyUri {
        KeyUri(String::from("CHK@"))
    }

    /// Key type prefix, e.g. `CHK`, `SSK` or `KSK`.
    pub fn key_type(&self) -> &str {
        match self.0.find('@') {
            Some(at) => &self.0[..at],
            None => "",
        }
    }

    pub fn is_chk(&self) -> bool {
        self.key_type().eq_ignore_ascii_case("CHK")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn render(&self) -> String {
        self.0.clone()
    }
}

impl fmt::Display for KeyUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for KeyUri {
    type Err = FcpError;

    fn from_str(s: &str) -> Result<KeyUri, FcpError> {
        let s = s.trim();
        if !s.contains('@') {
            return Err(FcpError::Protocol(format!("'{}' is not a key URI", s)));
        }
        Ok(KeyUri::new(s))
    }
}

impl From<&str> for KeyUri {
    fn from(s: &str) -> KeyUri {
        KeyUri::new(s)
    }
}
