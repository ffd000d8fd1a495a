//! xrpc call header
//!
//! Every request and response frame starts with a header. The body that
//! follows is not self-describing: the receiver decodes it using the pending
//! call's reply type or the registered method's argument type.

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Per-call header
///
/// # Wire Format (JSON codec)
///
/// ```text
/// {"ServiceMethod":"Arith.Sum","Seq":1,"Error":""}\n
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target in the form `Service.Method`
    #[serde(rename = "ServiceMethod")]
    pub service_method: String,
    /// Sequence number chosen by the client
    #[serde(rename = "Seq")]
    pub seq: u64,
    /// Error text; empty means success
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl Header {
    /// Create a request header
    #[must_use]
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Whether the header reports a failure
    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Split the service method into `(service, method)`
    ///
    /// Exactly one dot is accepted and neither side may be empty.
    pub fn split_service_method(&self) -> Result<(&str, &str)> {
        let mut parts = self.service_method.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
                Ok((service, method))
            }
            _ => Err(Error::IllFormedServiceMethod(self.service_method.clone())),
        }
    }
}
