//! xrpc error types

use thiserror::Error;

/// xrpc errors
#[derive(Error, Debug)]
pub enum Error {
    /// Handshake carried the wrong magic number
    #[error("invalid magic number: expected 0x3bef5c, got {found:#x}")]
    InvalidMagic {
        /// Found magic number
        found: u64,
    },

    /// Handshake named a codec that is not registered
    #[error("invalid codec type {tag}")]
    UnknownCodec {
        /// Codec tag as received
        tag: String,
    },

    /// Encoded header or body exceeds the frame limit
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame size seen so far
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Stream ended where a frame was expected
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding a value failed
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Client is closing or its connection has terminated
    #[error("connection is shut down")]
    Shutdown,

    /// Error string returned by the remote method
    #[error("{0}")]
    Remote(String),

    /// Reply body could not be decoded into the reply type
    #[error("reading body {0}")]
    ReadBody(String),

    /// Service method is not of the form `Service.Method`
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    /// No service registered under the name
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    /// Service has no method with the name
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// A service with the same name is already registered
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    /// Service name is not an exported identifier
    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    /// Method name is not an exported identifier
    #[error("rpc server: {0} is not a valid method name")]
    InvalidMethodName(String),

    /// Method registered twice on the same service
    #[error("rpc server: method {0} already defined")]
    DuplicateMethod(String),

    /// Discovery has no servers to pick from
    #[error("rpc discovery: no available servers")]
    NoServers,

    /// Address is not of the form `network@addr`
    #[error("rpc client: wrong format '{0}', expect network@addr")]
    InvalidAddress(String),

    /// Network kind cannot be dialed
    #[error("rpc client: unsupported network {0}")]
    UnsupportedNetwork(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
