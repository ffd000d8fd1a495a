//! Server dispatch loop
//!
//! Each accepted connection gets its own task. After the handshake the task
//! reads requests in order and spawns one handler per request; handlers share
//! the connection's send lock so response frames never interleave. Responses
//! may go out in a different order than requests came in, which is why each
//! one echoes the request's sequence number.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::protocol::metrics::{Metrics, Side};
use crate::protocol::{
    CodecType, Error, FrameReader, FrameWriter, Header, Result, new_codec_func, read_options,
};
use crate::service::{Invocation, MethodType, Service};

type SharedWriter = Arc<AsyncMutex<Box<dyn FrameWriter>>>;

/// Body sent alongside an error header
#[derive(Serialize)]
struct InvalidRequest {}

/// A decoded request, ready to dispatch
struct Request {
    header: Header,
    method: Arc<MethodType>,
    invocation: Invocation,
}

/// Why a request could not be dispatched
///
/// With a header the request was fully consumed and gets an error response;
/// without one the stream is broken.
struct RequestError {
    header: Option<Header>,
    error: Error,
}

impl RequestError {
    fn fatal(error: Error) -> Self {
        Self {
            header: None,
            error,
        }
    }
}

/// RPC server holding the registered services
#[derive(Default)]
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    /// Create a server with no services
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service
    ///
    /// Fails if a service with the same name exists; the existing one stays.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().expect("service map lock poisoned");
        match services.entry(service.name().to_string()) {
            Entry::Occupied(entry) => Err(Error::DuplicateService(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!(service = %entry.key(), "service registered");
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Look up a registered service
    #[must_use]
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .expect("service map lock poisoned")
            .get(name)
            .cloned()
    }

    /// Serve every connection accepted on `listener`
    ///
    /// Runs until accepting fails, which is returned.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "rpc server accepting");
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "rpc server: accept error");
                    return Err(err.into());
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, error = %err, "set_nodelay failed");
            }

            let server = Arc::clone(&self);
            tokio::spawn(
                async move { server.serve_conn(stream).await }
                    .instrument(info_span!("conn", %peer)),
            );
        }
    }

    /// Run the handshake and the request loop on one connection
    ///
    /// Returns once the peer hangs up or the stream breaks, after every
    /// in-flight handler has written its response.
    #[instrument(level = "debug", skip_all)]
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut read_half = BufReader::new(read_half);

        let codec = match read_options(&mut read_half)
            .await
            .and_then(|options| options.validate())
        {
            Ok(codec) => codec,
            Err(err) => {
                warn!(error = %err, "rpc server: options error");
                return;
            }
        };
        let Some(new_codec) = new_codec_func(codec) else {
            warn!(%codec, "rpc server: no codec registered");
            return;
        };

        let (reader, writer) = new_codec(Box::new(read_half), Box::new(write_half));
        Metrics::record_connection_open(Side::Server);
        self.serve_codec(codec, reader, writer).await;
        Metrics::record_connection_close(Side::Server);
    }

    async fn serve_codec(
        &self,
        codec: CodecType,
        mut reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
    ) {
        let sending: SharedWriter = Arc::new(AsyncMutex::new(writer));
        let placeholder = codec.encode(&InvalidRequest {}).unwrap_or_default();
        let mut handlers = JoinSet::new();

        loop {
            match self.read_request(codec, reader.as_mut()).await {
                Ok(request) => {
                    handlers.spawn(handle_request(
                        request,
                        Arc::clone(&sending),
                        placeholder.clone(),
                    ));
                }
                Err(RequestError {
                    header: Some(mut header),
                    error,
                }) => {
                    debug!(seq = header.seq, error = %error, "rpc server: bad request");
                    Metrics::record_served(std::time::Duration::ZERO, true);
                    header.error = error.to_string();
                    send_response(&sending, &header, &placeholder).await;
                }
                Err(RequestError {
                    header: None,
                    error,
                }) => {
                    match error {
                        Error::UnexpectedEof => debug!("rpc server: peer closed connection"),
                        error => warn!(error = %error, "rpc server: read request error"),
                    }
                    break;
                }
            }

            while let Some(finished) = handlers.try_join_next() {
                log_handler_exit(finished);
            }
        }

        while let Some(finished) = handlers.join_next().await {
            log_handler_exit(finished);
        }
        if let Err(err) = sending.lock().await.close().await {
            debug!(error = %err, "rpc server: close error");
        }
    }

    async fn read_request(
        &self,
        codec: CodecType,
        reader: &mut dyn FrameReader,
    ) -> std::result::Result<Request, RequestError> {
        let header = reader.read_header().await.map_err(RequestError::fatal)?;

        let method = match self.find_method(&header) {
            Ok(method) => method,
            Err(error) => {
                // Consume the body so the next header is read from the right place.
                reader.discard_body().await.map_err(RequestError::fatal)?;
                return Err(RequestError {
                    header: Some(header),
                    error,
                });
            }
        };

        let body = reader.read_body().await.map_err(RequestError::fatal)?;
        match method.prepare(codec, &body) {
            Ok(invocation) => Ok(Request {
                header,
                method,
                invocation,
            }),
            Err(error) => Err(RequestError {
                header: Some(header),
                error,
            }),
        }
    }

    fn find_method(&self, header: &Header) -> Result<Arc<MethodType>> {
        let (service_name, method_name) = header.split_service_method()?;
        let services = self.services.read().expect("service map lock poisoned");
        let service = services
            .get(service_name)
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_string()))?;
        service
            .method(method_name)
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(method_name.to_string()))
    }
}

async fn handle_request(request: Request, sending: SharedWriter, placeholder: Bytes) {
    let Request {
        mut header,
        method,
        invocation,
    } = request;
    debug!(seq = header.seq, service_method = %header.service_method, "dispatching request");

    let started = Instant::now();
    // A panicking handler must still produce a response.
    let outcome = match tokio::spawn(async move { method.call(invocation).await }).await {
        Ok(outcome) => outcome,
        Err(err) => Err(format!("rpc server: method panicked: {err}")),
    };
    Metrics::record_served(started.elapsed(), outcome.is_err());

    let body = match outcome {
        Ok(body) => body,
        Err(error) => {
            header.error = error;
            placeholder
        }
    };
    send_response(&sending, &header, &body).await;
}

async fn send_response(sending: &AsyncMutex<Box<dyn FrameWriter>>, header: &Header, body: &[u8]) {
    let mut writer = sending.lock().await;
    if let Err(err) = writer.write(header, body).await {
        warn!(seq = header.seq, error = %err, "rpc server: write response error");
    }
}

fn log_handler_exit(finished: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        warn!(error = %err, "rpc server: handler task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::protocol::{MAGIC_NUMBER, Options};
    use serde::Deserialize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Notify;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    struct Arith {
        gate: Arc<Notify>,
    }

    impl Arith {
        async fn sum(self: Arc<Self>, args: Args) -> std::result::Result<i64, String> {
            Ok(args.num1 + args.num2)
        }

        async fn slow_sum(self: Arc<Self>, args: Args) -> std::result::Result<i64, String> {
            self.gate.notified().await;
            Ok(args.num1 + args.num2)
        }

        async fn explode(self: Arc<Self>, _args: Args) -> std::result::Result<i64, String> {
            panic!("boom");
        }
    }

    fn server(gate: Arc<Notify>) -> Arc<Server> {
        let server = Server::new();
        let service = Service::builder(Arith { gate })
            .method("Sum", Arith::sum)
            .method("SlowSum", Arith::slow_sum)
            .method("Explode", Arith::explode)
            .build()
            .unwrap();
        server.register(service).unwrap();
        Arc::new(server)
    }

    async fn connect(server: Arc<Server>) -> Client {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { server.serve_conn(remote).await });
        Client::new(local, Options::default()).await.unwrap()
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let server = server(Arc::new(Notify::new()));
        let again = Service::builder(Arith {
            gate: Arc::new(Notify::new()),
        })
        .method("Other", Arith::sum)
        .build()
        .unwrap();

        assert!(matches!(
            server.register(again),
            Err(Error::DuplicateService(ref name)) if name == "Arith"
        ));
        let kept = server.service("Arith").unwrap();
        assert!(kept.method("Sum").is_some());
        assert!(kept.method("Other").is_none());
    }

    #[tokio::test]
    async fn test_sum_and_call_count() {
        let server = server(Arc::new(Notify::new()));
        let client = connect(Arc::clone(&server)).await;

        let reply: i64 = client
            .call("Arith.Sum", &Args { num1: 2, num2: 3 })
            .await
            .unwrap();
        assert_eq!(reply, 5);
        let sum = Arc::clone(server.service("Arith").unwrap().method("Sum").unwrap());
        assert_eq!(sum.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_lookup_errors_keep_connection() {
        let server = server(Arc::new(Notify::new()));
        let client = connect(server).await;
        let args = Args { num1: 1, num2: 1 };

        for (target, expected) in [
            ("Foo.Missing", "rpc server: can't find service Foo"),
            ("Arith.Missing", "rpc server: can't find method Missing"),
            ("Arith", "rpc server: service/method request ill-formed: Arith"),
        ] {
            let err = client.call::<_, i64>(target, &args).await.unwrap_err();
            assert!(matches!(err, Error::Remote(ref msg) if msg == expected), "{err}");
        }

        let err = client.call::<_, i64>("Arith.Sum", &"wrong").await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));

        let reply: i64 = client.call("Arith.Sum", &args).await.unwrap();
        assert_eq!(reply, 2);
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        let gate = Arc::new(Notify::new());
        let client = connect(server(Arc::clone(&gate))).await;

        let slow = client
            .async_call::<_, i64>("Arith.SlowSum", &Args { num1: 10, num2: 20 })
            .await;
        let fast: i64 = client
            .call("Arith.Sum", &Args { num1: 1, num2: 2 })
            .await
            .unwrap();
        assert_eq!(fast, 3);

        gate.notify_one();
        let slow = slow.wait().await;
        assert_eq!(slow.seq, 1);
        assert_eq!(slow.into_result().unwrap(), 30);
    }

    #[tokio::test]
    async fn test_panicking_handler_replies_with_error() {
        let client = connect(server(Arc::new(Notify::new()))).await;

        let err = client
            .call::<_, i64>("Arith.Explode", &Args { num1: 0, num2: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote(ref msg) if msg.contains("panicked")));
        assert!(client.is_available());
    }

    /// Send a raw handshake and return whatever the server writes back
    async fn handshake_reply(options: Options) -> Vec<u8> {
        let server = server(Arc::new(Notify::new()));
        let (mut local, remote) = tokio::io::duplex(1024);
        let serving = tokio::spawn(async move { server.serve_conn(remote).await });

        let mut line = serde_json::to_vec(&options).unwrap();
        line.push(b'\n');
        local.write_all(&line).await.unwrap();

        serving.await.unwrap();
        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        rest
    }

    #[tokio::test]
    async fn test_bad_magic_closes_without_reply() {
        let rest = handshake_reply(Options {
            magic_number: MAGIC_NUMBER + 1,
            codec_type: CodecType::Json.as_tag().to_string(),
        })
        .await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_codec_closes_without_reply() {
        let rest = handshake_reply(Options {
            magic_number: MAGIC_NUMBER,
            codec_type: "application/gob".to_string(),
        })
        .await;
        assert!(rest.is_empty());
    }
}
