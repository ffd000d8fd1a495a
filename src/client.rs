//! Client call engine
//!
//! One [`Client`] owns one connection. Calls are written one frame at a time
//! under the send lock, parked in the pending table under their sequence
//! number, and completed by a single receive task that reads responses in
//! whatever order the server writes them.
//!
//! Two locks are involved and are always taken in the same order: the async
//! send lock (serializes frames on the wire) and then the state lock (pending
//! table, sequence counter and shutdown flags). The state lock is never held
//! across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tracing::{debug, instrument, warn};

use crate::protocol::metrics::{Metrics, Side};
use crate::protocol::{
    CodecType, Error, FrameReader, FrameWriter, Header, MAGIC_NUMBER, MAX_FRAME_SIZE, Options,
    Result, new_codec_func, write_options,
};

/// A finished call, delivered once on its completion queue
#[derive(Debug)]
pub struct Call<R> {
    /// Target in the form `Service.Method`
    pub service_method: String,
    /// Sequence number the call was sent with; 0 if it was never sent
    pub seq: u64,
    /// Decoded reply, present on success
    pub reply: Option<R>,
    /// Failure, present when the call did not succeed
    pub error: Option<Error>,
}

impl<R> Call<R> {
    /// Reply or error
    pub fn into_result(self) -> Result<R> {
        match (self.error, self.reply) {
            (Some(err), _) => Err(err),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(Error::ReadBody("missing reply".to_string())),
        }
    }
}

/// Handle to a call issued with [`Client::async_call`]
#[derive(Debug)]
pub struct PendingCall<R> {
    service_method: String,
    done: mpsc::Receiver<Call<R>>,
}

impl<R> PendingCall<R> {
    /// Wait for the call to finish
    pub async fn wait(mut self) -> Call<R> {
        match self.done.recv().await {
            Some(call) => call,
            None => Call {
                service_method: self.service_method,
                seq: 0,
                reply: None,
                error: Some(Error::Shutdown),
            },
        }
    }
}

/// Type-erased in-flight call as stored in the pending table
trait Completion: Send {
    fn service_method(&self) -> &str;

    fn set_seq(&mut self, seq: u64);

    /// Decode the outcome into the call and signal its queue
    fn complete(self: Box<Self>, outcome: Result<Bytes>);
}

struct InFlight<R> {
    service_method: String,
    seq: u64,
    codec: CodecType,
    done: mpsc::Sender<Call<R>>,
}

impl<R> Completion for InFlight<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn service_method(&self) -> &str {
        &self.service_method
    }

    fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    fn complete(self: Box<Self>, outcome: Result<Bytes>) {
        let Self {
            service_method,
            seq,
            codec,
            done,
        } = *self;

        let (reply, error) = match outcome.and_then(|body| {
            codec
                .decode::<R>(&body)
                .map_err(|err| Error::ReadBody(err.to_string()))
        }) {
            Ok(reply) => (Some(reply), None),
            Err(err) => {
                Metrics::record_call_error();
                (None, Some(err))
            }
        };

        let call = Call {
            service_method,
            seq,
            reply,
            error,
        };
        match done.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                debug!(seq, "completion queue full; delivering in background");
                tokio::spawn(async move {
                    let _ = done.send(call).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(seq, "completion queue dropped; discarding call");
            }
        }
    }
}

#[derive(Default)]
struct State {
    seq: u64,
    pending: HashMap<u64, Box<dyn Completion>>,
    closing: bool,
    shutdown: bool,
}

struct ClientInner {
    codec: CodecType,
    options: Options,
    sending: AsyncMutex<Box<dyn FrameWriter>>,
    state: Mutex<State>,
    stop: Notify,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("client state mutex poisoned")
    }

    /// Reserve a sequence number and park the call, unless shutting down
    fn register_call(
        &self,
        mut call: Box<dyn Completion>,
    ) -> std::result::Result<u64, Box<dyn Completion>> {
        let mut state = self.state();
        if state.closing || state.shutdown {
            return Err(call);
        }
        let seq = state.seq;
        call.set_seq(seq);
        state.pending.insert(seq, call);
        state.seq += 1;
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Box<dyn Completion>> {
        self.state().pending.remove(&seq)
    }

    /// Mark the engine shut down and fail every pending call
    async fn terminate_calls(&self) {
        let _sending = self.sending.lock().await;
        let pending = {
            let mut state = self.state();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending calls");
        }
        for call in pending.into_values() {
            call.complete(Err(Error::Shutdown));
        }
    }

    async fn send(&self, call: Box<dyn Completion>, body: Bytes) {
        let mut writer = self.sending.lock().await;
        let service_method = call.service_method().to_string();

        let seq = match self.register_call(call) {
            Ok(seq) => seq,
            Err(call) => {
                call.complete(Err(Error::Shutdown));
                return;
            }
        };

        let header = Header::new(service_method, seq);
        Metrics::record_call_sent();
        if let Err(err) = writer.write(&header, &body).await {
            warn!(seq, service_method = %header.service_method, error = %err, "rpc client: send failed");
            if let Some(call) = self.remove_call(seq) {
                call.complete(Err(err));
            }
            // The stream is closed after a failed write; stop reading too.
            self.stop.notify_one();
        }
    }

    async fn receive(self: Arc<Self>, mut reader: Box<dyn FrameReader>) {
        let err = loop {
            let header = tokio::select! {
                () = self.stop.notified() => break Error::Shutdown,
                result = reader.read_header() => match result {
                    Ok(header) => header,
                    Err(err) => break err,
                },
            };

            Metrics::record_reply_received();
            match self.remove_call(header.seq) {
                None => {
                    debug!(seq = header.seq, "no pending call for response; discarding body");
                    if let Err(err) = reader.discard_body().await {
                        break err;
                    }
                }
                Some(call) if header.is_error() => {
                    let discarded = reader.discard_body().await;
                    call.complete(Err(Error::Remote(header.error)));
                    if let Err(err) = discarded {
                        break err;
                    }
                }
                Some(call) => match reader.read_body().await {
                    Ok(body) => call.complete(Ok(body)),
                    Err(err) => {
                        call.complete(Err(Error::ReadBody(err.to_string())));
                        break err;
                    }
                },
            }
        };

        match err {
            Error::Shutdown | Error::UnexpectedEof => debug!("rpc client: connection closed"),
            err => warn!(error = %err, "rpc client: receive loop terminated"),
        }
        self.terminate_calls().await;
        Metrics::record_connection_close(Side::Client);
    }
}

/// RPC client bound to one connection
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Perform the handshake over an established stream and start receiving
    pub async fn new<S>(stream: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = options.validate()?;
        let Some(new_codec) = new_codec_func(codec) else {
            return Err(Error::UnknownCodec {
                tag: options.codec_type,
            });
        };

        let (read_half, mut write_half) = tokio::io::split(stream);
        write_options(&mut write_half, &options).await?;
        let (reader, writer) = new_codec(Box::new(BufReader::new(read_half)), Box::new(write_half));
        Ok(Self::start(codec, options, reader, writer))
    }

    /// Start the receive task over already negotiated codec halves
    fn start(
        codec: CodecType,
        options: Options,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
    ) -> Self {
        let inner = Arc::new(ClientInner {
            codec,
            options,
            sending: AsyncMutex::new(writer),
            state: Mutex::new(State {
                seq: 1,
                ..State::default()
            }),
            stop: Notify::new(),
        });
        Metrics::record_connection_open(Side::Client);
        tokio::spawn(Arc::clone(&inner).receive(reader));

        Self { inner }
    }

    /// Connect to `address` over `network` (`tcp`, or `unix` on Unix)
    ///
    /// Without options the default JSON codec is used. The magic number is
    /// always the protocol constant.
    #[instrument(level = "debug", skip(options))]
    pub async fn dial(network: &str, address: &str, options: Option<Options>) -> Result<Self> {
        let options = options.map_or_else(Options::default, |options| Options {
            magic_number: MAGIC_NUMBER,
            ..options
        });

        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Self::new(stream, options).await
            }
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::net::UnixStream::connect(address).await?;
                Self::new(stream, options).await
            }
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }

    /// Options negotiated for this connection
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Whether new calls can still be sent
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.inner.state();
        !state.closing && !state.shutdown
    }

    /// Issue a call whose completion is delivered on `done`
    ///
    /// Returns once the request is written (or has failed). The finished
    /// [`Call`] is sent on `done` exactly once, including on shutdown. One
    /// queue may be shared by many calls.
    pub async fn go<A, R>(&self, service_method: &str, args: &A, done: mpsc::Sender<Call<R>>)
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let call: Box<dyn Completion> = Box::new(InFlight::<R> {
            service_method: service_method.to_string(),
            seq: 0,
            codec: self.inner.codec,
            done,
        });

        match self.inner.codec.encode(args) {
            // Rejected here, the writer would close the stream for every call.
            Ok(body) if body.len() > MAX_FRAME_SIZE => call.complete(Err(Error::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            })),
            Ok(body) => self.inner.send(call, body).await,
            Err(err) => call.complete(Err(err)),
        }
    }

    /// Issue a call and return a handle to wait on
    pub async fn async_call<A, R>(&self, service_method: &str, args: &A) -> PendingCall<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        self.go(service_method, args, tx).await;
        PendingCall {
            service_method: service_method.to_string(),
            done: rx,
        }
    }

    /// Issue a call and wait for its reply
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.async_call(service_method, args)
            .await
            .wait()
            .await
            .into_result()
    }

    /// Close the connection
    ///
    /// Pending calls fail with [`Error::Shutdown`]. Closing twice returns
    /// [`Error::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.inner.stop.notify_one();
        self.inner.sending.lock().await.close().await
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.state().pending.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.stop.notify_one();
    }
}

/// Dial an address of the form `network@addr`, e.g. `tcp@127.0.0.1:9999`
pub async fn x_dial(rpc_addr: &str, options: Option<Options>) -> Result<Client> {
    let Some((network, address)) = rpc_addr.split_once('@') else {
        return Err(Error::InvalidAddress(rpc_addr.to_string()));
    };
    Client::dial(network, address, options).await
}
