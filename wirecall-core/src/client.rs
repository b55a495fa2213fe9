use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::{
    self, read_line_capped, Body, CodecKind, CodecReader, CodecWriter, ConnReader, ConnWriter,
    Header, MAX_HEADER_FRAME,
};
use crate::error::{Result, RpcError};
use crate::options::{Options, CONNECTED_STATUS, DEFAULT_RPC_PATH};

type CallOutcome = Result<Bytes>;

/// A single in-flight request.
///
/// Returned by [`Client::go`]; completion arrives through [`Call::done`] (raw
/// reply bytes) or [`Call::recv`] (decoded reply). Dropping a `Call` before
/// completion cancels it: the pending entry is removed, and a late reply is
/// discarded by the receive loop's no-matching-seq branch. The connection
/// stays usable.
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    kind: CodecKind,
    done: oneshot::Receiver<CallOutcome>,
    client: Weak<ClientInner>,
}

impl Call {
    /// Wait for completion and return the raw reply body.
    pub async fn done(mut self) -> Result<Bytes> {
        match (&mut self.done).await {
            Ok(outcome) => outcome,
            // Sender gone without a verdict: the connection died.
            Err(_) => Err(RpcError::Shutdown),
        }
    }

    /// Wait for completion and decode the reply.
    pub async fn recv<R: Body>(self) -> Result<R> {
        let kind = self.kind;
        let body = self.done().await?;
        R::from_wire(kind, &body)
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.remove(self.seq);
        }
    }
}

struct ClientState {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    closing: bool,
    shutdown: bool,
}

struct ClientInner {
    kind: CodecKind,
    /// The sending lock: serializes writes so header+body frames never
    /// interleave. Canonical lock order is sending before state.
    writer: tokio::sync::Mutex<Box<dyn CodecWriter>>,
    /// Pending table and lifecycle flags. Never held across an await.
    state: Mutex<ClientState>,
    cancel: CancellationToken,
}

impl ClientInner {
    /// Issue a seq and insert the call, unless the client is dead.
    fn register(&self) -> Result<(u64, oneshot::Receiver<CallOutcome>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    fn remove(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    /// Mark the client shut down and resolve every outstanding call with the
    /// terminating error. Takes the sending lock first so no write races the
    /// transition.
    async fn terminate(&self, err: RpcError) {
        let _sending = self.writer.lock().await;
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!(calls = pending.len(), error = %err, "draining pending calls");
        }
        let user_closed = matches!(err, RpcError::Shutdown);
        let msg = err.to_string();
        for (_, tx) in pending {
            let outcome = if user_closed {
                RpcError::Shutdown
            } else {
                RpcError::ConnectionLost(msg.clone())
            };
            let _ = tx.send(Err(outcome));
        }
    }
}

/// A multiplexing RPC client over one connection.
///
/// Many calls may be in flight at once; a dedicated receive task owns the
/// read half and resolves calls by sequence number, in whatever order replies
/// arrive. Cloning is cheap and clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Dial `addr` over plain TCP.
    pub async fn dial(addr: &str, options: Options) -> Result<Client> {
        Self::dial_protocol("tcp", addr, options).await
    }

    /// Dial `addr` and upgrade via HTTP CONNECT before speaking RPC.
    pub async fn dial_http(addr: &str, options: Options) -> Result<Client> {
        Self::dial_protocol("http", addr, options).await
    }

    /// Dial with the transport chosen by `protocol`: `"http"` upgrades via
    /// CONNECT, anything else uses plain TCP. A nonzero connect timeout
    /// bounds the whole construction, including the option prelude.
    pub async fn dial_protocol(protocol: &str, addr: &str, options: Options) -> Result<Client> {
        let connect_timeout = options.connect_timeout;
        let connect = async {
            let stream = TcpStream::connect(addr).await?;
            Self::with_stream(protocol, stream, options).await
        };
        if connect_timeout.is_zero() {
            connect.await
        } else {
            match tokio::time::timeout(connect_timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::ConnectTimeout),
            }
        }
    }

    /// Build a client over an established stream (e.g. one borrowed from a
    /// connection pool), performing the handshake for `protocol`. Does not
    /// apply the connect timeout; dial wrappers do.
    pub async fn with_stream(
        protocol: &str,
        stream: TcpStream,
        options: Options,
    ) -> Result<Client> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        if protocol == "http" {
            http_upgrade(&mut reader, &mut writer).await?;
        }
        write_prelude(&mut writer, &options).await?;

        let (codec_reader, codec_writer) = codec::pair(options.codec_type, reader, writer);
        let inner = Arc::new(ClientInner {
            kind: options.codec_type,
            writer: tokio::sync::Mutex::new(codec_writer),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(receive_loop(Arc::clone(&inner), codec_reader));
        Ok(Client { inner })
    }

    /// Start a call and return immediately with its [`Call`] handle.
    pub async fn go<A: Body>(&self, service_method: &str, args: &A) -> Result<Call> {
        let body = args.to_wire(self.inner.kind)?;
        // Sending lock first, then the state lock inside register.
        let mut writer = self.inner.writer.lock().await;
        let (seq, done) = self.inner.register()?;
        let header = Header::request(service_method, seq);
        if let Err(err) = writer.write(header, &body).await {
            drop(writer);
            self.inner.remove(seq);
            return Err(err);
        }
        trace!(seq, service_method, "request sent");
        Ok(Call {
            seq,
            service_method: service_method.to_owned(),
            kind: self.inner.kind,
            done,
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Send a request and wait for its reply.
    pub async fn call<A: Body, R: Body>(&self, service_method: &str, args: &A) -> Result<R> {
        let call = self.go(service_method, args).await?;
        call.recv().await
    }

    /// [`Client::call`] bounded by `timeout`; on expiry the call is cancelled
    /// and removed from the pending table.
    pub async fn call_timeout<A: Body, R: Body>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R> {
        match tokio::time::timeout(timeout, self.call(service_method, args)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Canceled("deadline exceeded".into())),
        }
    }

    /// True iff the client is neither closing nor shut down.
    pub fn is_alive(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    /// User-initiated close. The receive loop stops, outstanding calls drain
    /// with the shutdown error, and the write half is shut down. A second
    /// close fails with the shutdown error.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.inner.cancel.cancel();
        let mut writer = self.inner.writer.lock().await;
        writer.close().await
    }
}

/// Write the JSON option prelude as the connection's first record.
async fn write_prelude(writer: &mut ConnWriter, options: &Options) -> Result<()> {
    let mut prelude = serde_json::to_vec(options)
        .map_err(|e| RpcError::Codec(format!("encoding options: {e}")))?;
    prelude.push(b'\n');
    writer.write_all(&prelude).await?;
    writer.flush().await?;
    Ok(())
}

/// Send the CONNECT request and require the connected banner before the RPC
/// protocol starts.
async fn http_upgrade(reader: &mut ConnReader, writer: &mut ConnWriter) -> Result<()> {
    writer
        .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/2.0\r\n\r\n").as_bytes())
        .await?;
    writer.flush().await?;

    let status_line = read_line_capped(reader, MAX_HEADER_FRAME).await?;
    let status = status_line
        .strip_prefix("HTTP/2.0 ")
        .unwrap_or(status_line.as_str());
    if status != CONNECTED_STATUS {
        return Err(RpcError::Handshake(status_line));
    }
    // Consume the blank line terminating the response.
    let _ = read_line_capped(reader, MAX_HEADER_FRAME).await?;
    Ok(())
}

/// Sole owner of the connection's read half. Reads headers, resolves calls by
/// seq, and on any read error marks the client shut down and drains the
/// pending table.
async fn receive_loop(inner: Arc<ClientInner>, mut reader: Box<dyn CodecReader>) {
    let err = loop {
        let header = tokio::select! {
            _ = inner.cancel.cancelled() => break RpcError::Shutdown,
            read = reader.read_header() => match read {
                Ok(header) => header,
                Err(err) => break err,
            },
        };
        match inner.remove(header.seq) {
            None => {
                // No matching call (cancelled or never ours): consume the
                // body to keep the stream aligned, then drop it.
                trace!(seq = header.seq, "discarding reply with no pending call");
                if let Err(err) = reader.read_body(header.body_size).await {
                    break err;
                }
            }
            Some(tx) if !header.error.is_empty() => {
                let read = reader.read_body(header.body_size).await;
                let _ = tx.send(Err(RpcError::Server(header.error)));
                if let Err(err) = read {
                    break err;
                }
            }
            Some(tx) => match reader.read_body(header.body_size).await {
                Ok(body) => {
                    let _ = tx.send(Ok(body));
                }
                Err(err) => {
                    let _ = tx.send(Err(RpcError::Codec(format!("reading body: {err}"))));
                    break err;
                }
            },
        }
    };
    debug!(error = %err, "receive loop terminated");
    inner.terminate(err).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_failure_is_an_io_error() {
        // Reserve a port, then free it so nothing listens there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Client::dial(&addr, Options::default()).await;
        assert!(matches!(err, Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn connect_timeout_bounds_a_stalled_handshake() {
        // A listener that accepts but never answers the CONNECT request: the
        // upgrade blocks reading the status line until the timeout fires.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut parked = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                parked.push(stream);
            }
        });

        let options = Options {
            connect_timeout: Duration::from_millis(200),
            ..Options::default()
        };
        let started = std::time::Instant::now();
        let err = Client::dial_http(&addr, options).await;
        assert!(matches!(err, Err(RpcError::ConnectTimeout)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
