use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{
    self, read_line_capped, CodecKind, CodecReader, CodecWriter, ConnReader, ConnWriter, Header,
    MAX_HEADER_FRAME,
};
use crate::error::{Result, RpcError};
use crate::options::{Options, CONNECTED_STATUS, DEFAULT_RPC_PATH, MAGIC_NUMBER};
use crate::registrar::Registrar;
use crate::service::{Method, Service};

const HANDLE_TIMEOUT_ERROR: &str = "rpc server: request handle timeout";

#[derive(Clone, Copy)]
enum Transport {
    Tcp,
    Http,
}

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn CodecWriter>>>;

/// The RPC server: a service map plus per-connection serve loops.
///
/// Each accepted connection negotiates its option prelude, then runs a serve
/// loop that reads requests and spawns one handler task per request.
/// Responses are written under a per-connection sending lock, so header+body
/// frames never interleave even though handlers complete out of order.
pub struct Server {
    services: Mutex<HashMap<String, Arc<Service>>>,
    registrar: Mutex<Option<Registrar>>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new() -> Self {
        Server {
            services: Mutex::new(HashMap::new()),
            registrar: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Export a service. Duplicate service names are rejected.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.lock().unwrap();
        let name = service.name().to_owned();
        if services.contains_key(&name) {
            return Err(RpcError::InvalidService(format!(
                "rpc: service already defined: {name}"
            )));
        }
        info!(service = %name, methods = ?service.method_names(), "service registered");
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// A registered service, by name.
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.lock().unwrap().get(name).cloned()
    }

    /// Attach a registrar advertising this server; it is closed (revoking
    /// its lease) on shutdown.
    pub fn with_registrar(&self, registrar: Registrar) {
        *self.registrar.lock().unwrap() = Some(registrar);
    }

    /// Accept plain-TCP connections until [`Server::shutdown`].
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        self.accept_transport(listener, Transport::Tcp).await
    }

    /// Accept connections that upgrade via HTTP CONNECT before speaking RPC.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        self.accept_transport(listener, Transport::Http).await
    }

    async fn accept_transport(self: Arc<Self>, listener: TcpListener, transport: Transport) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.serve_conn(stream, transport).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }

    /// Stop accepting, tear down connection loops, and deregister.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let registrar = self.registrar.lock().unwrap().take();
        if let Some(registrar) = registrar {
            if let Err(e) = registrar.close().await {
                warn!(error = %e, "registrar close failed");
            }
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream, transport: Transport) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        if let Transport::Http = transport {
            if !upgrade(&mut reader, &mut writer).await {
                return;
            }
        }

        // The option prelude is the first record on the stream. Reject the
        // connection silently on anything malformed.
        let options = match read_prelude(&mut reader).await {
            Ok(options) => options,
            Err(e) => {
                debug!(error = %e, "rejecting connection: bad option prelude");
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            debug!(
                magic = options.magic_number,
                "rejecting connection: invalid magic number"
            );
            return;
        }

        let (codec_reader, codec_writer) = codec::pair(options.codec_type, reader, writer);
        self.serve_codec(codec_reader, codec_writer, &options).await;
    }

    async fn serve_codec(
        self: Arc<Self>,
        mut reader: Box<dyn CodecReader>,
        writer: Box<dyn CodecWriter>,
        options: &Options,
    ) {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let kind = options.codec_type;
        let handle_timeout = options.handle_timeout;
        let mut handlers = JoinSet::new();

        loop {
            let header = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = reader.read_header() => match read {
                    Ok(header) => header,
                    Err(e) => {
                        debug!(error = %e, "connection read ended");
                        break;
                    }
                },
            };
            match self.find_method(&header.service_method) {
                Err(dispatch_error) => {
                    // Consume the declared body so the next header starts at
                    // a frame boundary, then report and keep serving.
                    if reader.read_body(header.body_size).await.is_err() {
                        break;
                    }
                    let mut response = header;
                    response.error = dispatch_error;
                    send_response(&writer, response, &[]).await;
                }
                Ok(method) => {
                    let body = match reader.read_body(header.body_size).await {
                        Ok(body) => body,
                        Err(e) => {
                            debug!(error = %e, "failed reading request body");
                            break;
                        }
                    };
                    let writer = Arc::clone(&writer);
                    handlers.spawn(async move {
                        handle_request(method, kind, header, body, writer, handle_timeout).await;
                    });
                }
            }
        }

        // Let in-flight handlers finish (and write) before the codec closes.
        while handlers.join_next().await.is_some() {}
        let _ = writer.lock().await.close().await;
    }

    fn find_method(&self, service_method: &str) -> std::result::Result<Arc<Method>, String> {
        let (service_name, method_name) = service_method.rsplit_once('.').ok_or_else(|| {
            format!("rpc server: service/method request ill-formed: {service_method}")
        })?;
        let service = self
            .service(service_name)
            .ok_or_else(|| format!("rpc server: can't find service {service_name}"))?;
        service
            .get(method_name)
            .ok_or_else(|| format!("rpc server: can't find method {method_name}"))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_prelude(reader: &mut ConnReader) -> Result<Options> {
    let line = read_line_capped(reader, MAX_HEADER_FRAME).await?;
    serde_json::from_str(&line).map_err(|e| RpcError::Codec(format!("decoding options: {e}")))
}

/// Answer the HTTP prelude of an upgraded connection. Only
/// `CONNECT <rpc_path>` proceeds; everything else is refused with a 405.
/// Returns true when the connection may continue as RPC.
async fn upgrade(reader: &mut ConnReader, writer: &mut ConnWriter) -> bool {
    let request_line = match read_line_capped(reader, MAX_HEADER_FRAME).await {
        Ok(line) => line,
        Err(_) => return false,
    };
    // Drain request headers up to the blank line.
    loop {
        match read_line_capped(reader, MAX_HEADER_FRAME).await {
            Ok(line) if line.is_empty() => break,
            Ok(_) => {}
            Err(_) => return false,
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    if method != "CONNECT" || path != DEFAULT_RPC_PATH {
        debug!(%request_line, "refusing non-CONNECT upgrade request");
        let refusal = "HTTP/1.0 405 Method Not Allowed\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n405 must CONNECT\n";
        let _ = writer.write_all(refusal.as_bytes()).await;
        let _ = writer.flush().await;
        return false;
    }

    let banner = format!("HTTP/2.0 {CONNECTED_STATUS}\r\n\r\n");
    if writer.write_all(banner.as_bytes()).await.is_err() {
        return false;
    }
    writer.flush().await.is_ok()
}

/// Run one request to completion and write its response. When a handler
/// budget is configured, the invocation races it; on expiry the response
/// carries the timeout error and the invocation is cancelled. The sending
/// lock is only taken around the write, never across the race.
async fn handle_request(
    method: Arc<Method>,
    kind: CodecKind,
    header: Header,
    body: Bytes,
    writer: SharedWriter,
    handle_timeout: Duration,
) {
    let invoked = if handle_timeout.is_zero() {
        method.invoke(kind, body).await
    } else {
        match tokio::time::timeout(handle_timeout, method.invoke(kind, body)).await {
            Ok(result) => result,
            Err(_) => Err(HANDLE_TIMEOUT_ERROR.to_owned()),
        }
    };

    let mut response = header;
    match invoked {
        Ok(reply) => {
            response.error.clear();
            send_response(&writer, response, &reply).await;
        }
        Err(error) => {
            response.error = error;
            send_response(&writer, response, &[]).await;
        }
    }
}

async fn send_response(writer: &SharedWriter, header: Header, body: &[u8]) {
    if let Err(e) = writer.lock().await.write(header, body).await {
        warn!(error = %e, "rpc server: write response error");
    }
}
