use async_trait::async_trait;
use ringleaf_types::errors::DhtError;
use ringleaf_types::message::{LENGTH_HEADER_SIZE, Request, Response, Status, WireMessage};
use ringleaf_types::peer::NodeInfo;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Bound on one whole request/response exchange, connect included.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on accepted message bodies, 1 MiB.
pub const DEFAULT_MESSAGE_SIZE: usize = 1_048_576;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// RPC surface of one overlay node: the verb dispatcher plus default
/// implementations of both sides of the transport.
///
/// `call` is the client primitive. A request addressed to this node's own
/// id is dispatched in-process, which is semantically identical to the
/// socket path; everything else gets a fresh short-lived connection, one
/// frame each way, and the shared timeout. There is no pooling and no
/// retry: transport errors surface to the caller, which treats them as
/// soft failures during routing.
#[async_trait]
pub trait OverlayProtocol: Send + Sync + 'static {
    fn node_info(&self) -> &NodeInfo;

    fn max_message_size(&self) -> usize {
        DEFAULT_MESSAGE_SIZE
    }

    /// Maps one verb to its local handler.
    async fn handle(&self, request: Request) -> Response;

    async fn call(&self, target: &NodeInfo, request: Request) -> Result<Response, DhtError> {
        if target.id == self.node_info().id {
            return Ok(self.handle(request).await);
        }
        let command = request.command();
        let response = send_request(&target.addr(), &request, self.max_message_size()).await?;
        if let Response::Status {
            status: Status::Error,
        } = response
        {
            return Err(DhtError::Protocol(format!("{target} rejected {command}")));
        }
        Ok(response)
    }

    /// Server side of one accepted connection: one request in, one
    /// response out, close. Malformed input is answered with an error
    /// status so the peer can fail fast.
    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stream);
        let body = match read_frame(&mut reader, self.max_message_size()).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::trace!(%peer, "connection closed before a full request");
                return;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "could not read request frame");
                let _ = write_response(reader.get_mut(), &Response::error()).await;
                return;
            }
        };
        let reply = match Request::from_bytes(&body) {
            Ok(request) => {
                tracing::debug!(%peer, command = request.command(), "handling request");
                self.handle(request).await
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed request");
                Response::error()
            }
        };
        if let Err(e) = write_response(reader.get_mut(), &reply).await {
            tracing::warn!(%peer, error = %e, "could not write response");
        }
    }
}

/// Performs one RPC against a raw address under [`RPC_TIMEOUT`].
pub async fn send_request(
    addr: &str,
    request: &Request,
    max_message_size: usize,
) -> Result<Response, DhtError> {
    match timeout(RPC_TIMEOUT, exchange(addr, request, max_message_size)).await {
        Ok(result) => result,
        Err(_) => Err(DhtError::transport(
            addr,
            format!("no response within {}s", RPC_TIMEOUT.as_secs()),
        )),
    }
}

async fn exchange(
    addr: &str,
    request: &Request,
    max_message_size: usize,
) -> Result<Response, DhtError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| DhtError::transport(addr, e))?;
    let mut stream = BufReader::with_capacity(READ_BUFFER_SIZE, stream);
    let frame = request.to_frame()?;
    stream
        .get_mut()
        .write_all(&frame)
        .await
        .map_err(|e| DhtError::transport(addr, e))?;
    let body = read_frame(&mut stream, max_message_size)
        .await
        .map_err(|e| DhtError::transport(addr, e))?;
    Response::from_bytes(&body)
}

async fn write_response(
    stream: &mut TcpStream,
    response: &Response,
) -> Result<(), DhtError> {
    let frame = response.to_frame()?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| DhtError::transport("peer", e))
}

/// Reads one length-prefixed frame, enforcing the body size cap.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; LENGTH_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {max_len} byte cap"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
