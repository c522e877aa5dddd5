//! The tunnel connection: layer-stack growth and the request state machine
//!
//! A connection handles one request at a time. `issue` opens the raw TCP
//! stream to the first target, wraps it in TLS, and then reacts to socket
//! readiness on a single task: writability triggers the pending CONNECT or
//! the user's request, readability feeds the layer stack and eventually
//! yields the response.

use super::{TunnelError, TunnelState};
use crate::chain::{Endpoint, ParsedChain};
use crate::http::{Request, Response};
use crate::stream::tls::TlsSettings;
use crate::stream::{Layer, PairedStream, RawStream, StreamError, StreamEvent, TlsLayer};
use crate::{Error, Result};
use bytes::BytesMut;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

/// Layer-stack indexing: the raw TCP stream is layer 0 and corresponds to
/// no target, so target indices trail layer indices by one once the stack
/// is more than two layers deep. Returns `(current_layer, current_target)`.
fn layer_indices(depth: usize) -> (usize, usize) {
    let current_layer = if depth < 2 { 0 } else { depth - 1 };
    let current_target = if current_layer < 2 { 0 } else { current_layer - 1 };
    (current_layer, current_target)
}

/// A single-use-at-a-time tunnel through zero or more proxies to an origin
pub struct TunnelConnection {
    /// Connect-order targets; the last one is the origin
    targets: Vec<Endpoint>,
    tls: TlsSettings,
    state: TunnelState,
    /// Top of the layer stack; each TLS layer owns the layer beneath it
    stack: Option<Layer>,
    /// Whether the topmost layer finished its handshake
    top_open: bool,
    request: Option<Request>,
    /// Accumulates response bytes until the header block is complete
    response_buf: BytesMut,
}

impl TunnelConnection {
    /// Create a connection for an explicit target list. The last target is
    /// the origin; everything before it is a proxy in connect order.
    pub fn new(targets: Vec<Endpoint>, tls: TlsSettings) -> Result<Self> {
        if targets.is_empty() {
            return Err(TunnelError::NoTargets.into());
        }
        Ok(Self {
            targets,
            tls,
            state: TunnelState::Inactive,
            stack: None,
            top_open: false,
            request: None,
            response_buf: BytesMut::new(),
        })
    }

    /// Create a connection from a decoded chain URL
    pub fn from_chain(chain: &ParsedChain, tls: TlsSettings) -> Result<Self> {
        let targets = chain.targets()?;
        Self::new(targets, tls)
    }

    /// Current state of the request machine
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// The configured targets in connect order
    pub fn targets(&self) -> &[Endpoint] {
        &self.targets
    }

    /// Issue one request through the tunnel and wait for its response.
    ///
    /// Cancellation is dropping the returned future; the stack is closed
    /// and the connection returns to inactive on the next call. Timeouts
    /// are the caller's, imposed from above.
    pub async fn issue(&mut self, request: Request) -> Result<Response> {
        // A cancelled predecessor may have left the machine mid-flight
        self.reset();
        request.validate()?;

        info!(
            "issuing {} {} through {} hop(s)",
            request.method,
            request.url,
            self.targets.len()
        );

        let socket = TcpStream::connect(self.targets[0].to_string()).await?;
        self.stack = Some(Layer::Raw(RawStream::new(socket)));
        self.state = if self.targets.len() > 1 {
            TunnelState::ShouldEstablishTunnelConnection
        } else {
            TunnelState::ShouldSendHttpRequest
        };
        if let Err(error) = self.wrap_layer() {
            // The machine must never report a live phase without a stack
            self.reset();
            return Err(error);
        }
        self.request = Some(request);

        let outcome = self.drive().await;
        self.reset();
        outcome
    }

    /// The readiness loop: translate socket readiness into stream events,
    /// feed them through the layer stack, and apply the results to the
    /// state machine until a completion emerges
    async fn drive(&mut self) -> Result<Response> {
        loop {
            let mut interest = Interest::READABLE;
            if self.wants_writable() {
                interest = interest | Interest::WRITABLE;
            }

            let ready = {
                let stack = self.stack.as_ref().expect("layer stack populated while driving");
                stack.raw_socket().ready(interest).await?
            };

            let mut events = Vec::new();
            if ready.is_readable() || ready.is_read_closed() {
                events.extend(self.dispatch(StreamEvent::HasBytesAvailable));
            }
            if ready.is_writable() {
                events.extend(self.dispatch(StreamEvent::HasSpaceAvailable));
            }

            for event in events {
                if let Some(outcome) = self.on_stream_event(event) {
                    return outcome;
                }
            }
        }
    }

    /// Writability is only interesting while something needs flushing or
    /// the machine has a send pending on an established layer; asking for
    /// it otherwise would spin the loop on an always-writable socket
    fn wants_writable(&self) -> bool {
        let buffered = self.stack.as_ref().is_some_and(|s| s.wants_write());
        let send_pending = self.top_open
            && matches!(
                self.state,
                TunnelState::ShouldEstablishTunnelConnection | TunnelState::ShouldSendHttpRequest
            );
        buffered || send_pending
    }

    fn dispatch(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        match self.stack.as_mut() {
            Some(stack) => stack.handle_event(event),
            None => Vec::new(),
        }
    }

    /// Apply one event from the top of the stack to the state machine.
    /// `Some` is the request's completion, success or failure.
    fn on_stream_event(&mut self, event: StreamEvent) -> Option<Result<Response>> {
        trace!("state {:?}, event {:?}", self.state, event);
        match event {
            StreamEvent::OpenCompleted => {
                self.top_open = true;
                if matches!(
                    self.state,
                    TunnelState::ShouldEstablishTunnelConnection
                        | TunnelState::ShouldSendHttpRequest
                ) {
                    self.state = self.next_phase();
                }
                None
            }
            StreamEvent::HasSpaceAvailable => match self.state {
                TunnelState::ShouldEstablishTunnelConnection if self.top_open => {
                    self.send_connect().err().map(Err)
                }
                TunnelState::ShouldSendHttpRequest if self.top_open => {
                    self.send_user_request().err().map(Err)
                }
                _ => None,
            },
            StreamEvent::HasBytesAvailable => match self.state {
                TunnelState::ExpectTunnelConnectionEstablished => self.on_connect_response(),
                TunnelState::ExpectHttpResponse => self.on_http_response(),
                _ => None,
            },
            StreamEvent::EndEncountered => Some(Err(Error::ConnectionClosed)),
            StreamEvent::ErrorOccurred(error) => Some(Err(error.into())),
        }
    }

    /// Send the CONNECT that asks the current hop for a tunnel to the next
    fn send_connect(&mut self) -> Result<()> {
        let depth = self.depth();
        let (_, current_target) = layer_indices(depth);
        let next_target = current_target + 1;

        let request = Request::connect(
            &self.targets[next_target],
            &self.targets[current_target],
            Vec::new(),
        )?;
        let bytes = request.compose()?;

        debug!(
            "CONNECT {} via {}",
            self.targets[next_target], self.targets[current_target]
        );
        self.write_out(&bytes)?;
        self.response_buf.clear();
        self.state = TunnelState::ExpectTunnelConnectionEstablished;
        Ok(())
    }

    /// Send the user's request on the fully established stack
    fn send_user_request(&mut self) -> Result<()> {
        let bytes = {
            let request = self.request.as_ref().expect("request present while active");
            request.compose()?
        };

        debug!("sending request ({} bytes)", bytes.len());
        self.write_out(&bytes)?;
        self.response_buf.clear();
        self.state = TunnelState::ExpectHttpResponse;
        Ok(())
    }

    /// A CONNECT response arrived (possibly partially)
    fn on_connect_response(&mut self) -> Option<Result<Response>> {
        let bytes = self.read_in()?;
        self.response_buf.extend_from_slice(&bytes);

        match Response::parse(&self.response_buf) {
            Ok(None) => None,
            Ok(Some(response)) => {
                if response.status != 200 {
                    return Some(Err(TunnelError::UnexpectedResponse {
                        status: response.status,
                        reason: response.description(),
                    }
                    .into()));
                }
                debug!("tunnel hop established ({})", response.status);
                self.response_buf.clear();
                if let Err(error) = self.wrap_layer() {
                    return Some(Err(error));
                }
                self.state = self.next_phase();
                None
            }
            Err(error) => Some(Err(error.into())),
        }
    }

    /// Final-response bytes arrived (possibly partially)
    fn on_http_response(&mut self) -> Option<Result<Response>> {
        let bytes = self.read_in()?;
        self.response_buf.extend_from_slice(&bytes);

        match Response::parse(&self.response_buf) {
            Ok(None) => None,
            Ok(Some(response)) => {
                info!("response {} {}", response.status, response.description());
                Some(Ok(response))
            }
            Err(error) => Some(Err(error.into())),
        }
    }

    fn read_in(&mut self) -> Option<BytesMut> {
        self.stack.as_mut().and_then(|stack| stack.read_all())
    }

    fn write_out(&mut self, bytes: &[u8]) -> Result<()> {
        let stack = self.stack.as_mut().expect("layer stack populated while sending");
        let written = stack.write_all(bytes).map_err(|e| {
            Error::Stream(StreamError::WritingFailed {
                reason: e.to_string(),
                processed: 0,
            })
        })?;
        if written < bytes.len() {
            return Err(StreamError::WritingFailed {
                reason: "stream rejected part of the payload".into(),
                processed: written,
            }
            .into());
        }
        Ok(())
    }

    /// Wrap the current top of the stack in a fresh TLS session targeting
    /// the endpoint the new layer speaks to
    fn wrap_layer(&mut self) -> Result<()> {
        let stack = self.stack.take().expect("layer stack populated while wrapping");
        let depth = stack.depth();
        let (current_layer, _) = layer_indices(depth);
        let host = self.targets[current_layer].host().to_string();

        let config = self.tls.client_config(&host).map_err(Error::Stream)?;
        let tls = TlsLayer::new(config, &host, stack).map_err(Error::Stream)?;
        self.stack = Some(Layer::Tls(Box::new(tls)));
        self.top_open = false;

        debug!("layer {} wrapped, targeting {}", depth + 1, host);
        Ok(())
    }

    /// The state to enter once the current layer is established: another
    /// CONNECT while targets remain, the user's request otherwise
    fn next_phase(&self) -> TunnelState {
        let (_, current_target) = layer_indices(self.depth());
        if current_target + 1 < self.targets.len() {
            TunnelState::ShouldEstablishTunnelConnection
        } else {
            TunnelState::ShouldSendHttpRequest
        }
    }

    fn depth(&self) -> usize {
        self.stack.as_ref().map_or(0, Layer::depth)
    }

    /// Drop the whole stack (closing from the top), clear the pending
    /// request and return to inactive. Idempotent.
    fn reset(&mut self) {
        if let Some(mut stack) = self.stack.take() {
            stack.close();
        }
        self.request = None;
        self.response_buf.clear();
        self.top_open = false;
        if self.state != TunnelState::Inactive {
            debug!("tunnel reset");
            self.state = TunnelState::Inactive;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinning::PinStore;

    #[test]
    fn test_layer_indices_contract() {
        // (depth) -> (current_layer, current_target)
        assert_eq!(layer_indices(0), (0, 0));
        assert_eq!(layer_indices(1), (0, 0));
        assert_eq!(layer_indices(2), (1, 0));
        assert_eq!(layer_indices(3), (2, 1));
        assert_eq!(layer_indices(4), (3, 2));
        assert_eq!(layer_indices(5), (4, 3));
    }

    #[test]
    fn test_new_requires_targets() {
        let result = TunnelConnection::new(Vec::new(), TlsSettings::new(PinStore::new()));
        assert!(matches!(
            result,
            Err(Error::Tunnel(TunnelError::NoTargets))
        ));
    }

    #[test]
    fn test_new_connection_is_inactive() {
        let targets = vec![Endpoint::new("origin.example", 443).unwrap()];
        let connection = TunnelConnection::new(targets, TlsSettings::new(PinStore::new())).unwrap();
        assert_eq!(connection.state(), TunnelState::Inactive);
        assert_eq!(connection.targets().len(), 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let targets = vec![Endpoint::new("origin.example", 443).unwrap()];
        let mut connection =
            TunnelConnection::new(targets, TlsSettings::new(PinStore::new())).unwrap();
        connection.reset();
        connection.reset();
        assert_eq!(connection.state(), TunnelState::Inactive);
        assert!(connection.stack.is_none());
    }
}
