//! HTTP client protocol state machine, the mirror image of the server
//! protocol. Drives one outbound keep-alive connection: emits the
//! request head and body, parses the response head, and feeds the
//! (de-chunked) response body into a pipe for the consuming
//! connection.

use crate::buffer::Buffer;
use crate::http::emit::prepare_client_request_headers;
use crate::http::parse::{find_end_of_http_headers, parse_http_response};
use crate::http::{ChunkedDecoder, Request, Response};
use crate::stream::Pipe;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    Connecting,
    Idle,
    SendingHeaders,
    Wait100Continue,
    SendingBody,
    WaitResponse,
    RecvHeaders,
    RecvBody,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientEvent {
    Connected,
    /// Interim 100 Continue consumed; body transmission may begin.
    ContinueReceived,
    /// Response head parsed; `resp` carries it.
    ResponseReceived,
    /// Response fully received.
    RequestComplete,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientError {
    BadResponse,
    ChunkedEncoding,
}

pub struct HttpClientProto {
    pub state: ClientState,
    pub req: Request,
    pub resp: Response,
    pub request_count: u32,
    head_buf: Vec<u8>,
    head_span: Option<crate::arena::Span>,
    head_sent: usize,
    body_sent: usize,
    decoder: ChunkedDecoder,
    waiting_100: bool,
    pub response_body_complete: bool,
    pub request_complete: bool,
}

impl HttpClientProto {
    pub fn new() -> HttpClientProto {
        HttpClientProto {
            state: ClientState::Connecting,
            req: Request::new(),
            resp: Response::new(),
            request_count: 0,
            head_buf: Vec::new(),
            head_span: None,
            head_sent: 0,
            body_sent: 0,
            decoder: ChunkedDecoder::new(),
            waiting_100: false,
            response_body_complete: false,
            request_complete: false,
        }
    }

    /// Underlying socket finished connecting.
    pub fn connected(&mut self, events: &mut Vec<ClientEvent>) {
        if self.state == ClientState::Connecting {
            self.state = ClientState::Idle;
            events.push(ClientEvent::Connected);
        }
    }

    /// Ready for the next request on this connection.
    pub fn rearm(&mut self) {
        self.req.reset();
        self.resp.reset();
        self.head_buf.clear();
        self.head_span = None;
        self.head_sent = 0;
        self.body_sent = 0;
        self.decoder.reset();
        self.waiting_100 = false;
        self.response_body_complete = false;
        self.request_complete = false;
        self.state = ClientState::Idle;
    }

    /// Begin sending a prepared outbound request.
    pub fn start_request(&mut self, req: Request) {
        debug_assert!(self.state == ClientState::Idle);
        self.req = req;
        self.head_span = None;
        self.head_sent = 0;
        self.body_sent = 0;
        self.request_count += 1;
        self.state = ClientState::SendingHeaders;
    }

    /// Emit request bytes into the output buffer. Returns true when
    /// anything was queued.
    pub fn produce(&mut self, out: &mut Buffer) -> bool {
        let mut progress = false;
        if self.state == ClientState::SendingHeaders {
            if self.head_span.is_none() {
                self.head_span = Some(prepare_client_request_headers(&mut self.req));
            }
            let span = self.head_span.expect("head prepared above");
            let head = self.req.arena.bytes(span);
            let take = head.len() - self.head_sent;
            if take > 0 {
                let chunk: Vec<u8> = head[self.head_sent..].to_vec();
                let accepted = out.append(&chunk);
                self.head_sent += accepted;
                progress = accepted > 0;
            }
            if self.head_sent == head.len() {
                self.state = if self.req.content_length == 0 {
                    ClientState::WaitResponse
                } else if self.req.expect_100_continue {
                    self.waiting_100 = true;
                    ClientState::Wait100Continue
                } else {
                    ClientState::SendingBody
                };
            }
        }
        if self.state == ClientState::SendingBody {
            let body = &self.req.content;
            if self.body_sent < body.len() {
                let chunk: Vec<u8> = body[self.body_sent..].to_vec();
                let accepted = out.append(&chunk);
                self.body_sent += accepted;
                progress = progress || accepted > 0;
            }
            if self.body_sent >= body.len() {
                self.state = ClientState::WaitResponse;
            }
        }
        progress
    }

    /// 100-continue wait resolved positively (interim response or
    /// timeout policy decided to push on).
    pub fn proceed_with_body(&mut self) {
        if self.waiting_100 {
            self.waiting_100 = false;
            self.state = ClientState::SendingBody;
        }
    }

    #[inline]
    fn response_has_body(&self, head_method: bool) -> bool {
        if head_method {
            return false;
        }
        !matches!(self.resp.status_code, 204 | 205 | 304) && self.resp.content_length != 0
    }

    /// Consume backend socket input. Decoded body bytes flow into
    /// `pipe`; input is only consumed as fast as the pipe drains.
    pub fn feed(
        &mut self,
        data: &[u8],
        pipe: &mut Pipe,
        events: &mut Vec<ClientEvent>,
    ) -> Result<usize, ClientError> {
        match self.state {
            ClientState::WaitResponse
            | ClientState::Wait100Continue
            | ClientState::SendingBody
            | ClientState::RecvHeaders => self.feed_headers(data, events),
            ClientState::RecvBody => self.feed_body(data, pipe, events),
            _ => Ok(0),
        }
    }

    fn feed_headers(
        &mut self,
        data: &[u8],
        events: &mut Vec<ClientEvent>,
    ) -> Result<usize, ClientError> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.state != ClientState::RecvHeaders {
            self.state = ClientState::RecvHeaders;
        }
        let room = crate::MAX_REQUEST_HEADERS_SIZE.saturating_sub(self.head_buf.len());
        if room == 0 {
            return Err(ClientError::BadResponse);
        }
        let take = data.len().min(room);
        self.head_buf.extend_from_slice(&data[..take]);

        match find_end_of_http_headers(&self.head_buf) {
            Some((head_end, body_start)) => {
                let consumed = take - (self.head_buf.len() - body_start);
                let head: Vec<u8> = self.head_buf[..head_end].to_vec();
                self.head_buf.clear();
                let mut resp = Response::new();
                parse_http_response(&mut resp, &head).map_err(|_| ClientError::BadResponse)?;

                if resp.status_code == 100 {
                    // interim response; go send the body
                    if self.waiting_100 {
                        self.proceed_with_body();
                    } else {
                        self.state = ClientState::WaitResponse;
                    }
                    events.push(ClientEvent::ContinueReceived);
                    return Ok(consumed);
                }

                self.resp = resp;
                events.push(ClientEvent::ResponseReceived);
                if self.response_has_body(self.req.head_method) {
                    self.decoder.reset();
                    self.state = ClientState::RecvBody;
                } else {
                    self.finish(events);
                }
                Ok(consumed)
            }
            None => Ok(take),
        }
    }

    fn feed_body(
        &mut self,
        data: &[u8],
        pipe: &mut Pipe,
        events: &mut Vec<ClientEvent>,
    ) -> Result<usize, ClientError> {
        if data.is_empty() {
            return Ok(0);
        }
        // never decode more than the pipe can absorb; decoding only
        // shrinks, so bounding the input is sufficient
        let room = pipe.buf.free_capacity();
        if room == 0 {
            return Ok(0);
        }

        if self.resp.chunked_encoding {
            let take = data.len().min(room);
            let mut scratch: Vec<u8> = data[..take].to_vec();
            let outcome = self
                .decoder
                .decode(&mut scratch)
                .map_err(|_| ClientError::ChunkedEncoding)?;
            if outcome.len > 0 {
                pipe.write(&scratch[..outcome.len]);
                self.resp.content_received += outcome.len as u64;
            }
            if outcome.complete {
                self.finish_body(pipe, events);
            }
            Ok(outcome.input_consumed)
        } else if self.resp.content_length >= 0 {
            let remaining = (self.resp.content_length as u64)
                .saturating_sub(self.resp.content_received) as usize;
            let take = data.len().min(remaining).min(room);
            pipe.write(&data[..take]);
            self.resp.content_received += take as u64;
            if self.resp.content_received >= self.resp.content_length as u64 {
                self.finish_body(pipe, events);
            }
            Ok(take)
        } else {
            // until-close delimited
            let take = data.len().min(room);
            pipe.write(&data[..take]);
            self.resp.content_received += take as u64;
            Ok(take)
        }
    }

    fn finish_body(&mut self, pipe: &mut Pipe, events: &mut Vec<ClientEvent>) {
        pipe.set_eof();
        self.response_body_complete = true;
        self.finish(events);
    }

    fn finish(&mut self, events: &mut Vec<ClientEvent>) {
        self.request_complete = true;
        self.state = ClientState::Idle;
        events.push(ClientEvent::RequestComplete);
    }

    /// Peer closed the read side. Legal end only for a close-delimited
    /// body.
    pub fn eof_received(&mut self, pipe: &mut Pipe, events: &mut Vec<ClientEvent>) -> bool {
        if self.state == ClientState::RecvBody
            && !self.resp.chunked_encoding
            && self.resp.content_length < 0
        {
            self.finish_body(pipe, events);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Pipe, PipeTable, Pull};

    fn outbound(method: &str, uri: &str, body: &[u8]) -> Request {
        let mut req = Request::new();
        req.set_method(method);
        req.set_uri(uri);
        req.set_host("backend:8000");
        req.http11 = true;
        req.keep_alive = true;
        req.content = body.to_vec();
        req.content_length = body.len() as i64;
        req
    }

    fn pipe() -> (PipeTable, Pipe) {
        let mut pipes = PipeTable::new();
        let id = pipes.create(crate::RBUF_SIZE);
        let pipe = pipes.take(id).unwrap();
        (pipes, pipe)
    }

    #[test]
    fn test_request_emission() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        assert_eq!(events, vec![ClientEvent::Connected]);

        proto.start_request(outbound("GET", "/items", b""));
        let mut out = Buffer::new(crate::RBUF_SIZE);
        assert!(proto.produce(&mut out));
        let wire = String::from_utf8(out.read_slice().to_vec()).unwrap();
        assert!(wire.starts_with("GET /items HTTP/1.1\r\nHost: backend:8000\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
        assert_eq!(proto.state, ClientState::WaitResponse);
    }

    #[test]
    fn test_request_with_body_emission() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        proto.start_request(outbound("POST", "/u", b"payload"));
        let mut out = Buffer::new(crate::RBUF_SIZE);
        proto.produce(&mut out);
        let wire = String::from_utf8(out.read_slice().to_vec()).unwrap();
        assert!(wire.contains("Content-Length: 7\r\n"));
        assert!(wire.ends_with("\r\n\r\npayload"));
        assert_eq!(proto.state, ClientState::WaitResponse);
    }

    #[test]
    fn test_response_with_content_length() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        proto.start_request(outbound("GET", "/", b""));
        let mut out = Buffer::new(crate::RBUF_SIZE);
        proto.produce(&mut out);

        let (_pipes, mut pipe) = pipe();
        let mut events = Vec::new();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut fed = 0;
        while fed < wire.len() {
            let n = proto.feed(&wire[fed..], &mut pipe, &mut events).unwrap();
            assert!(n > 0);
            fed += n;
        }
        assert_eq!(
            events,
            vec![ClientEvent::ResponseReceived, ClientEvent::RequestComplete]
        );
        assert_eq!(proto.resp.status_code, 200);
        let mut got = [0u8; 16];
        assert_eq!(pipe.read_into(&mut got), Pull::Data(5));
        assert_eq!(&got[..5], b"hello");
        assert_eq!(pipe.read_into(&mut got), Pull::Eof);
        assert!(proto.request_complete);
        assert_eq!(proto.state, ClientState::Idle);
    }

    #[test]
    fn test_chunked_response_decoded_into_pipe() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        proto.start_request(outbound("GET", "/", b""));
        let mut out = Buffer::new(crate::RBUF_SIZE);
        proto.produce(&mut out);

        let (_pipes, mut pipe) = pipe();
        let mut events = Vec::new();
        let wire =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n";
        let mut fed = 0;
        while fed < wire.len() {
            let n = proto.feed(&wire[fed..], &mut pipe, &mut events).unwrap();
            assert!(n > 0);
            fed += n;
        }
        assert!(events.contains(&ClientEvent::RequestComplete));
        let mut got = [0u8; 16];
        assert_eq!(pipe.read_into(&mut got), Pull::Data(7));
        assert_eq!(&got[..7], b"abcdefg");
        assert_eq!(pipe.read_into(&mut got), Pull::Eof);
    }

    #[test]
    fn test_100_continue_flow() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        let mut req = outbound("POST", "/u", b"abc");
        req.expect_100_continue = true;
        proto.start_request(req);

        let mut out = Buffer::new(crate::RBUF_SIZE);
        proto.produce(&mut out);
        let wire = String::from_utf8(out.read_slice().to_vec()).unwrap();
        assert!(wire.contains("Expect: 100-continue\r\n"));
        assert!(!wire.ends_with("abc"));
        assert_eq!(proto.state, ClientState::Wait100Continue);
        out.clear();

        let (_pipes, mut pipe) = pipe();
        let mut events = Vec::new();
        proto
            .feed(b"HTTP/1.1 100 Continue\r\n\r\n", &mut pipe, &mut events)
            .unwrap();
        assert_eq!(events, vec![ClientEvent::ContinueReceived]);
        assert_eq!(proto.state, ClientState::SendingBody);

        proto.produce(&mut out);
        assert_eq!(out.read_slice(), b"abc");
        assert_eq!(proto.state, ClientState::WaitResponse);
    }

    #[test]
    fn test_304_has_no_body() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        proto.start_request(outbound("GET", "/", b""));
        let mut out = Buffer::new(crate::RBUF_SIZE);
        proto.produce(&mut out);

        let (_pipes, mut pipe) = pipe();
        let mut events = Vec::new();
        proto
            .feed(
                b"HTTP/1.1 304 Not Modified\r\nContent-Length: 100\r\n\r\n",
                &mut pipe,
                &mut events,
            )
            .unwrap();
        assert!(proto.request_complete);
        assert_eq!(proto.resp.status_code, 304);
    }

    #[test]
    fn test_close_delimited_body() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        proto.start_request(outbound("GET", "/", b""));
        let mut out = Buffer::new(crate::RBUF_SIZE);
        proto.produce(&mut out);

        let (_pipes, mut pipe) = pipe();
        let mut events = Vec::new();
        proto
            .feed(
                b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\npartial",
                &mut pipe,
                &mut events,
            )
            .unwrap();
        assert_eq!(proto.state, ClientState::RecvBody);
        proto.feed(b" data", &mut pipe, &mut events).unwrap();
        assert!(proto.eof_received(&mut pipe, &mut events));
        assert!(proto.request_complete);
        let mut got = [0u8; 32];
        assert_eq!(pipe.read_into(&mut got), Pull::Data(12));
        assert_eq!(&got[..12], b"partial data");
    }

    #[test]
    fn test_pipe_backpressure_limits_consumption() {
        let mut proto = HttpClientProto::new();
        let mut events = Vec::new();
        proto.connected(&mut events);
        proto.start_request(outbound("GET", "/", b""));
        let mut out = Buffer::new(crate::RBUF_SIZE);
        proto.produce(&mut out);

        let mut pipes = PipeTable::new();
        let id = pipes.create(4096);
        let mut pipe = pipes.take(id).unwrap();

        let mut events = Vec::new();
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 8192\r\n\r\n";
        proto.feed(head, &mut pipe, &mut events).unwrap();

        let body = vec![b'x'; 8192];
        let n1 = proto.feed(&body, &mut pipe, &mut events).unwrap();
        assert_eq!(n1, 4096); // pipe full
        let n2 = proto.feed(&body[n1..], &mut pipe, &mut events).unwrap();
        assert_eq!(n2, 0);
        // consumer drains, producer resumes
        let mut sink = vec![0u8; 4096];
        assert_eq!(pipe.read_into(&mut sink), Pull::Data(4096));
        let n3 = proto.feed(&body[n1..], &mut pipe, &mut events).unwrap();
        assert_eq!(n3, 4096);
        assert!(proto.request_complete);
    }
}
