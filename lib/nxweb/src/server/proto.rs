//! HTTP server protocol state machine. One instance per keep-alive
//! connection; owns the current request and response and moves bytes
//! between the connection's buffers and the parsed/assembled forms.
//! It is driven entirely through `feed` (socket input) and `produce`
//! (socket output), so it is testable without sockets.

use crate::buffer::Buffer;
use crate::error::{FatalKind, NetError, NetResult};
use crate::event::Message;
use crate::http::emit::{prepare_response_headers, HTTP_100_CONTINUE};
use crate::http::parse::{find_end_of_http_headers, parse_http_request, ParseError};
use crate::http::{Content, Request, Response};
use crate::stream::{BodySink, PipeTable, Pull};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtoState {
    Waiting,
    RecvHeaders,
    RecvBody,
    Handling,
    SendHeaders,
    SendBody,
}

/// Hard protocol failures; the connection answers with the paired
/// status code and closes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtoError {
    /// Malformed request head.
    BadRequest,
    /// Request line alone overflows the header buffer.
    UriTooLong,
    /// Trailer header present.
    NotImplemented,
    /// Buffered body over the limit.
    BodyTooLarge,
    /// Malformed chunked framing.
    ChunkedEncoding,
}

impl ProtoError {
    pub fn status(self) -> (u16, &'static str) {
        match self {
            ProtoError::BadRequest => (400, "Bad Request"),
            ProtoError::UriTooLong => (414, "Request-URI Too Long"),
            ProtoError::NotImplemented => (501, "Not Implemented"),
            ProtoError::BodyTooLarge => (413, "Request Entity Too Large"),
            ProtoError::ChunkedEncoding => (400, "Bad Request"),
        }
    }
}

/// Where decoded request body bytes go.
enum BodyOut {
    /// Buffer into `req.content`, bounded by the body size limit.
    Memory,
    /// Handler-connected sink.
    Sink(Box<dyn BodySink>),
}

/// What `produce` accomplished.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Produced {
    /// Bytes were moved into the output buffer.
    pub progress: bool,
    /// The response is fully framed into the output buffer.
    pub complete: bool,
    /// Content source has no data yet (pipe/streamer waiting).
    pub waiting_on_content: bool,
}

pub struct HttpServerProto {
    pub state: ProtoState,
    pub req: Request,
    pub resp: Response,
    pub request_count: u32,
    pub headers_bytes_received: usize,
    head_buf: Vec<u8>,
    seen_newline: bool,
    body_out: Option<BodyOut>,
    send_100_continue: bool,
    head_emitted: bool,
    body_eof: bool,
    pub is_subrequest: bool,
    scratch: Vec<u8>,
}

impl HttpServerProto {
    pub fn new() -> HttpServerProto {
        HttpServerProto {
            state: ProtoState::Waiting,
            req: Request::new(),
            resp: Response::new(),
            request_count: 0,
            headers_bytes_received: 0,
            head_buf: Vec::new(),
            seen_newline: false,
            body_out: None,
            send_100_continue: false,
            head_emitted: false,
            body_eof: false,
            is_subrequest: false,
            scratch: Vec::new(),
        }
    }

    pub fn subrequest() -> HttpServerProto {
        let mut proto = HttpServerProto::new();
        proto.is_subrequest = true;
        proto
    }

    /// Reset for the next request on the same connection. The arenas
    /// keep their capacity; everything else starts clean.
    pub fn request_reset(&mut self) {
        self.req.reset();
        self.resp.reset();
        self.state = ProtoState::Waiting;
        self.headers_bytes_received = 0;
        self.head_buf.clear();
        self.seen_newline = false;
        self.body_out = None;
        self.send_100_continue = false;
        self.head_emitted = false;
        self.body_eof = false;
    }

    #[inline]
    pub fn receiving(&self) -> bool {
        matches!(
            self.state,
            ProtoState::Waiting | ProtoState::RecvHeaders | ProtoState::RecvBody
        )
    }

    /// Consume socket input. Returns the number of bytes consumed;
    /// zero means the protocol is not ready for input (mid-handling
    /// backpressure).
    pub fn feed(&mut self, data: &[u8], events: &mut Vec<Message>) -> Result<usize, ProtoError> {
        match self.state {
            ProtoState::Waiting | ProtoState::RecvHeaders => self.feed_headers(data, events),
            ProtoState::RecvBody => self.feed_body(data, events),
            _ => Ok(0),
        }
    }

    fn feed_headers(&mut self, data: &[u8], events: &mut Vec<Message>) -> Result<usize, ProtoError> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.state == ProtoState::Waiting {
            self.state = ProtoState::RecvHeaders;
        }

        let room = crate::MAX_REQUEST_HEADERS_SIZE - self.head_buf.len();
        let take = data.len().min(room);
        self.head_buf.extend_from_slice(&data[..take]);
        self.headers_bytes_received = self.head_buf.len();
        self.seen_newline = self.seen_newline || data[..take].contains(&b'\n');

        match find_end_of_http_headers(&self.head_buf) {
            Some((head_end, body_start)) => {
                let consumed = take - (self.head_buf.len() - body_start);
                let head: Vec<u8> = self.head_buf[..head_end].to_vec();
                self.head_buf.clear();
                match parse_http_request(&mut self.req, &head) {
                    Ok(()) => {}
                    Err(ParseError::TrailerNotImplemented) => {
                        return Err(ProtoError::NotImplemented)
                    }
                    Err(ParseError::Bad) => return Err(ProtoError::BadRequest),
                }
                self.request_count += 1;
                self.resp.init_from(&self.req);
                self.state = ProtoState::Handling;
                events.push(Message::RequestReceived);
                Ok(consumed)
            }
            None => {
                if self.head_buf.len() >= crate::MAX_REQUEST_HEADERS_SIZE {
                    // an oversized request line alone reads as a URI
                    // problem, anything else as a plain bad request
                    return Err(if self.seen_newline {
                        ProtoError::BadRequest
                    } else {
                        ProtoError::UriTooLong
                    });
                }
                Ok(take)
            }
        }
    }

    fn feed_body(&mut self, data: &[u8], events: &mut Vec<Message>) -> Result<usize, ProtoError> {
        if data.is_empty() {
            return Ok(0);
        }
        let consumed;
        let complete;
        if self.req.chunked_encoding {
            self.scratch.clear();
            self.scratch.extend_from_slice(data);
            let outcome = {
                let scratch = &mut self.scratch;
                self.req
                    .cdstate
                    .decode(scratch)
                    .map_err(|_| ProtoError::ChunkedEncoding)?
            };
            let decoded_len = outcome.len;
            consumed = outcome.input_consumed;
            complete = outcome.complete;
            if decoded_len > 0 {
                let decoded: Vec<u8> = self.scratch[..decoded_len].to_vec();
                self.deliver_body(&decoded)?;
            }
            if complete {
                self.req.chunked_content_complete = true;
            }
        } else {
            let remaining = (self.req.content_length as u64)
                .saturating_sub(self.req.content_received) as usize;
            let take = data.len().min(remaining);
            self.deliver_body(&data[..take])?;
            consumed = take;
            complete = self.req.content_received >= self.req.content_length as u64;
        }

        if complete {
            self.state = ProtoState::Handling;
            if let Some(BodyOut::Sink(mut sink)) = self.body_out.take() {
                sink.on_complete();
            }
            events.push(Message::RequestBodyReceived);
        }
        Ok(consumed)
    }

    fn deliver_body(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        if data.is_empty() {
            return Ok(());
        }
        self.req.content_received += data.len() as u64;
        match self.body_out.as_mut() {
            Some(BodyOut::Memory) => {
                if self.req.content.len() + data.len() > crate::MAX_REQUEST_BODY_SIZE {
                    return Err(ProtoError::BodyTooLarge);
                }
                self.req.content.extend_from_slice(data);
                Ok(())
            }
            Some(BodyOut::Sink(sink)) => {
                sink.on_data(data).map_err(|_| ProtoError::BadRequest)?;
                Ok(())
            }
            None => Ok(()), // body discarded (drain before error close)
        }
    }

    /// Route the request body to a handler sink.
    pub fn connect_request_body_out(&mut self, sink: Box<dyn BodySink>) {
        self.body_out = Some(BodyOut::Sink(sink));
    }

    #[inline]
    pub fn body_out_connected(&self) -> bool {
        matches!(self.body_out, Some(BodyOut::Sink(_)))
    }

    /// Begin receiving the request body. With Expect: 100-continue the
    /// interim response goes out first.
    pub fn start_receiving_request_body(&mut self) {
        if self.body_out.is_none() {
            self.body_out = Some(BodyOut::Memory);
            self.req.buffering_to_memory = true;
        }
        if self.req.expect_100_continue && self.req.content_received == 0 {
            self.send_100_continue = true;
            self.req.sending_100_continue = true;
        }
        self.state = ProtoState::RecvBody;
    }

    /// Choose response framing. Chunked is only available for
    /// HTTP/1.1 peers; for 1.0 an unknown length forces close
    /// delimiting.
    pub fn finish_response(resp: &mut Response) {
        if resp.content_length < 0 && !resp.http11 {
            resp.keep_alive = false;
        }
        if resp.status_code == 0 {
            resp.status_code = 200;
        }
    }

    /// Finalise headers and switch to sending.
    pub fn start_sending_response(&mut self, http_date: &str, events: &mut Vec<Message>) {
        Self::finish_response(&mut self.resp);
        if self.is_subrequest {
            // no wire head for in-process requests
            self.state = ProtoState::SendBody;
            events.push(Message::ResponseReady);
            return;
        }
        prepare_response_headers(&mut self.resp, http_date);
        self.head_emitted = false;
        self.body_eof = false;
        self.state = ProtoState::SendHeaders;
    }

    #[inline]
    fn entity_suppressed(&self) -> bool {
        self.req.head_method
            || matches!(self.resp.status_code, 204 | 205 | 304)
    }

    /// Move response bytes into the output buffer. Repeated calls
    /// continue where the previous one left off.
    pub fn produce(&mut self, out: &mut Buffer, pipes: &mut PipeTable) -> NetResult<Produced> {
        let mut progress = false;

        if self.send_100_continue {
            if out.free_capacity() < HTTP_100_CONTINUE.len() {
                return Ok(Produced {
                    progress,
                    complete: false,
                    waiting_on_content: false,
                });
            }
            out.append(HTTP_100_CONTINUE);
            self.send_100_continue = false;
            self.req.sending_100_continue = false;
            progress = true;
        }

        if self.state != ProtoState::SendHeaders && self.state != ProtoState::SendBody {
            return Ok(Produced {
                progress,
                complete: false,
                waiting_on_content: false,
            });
        }

        if self.state == ProtoState::SendHeaders && !self.head_emitted {
            let head: &[u8] = match self.resp.raw_headers {
                Some(span) => self.resp.arena.bytes(span),
                None => &[],
            };
            if out.free_capacity() < head.len() {
                return Ok(Produced {
                    progress,
                    complete: false,
                    waiting_on_content: false,
                });
            }
            out.append(head);
            self.head_emitted = true;
            self.state = ProtoState::SendBody;
            progress = true;
        }

        if self.entity_suppressed() || self.resp.content_length == 0 {
            return Ok(Produced {
                progress,
                complete: true,
                waiting_on_content: false,
            });
        }

        // subrequest bodies flow raw into the parent's pipe; the
        // parent applies its own framing
        let chunked = self.resp.content_length < 0 && self.resp.http11 && !self.is_subrequest;
        loop {
            if self.body_eof {
                break;
            }
            let mut room = out.free_capacity();
            if chunked {
                room = room.saturating_sub(crate::http::ChunkedEncoder::overhead(0) + 8);
            }
            if room < 64 {
                // output full; socket drain will call produce again
                return Ok(Produced {
                    progress,
                    complete: false,
                    waiting_on_content: false,
                });
            }
            let block = room.min(crate::stream::FILE_READ_BLOCK);
            if self.scratch.len() < block {
                self.scratch.resize(block, 0);
            }

            let pull = match &mut self.resp.content {
                Content::None => Pull::Eof,
                Content::Bytes(span) => {
                    let bytes = self.resp.arena.bytes(*span);
                    let sent = self.resp.bytes_sent as usize;
                    if sent >= bytes.len() {
                        Pull::Eof
                    } else {
                        let take = block.min(bytes.len() - sent);
                        self.scratch[..take].copy_from_slice(&bytes[sent..sent + take]);
                        Pull::Data(take)
                    }
                }
                Content::Cached(rec) => {
                    let sent = self.resp.bytes_sent as usize;
                    if sent >= rec.content.len() {
                        Pull::Eof
                    } else {
                        let take = block.min(rec.content.len() - sent);
                        self.scratch[..take].copy_from_slice(&rec.content[sent..sent + take]);
                        Pull::Data(take)
                    }
                }
                Content::File(fw) => fw
                    .read_into(&mut self.scratch[..block])
                    .map_err(NetError::from)?,
                Content::Pipe(id) => {
                    let pipe = pipes.get_mut(*id);
                    if pipe.broken && !pipe.eof && pipe.buf.is_empty() {
                        return Err(NetError::Fatal(FatalKind::Io));
                    }
                    pipe.read_into(&mut self.scratch[..block])
                }
                Content::Streamer(streamer) => {
                    streamer.read_into(&mut self.scratch[..block], pipes)?
                }
            };

            match pull {
                Pull::Data(n) => {
                    if chunked {
                        let mut framed = Vec::with_capacity(n + 16);
                        self.resp.cestate.encode(&mut framed, &self.scratch[..n]);
                        out.append(&framed);
                    } else {
                        out.append(&self.scratch[..n]);
                    }
                    self.resp.bytes_sent += n as u64;
                    progress = true;
                }
                Pull::Wait => {
                    return Ok(Produced {
                        progress,
                        complete: false,
                        waiting_on_content: true,
                    });
                }
                Pull::Eof => {
                    if chunked {
                        let mut terminator = Vec::with_capacity(8);
                        self.resp.cestate.finish(&mut terminator);
                        if !terminator.is_empty() {
                            out.append(&terminator);
                            progress = true;
                        }
                    }
                    self.body_eof = true;
                }
            }
        }

        let complete = if self.resp.content_length >= 0 {
            self.resp.bytes_sent >= self.resp.content_length as u64
        } else {
            self.body_eof
        };
        Ok(Produced {
            progress,
            complete,
            waiting_on_content: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetResult;

    const DATE: &str = "Tue, 24 Jan 2012 13:05:54 GMT";

    fn feed_all(proto: &mut HttpServerProto, mut data: &[u8]) -> (Vec<Message>, usize) {
        let mut events = Vec::new();
        let mut total = 0;
        while !data.is_empty() {
            let n = proto.feed(data, &mut events).unwrap();
            if n == 0 {
                break;
            }
            total += n;
            data = &data[n..];
        }
        (events, total)
    }

    fn drain(proto: &mut HttpServerProto) -> Vec<u8> {
        let mut out = Buffer::new(crate::RBUF_SIZE);
        let mut pipes = PipeTable::new();
        let mut wire = Vec::new();
        loop {
            let produced = proto.produce(&mut out, &mut pipes).unwrap();
            wire.extend_from_slice(out.read_slice());
            out.clear();
            if produced.complete || (!produced.progress && !produced.complete) {
                break;
            }
        }
        wire
    }

    #[test]
    fn test_request_then_404_response() {
        let mut proto = HttpServerProto::new();
        let (events, _) = feed_all(&mut proto, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(events, vec![Message::RequestReceived]);
        assert_eq!(proto.state, ProtoState::Handling);
        assert!(!proto.req.http11);

        proto.resp.send_http_error(404, "Not Found");
        let mut events = Vec::new();
        proto.start_sending_response(DATE, &mut events);
        let wire = drain(&mut proto);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        assert!(!body.is_empty());
        assert!(body.contains(&format!("nxweb/{}", crate::REVISION)));
    }

    #[test]
    fn test_split_header_arrival() {
        let mut proto = HttpServerProto::new();
        let mut events = Vec::new();
        proto.feed(b"GET / HT", &mut events).unwrap();
        assert_eq!(proto.state, ProtoState::RecvHeaders);
        proto.feed(b"TP/1.1\r\nHost: x\r\n", &mut events).unwrap();
        assert!(events.is_empty());
        proto.feed(b"\r\n", &mut events).unwrap();
        assert_eq!(events, vec![Message::RequestReceived]);
    }

    #[test]
    fn test_oversized_headers_rejected() {
        let mut proto = HttpServerProto::new();
        let mut events = Vec::new();
        let huge = vec![b'a'; crate::MAX_REQUEST_HEADERS_SIZE + 10];
        let err = loop {
            match proto.feed(&huge, &mut events) {
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        // no newline ever seen: the request line itself overflowed
        assert_eq!(err, ProtoError::UriTooLong);

        let mut proto = HttpServerProto::new();
        let mut head = b"GET / HTTP/1.1\r\n".to_vec();
        head.extend(vec![b'h'; crate::MAX_REQUEST_HEADERS_SIZE]);
        let err = loop {
            match proto.feed(&head, &mut events) {
                Ok(n) => {
                    head.drain(..n);
                    continue;
                }
                Err(err) => break err,
            }
        };
        assert_eq!(err, ProtoError::BadRequest);
    }

    #[test]
    fn test_body_buffering_to_memory() {
        let mut proto = HttpServerProto::new();
        let (events, _) =
            feed_all(&mut proto, b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(events, vec![Message::RequestReceived]);
        assert_eq!(proto.req.content_length, 5);

        proto.start_receiving_request_body();
        let mut events = Vec::new();
        let consumed = proto.feed(b"HELLO", &mut events).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(events, vec![Message::RequestBodyReceived]);
        assert_eq!(proto.req.content, b"HELLO");
        assert_eq!(proto.req.content_received, 5);
    }

    #[test]
    fn test_body_keeps_pipelined_bytes() {
        let mut proto = HttpServerProto::new();
        feed_all(&mut proto, b"POST /e HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\n");
        proto.start_receiving_request_body();
        let mut events = Vec::new();
        let consumed = proto.feed(b"abcGET /next", &mut events).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(proto.req.content, b"abc");
    }

    #[test]
    fn test_chunked_body_decode() {
        let mut proto = HttpServerProto::new();
        let (events, _) = feed_all(
            &mut proto,
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert_eq!(events, vec![Message::RequestReceived]);
        proto.start_receiving_request_body();

        let mut events = Vec::new();
        let consumed = proto.feed(b"5\r\nHELLO\r\n0\r\n\r\n", &mut events).unwrap();
        assert_eq!(consumed, 15);
        assert_eq!(events, vec![Message::RequestBodyReceived]);
        assert_eq!(proto.req.content, b"HELLO");
        assert!(proto.req.chunked_content_complete);
    }

    #[test]
    fn test_body_too_large() {
        let mut proto = HttpServerProto::new();
        feed_all(
            &mut proto,
            format!(
                "POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
                crate::MAX_REQUEST_BODY_SIZE + 1
            )
            .as_bytes(),
        );
        proto.start_receiving_request_body();
        let big = vec![0u8; crate::MAX_REQUEST_BODY_SIZE + 1];
        let mut events = Vec::new();
        assert_eq!(proto.feed(&big, &mut events), Err(ProtoError::BodyTooLarge));
    }

    #[test]
    fn test_100_continue_emitted_before_body_read() {
        let mut proto = HttpServerProto::new();
        let (events, _) = feed_all(
            &mut proto,
            b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n",
        );
        assert_eq!(events, vec![Message::RequestReceived]);
        assert!(proto.req.expect_100_continue);
        proto.start_receiving_request_body();
        assert!(proto.req.sending_100_continue);

        let mut out = Buffer::new(crate::RBUF_SIZE);
        let mut pipes = PipeTable::new();
        proto.produce(&mut out, &mut pipes).unwrap();
        assert_eq!(out.read_slice(), HTTP_100_CONTINUE);
        out.clear();

        let mut events = Vec::new();
        proto.feed(b"abc", &mut events).unwrap();
        assert_eq!(events, vec![Message::RequestBodyReceived]);
        assert_eq!(proto.req.content, b"abc");
    }

    #[test]
    fn test_content_length_framing_exact() {
        let mut proto = HttpServerProto::new();
        feed_all(&mut proto, b"GET /d HTTP/1.1\r\nHost: x\r\n\r\n");
        proto.resp.send_data(b"0123456789", "text/plain");
        let mut events = Vec::new();
        proto.start_sending_response(DATE, &mut events);
        let wire = drain(&mut proto);
        let text = String::from_utf8(wire).unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body.len(), 10);
        assert_eq!(body, "0123456789");
        assert_eq!(proto.resp.bytes_sent, 10);
    }

    #[test]
    fn test_chunked_response_roundtrip() {
        let mut proto = HttpServerProto::new();
        feed_all(&mut proto, b"GET /s HTTP/1.1\r\nHost: x\r\n\r\n");

        let mut streamer = crate::stream::Streamer::new();
        streamer.append_bytes(b"hello ".to_vec());
        streamer.append_bytes(b"world".to_vec());
        streamer.close();
        proto.resp.content = Content::Streamer(streamer);
        proto.resp.content_length = -1;

        let mut events = Vec::new();
        proto.start_sending_response(DATE, &mut events);
        let wire = drain(&mut proto);
        let text = String::from_utf8(wire.clone()).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));

        let head_end = text.find("\r\n\r\n").unwrap() + 4;
        let mut body = wire[head_end..].to_vec();
        // exactly one terminator at the very end
        assert!(body.ends_with(b"0\r\n\r\n"));
        let terminator: &[u8] = b"0\r\n\r\n";
        assert_eq!(body.windows(5).filter(|w| *w == terminator).count(), 1);
        let mut decoder = crate::http::ChunkedDecoder::new();
        let outcome = decoder.decode(&mut body).unwrap();
        assert!(outcome.complete);
        assert_eq!(&body[..outcome.len], b"hello world");
    }

    #[test]
    fn test_head_method_suppresses_entity() {
        let mut proto = HttpServerProto::new();
        feed_all(&mut proto, b"HEAD /d HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(proto.req.head_method);
        proto.resp.send_data(b"0123456789", "text/plain");
        let mut events = Vec::new();
        proto.start_sending_response(DATE, &mut events);
        let wire = drain(&mut proto);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_keep_alive_reset_bounds_arena() {
        let mut proto = HttpServerProto::new();
        let mut high_water = 0;
        for i in 0..50 {
            let head = format!("GET /r{} HTTP/1.1\r\nHost: x\r\n\r\n", i);
            let (events, _) = feed_all(&mut proto, head.as_bytes());
            assert_eq!(events, vec![Message::RequestReceived]);
            proto.resp.send_data(b"payload-payload", "text/plain");
            let mut events = Vec::new();
            proto.start_sending_response(DATE, &mut events);
            let wire = drain(&mut proto);
            assert!(!wire.is_empty());
            if i == 25 {
                high_water = proto.req.arena.capacity() + proto.resp.arena.capacity();
            }
            proto.request_reset();
            assert_eq!(proto.state, ProtoState::Waiting);
        }
        let final_water = proto.req.arena.capacity() + proto.resp.arena.capacity();
        assert_eq!(final_water, high_water);
        assert_eq!(proto.request_count, 50);
    }

    #[test]
    fn test_http10_unknown_length_forces_close() {
        let mut resp = Response::new();
        resp.http11 = false;
        resp.keep_alive = true;
        resp.content_length = -1;
        HttpServerProto::finish_response(&mut resp);
        assert!(!resp.keep_alive);
    }

    #[test]
    fn test_produce_is_resumable_across_full_output() -> NetResult<()> {
        let mut proto = HttpServerProto::new();
        feed_all(&mut proto, b"GET /big HTTP/1.1\r\nHost: x\r\n\r\n");
        let payload = vec![b'z'; 40000];
        proto.resp.send_data(&payload, "text/plain");
        let mut events = Vec::new();
        proto.start_sending_response(DATE, &mut events);

        let mut out = Buffer::new(4096);
        let mut pipes = PipeTable::new();
        let mut wire = Vec::new();
        loop {
            let produced = proto.produce(&mut out, &mut pipes)?;
            wire.extend_from_slice(out.read_slice());
            out.clear();
            if produced.complete {
                break;
            }
        }
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(wire.len() - head_end, payload.len());
        Ok(())
    }
}
