//! Request handlers for the event loop.
//!
//! Handlers are synchronous and work on raw byte buffers: they look at
//! the bytes accumulated on a connection and decide what to send back.
//!
//! - `HelloWorld`: any request is answered with a fixed HTTP/1.0 response.
//! - `Echo`: every received byte is sent back, in arrival order.

use bytes::BytesMut;

/// Fixed response for the hello-world handler.
///
/// Status line, blank line, body. No headers and no length negotiation.
pub const HELLO_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\n\nHello World!";

/// Handler selected for every connection accepted by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    HelloWorld,
    Echo,
}

/// Result of processing the inbound buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Nothing buffered yet.
    NeedData,
    /// Input consumed, response appended to the output buffer.
    Response {
        consumed: usize,
        response_len: usize,
    },
}

impl Protocol {
    /// Run the handler over `input`, consuming what it used and appending
    /// the response to `output`.
    pub fn process(self, input: &mut BytesMut, output: &mut BytesMut) -> ProcessResult {
        match self {
            Protocol::HelloWorld => process_hello(input, output),
            Protocol::Echo => process_echo(input, output),
        }
    }
}

/// Answer any buffered request with [`HELLO_RESPONSE`].
///
/// Request contents are never parsed, the whole buffer is discarded.
fn process_hello(input: &mut BytesMut, output: &mut BytesMut) -> ProcessResult {
    if input.is_empty() {
        return ProcessResult::NeedData;
    }

    let consumed = input.len();
    input.clear();
    output.extend_from_slice(HELLO_RESPONSE);

    ProcessResult::Response {
        consumed,
        response_len: HELLO_RESPONSE.len(),
    }
}

/// Move every unconsumed input byte to the output buffer.
///
/// Bytes left unflushed from an earlier tick stay at the front of `output`,
/// so the stream written back is the concatenation of everything received.
fn process_echo(input: &mut BytesMut, output: &mut BytesMut) -> ProcessResult {
    if input.is_empty() {
        return ProcessResult::NeedData;
    }

    let data = input.split();
    let consumed = data.len();
    output.extend_from_slice(&data);

    ProcessResult::Response {
        consumed,
        response_len: consumed,
    }
}
