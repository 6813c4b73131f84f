//! Wire codec for the hub's TCP protocol.
//!
//! A message is a byte sequence terminated by the sentinel `[-_-]`; a
//! request payload is further structured as `METHOD|-**-|BODY`. There is no
//! length prefix, so the reader accumulates until it observes the sentinel,
//! tolerating arbitrary chunk sizes and partial delivery.
//!
//! The framing is kept byte-compatible with the existing worker fleet.
//! Neither token may appear inside a payload; senders reject such payloads
//! instead of escaping them, so a collision fails loudly at the producer
//! rather than desynchronizing the stream.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frame terminator.
pub const FRAME_END: &[u8] = b"[-_-]";

/// Separator between the method literal and the request body.
pub const METHOD_SPLIT: &[u8] = b"|-**-|";

/// Acknowledgement payload for accepted mutations.
pub const OK_RESPONSE: &[u8] = b"ok";

/// Error marker returned for an unrecognized method literal.
pub const UNKNOWN_METHOD_RESPONSE: &[u8] = b"unknown-method";

/// Upper bound on a single frame. Anything larger is treated as a
/// malformed (or hostile) stream.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Request methods understood by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Lease up to N runnable steps for a scope set.
    GetSteps,
    /// Mark a step successful and promote its children.
    Done,
    /// Return a step to the runnable pool.
    Pending,
    /// Cancel a step and everything reachable from it.
    Cancel,
    /// Reset a step and everything reachable from it.
    Reset,
    /// Record a worker failure with message and trace.
    Error,
    /// Insert one step row.
    UploadStep,
    /// Insert a batch of step rows.
    UploadSteps,
    /// Grouped row counts by status.
    StepCount,
    /// Flip errored (optionally stuck) rows back to pending.
    ResetErrors,
    /// Administrative wipe of the metadata table.
    DeleteSteps,
    /// Page of errored rows with definitions attached.
    FetchErrors,
    /// Fetch runtime rows by id.
    FetchRows,
}

impl Method {
    /// Returns the wire literal for this method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetSteps => "get-steps",
            Self::Done => "done",
            Self::Pending => "pending",
            Self::Cancel => "cancel",
            Self::Reset => "reset",
            Self::Error => "error",
            Self::UploadStep => "upload-step",
            Self::UploadSteps => "upload-steps",
            Self::StepCount => "step-count",
            Self::ResetErrors => "reset-errors",
            Self::DeleteSteps => "delete-steps",
            Self::FetchErrors => "fetch-errors",
            Self::FetchRows => "fetch-rows",
        }
    }

    /// Resolves a wire literal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMethod`] if the literal is not part of the
    /// protocol.
    pub fn parse(literal: &str) -> Result<Self> {
        match literal {
            "get-steps" => Ok(Self::GetSteps),
            "done" => Ok(Self::Done),
            "pending" => Ok(Self::Pending),
            "cancel" => Ok(Self::Cancel),
            "reset" => Ok(Self::Reset),
            "error" => Ok(Self::Error),
            "upload-step" => Ok(Self::UploadStep),
            "upload-steps" => Ok(Self::UploadSteps),
            "step-count" => Ok(Self::StepCount),
            "reset-errors" => Ok(Self::ResetErrors),
            "delete-steps" => Ok(Self::DeleteSteps),
            "fetch-errors" => Ok(Self::FetchErrors),
            "fetch-rows" => Ok(Self::FetchRows),
            other => Err(Error::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }

    /// Returns true if the method mutates step state and therefore goes
    /// through the durable transaction queue rather than the read path.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::Pending
                | Self::Cancel
                | Self::Reset
                | Self::Error
                | Self::UploadStep
                | Self::UploadSteps
                | Self::ResetErrors
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded request: method plus opaque body bytes.
#[derive(Debug, Clone)]
pub struct Request {
    /// The resolved method.
    pub method: Method,
    /// Body bytes; interpretation depends on the method.
    pub body: Vec<u8>,
}

impl Request {
    /// Creates a request.
    #[must_use]
    pub fn new(method: Method, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method,
            body: body.into(),
        }
    }

    /// Encodes the request payload (without the frame terminator).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the body contains a reserved token.
    pub fn encode(&self) -> Result<Vec<u8>> {
        reject_reserved_tokens(&self.body)?;
        let mut out = Vec::with_capacity(self.method.as_str().len() + METHOD_SPLIT.len() + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.extend_from_slice(METHOD_SPLIT);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decodes a request payload (a frame with the terminator stripped).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] if the method separator is missing
    /// or the method literal is not UTF-8, and [`Error::UnknownMethod`] for
    /// an unrecognized literal.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let split = find_token(payload, METHOD_SPLIT)
            .ok_or_else(|| Error::malformed_frame("missing method separator"))?;
        let literal = std::str::from_utf8(&payload[..split])
            .map_err(|_| Error::malformed_frame("method literal is not UTF-8"))?;
        let method = Method::parse(literal)?;
        let body = payload[split + METHOD_SPLIT.len()..].to_vec();
        Ok(Self { method, body })
    }
}

/// Reads one frame, returning the payload with the terminator stripped.
///
/// Returns `Ok(None)` if the peer closed the connection before sending any
/// bytes.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] on EOF mid-frame or when the frame
/// exceeds the size guard, and [`Error::Io`] for transport failures.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4 * 1024);
    // Resume scanning where the previous pass left off; the terminator may
    // straddle a chunk boundary, so back up by its length minus one.
    let mut scanned = 0usize;
    loop {
        if let Some(pos) = find_token(&buf[scanned..], FRAME_END) {
            let end = scanned + pos;
            return Ok(Some(buf[..end].to_vec()));
        }
        scanned = buf.len().saturating_sub(FRAME_END.len() - 1);

        if buf.len() > MAX_FRAME_BYTES {
            return Err(Error::malformed_frame(format!(
                "frame exceeds {MAX_FRAME_BYTES} bytes without terminator"
            )));
        }

        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::malformed_frame(format!(
                "connection closed mid-frame after {} bytes",
                buf.len()
            )));
        }
    }
}

/// Writes one frame: the payload followed by the terminator.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the payload contains the terminator,
/// and [`Error::Io`] for transport failures.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if find_token(payload, FRAME_END).is_some() {
        return Err(Error::InvalidInput(
            "payload contains the frame terminator".to_string(),
        ));
    }
    writer.write_all(payload).await?;
    writer.write_all(FRAME_END).await?;
    writer.flush().await?;
    Ok(())
}

/// Rejects payloads that would collide with the framing tokens.
fn reject_reserved_tokens(body: &[u8]) -> Result<()> {
    if find_token(body, FRAME_END).is_some() {
        return Err(Error::InvalidInput(
            "body contains the frame terminator".to_string(),
        ));
    }
    if find_token(body, METHOD_SPLIT).is_some() {
        return Err(Error::InvalidInput(
            "body contains the method separator".to_string(),
        ));
    }
    Ok(())
}

/// Finds the first occurrence of `token` in `haystack`.
fn find_token(haystack: &[u8], token: &[u8]) -> Option<usize> {
    if token.is_empty() || haystack.len() < token.len() {
        return None;
    }
    haystack.windows(token.len()).position(|w| w == token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn method_literals_round_trip() {
        for method in [
            Method::GetSteps,
            Method::Done,
            Method::Pending,
            Method::Cancel,
            Method::Reset,
            Method::Error,
            Method::UploadStep,
            Method::UploadSteps,
            Method::StepCount,
            Method::ResetErrors,
            Method::DeleteSteps,
            Method::FetchErrors,
            Method::FetchRows,
        ] {
            assert_eq!(Method::parse(method.as_str()).expect("parse"), method);
        }
        assert!(Method::parse("gimme-steps").is_err());
    }

    #[test]
    fn mutation_classification() {
        assert!(Method::Done.is_mutation());
        assert!(Method::UploadSteps.is_mutation());
        assert!(Method::ResetErrors.is_mutation());
        assert!(!Method::GetSteps.is_mutation());
        assert!(!Method::FetchRows.is_mutation());
        assert!(!Method::DeleteSteps.is_mutation());
    }

    #[test]
    fn request_encode_decode() {
        let request = Request::new(Method::Done, "step-123".as_bytes());
        let encoded = request.encode().expect("encode");
        let decoded = Request::decode(&encoded).expect("decode");
        assert_eq!(decoded.method, Method::Done);
        assert_eq!(decoded.body, b"step-123");
    }

    #[test]
    fn encode_rejects_reserved_tokens() {
        let request = Request::new(Method::Error, b"oops [-_-] in payload".to_vec());
        assert!(request.encode().is_err());

        let request = Request::new(Method::Error, b"oops |-**-| in payload".to_vec());
        assert!(request.encode().is_err());
    }

    #[test]
    fn decode_requires_separator() {
        assert!(Request::decode(b"done step-123").is_err());
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"hello hub").await.expect("write");
        drop(client);

        let frame = read_frame(&mut server).await.expect("read");
        assert_eq!(frame.as_deref(), Some(b"hello hub".as_slice()));
    }

    #[tokio::test]
    async fn reader_tolerates_partial_delivery() {
        let (mut client, mut server) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            // Drip the frame out in tiny chunks so the terminator straddles
            // a read boundary.
            let mut message = b"chunked payload".to_vec();
            message.extend_from_slice(FRAME_END);
            for chunk in message.chunks(3) {
                client.write_all(chunk).await.expect("chunk");
                client.flush().await.expect("flush");
            }
        });

        let frame = read_frame(&mut server).await.expect("read");
        assert_eq!(frame.as_deref(), Some(b"chunked payload".as_slice()));
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        let frame = read_frame(&mut server).await.expect("read");
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(16);
        client.write_all(b"half a mess").await.expect("write");
        drop(client);

        let err = read_frame(&mut server).await.expect_err("must fail");
        assert!(err.to_string().contains("mid-frame"));
    }
}
