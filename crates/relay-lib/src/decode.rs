//! Incremental decoding of consecutive JSON objects from a byte stream
//!
//! The runtime's stats and event endpoints write one JSON document after
//! another on a long-lived response body. Transport reads do not respect
//! document boundaries, so a trailing partial document is carried over to
//! the next read.

use crate::error::{RelayError, Result};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

pub struct JsonStreamDecoder<T> {
    buffer: BytesMut,
    what: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JsonStreamDecoder<T> {
    /// `what` names the decoded object in error messages
    pub fn new(what: &'static str) -> Self {
        Self {
            buffer: BytesMut::new(),
            what,
            _marker: PhantomData,
        }
    }

    /// Append a chunk and return every object it completes, in order.
    ///
    /// A syntax error is fatal for the stream: the caller is expected to
    /// stop feeding this decoder.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<T>> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut consumed = 0;
        {
            let mut iter = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<T>();
            loop {
                match iter.next() {
                    Some(Ok(value)) => {
                        decoded.push(value);
                        consumed = iter.byte_offset();
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => return Err(RelayError::decode(self.what, e)),
                    None => {
                        // only whitespace left
                        consumed = iter.byte_offset();
                        break;
                    }
                }
            }
        }

        self.buffer.advance(consumed);
        Ok(decoded)
    }

    /// Bytes held back waiting for the rest of a document
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
