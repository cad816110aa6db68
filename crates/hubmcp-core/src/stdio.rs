use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

const DEFAULT_TAIL_BYTES: usize = 8 * 1024;

/// Bounded tail of a child's combined stdout/stderr.
///
/// The child's pipes are drained into this log continuously so a chatty
/// service never blocks on a full pipe; only the newest bytes are kept.
#[derive(Clone, Debug)]
pub struct DiagnosticLog {
    inner: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::with_limit(DEFAULT_TAIL_BYTES)
    }
}

impl DiagnosticLog {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            limit,
        }
    }

    pub fn push(&self, chunk: &str) {
        let mut chunks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        chunks.push_back(chunk.to_owned());

        let mut total: usize = chunks.iter().map(String::len).sum();
        while total > self.limit && chunks.len() > 1 {
            if let Some(front) = chunks.pop_front() {
                total -= front.len();
            }
        }
    }

    /// Captured text, trimmed of surrounding whitespace
    pub fn contents(&self) -> String {
        let chunks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        chunks.iter().map(String::as_str).collect::<String>().trim().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.contents().is_empty()
    }
}

struct Utf8Codec;

impl Decoder for Utf8Codec {
    type Item = String;
    type Error = anyhow::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match std::str::from_utf8(src) {
            Ok(s) => {
                let out = s.to_owned();
                src.clear();

                if out.is_empty() {
                    return Ok(None);
                }

                Ok(Some(out))
            }
            // Incomplete multi-byte sequence at the end: emit the valid prefix, keep the rest
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();

                if valid == 0 {
                    return Ok(None);
                }

                let out = std::str::from_utf8(&src[..valid])?.to_owned();
                src.advance(valid);
                Ok(Some(out))
            }
            Err(_) => {
                // Not text; keep it visible rather than failing the drain
                let out = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(out))
            }
        }
    }
}

/// Drain `io` into `log` until EOF
pub async fn capture<A: AsyncRead + Unpin>(io: A, log: DiagnosticLog) -> Result<()> {
    let mut frames = FramedRead::with_capacity(io, Utf8Codec, 1024);
    while let Some(frame) = frames.next().await {
        log.push(&frame?);
    }
    Ok(())
}
