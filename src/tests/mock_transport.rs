//! In-memory [`HttpTransport`] serving a deterministic byte pattern.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};

use crate::error::TransportError;
use crate::transport::{BodyStream, ByteRange, HttpTransport, ProbeResponse};

pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn pattern(range: Range<u64>) -> Vec<u8> {
    range.map(pattern_byte).collect()
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    range_start: u64,
    after: u64,
}

pub struct MockTransport {
    size: u64,
    accepts_ranges: bool,
    reports_length: bool,
    body_chunk: u64,
    stall_after: Option<u64>,
    truncate_after: Option<u64>,
    failure: Mutex<Option<InjectedFailure>>,
    requests: Mutex<Vec<Option<ByteRange>>>,
    probes: AtomicU64,
    served: Arc<AtomicU64>,
}

impl MockTransport {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            accepts_ranges: true,
            reports_length: true,
            body_chunk: 64 * 1024,
            stall_after: None,
            truncate_after: None,
            failure: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            probes: AtomicU64::new(0),
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accepts_ranges = false;
        self
    }

    pub fn without_content_length(mut self) -> Self {
        self.reports_length = false;
        self
    }

    pub fn with_body_chunk(mut self, bytes: u64) -> Self {
        self.body_chunk = bytes.max(1);
        self
    }

    /// The first request starting at `range_start` errors after `after` bytes.
    pub fn fail_once(self, range_start: u64, after: u64) -> Self {
        *self.failure.lock().unwrap() = Some(InjectedFailure { range_start, after });
        self
    }

    /// Every response hangs after `bytes` bytes.
    pub fn stall_after(mut self, bytes: u64) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    /// Every response ends cleanly after `bytes` bytes.
    pub fn truncate_bodies(mut self, bytes: u64) -> Self {
        self.truncate_after = Some(bytes);
        self
    }

    pub fn requests(&self) -> Vec<Option<ByteRange>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Body bytes handed out so far, over all requests.
    pub fn served_bytes(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }
}

enum Tail {
    End,
    Fail,
    Stall,
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn probe(&self, _url: &str) -> Result<ProbeResponse, TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeResponse {
            content_length: self.reports_length.then_some(self.size),
            accepts_ranges: self.accepts_ranges,
        })
    }

    async fn get(&self, _url: &str, range: Option<ByteRange>) -> Result<BodyStream, TransportError> {
        self.requests.lock().unwrap().push(range);

        if range.is_some() && !self.accepts_ranges {
            return Err(TransportError::RangeIgnored);
        }
        let (start, end) = match range {
            Some(r) => (r.start, (r.end + 1).min(self.size)),
            None => (0, self.size),
        };

        let failure = {
            let mut slot = self.failure.lock().unwrap();
            match *slot {
                Some(f) if f.range_start == start => slot.take(),
                _ => None,
            }
        };

        let (limit, tail) = if let Some(f) = failure {
            (Some(f.after), Tail::Fail)
        } else if let Some(n) = self.stall_after {
            (Some(n), Tail::Stall)
        } else if let Some(n) = self.truncate_after {
            (Some(n), Tail::End)
        } else {
            (None, Tail::End)
        };
        let data_end = limit.map_or(end, |n| (start + n).min(end));

        let served = self.served.clone();
        let chunk = self.body_chunk;
        let body = stream::unfold(start, move |pos| {
            let served = served.clone();
            async move {
                if pos >= data_end {
                    return None;
                }
                let next = (pos + chunk).min(data_end);
                served.fetch_add(next - pos, Ordering::SeqCst);
                Some((Ok(Bytes::from(pattern(pos..next))), next))
            }
        });

        let tail: BodyStream = match tail {
            Tail::End => stream::empty().boxed(),
            Tail::Fail => stream::once(async {
                Err(TransportError::Body("connection reset by peer".to_string()))
            })
            .boxed(),
            Tail::Stall => stream::pending().boxed(),
        };

        Ok(body.chain(tail).boxed())
    }
}
