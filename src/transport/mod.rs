//! The transport method (TM) contract: the pluggable surface every
//! concrete network backend implements. Rather than a synchronous-feeling
//! `send`/`receive` pair per connection, a transport method here posts
//! non-blocking operations that are later collected via `test`/
//! `testcontext`/`testunexpected`, matching the asynchronous completion
//! model the message-passing shim (`mp.rs`) builds on.

pub mod gm;
pub mod mx;
pub mod tcp;

use async_trait::async_trait;

use crate::addr::TransportAddr;
use crate::error::BmiResult;

/// One posted operation's outcome, as delivered by `test`/`testcontext`.
#[derive(Debug, Clone)]
pub struct TmCompletion {
    pub op_id: u64,
    pub actual_size: usize,
    pub error: Option<crate::error::BmiErrorKind>,
    pub tag: u64,
}

/// A tagged, potentially-unexpected message payload, as delivered by
/// `testunexpected`. `class` is the 8-bit class byte every unexpected
/// send carries, matched against a receiver's `testunexpected` class
/// filter.
#[derive(Debug, Clone)]
pub struct UnexpectedMessage {
    pub addr: TransportAddr,
    pub tag: u64,
    pub class: u8,
    pub payload: Vec<u8>,
}

/// The contract a concrete network backend must satisfy to plug into the
/// message-passing shim. All operations are non-blocking: `post_*` methods
/// enqueue work and return an operation id immediately; completion is
/// observed later via `test`/`testcontext`/`testunexpected`.
#[async_trait]
pub trait TransportMethod: Send + Sync {
    /// The scheme this method answers to in the address grammar (e.g.
    /// `"tcp"`, `"gm"`, `"mx"`).
    fn scheme(&self) -> &'static str;

    /// Resolve an address string into this method's own addressing,
    /// establishing a connection/peer record if one does not exist yet.
    async fn addr_lookup(&self, raw: &str) -> BmiResult<TransportAddr>;

    /// Release this method's resources for an address once the reference
    /// list's refcount has reached zero. Implements the `BMI_DROP_ADDR`
    /// info-query step of `dealloc_ref_st`.
    async fn addr_drop(&self, addr: TransportAddr) -> BmiResult<()>;

    /// Post a scatter/gather send of `buffers` to `addr` tagged `tag`,
    /// returning an operation id to be observed via `test`/`testcontext`.
    /// This is the mandatory send primitive; `post_send` is a single-buffer
    /// convenience wrapper over it.
    async fn post_send_list(
        &self,
        addr: TransportAddr,
        tag: u64,
        buffers: Vec<Vec<u8>>,
    ) -> BmiResult<u64>;

    /// Post a scatter/gather receive for a message tagged `tag` from
    /// `addr`, with `buffer_sizes` giving the size of each expected
    /// segment in order, returning an operation id. This is the mandatory
    /// recv primitive; `post_recv` is a single-buffer wrapper over it.
    async fn post_recv_list(
        &self,
        addr: TransportAddr,
        tag: u64,
        buffer_sizes: &[usize],
    ) -> BmiResult<u64>;

    /// Post an unexpected scatter/gather send: the receiver has not yet
    /// posted a matching receive. Delivered to the receiver via
    /// `testunexpected`, which flattens the list back into one payload
    /// since an unexpected message has no posted recv to size its
    /// segments against. `class` must not exceed
    /// [`TransportMethod::max_unexpected_size`] in total payload length
    /// and is carried through so the receiver can filter by it.
    async fn post_sendunexpected_list(
        &self,
        addr: TransportAddr,
        tag: u64,
        class: u8,
        buffers: Vec<Vec<u8>>,
    ) -> BmiResult<u64>;

    /// Post a send of `payload` to `addr` tagged `tag`. Single-buffer
    /// convenience wrapper over [`TransportMethod::post_send_list`].
    async fn post_send(&self, addr: TransportAddr, tag: u64, payload: Vec<u8>) -> BmiResult<u64> {
        self.post_send_list(addr, tag, vec![payload]).await
    }

    /// Post a receive for a message tagged `tag` from `addr`, with at most
    /// `max_size` bytes expected. Single-buffer convenience wrapper over
    /// [`TransportMethod::post_recv_list`].
    async fn post_recv(&self, addr: TransportAddr, tag: u64, max_size: usize) -> BmiResult<u64> {
        self.post_recv_list(addr, tag, &[max_size]).await
    }

    /// Post an unexpected send of a single `payload`. Convenience wrapper
    /// over [`TransportMethod::post_sendunexpected_list`].
    async fn post_send_unexpected(
        &self,
        addr: TransportAddr,
        tag: u64,
        class: u8,
        payload: Vec<u8>,
    ) -> BmiResult<u64> {
        self.post_sendunexpected_list(addr, tag, class, vec![payload]).await
    }

    /// Poll for completions of previously posted operations, waiting up to
    /// `timeout_ms` if none are immediately ready. `incount` bounds the
    /// number of completions returned.
    async fn test(&self, incount: usize, timeout_ms: u64) -> BmiResult<Vec<TmCompletion>>;

    /// Poll for unexpected messages (sends for which the receiver had not
    /// yet posted a matching recv). `class_filter`, when `Some`, restricts
    /// the result to messages carrying that class byte.
    async fn testunexpected(
        &self,
        incount: usize,
        timeout_ms: u64,
        class_filter: Option<u8>,
    ) -> BmiResult<Vec<UnexpectedMessage>>;

    /// Cancel a previously posted operation. Cancellation of an operation
    /// that has already completed is not an error — the completion and the
    /// cancel request may race, and the completion wins.
    async fn cancel(&self, op_id: u64) -> BmiResult<()>;

    /// The largest payload this method can carry in a single operation.
    fn max_message_size(&self) -> usize;

    /// The largest payload this method can carry in a single unexpected
    /// send (`UnexpectedMax`, queried by the message-passing shim via
    /// `get_info(CheckMaxsize)`).
    fn max_unexpected_size(&self) -> usize {
        self.max_message_size() / 16
    }

    /// Open a new isolated completion context. Completions posted under one
    /// context are never observed by `test`/`testcontext` calls against a
    /// different context.
    fn open_context(&self) -> u64;

    fn close_context(&self, context_id: u64);

    /// Test whether `addr` falls within the given CIDR-notation network and
    /// netmask, mirroring `BMI_query_addr_range`. Returns `1` if it does,
    /// `0` if it does not, and a negative value if this method has no
    /// notion of IP-style addressing to test against (e.g. a
    /// hardware-fabric transport addressed by peer id rather than IP).
    fn query_addr_range(&self, addr: TransportAddr, cidr: &str, netmask: &str) -> i32;
}

/// Resolve a scheme name to a constructed transport method.
pub fn create(scheme: &str) -> BmiResult<Box<dyn TransportMethod>> {
    match scheme {
        "tcp" => Ok(Box::new(tcp::TcpTransportMethod::new())),
        "gm" => Ok(Box::new(gm::GmTransportMethod::new())),
        "mx" => Ok(Box::new(mx::MxTransportMethod::new())),
        other => Err(crate::addr::unsupported_scheme(other)),
    }
}
