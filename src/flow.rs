//! The flow engine: a FIFO queue of scatter/gather descriptors layered
//! atop the message-passing shim, with a `flow_queue_search_multi`-style
//! multi-descriptor conjunctive search and an id-tagged queue a flow
//! protocol keeps alongside it.
//!
//! A flow here always terminates at MP — the disk/Trove leg of a full
//! flow protocol is out of scope (storage I/O is an explicit non-goal),
//! so every [`FlowDescriptor`] wraps exactly one MP send or recv.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::addr::MpAddr;
use crate::error::BmiResult;
use crate::ids::IdRegistry;
use crate::mp::Mp;

/// The direction a flow moves data, relative to the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Send,
    Recv,
}

/// A scatter/gather descriptor queued on the flow engine.
#[derive(Debug, Clone)]
pub struct FlowDescriptor {
    pub direction: FlowDirection,
    pub addr: MpAddr,
    pub tag: u64,
    pub buffers: Vec<Vec<u8>>,
    pub context_id: u64,
    pub user_ptr: u64,
    /// The MP-level op id once posted; `None` while still queued.
    pub mp_op_id: Option<u64>,
}

/// A completed flow's result, surfaced by [`FlowQueue::test`].
#[derive(Debug, Clone)]
pub struct FlowCompletion {
    pub flow_id: u64,
    pub actual_size: usize,
    pub error: Option<crate::error::BmiErrorKind>,
    pub user_ptr: u64,
}

/// Conjunctive multi-key search, identical in shape to [`crate::op_list::OpKey`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowKey {
    pub addr: Option<MpAddr>,
    pub tag: Option<u64>,
    pub context_id: Option<u64>,
}

impl FlowKey {
    fn matches(&self, flow: &FlowDescriptor) -> bool {
        if let Some(addr) = self.addr {
            if flow.addr != addr {
                return false;
            }
        }
        if let Some(tag) = self.tag {
            if flow.tag != tag {
                return false;
            }
        }
        if let Some(ctx) = self.context_id {
            if flow.context_id != ctx {
                return false;
            }
        }
        true
    }
}

/// The flow queue: a FIFO of descriptors plus an id registry for O(1)
/// lookup by flow id, matching `flow_queue_add`/`flow_queue_remove`'s
/// queue-order semantics with `flow_queue_search_multi`'s batch search
/// layered on top via the registry.
pub struct FlowQueue {
    descriptors: IdRegistry<FlowDescriptor>,
    order: Mutex<VecDeque<u64>>,
    mp_index: Mutex<std::collections::HashMap<u64, u64>>,
}

impl Default for FlowQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowQueue {
    pub fn new() -> Self {
        FlowQueue {
            descriptors: IdRegistry::new(),
            order: Mutex::new(VecDeque::new()),
            mp_index: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// `flow_post`: post the descriptor's single send/recv against MP and
    /// enqueue it for completion tracking.
    pub async fn post(&self, mp: &Mp, descriptor: FlowDescriptor) -> BmiResult<u64> {
        let FlowDescriptor {
            direction,
            addr,
            tag,
            buffers,
            context_id,
            user_ptr,
            ..
        } = descriptor;

        let mp_op_id = match direction {
            FlowDirection::Send => {
                mp.post_send_list(addr, tag, buffers.clone(), context_id, user_ptr)
                    .await?
            }
            FlowDirection::Recv => {
                let sizes: Vec<usize> = buffers.iter().map(|b| b.len()).collect();
                mp.post_recv_list(addr, tag, &sizes, context_id, user_ptr).await?
            }
        };

        let flow_id = self.descriptors.register(FlowDescriptor {
            direction,
            addr,
            tag,
            buffers,
            context_id,
            user_ptr,
            mp_op_id: Some(mp_op_id),
        });
        self.order.lock().push_back(flow_id);
        self.mp_index.lock().insert(mp_op_id, flow_id);
        Ok(flow_id)
    }

    /// Search for flows matching `key`, in FIFO order, mirroring
    /// `flow_queue_search_multi`'s incount/outcount batch contract.
    pub fn search_multi(&self, key: FlowKey, incount: usize) -> Vec<u64> {
        let order = self.order.lock();
        let mut found = Vec::new();
        for &id in order.iter() {
            if found.len() >= incount {
                break;
            }
            if self
                .descriptors
                .with(id, |flow| key.matches(flow))
                .unwrap_or(false)
            {
                found.push(id);
            }
        }
        found
    }

    fn remove(&self, flow_id: u64) -> Option<FlowDescriptor> {
        let removed = self.descriptors.unregister(flow_id);
        self.order.lock().retain(|&id| id != flow_id);
        if let Some(flow) = &removed {
            if let Some(mp_op_id) = flow.mp_op_id {
                self.mp_index.lock().remove(&mp_op_id);
            }
        }
        removed
    }

    /// Poll the underlying MP context for completions of any queued
    /// flow, resolving each back to its flow id.
    pub async fn test(&self, mp: &Mp, context_id: u64, incount: usize, timeout_ms: u64) -> BmiResult<Vec<FlowCompletion>> {
        let completions = mp.testcontext(incount, timeout_ms, context_id).await?;
        let mut out = Vec::new();
        for c in completions {
            let flow_id = self.mp_index.lock().get(&c.op_id).copied();
            if let Some(flow_id) = flow_id {
                self.remove(flow_id);
                out.push(FlowCompletion {
                    flow_id,
                    actual_size: c.actual_size,
                    error: c.error,
                    user_ptr: c.user_ptr,
                });
            }
        }
        Ok(out)
    }

    /// `flow_cancel`: chain down to the underlying MP cancel for the
    /// flow's posted op, if it has one. A flow still waiting for a post
    /// to land on the wire (the disk/Trove leg this crate doesn't
    /// implement) has nothing further to cancel.
    pub async fn cancel(&self, mp: &Mp, flow_id: u64) -> BmiResult<()> {
        let mp_op_id = self.descriptors.with(flow_id, |f| f.mp_op_id).flatten();
        if let Some(mp_op_id) = mp_op_id {
            mp.cancel(mp_op_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_and_test_round_trips_a_send_flow() {
        let mp = Mp::new_client();
        let ctx = mp.open_context().unwrap();
        let gm = mp.addr_lookup("gm://flow-peer:1").await.unwrap();

        let queue = FlowQueue::new();
        let flow_id = queue
            .post(
                &mp,
                FlowDescriptor {
                    direction: FlowDirection::Send,
                    addr: gm,
                    tag: 99,
                    buffers: vec![b"payload".to_vec()],
                    context_id: ctx,
                    user_ptr: 42,
                    mp_op_id: None,
                },
            )
            .await
            .unwrap();
        assert!(!queue.is_empty());

        let completions = queue.test(&mp, ctx, 4, 200).await.unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].flow_id, flow_id);
        assert_eq!(completions[0].user_ptr, 42);
        assert!(queue.is_empty());
    }

    #[test]
    fn search_multi_respects_incount_and_conjunctive_keys() {
        let queue = FlowQueue::new();
        let addr_a = MpAddr(1);
        let addr_b = MpAddr(2);
        let a1 = queue.descriptors.register(FlowDescriptor {
            direction: FlowDirection::Send,
            addr: addr_a,
            tag: 1,
            buffers: vec![],
            context_id: 0,
            user_ptr: 0,
            mp_op_id: None,
        });
        queue.order.lock().push_back(a1);
        let a2 = queue.descriptors.register(FlowDescriptor {
            direction: FlowDirection::Send,
            addr: addr_a,
            tag: 2,
            buffers: vec![],
            context_id: 0,
            user_ptr: 0,
            mp_op_id: None,
        });
        queue.order.lock().push_back(a2);
        let _b1 = {
            let id = queue.descriptors.register(FlowDescriptor {
                direction: FlowDirection::Send,
                addr: addr_b,
                tag: 1,
                buffers: vec![],
                context_id: 0,
                user_ptr: 0,
                mp_op_id: None,
            });
            queue.order.lock().push_back(id);
            id
        };

        let found = queue.search_multi(
            FlowKey {
                addr: Some(addr_a),
                tag: None,
                context_id: None,
            },
            10,
        );
        assert_eq!(found, vec![a1, a2]);

        let found_one = queue.search_multi(
            FlowKey {
                addr: Some(addr_a),
                tag: None,
                context_id: None,
            },
            1,
        );
        assert_eq!(found_one, vec![a1]);
    }
}
