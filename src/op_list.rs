//! The op list: a generic container of in-flight [`MethodOp`] records with
//! conjunctive multi-key search.
//!
//! The search routine preserves a quirk of `op_list_cmp_key` verbatim:
//! when a key's address doesn't match an op's stored address
//! directly but matches that address's `primary` or `secondary` alias, the
//! op's stored address is *rewritten* to the alias that matched. This is an
//! intentional failover behavior (an address that has been reassigned to a
//! backup path continues to match in-flight ops posted against the old
//! one) and is preserved rather than "fixed," per the open question in
//! `SPEC_FULL.md` §9.

use crate::addr::MpAddr;
use crate::ids::IdRegistry;

/// A single in-flight operation tracked by a transport method.
#[derive(Debug, Clone)]
pub struct MethodOp {
    pub addr: MpAddr,
    pub tag: u64,
    pub context_id: u64,
    pub user_ptr: u64,
}

/// Search keys are conjunctive: every `Some` field must match for an op to
/// be selected. `None` fields are wildcards.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpKey {
    pub addr: Option<MpAddr>,
    pub tag: Option<u64>,
    pub context_id: Option<u64>,
}

impl OpKey {
    fn matches_after_swap(&self, op: &mut MethodOp, addr_book: &crate::addr::RefList) -> bool {
        if let Some(key_addr) = self.addr {
            if op.addr != key_addr {
                let swapped = addr_book
                    .get(op.addr)
                    .and_then(|entry| {
                        if entry.primary == Some(key_addr) {
                            Some(key_addr)
                        } else if entry.secondary == Some(key_addr) {
                            Some(key_addr)
                        } else {
                            None
                        }
                    });
                match swapped {
                    Some(new_addr) => {
                        tracing::trace!(
                            old = op.addr.0,
                            new = new_addr.0,
                            "op address swapped to matching primary/secondary alias"
                        );
                        op.addr = new_addr;
                    }
                    None => return false,
                }
            }
        }
        if let Some(tag) = self.tag {
            if op.tag != tag {
                return false;
            }
        }
        if let Some(ctx) = self.context_id {
            if op.context_id != ctx {
                return false;
            }
        }
        true
    }
}

/// A generic op list, keyed by a registry id. `search` performs the
/// conjunctive multi-key scan with the primary/secondary swap behavior.
pub struct OpList {
    ops: IdRegistry<MethodOp>,
}

impl Default for OpList {
    fn default() -> Self {
        Self::new()
    }
}

impl OpList {
    pub fn new() -> Self {
        OpList {
            ops: IdRegistry::new(),
        }
    }

    pub fn add(&self, op: MethodOp) -> u64 {
        self.ops.register(op)
    }

    pub fn remove(&self, id: u64) -> Option<MethodOp> {
        self.ops.unregister(id)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Search for the first op matching `key`, applying the address
    /// failover swap as a side effect (mutating the matched op in place,
    /// matching `op_list_cmp_key`'s direct pointer mutation).
    pub fn search(&self, key: OpKey, addr_book: &crate::addr::RefList, candidate_ids: &[u64]) -> Option<u64> {
        for &id in candidate_ids {
            let matched = self
                .ops
                .with_mut(id, |op| key.matches_after_swap(op, addr_book))
                .unwrap_or(false);
            if matched {
                return Some(id);
            }
        }
        None
    }

    pub fn get(&self, id: u64) -> Option<MethodOp> {
        self.ops.lookup(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{RefList, TransportAddr};

    #[test]
    fn search_matches_direct_address() {
        let addr_book = RefList::new();
        let a = addr_book.add("tcp://h:1", TransportAddr(1), "tcp").unwrap();
        let list = OpList::new();
        let id = list.add(MethodOp {
            addr: a,
            tag: 7,
            context_id: 0,
            user_ptr: 0,
        });
        let key = OpKey {
            addr: Some(a),
            tag: Some(7),
            context_id: None,
        };
        assert_eq!(list.search(key, &addr_book, &[id]), Some(id));
    }

    #[test]
    fn swap_falls_back_to_secondary_address() {
        let addr_book = RefList::new();
        let primary = addr_book
            .add("tcp://primary:1", TransportAddr(1), "tcp")
            .unwrap();
        let secondary = addr_book
            .add("tcp://secondary:1", TransportAddr(2), "tcp")
            .unwrap();
        // The op was posted against `primary`, but the address has since
        // been reassigned so that `primary`'s stored entry points at
        // `secondary` as its failover.
        addr_book.set_secondary(primary, secondary);

        let list = OpList::new();
        let id = list.add(MethodOp {
            addr: primary,
            tag: 1,
            context_id: 0,
            user_ptr: 0,
        });

        // Searching directly for `secondary` should still find the op,
        // because `primary`'s `secondary` field names it — and the op's
        // stored address should be rewritten to `secondary` afterwards.
        let key = OpKey {
            addr: Some(secondary),
            tag: Some(1),
            context_id: None,
        };
        let found = list.search(key, &addr_book, &[id]);
        assert_eq!(found, Some(id));
        assert_eq!(list.get(id).unwrap().addr, secondary);
    }

    #[test]
    fn no_match_when_no_alias_matches() {
        let addr_book = RefList::new();
        let a = addr_book.add("tcp://h:1", TransportAddr(1), "tcp").unwrap();
        let b = addr_book.add("tcp://other:1", TransportAddr(2), "tcp").unwrap();
        let list = OpList::new();
        let id = list.add(MethodOp {
            addr: a,
            tag: 1,
            context_id: 0,
            user_ptr: 0,
        });
        let key = OpKey {
            addr: Some(b),
            tag: Some(1),
            context_id: None,
        };
        assert_eq!(list.search(key, &addr_book, &[id]), None);
    }
}
