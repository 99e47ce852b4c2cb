//! Compiled state machines. Each `fn` here is a `StateFn`: ordinary Rust
//! code that boxes its own `async move` body, the same "manual async fn
//! pointer" pattern this crate already leans on elsewhere a trait needs
//! an async call behind a plain fn-item (see `transport::mod::TransportMethod`).
//!
//! Every state function follows one contract: if `smcb.last_completion`
//! is set, the state's previously-posted MP op has completed and the
//! function should consume it and compute a return code; otherwise the
//! state is being entered fresh and should post its work (or complete
//! immediately, for states with no MP op at all).

use std::future::Future;
use std::pin::Pin;

use crate::mp::Mp;

use super::{Machine, NextAction, Smcb, State, StateAction, TransitionEntry, TransitionKind, WILDCARD};

/// Two-state machine that completes within its own `post()` call with no
/// MP op at all — the vehicle for exercising the immediate-completion
/// loop (no yield, no completion-list round trip).
pub fn noop_machine() -> &'static Machine {
    static START_TRANSITIONS: &[TransitionEntry] = &[
        TransitionEntry {
            ret_code: 0,
            kind: TransitionKind::NextState(&FINISH_STATE),
        },
    ];
    static FINISH_TRANSITIONS: &[TransitionEntry] = &[
        TransitionEntry {
            ret_code: WILDCARD,
            kind: TransitionKind::Terminate,
        },
    ];
    static FINISH_STATE: State = State {
        name: "noop-finish",
        action: StateAction::Run(noop_finish),
        transitions: FINISH_TRANSITIONS,
    };
    static START_STATE: State = State {
        name: "noop-start",
        action: StateAction::Run(noop_start),
        transitions: START_TRANSITIONS,
    };
    static MACHINE: Machine = Machine {
        name: "noop",
        first_state: &START_STATE,
    };
    &MACHINE
}

fn noop_start<'a>(_smcb: &'a mut Smcb, _mp: &'a Mp) -> Pin<Box<dyn Future<Output = NextAction> + Send + 'a>> {
    Box::pin(async move { NextAction::Immediate(0) })
}

fn noop_finish<'a>(_smcb: &'a mut Smcb, _mp: &'a Mp) -> Pin<Box<dyn Future<Output = NextAction> + Send + 'a>> {
    Box::pin(async move { NextAction::Immediate(0) })
}

/// Resolve a path to a handle by looping over path segments, sending a
/// lookup request per segment and consuming its response, until the
/// server signals full resolution (`segments_remaining` reaches zero) or
/// an error occurs. Dcache/pinode/attribute-fetch machinery is out of
/// scope (no filesystem semantics are modeled by this crate), so each
/// "segment" just round-trips a request tag with no interpretation of
/// its payload.
pub fn lookup_machine() -> &'static Machine {
    static SEND_TRANSITIONS: &[TransitionEntry] = &[
        TransitionEntry {
            ret_code: 0,
            kind: TransitionKind::NextState(&RECV_STATE),
        },
        TransitionEntry {
            ret_code: WILDCARD,
            kind: TransitionKind::Terminate,
        },
    ];
    static RECV_TRANSITIONS: &[TransitionEntry] = &[
        // More path segments remain: loop back and send the next request.
        TransitionEntry {
            ret_code: 1,
            kind: TransitionKind::NextState(&SEND_STATE),
        },
        // Fully resolved, or an error: either way this machine is done.
        TransitionEntry {
            ret_code: 0,
            kind: TransitionKind::Terminate,
        },
        TransitionEntry {
            ret_code: WILDCARD,
            kind: TransitionKind::Terminate,
        },
    ];
    static SEND_STATE: State = State {
        name: "lookup-send-req",
        action: StateAction::Run(send_lookup_req),
        transitions: SEND_TRANSITIONS,
    };
    static RECV_STATE: State = State {
        name: "lookup-recv-resp",
        action: StateAction::Run(recv_lookup_resp),
        transitions: RECV_TRANSITIONS,
    };
    static MACHINE: Machine = Machine {
        name: "lookup",
        first_state: &SEND_STATE,
    };
    &MACHINE
}

fn send_lookup_req<'a>(smcb: &'a mut Smcb, mp: &'a Mp) -> Pin<Box<dyn Future<Output = NextAction> + Send + 'a>> {
    Box::pin(async move {
        if let Some(completion) = smcb.last_completion.take() {
            return match completion.error {
                None => NextAction::Immediate(0),
                Some(kind) => {
                    smcb.error = Some(kind);
                    NextAction::Immediate(-1)
                }
            };
        }

        let addr = match smcb.remote_addr {
            Some(addr) => addr,
            None => {
                smcb.error = Some(crate::error::BmiErrorKind::Inval);
                return NextAction::Immediate(-1);
            }
        };
        let payload = smcb.send_buf.clone();
        match mp
            .post_send(addr, smcb.tag, payload, smcb.context_id, smcb.id)
            .await
        {
            Ok(op_id) => {
                smcb.pending_mp_op = Some(op_id);
                NextAction::Yield
            }
            Err(e) => {
                smcb.error = Some(e.kind);
                NextAction::Immediate(-1)
            }
        }
    })
}

fn recv_lookup_resp<'a>(smcb: &'a mut Smcb, mp: &'a Mp) -> Pin<Box<dyn Future<Output = NextAction> + Send + 'a>> {
    Box::pin(async move {
        if let Some(completion) = smcb.last_completion.take() {
            return match completion.error {
                None => {
                    if smcb.segments_remaining > 0 {
                        smcb.segments_remaining -= 1;
                    }
                    if smcb.segments_remaining > 0 {
                        NextAction::Immediate(1)
                    } else {
                        NextAction::Immediate(0)
                    }
                }
                Some(kind) => {
                    smcb.error = Some(kind);
                    NextAction::Immediate(-1)
                }
            };
        }

        let addr = match smcb.remote_addr {
            Some(addr) => addr,
            None => {
                smcb.error = Some(crate::error::BmiErrorKind::Inval);
                return NextAction::Immediate(-1);
            }
        };
        let max_size = smcb.recv_buf.capacity().max(4096);
        match mp
            .post_recv(addr, smcb.tag, max_size, smcb.context_id, smcb.id)
            .await
        {
            Ok(op_id) => {
                smcb.pending_mp_op = Some(op_id);
                NextAction::Yield
            }
            Err(e) => {
                smcb.error = Some(e.kind);
                NextAction::Immediate(-1)
            }
        }
    })
}

/// `io` machine: a `ParallelJump` that posts every `IoContext`'s two legs
/// (a request send, then a bulk-transfer send once the request lands)
/// up front and yields, resuming incrementally as each leg's completion
/// arrives rather than polling any one datafile to conclusion before
/// starting the next — this crate's `ParallelJump` folds a fan-out into
/// the single function it's given (see `sme::mod`'s
/// `StateAction::ParallelJump` doc comment), so "in parallel" here means
/// "concurrently posted, concurrently resumed," not one child SMCB per
/// datafile. Wire format and actual datafile addressing are out of scope
/// (this crate excludes filesystem/storage semantics), and the ack/
/// write-ack legs a full flow protocol has on its disk/Trove side are not
/// modeled; this machine exists to give the cancellation walk over
/// `io_contexts` and the multi-job join a real state to drive.
pub fn io_machine() -> &'static Machine {
    static DATAFILE_TRANSITIONS: &[TransitionEntry] = &[
        TransitionEntry {
            ret_code: 0,
            kind: TransitionKind::Terminate,
        },
        TransitionEntry {
            ret_code: WILDCARD,
            kind: TransitionKind::Terminate,
        },
    ];
    static DATAFILE_STATE: State = State {
        name: "io-datafiles",
        action: StateAction::ParallelJump(run_datafiles, &[]),
        transitions: DATAFILE_TRANSITIONS,
    };
    static MACHINE: Machine = Machine {
        name: "io",
        first_state: &DATAFILE_STATE,
    };
    &MACHINE
}

/// Post the request leg for every datafile that hasn't started yet, or —
/// on re-entry with `smcb.last_completion` set — advance the one datafile
/// whose job id matches the completion that just arrived: either posting
/// its bulk-transfer leg (the request leg settled cleanly) or marking it
/// done (the bulk-transfer leg settled, or either leg errored).
fn run_datafiles<'a>(smcb: &'a mut Smcb, mp: &'a Mp) -> Pin<Box<dyn Future<Output = NextAction> + Send + 'a>> {
    Box::pin(async move {
        let addr = match smcb.remote_addr {
            Some(addr) => addr,
            None => {
                smcb.error = Some(crate::error::BmiErrorKind::Inval);
                return NextAction::Immediate(-1);
            }
        };

        if smcb.io_contexts.is_empty() {
            return NextAction::Immediate(0);
        }

        let Some(completion) = smcb.last_completion.take() else {
            // Fresh entry: post every datafile's request leg up front and
            // wait for completions to arrive one at a time.
            for idx in 0..smcb.io_contexts.len() {
                let tag = smcb.tag + idx as u64;
                let payload = smcb.send_buf.clone();
                match mp.post_send(addr, tag, payload, smcb.context_id, smcb.id).await {
                    Ok(op_id) => {
                        smcb.io_contexts[idx].send_job_id = Some(op_id);
                        smcb.io_contexts[idx].send_in_progress = true;
                    }
                    Err(e) => {
                        smcb.error = Some(e.kind);
                        smcb.io_datafiles_done += 1;
                    }
                }
            }
            return NextAction::Yield;
        };

        let matched = (0..smcb.io_contexts.len()).find_map(|idx| {
            if smcb.io_contexts[idx].send_job_id == Some(completion.op_id) {
                Some((idx, true))
            } else if smcb.io_contexts[idx].flow_job_id == Some(completion.op_id) {
                Some((idx, false))
            } else {
                None
            }
        });

        match matched {
            Some((idx, was_request_leg)) if was_request_leg => {
                smcb.io_contexts[idx].send_job_id = None;
                smcb.io_contexts[idx].send_in_progress = false;
                if let Some(kind) = completion.error {
                    smcb.error = Some(kind);
                    smcb.io_datafiles_done += 1;
                } else {
                    let tag = smcb.tag + 1_000_000 + idx as u64;
                    let payload = smcb.send_buf.clone();
                    match mp.post_send(addr, tag, payload, smcb.context_id, smcb.id).await {
                        Ok(op_id) => {
                            smcb.io_contexts[idx].flow_job_id = Some(op_id);
                            smcb.io_contexts[idx].flow_in_progress = true;
                        }
                        Err(e) => {
                            smcb.error = Some(e.kind);
                            smcb.io_datafiles_done += 1;
                        }
                    }
                }
            }
            Some((idx, _was_flow_leg)) => {
                smcb.io_contexts[idx].flow_job_id = None;
                smcb.io_contexts[idx].flow_in_progress = false;
                if let Some(kind) = completion.error {
                    smcb.error = Some(kind);
                }
                smcb.io_datafiles_done += 1;
            }
            None => crate::error::fatal_inconsistency("io machine completion for unknown datafile job id"),
        }

        if smcb.io_datafiles_done >= smcb.io_contexts.len() {
            NextAction::Immediate(if smcb.error.is_some() { -1 } else { 0 })
        } else {
            NextAction::Yield
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use super::super::Sme;

    #[tokio::test]
    async fn io_machine_resolves_every_datafile_concurrently() {
        let mp = Arc::new(Mp::new_client());
        let sme = Sme::new(mp.clone()).unwrap();
        let addr = mp.addr_lookup("gm://io-peer:1").await.unwrap();

        let sys_op_id = sme
            .post_with(io_machine(), 99, |smcb| {
                smcb.remote_addr = Some(addr);
                smcb.tag = 500;
                smcb.send_buf = b"datafile-payload".to_vec();
                smcb.io_contexts = vec![
                    super::super::IoContext::default(),
                    super::super::IoContext::default(),
                    super::super::IoContext::default(),
                ];
            })
            .await
            .unwrap();

        let mut result = None;
        for _ in 0..200 {
            result = sme.test(sys_op_id, 0).await.unwrap();
            if result.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let result = result.expect("io machine must complete once every datafile's two legs land");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn cancel_reaches_an_in_flight_datafile_job() {
        let mp = Arc::new(Mp::new_client());
        let sme = Sme::new(mp.clone()).unwrap();
        let addr = mp.addr_lookup("gm://io-cancel-peer:1").await.unwrap();

        let sys_op_id = sme
            .post_with(io_machine(), 1, |smcb| {
                smcb.remote_addr = Some(addr);
                smcb.tag = 900;
                smcb.send_buf = b"payload".to_vec();
                smcb.io_contexts = vec![super::super::IoContext::default()];
            })
            .await
            .unwrap();

        // The request leg may still be in flight; cancelling it must not
        // error even though it races the completion.
        sme.cancel(sys_op_id).await.unwrap();
    }

    #[tokio::test]
    async fn io_machine_with_no_datafiles_completes_immediately() {
        let mp = Arc::new(Mp::new_client());
        let sme = Sme::new(mp.clone()).unwrap();
        let addr = mp.addr_lookup("gm://io-empty-peer:1").await.unwrap();

        let sys_op_id = sme
            .post_with(io_machine(), 2, |smcb| {
                smcb.remote_addr = Some(addr);
            })
            .await
            .unwrap();
        let result = sme
            .test(sys_op_id, 0)
            .await
            .unwrap()
            .expect("an io machine with no datafiles has nothing to wait on");
        assert!(result.error.is_none());
    }
}
