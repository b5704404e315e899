//! Equivalence of the two suspension mechanisms.
//!
//! A computation whose suspension points are statically enumerable can
//! execute either through the general continuation runtime or through a
//! specialized state cell. The two must produce identical observable
//! results and identical effect sequencing; only allocation behavior may
//! differ — the state cell never creates an execution context.

use ember_runtime::config::ContextConfig;
use ember_runtime::context::ContextPool;
use ember_runtime::continuation::Continuation;
use ember_runtime::poll::{run_to_completion, Poll, StateCell};

fn test_pool() -> ContextPool {
    ContextPool::new(ContextConfig {
        max_contexts: 16,
        initial_stack_size: 1024,
        max_stack_size: 8192,
    })
}

/// The handler side of the computation: operation index -> value.
fn handler_value(op: i64) -> i64 {
    match op {
        1 => 10,
        2 => 32,
        other => panic!("unknown operation {other}"),
    }
}

/// The computation through the general runtime: each suspension captures
/// a continuation that the handler resumes with its value.
fn run_general(pool: &ContextPool, log: &mut Vec<i64>) -> i64 {
    let k = Continuation::capture(pool, |x: i64| x).unwrap();
    log.push(1);
    let a: i64 = k.resume(handler_value(1)).unwrap();

    let k = Continuation::capture(pool, |x: i64| x).unwrap();
    log.push(2);
    let b: i64 = k.resume(handler_value(2)).unwrap();

    a + b
}

/// The same computation through a specialized state cell: one dispatch
/// state per suspension point, locals in the flat record, everything on
/// the caller's stack.
fn run_specialized(log: &mut Vec<i64>) -> i64 {
    let mut cell = StateCell::new(2);
    run_to_completion(
        &mut cell,
        |cell| match cell.state() {
            0 => {
                log.push(1);
                cell.frame_mut().set(0, handler_value(1));
                cell.transition(1);
                Poll::Pending
            }
            1 => {
                log.push(2);
                cell.frame_mut().set(1, handler_value(2));
                cell.transition(2);
                Poll::Pending
            }
            _ => Poll::Ready(cell.frame().get(0) + cell.frame().get(1)),
        },
        8,
    )
    .expect("specialized computation completes")
}

#[test]
fn specialized_and_general_paths_agree() {
    let pool = test_pool();

    let mut general_log = Vec::new();
    let general = run_general(&pool, &mut general_log);

    let mut specialized_log = Vec::new();
    let specialized = run_specialized(&mut specialized_log);

    // Identical observable results and identical effect sequencing.
    assert_eq!(general, specialized);
    assert_eq!(general, 42);
    assert_eq!(general_log, specialized_log);
}

#[test]
fn specialized_path_allocates_no_context() {
    let pool = test_pool();
    assert_eq!(pool.live_contexts(), 0);

    let mut log = Vec::new();
    let result = run_specialized(&mut log);
    assert_eq!(result, 42);

    // The whole run stayed on this stack: the pool never saw it.
    assert_eq!(pool.live_contexts(), 0);
    assert_eq!(pool.live_frames(), 0);
}

#[test]
fn general_path_releases_contexts_promptly() {
    let pool = test_pool();
    let mut log = Vec::new();
    let result = run_general(&pool, &mut log);
    assert_eq!(result, 42);

    // Each capture's context was released at its resume, not batched.
    assert_eq!(pool.live_contexts(), 0);
    assert_eq!(pool.live_frames(), 0);
}
