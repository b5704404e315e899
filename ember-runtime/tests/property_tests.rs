//! Property-based tests for the Ember runtime.
//!
//! Uses proptest to generate random usage patterns and verify the
//! resource invariants hold: contexts and frames never leak, one-shot
//! continuations never resume twice, and multi-shot clones never
//! interfere with one another.

use proptest::prelude::*;

use ember_runtime::config::ContextConfig;
use ember_runtime::context::ContextPool;
use ember_runtime::continuation::{
    register_continuation, resume_ref, Continuation, ResumeError,
};
use ember_runtime::evidence::{EffectTag, EvidenceEntry, EvidenceVector, HandlerRef};

fn test_pool() -> ContextPool {
    ContextPool::new(ContextConfig {
        max_contexts: 256,
        initial_stack_size: 1024,
        max_stack_size: 8192,
    })
}

/// One step of a random continuation workout.
#[derive(Debug, Clone, Copy)]
enum LifecycleOp {
    Capture,
    ResumeLast,
    CloneLast,
    DropLast,
}

fn lifecycle_op() -> impl Strategy<Value = LifecycleOp> {
    prop_oneof![
        Just(LifecycleOp::Capture),
        Just(LifecycleOp::ResumeLast),
        Just(LifecycleOp::CloneLast),
        Just(LifecycleOp::DropLast),
    ]
}

proptest! {
    /// Any interleaving of capture/resume/clone/drop leaves the pool
    /// with zero live contexts and frames once everything is released.
    #[test]
    fn lifecycle_never_leaks(ops in proptest::collection::vec(lifecycle_op(), 0..40)) {
        let pool = test_pool();
        let mut live: Vec<Continuation> = Vec::new();

        for op in ops {
            match op {
                LifecycleOp::Capture => {
                    if let Ok(k) = Continuation::capture(&pool, |x: i64| x + 1) {
                        live.push(k);
                    }
                }
                LifecycleOp::ResumeLast => {
                    if let Some(k) = live.pop() {
                        let result: i64 = k.resume(1i64).unwrap();
                        prop_assert_eq!(result, 2);
                    }
                }
                LifecycleOp::CloneLast => {
                    if let Some(k) = live.last() {
                        if let Ok(clone) = k.clone_shot() {
                            live.push(clone);
                        }
                    }
                }
                LifecycleOp::DropLast => {
                    drop(live.pop());
                }
            }
            // Exactly one live context per live continuation at every
            // point in the interleaving.
            prop_assert_eq!(pool.live_contexts(), live.len());
        }

        live.clear();
        prop_assert_eq!(pool.live_contexts(), 0);
        prop_assert_eq!(pool.live_frames(), 0);
    }

    /// Resuming the same handle twice always yields the
    /// resume-after-completion error, never a second execution.
    #[test]
    fn registry_enforces_one_shot(value in -1000i64..1000) {
        let pool = test_pool();
        let k = Continuation::capture(&pool, move |x: i64| x * 3).unwrap();
        let handle = register_continuation(k);

        let first: i64 = resume_ref(handle, value).unwrap();
        prop_assert_eq!(first, value * 3);

        let second: Result<i64, _> = resume_ref(handle, value);
        prop_assert!(matches!(second, Err(ResumeError::AlreadyCompleted { .. })), "expected AlreadyCompleted on second resume");
        prop_assert_eq!(pool.live_contexts(), 0);
    }

    /// N independent clones complete with N independent results, even
    /// though the handler body allocates and mutates local data.
    #[test]
    fn multishot_clones_do_not_interfere(n in 1usize..8, base in 0i64..100) {
        let pool = test_pool();
        let k = Continuation::capture(&pool, move |x: i64| {
            let mut scratch = vec![0i64; 16];
            for slot in scratch.iter_mut() {
                *slot = x;
            }
            scratch.iter().sum::<i64>()
        }).unwrap();

        let clones: Vec<Continuation> =
            (0..n).map(|_| k.clone_shot().unwrap()).collect();
        prop_assert_eq!(pool.live_contexts(), n + 1);

        for (i, clone) in clones.into_iter().enumerate() {
            let input = base + i as i64;
            let result: i64 = clone.resume(input).unwrap();
            prop_assert_eq!(result, input * 16);
        }

        // The original is unaffected by its clones' completions.
        let result: i64 = k.resume(base).unwrap();
        prop_assert_eq!(result, base * 16);
        prop_assert_eq!(pool.live_contexts(), 0);
    }

    /// Evidence vectors keep LIFO scope discipline under arbitrary
    /// push/pop sequences, and dynamic lookup always finds the
    /// innermost entry.
    #[test]
    fn evidence_scopes_are_lifo(
        scopes in proptest::collection::vec(
            proptest::collection::vec((0u32..4, 0u64..100), 1..4),
            0..8,
        )
    ) {
        let mut ev = EvidenceVector::new();
        let mut shadow: Vec<Vec<EvidenceEntry>> = Vec::new();

        for scope in &scopes {
            let entries: Vec<EvidenceEntry> = scope
                .iter()
                .map(|(e, h)| EvidenceEntry::new(EffectTag(*e), HandlerRef(*h)))
                .collect();
            ev.push_scope(&entries);
            shadow.push(entries);

            // Innermost-wins lookup matches a straightforward reverse
            // scan of the shadow stack.
            for effect in 0u32..4 {
                let expected = shadow
                    .iter()
                    .flatten()
                    .rev()
                    .find(|e| e.effect == EffectTag(effect))
                    .copied();
                prop_assert_eq!(ev.lookup_dynamic(EffectTag(effect)).copied(), expected);
            }
        }

        prop_assert_eq!(ev.depth(), scopes.len());

        // Unwind: each pop restores the previous configuration exactly.
        while let Some(expected_scope) = shadow.pop() {
            let popped = ev.pop_scope().unwrap();
            prop_assert_eq!(popped, expected_scope.len());
            prop_assert_eq!(ev.len(), shadow.iter().map(Vec::len).sum::<usize>());
        }
        prop_assert!(ev.is_empty());
        prop_assert_eq!(ev.pop_scope(), None);
    }
}
