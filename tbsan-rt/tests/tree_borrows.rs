use tbsan_rt::borrow_tracker::errors::TransitionError;
use tbsan_rt::*;

fn full(size: u64) -> AllocRange {
    AllocRange::new(0, size)
}

fn derive(
    rt: &mut Runtime,
    prov: Provenance,
    range: AllocRange,
    derivation: DerivationKind,
    interior_mut: bool,
) -> Provenance {
    let tag = rt.notify_create(prov, range, derivation, interior_mut).unwrap();
    Provenance { alloc_id: prov.alloc_id, bor_tag: tag.unwrap_or(prov.bor_tag) }
}

fn reserved(rt: &mut Runtime, parent: Provenance, range: AllocRange) -> Provenance {
    derive(rt, parent, range, DerivationKind::ExclusiveReborrow, false)
}

fn frozen(rt: &mut Runtime, parent: Provenance, range: AllocRange) -> Provenance {
    derive(rt, parent, range, DerivationKind::SharedReborrow, false)
}

fn kind_at(rt: &Runtime, prov: Provenance, offset: u64) -> PermissionKind {
    rt.permission_at(prov, offset).unwrap().kind()
}

#[test]
fn two_phase_borrow_survives_foreign_read() {
    let mut rt = Runtime::default();
    let r = rt.notify_allocate(4);
    let c = reserved(&mut rt, r, full(4));
    assert_eq!(kind_at(&rt, c, 0), PermissionKind::Reserved);

    rt.notify_access(r, full(4), AccessKind::Read).unwrap();
    assert_eq!(kind_at(&rt, c, 0), PermissionKind::Reserved);

    rt.notify_access(c, full(4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, c, 0), PermissionKind::Active);
    assert_eq!(kind_at(&rt, r, 0), PermissionKind::Active);
}

#[test]
fn foreign_write_disables_frozen() {
    let mut rt = Runtime::default();
    let r = rt.notify_allocate(4);
    let c = frozen(&mut rt, r, full(4));
    rt.notify_access(r, full(4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, c, 0), PermissionKind::Disabled);

    let err = rt.notify_access(c, full(4), AccessKind::Read).unwrap_err();
    let violation = err.as_violation().unwrap();
    assert_eq!(violation.kind(), ViolationKind::Incompatible);
    assert_eq!(violation.conflicting_info.tag, c.bor_tag);
    assert_eq!(violation.accessed_info.tag, c.bor_tag);
    assert_eq!(violation.perm_before.kind(), PermissionKind::Disabled);
    assert_eq!(violation.perm_after, None);
}

#[test]
fn write_through_frozen_child_of_protected_tag_is_reported() {
    let mut rt = Runtime::default();
    let alloc = rt.notify_allocate(4);
    let r = reserved(&mut rt, alloc, full(4));
    let mut scope = rt.enter_call(&[r]);
    let c = frozen(&mut scope, r, full(4));

    let err = scope.notify_access(c, full(4), AccessKind::Write).unwrap_err();
    assert!(err.as_violation().is_some());
    // The protected tag was not silently disabled.
    assert_eq!(kind_at(&scope, r, 0), PermissionKind::Reserved);
}

#[test]
fn protector_forbids_losing_read() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(8);
    let x = reserved(&mut rt, root, full(8));
    let scope = rt.enter_call(&[x]);

    let err = scope.notify_access(root, AllocRange::new(2, 2), AccessKind::Write).unwrap_err();
    let violation = err.as_violation().unwrap();
    assert_eq!(violation.kind(), ViolationKind::Protector);
    assert_eq!(violation.conflicting_info.tag, x.bor_tag);
    assert_eq!(violation.accessed_info.tag, root.bor_tag);
    assert_eq!(violation.error_offset, 2);
    assert_eq!(violation.perm_before.kind(), PermissionKind::Reserved);
    assert_eq!(violation.perm_after.map(|p| p.kind()), Some(PermissionKind::Disabled));
    assert_eq!(kind_at(&scope, x, 2), PermissionKind::Reserved);

    // Once the call returns, the same write is allowed.
    drop(scope);
    rt.notify_access(root, AllocRange::new(2, 2), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, x, 2), PermissionKind::Disabled);
}

#[test]
fn protected_reserved_freezes_on_foreign_read() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let x = reserved(&mut rt, root, full(4));
    {
        let scope = rt.enter_call(&[x]);
        scope.notify_access(root, full(4), AccessKind::Read).unwrap();
        assert_eq!(kind_at(&scope, x, 0), PermissionKind::Frozen);
        let err = scope.notify_access(x, full(4), AccessKind::Write).unwrap_err();
        assert_eq!(err.as_violation().unwrap().kind(), ViolationKind::Incompatible);
    }
    // Unprotected, a foreign read leaves `Reserved` alone.
    let y = reserved(&mut rt, root, full(4));
    rt.notify_access(root, full(4), AccessKind::Read).unwrap();
    assert_eq!(kind_at(&rt, y, 0), PermissionKind::Reserved);
}

#[test]
fn protected_active_cannot_be_disabled_by_sibling() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let x = reserved(&mut rt, root, full(4));
    // Interior mutable, so the write through `x` leaves it `Reserved`.
    let y = derive(&mut rt, root, full(4), DerivationKind::ExclusiveReborrow, true);
    let scope = rt.enter_call(&[x]);
    scope.notify_access(x, full(4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&scope, x, 0), PermissionKind::Active);
    assert_eq!(kind_at(&scope, y, 0), PermissionKind::Reserved);

    let err = scope.notify_access(y, full(4), AccessKind::Write).unwrap_err();
    let violation = err.as_violation().unwrap();
    assert_eq!(violation.kind(), ViolationKind::Protector);
    assert_eq!(violation.conflicting_info.tag, x.bor_tag);
}

#[test]
fn interior_mutable_reserved_survives_foreign_writes() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let cell = derive(&mut rt, root, full(4), DerivationKind::ExclusiveReborrow, true);
    rt.notify_access(root, full(4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, cell, 0), PermissionKind::Reserved);
    rt.notify_access(cell, full(4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, cell, 0), PermissionKind::Active);
}

#[test]
fn allocation_teardown_isolates_trees() {
    let mut rt = Runtime::default();
    let a = rt.notify_allocate(8);
    let b = rt.notify_allocate(8);
    let b_child = reserved(&mut rt, b, full(8));
    rt.notify_access(b_child, AllocRange::new(0, 4), AccessKind::Write).unwrap();

    rt.notify_deallocate(a.alloc_id).unwrap();
    assert_eq!(rt.global().live_allocations(), 1);
    assert_eq!(kind_at(&rt, b_child, 0), PermissionKind::Active);
    assert_eq!(kind_at(&rt, b_child, 4), PermissionKind::Reserved);
    assert_eq!(kind_at(&rt, b, 0), PermissionKind::Active);
    rt.notify_access(b_child, full(8), AccessKind::Write).unwrap();

    let err = rt.notify_access(a, full(8), AccessKind::Read).unwrap_err();
    assert!(matches!(err, BorrowTrackerError::UseAfterFree(_)));
    assert!(matches!(rt.notify_deallocate(a.alloc_id), Err(BorrowTrackerError::UseAfterFree(_))));
}

#[test]
fn sibling_reads_commute() {
    fn run(first_a: bool) -> (bool, bool, PermissionKind, PermissionKind) {
        let mut rt = Runtime::default();
        let root = rt.notify_allocate(4);
        let a = reserved(&mut rt, root, full(4));
        let b = frozen(&mut rt, root, full(4));
        let (first, second) = if first_a { (a, b) } else { (b, a) };
        let r1 = rt.notify_access(first, full(4), AccessKind::Read).is_ok();
        let r2 = rt.notify_access(second, full(4), AccessKind::Read).is_ok();
        let (ra, rb) = if first_a { (r1, r2) } else { (r2, r1) };
        (ra, rb, kind_at(&rt, a, 0), kind_at(&rt, b, 0))
    }
    assert_eq!(run(true), run(false));
    assert_eq!(run(true), (true, true, PermissionKind::Reserved, PermissionKind::Frozen));
}

#[test]
fn rejected_access_is_not_applied() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(8);
    let a = reserved(&mut rt, root, full(8));
    let p = frozen(&mut rt, root, AllocRange::new(4, 4));
    let scope = rt.enter_call(&[p]);

    assert!(scope.notify_access(root, full(8), AccessKind::Write).is_err());
    for offset in 0..8 {
        assert_eq!(kind_at(&scope, a, offset), PermissionKind::Reserved);
        assert_eq!(kind_at(&scope, p, offset), PermissionKind::Frozen);
    }
}

#[test]
fn strongly_protected_allocation_cannot_be_freed() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let x = reserved(&mut rt, root, full(4));
    {
        let scope = rt.enter_call(&[x]);
        // Through the root, the write alone already trips the protector.
        let err = scope.notify_free(root).unwrap_err();
        let violation = err.as_violation().unwrap();
        assert!(matches!(violation.error_kind, TransitionError::ProtectedTransition(_)));
        assert_eq!(violation.conflicting_info.tag, x.bor_tag);

        // Through `x` the write is fine, but the allocation still cannot go away.
        let err = scope.notify_free(x).unwrap_err();
        let violation = err.as_violation().unwrap();
        assert_eq!(violation.kind(), ViolationKind::Protector);
        assert_eq!(violation.error_kind, TransitionError::ProtectedDealloc);
        assert_eq!(violation.conflicting_info.tag, x.bor_tag);
        assert_eq!(scope.global().live_allocations(), 1);
        assert_eq!(kind_at(&scope, x, 0), PermissionKind::Reserved);
    }
    rt.notify_free(root).unwrap();
    assert_eq!(rt.global().live_allocations(), 0);
}

#[test]
fn weakly_protected_allocation_can_be_freed() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let call = rt.new_call_id();
    rt.notify_call_enter(call, &[]);
    let info = RetagInfo::protected(
        DerivationKind::ExclusiveReborrow,
        false,
        ProtectorKind::WeakProtector,
    );
    let x = rt.notify_retag(root, full(4), info).unwrap().unwrap();
    assert_eq!(rt.global().get_protector_kind(x), Some(ProtectorKind::WeakProtector));
    let x = Provenance { alloc_id: root.alloc_id, bor_tag: x };
    rt.notify_free(x).unwrap();
    assert_eq!(rt.global().live_allocations(), 0);
    rt.notify_call_exit(call);
    assert_eq!(rt.global().get_protector_kind(x.bor_tag), None);
}

#[test]
fn protector_covers_offsets_outside_the_reborrow() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(8);
    let x = reserved(&mut rt, root, AllocRange::new(0, 4));
    let scope = rt.enter_call(&[x]);

    let err = scope.notify_access(root, AllocRange::new(4, 4), AccessKind::Write).unwrap_err();
    let violation = err.as_violation().unwrap();
    assert_eq!(violation.kind(), ViolationKind::Protector);
    assert_eq!(violation.conflicting_info.tag, x.bor_tag);
    assert_eq!(violation.error_offset, 4);
    assert_eq!(violation.perm_after.map(|p| p.kind()), Some(PermissionKind::Disabled));
    assert_eq!(kind_at(&scope, x, 4), PermissionKind::Reserved);
}

#[test]
fn interior_mutability_outlives_the_protector() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let x = {
        let mut scope = rt.enter_call(&[]);
        let info = RetagInfo::protected(
            DerivationKind::ExclusiveReborrow,
            true,
            ProtectorKind::StrongProtector,
        );
        let tag = scope.notify_retag(root, full(4), info).unwrap().unwrap();
        let x = Provenance { alloc_id: root.alloc_id, bor_tag: tag };
        // While protected, a foreign write is not allowed to disable it.
        let err = scope.notify_access(root, full(4), AccessKind::Write).unwrap_err();
        assert_eq!(err.as_violation().unwrap().kind(), ViolationKind::Protector);
        x
    };

    rt.notify_access(root, full(4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, x, 0), PermissionKind::Reserved);
    rt.notify_access(x, full(4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, x, 0), PermissionKind::Active);
}

#[test]
fn exiting_an_outer_call_unwinds_inner_calls() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let a = reserved(&mut rt, root, full(4));
    let b = reserved(&mut rt, root, full(4));
    let (outer, inner) = (rt.new_call_id(), rt.new_call_id());
    rt.notify_call_enter(outer, &[a]);
    rt.notify_call_enter(inner, &[b]);
    assert_eq!(rt.local().depth(), 2);

    rt.notify_call_exit(outer);
    assert_eq!(rt.local().depth(), 0);
    assert_eq!(rt.global().get_protector_kind(a.bor_tag), None);
    assert_eq!(rt.global().get_protector_kind(b.bor_tag), None);
    // The inner call is already gone; exiting it again is ignored.
    rt.notify_call_exit(inner);
    rt.notify_access(root, full(4), AccessKind::Write).unwrap();
}

#[test]
fn protector_guard_releases_on_panic() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(4);
    let x = reserved(&mut rt, root, full(4));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _scope = rt.enter_call(&[x]);
        panic!("unwinding through a protected call");
    }));
    assert!(result.is_err());
    assert_eq!(rt.local().depth(), 0);
    assert_eq!(rt.global().get_protector_kind(x.bor_tag), None);
}

#[test]
fn out_of_range_of_origin_but_in_bounds() {
    let mut rt = Runtime::default();
    let root = rt.notify_allocate(16);
    let c = reserved(&mut rt, root, AllocRange::new(0, 4));
    rt.notify_access(c, AllocRange::new(8, 4), AccessKind::Write).unwrap();
    assert_eq!(kind_at(&rt, c, 8), PermissionKind::Active);
    assert_eq!(kind_at(&rt, c, 0), PermissionKind::Reserved);

    let err = rt.notify_access(c, AllocRange::new(12, 8), AccessKind::Read).unwrap_err();
    assert!(matches!(err, BorrowTrackerError::OutOfBounds(_)));
}

#[test]
fn invalid_provenance_is_reported() {
    let mut rt = Runtime::default();
    let a = rt.notify_allocate(4);
    let b = rt.notify_allocate(4);
    let b_child = reserved(&mut rt, b, full(4));
    let mixed = Provenance { alloc_id: a.alloc_id, bor_tag: b_child.bor_tag };
    let err = rt.notify_access(mixed, full(4), AccessKind::Read).unwrap_err();
    assert!(matches!(err, BorrowTrackerError::InvalidProvenance(_)));
}

/// A small deterministic generator for access traces.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Ok(Option<BorTag>),
    Violation(BorTag, u64, ViolationKind),
    Other,
}

fn verdict<T>(result: BtResult<T>, ok: impl FnOnce(T) -> Option<BorTag>) -> Verdict {
    match result {
        Ok(value) => Verdict::Ok(ok(value)),
        Err(err) => match err.as_violation() {
            Some(v) => Verdict::Violation(v.conflicting_info.tag, v.error_offset, v.kind()),
            None => Verdict::Other,
        },
    }
}

/// Replays the same pseudo-random trace and returns every verdict and the final states.
fn replay(seed: u64, skipping: bool) -> (Vec<Verdict>, Vec<Option<Permission>>) {
    const SIZE: u64 = 16;
    let config = Config { foreign_access_skipping: skipping, ..Config::default() };
    let mut rt = Runtime::new(config);
    let root = rt.notify_allocate(SIZE);
    let mut ptrs = vec![root];
    let mut calls = Vec::new();
    let mut rng = Lcg(seed);
    let mut verdicts = Vec::new();

    for _ in 0..400 {
        let prov = ptrs[rng.next(ptrs.len() as u64) as usize];
        let start = rng.next(SIZE);
        let range = AllocRange::new(start, 1 + rng.next(SIZE - start));
        let v = match rng.next(10) {
            0 | 1 => {
                let derivation = match rng.next(3) {
                    0 => DerivationKind::ExclusiveReborrow,
                    1 => DerivationKind::SharedReborrow,
                    _ => DerivationKind::RawOrRetained,
                };
                let interior_mut = rng.next(4) == 0;
                let result = rt.notify_create(prov, range, derivation, interior_mut);
                if let Ok(Some(tag)) = result {
                    ptrs.push(Provenance { alloc_id: root.alloc_id, bor_tag: tag });
                }
                verdict(result, |tag| tag)
            }
            2 | 3 | 4 => verdict(rt.notify_access(prov, range, AccessKind::Read), |()| None),
            5 | 6 | 7 => verdict(rt.notify_access(prov, range, AccessKind::Write), |()| None),
            8 => {
                let call = rt.new_call_id();
                rt.notify_call_enter(call, &[prov]);
                calls.push(call);
                Verdict::Ok(None)
            }
            _ => {
                if let Some(call) = calls.pop() {
                    rt.notify_call_exit(call);
                }
                Verdict::Ok(None)
            }
        };
        verdicts.push(v);
    }

    let states = ptrs
        .iter()
        .flat_map(|&prov| (0..SIZE).map(move |offset| (prov, offset)))
        .map(|(prov, offset)| rt.permission_at(prov, offset).ok())
        .collect();
    (verdicts, states)
}

#[test]
fn foreign_access_skipping_never_changes_a_verdict() {
    for seed in 0..24 {
        let with_skipping = replay(seed, true);
        let without_skipping = replay(seed, false);
        assert_eq!(with_skipping, without_skipping, "seed {seed}");
    }
}

#[test]
fn configuration_from_toml() {
    let config = Config::from_toml_str("foreign_access_skipping = false\ntracked_tags = [2]").unwrap();
    let mut rt = Runtime::new(config);
    let root = rt.notify_allocate(4);
    assert_eq!(root.bor_tag, BorTag::new(2));
    assert!(rt.global().config().is_tracked(root.bor_tag));
    let c = reserved(&mut rt, root, full(4));
    rt.notify_access(c, full(4), AccessKind::Write).unwrap();
}
