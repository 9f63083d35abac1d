/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The decision that a new primary carries across a view change.
//!
//! Because at most one batch is ever in flight, only one sequence number can be undecided at a view
//! change: the one right after the best stable checkpoint among the view changes. For that sequence
//! number, the new view either re-proposes a batch that may have been decided in an earlier view, or
//! agrees on an empty batch.
//!
//! A subject `m` found in some view change's pset is re-proposed if both:
//! 1. `2f + 1` view changes have no prepared subject at that sequence number that conflicts with
//!    `m`, i.e., every prepared subject there was prepared in an earlier view than `m`, or in the same
//!    view with the same digest, and
//! 2. `f + 1` view changes have accepted a preprepare for `m`'s digest in `m`'s view or later.
//!
//! Otherwise, if `2f + 1` view changes have no prepared subject at that sequence number, nothing can
//! have been decided there and the new view agrees on an empty batch. If neither holds, the primary
//! has to wait for more view changes.
//!
//! The primary and every backup run [`make_xset`] on the same set of view changes, so a backup can
//! check the primary's decision by recomputing it.

use crate::{
    networking::messages::{ViewChange, XSet},
    types::{
        certificates::CheckpointCertificate,
        data_types::ViewNumber,
        subject::{SeqView, Subject},
    },
};

/// Decide what `view` must carry over, given the (already verified) `view_changes` and the number
/// of tolerated faults `f`.
///
/// Returns the decision together with the best stable checkpoint among the view changes, or `None`
/// if the view changes are not enough to decide yet.
pub(crate) fn make_xset<'a>(
    view: ViewNumber,
    view_changes: &[&'a ViewChange],
    f: u64,
) -> Option<(XSet, &'a CheckpointCertificate)> {
    let no_faulty_quorum = (2 * f + 1) as usize;
    let one_correct_quorum = (f + 1) as usize;
    if view_changes.len() < no_faulty_quorum {
        return None;
    }

    let best = view_changes
        .iter()
        .map(|vc| &vc.checkpoint)
        .max_by_key(|checkpoint| checkpoint.seq())?;
    let next = best.seq().next();

    let candidates = view_changes
        .iter()
        .flat_map(|vc| vc.pset.iter())
        .filter(|subject| subject.seq_no() == next);
    for candidate in candidates {
        let unconflicted = view_changes
            .iter()
            .filter(|vc| {
                vc.pset
                    .iter()
                    .filter(|prepared| prepared.seq_no() == next)
                    .all(|prepared| {
                        prepared.view() < candidate.view()
                            || (prepared.view() == candidate.view()
                                && prepared.digest == candidate.digest)
                    })
            })
            .count();
        if unconflicted < no_faulty_quorum {
            continue;
        }

        let accepted = view_changes
            .iter()
            .filter(|vc| {
                vc.qset.iter().any(|accepted| {
                    accepted.seq_no() == next
                        && accepted.view() >= candidate.view()
                        && accepted.digest == candidate.digest
                })
            })
            .count();
        if accepted < one_correct_quorum {
            continue;
        }

        return Some((
            XSet::Reproposal(Subject::new(SeqView::new(next, view), candidate.digest)),
            best,
        ));
    }

    let empty = view_changes
        .iter()
        .filter(|vc| !vc.pset.iter().any(|prepared| prepared.seq_no() == next))
        .count();
    if empty >= no_faulty_quorum {
        return Some((XSet::Null(SeqView::new(next, view)), best));
    }

    None
}
