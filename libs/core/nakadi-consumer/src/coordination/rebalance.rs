//! Deterministic partition distribution across group members.
//!
//! Partition ids and member ids are both sorted; the partition at sorted
//! index `i` belongs to the member at sorted index `i % members`. Every
//! member computes the same table from the same inputs, so ownership is
//! collision-free without a central scheduler.

use std::collections::BTreeSet;

/// What one member should contest and what it should give up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceDecision {
    /// Partitions this member is the candidate owner of
    pub assign: BTreeSet<String>,
    /// Every other known partition
    pub revoke: BTreeSet<String>,
}

/// Compute `member_id`'s share of `partitions`.
///
/// Returns `None` while there is nothing to decide: the member is not in the
/// membership snapshot yet, or no partitions are known.
pub fn rebalance<'a, P, M>(member_id: &str, partitions: P, members: M) -> Option<RebalanceDecision>
where
    P: IntoIterator<Item = &'a str>,
    M: IntoIterator<Item = &'a str>,
{
    let partitions: BTreeSet<&str> = partitions.into_iter().collect();
    let members: Vec<&str> = members
        .into_iter()
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .collect();

    if partitions.is_empty() || !members.iter().any(|member| *member == member_id) {
        return None;
    }

    let mut decision = RebalanceDecision::default();
    for (index, partition) in partitions.into_iter().enumerate() {
        if members[index % members.len()] == member_id {
            decision.assign.insert(partition.to_string());
        } else {
            decision.revoke.insert(partition.to_string());
        }
    }
    Some(decision)
}
