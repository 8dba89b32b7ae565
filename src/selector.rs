//! Ready-PR selection - pure functions deciding what gets staged next
//!
//! The engine gathers a branch's pull requests and pending splits, this
//! module turns them into a [`StagingPlan`]. No I/O happens here.

use crate::types::{BatchId, PrId, PrState, Priority, PullRequest, Split, SplitId};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Labels of GitHub's web-editor branches (`user:patch-3`), which are reused
/// across unrelated PRs and must not link them
static PATCH_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":patch-[0-9]+$").unwrap_or_else(|e| unreachable!("invalid regex: {e}"))
});

/// PRs of one label group, candidates for a single batch
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Most urgent priority of the group
    pub priority: Priority,
    /// Group members, by id
    pub prs: Vec<PullRequest>,
}

impl Candidate {
    /// Member ids
    pub fn ids(&self) -> Vec<PrId> {
        self.prs.iter().map(|p| p.id).collect()
    }

    fn min_id(&self) -> PrId {
        self.prs.iter().map(|p| p.id).min().unwrap_or_default()
    }
}

/// What the staging builder should do for a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingPlan {
    /// Stage these PR groups, in order, one batch each
    Fresh(Vec<Vec<PrId>>),
    /// Restage the first part of a pending split
    Split {
        /// Split the part is taken from
        split: SplitId,
        /// Batches of the part
        batches: Vec<BatchId>,
    },
    /// Nothing to stage
    Idle,
}

fn group_key(pr: &PullRequest) -> String {
    if PATCH_LABEL.is_match(&pr.label) {
        format!("#{}", pr.id)
    } else {
        pr.label.clone()
    }
}

/// Label groups of `target` that could be staged, most urgent first
///
/// Groups are kept when at least one member is ready or urgent; whether the
/// whole group can actually go is [`blocked_reason`]'s call. PRs already part
/// of a live batch (staged, or waiting in a split) are not candidates.
pub fn ready_prs(prs: &[PullRequest], target: &str) -> Vec<Candidate> {
    let mut groups: BTreeMap<String, Vec<PullRequest>> = BTreeMap::new();
    for pr in prs {
        if pr.target != target || pr.state.is_terminal() || pr.batch.is_some() {
            continue;
        }
        groups.entry(group_key(pr)).or_default().push(pr.clone());
    }

    let mut candidates: Vec<Candidate> = groups
        .into_values()
        .filter(|g| {
            g.iter()
                .any(|p| p.state == PrState::Ready || p.priority == Priority::Urgent)
        })
        .map(|mut prs| {
            prs.sort_by_key(|p| p.id);
            Candidate {
                priority: prs.iter().map(|p| p.priority).min().unwrap_or_default(),
                prs,
            }
        })
        .collect();
    candidates.sort_by_key(|c| (c.priority, c.min_id()));
    candidates
}

/// Why a label group can not be staged, if it can't
///
/// One blocked member blocks the group: linked PRs only ever go in together.
pub fn blocked_reason(group: &[PullRequest]) -> Option<String> {
    let urgent = group.iter().any(|p| p.priority == Priority::Urgent);
    for pr in group {
        let name = pr.display_name();
        if pr.draft {
            return Some(format!("{name} is a draft"));
        }
        if !pr.has_merge_method() {
            return Some(format!("{name} has no merge method"));
        }
        if urgent {
            if pr.state == PrState::Error {
                return Some(format!("{name} is in error"));
            }
        } else if pr.state != PrState::Ready {
            return Some(format!("{name} is not ready ({})", pr.state));
        }
    }
    None
}

/// Decide what to stage next on a branch
///
/// Urgent (p=0) and pressing (p=1) work goes first, even ahead of pending
/// splits, then the oldest split, then normal work. Only groups sharing the
/// leading priority are taken.
pub fn plan_staging(candidates: Vec<Candidate>, splits: &[Split]) -> StagingPlan {
    let rows: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| blocked_reason(&c.prs).is_none())
        .collect();
    let leading = rows.first().map(|c| c.priority);

    let take = |priority: Priority| {
        StagingPlan::Fresh(
            rows.iter()
                .take_while(|c| c.priority == priority)
                .map(Candidate::ids)
                .collect(),
        )
    };

    match leading {
        Some(p @ (Priority::Urgent | Priority::Pressing)) => take(p),
        _ => {
            if let Some(split) = splits.iter().find(|s| !s.parts.is_empty()) {
                return StagingPlan::Split {
                    split: split.id,
                    batches: split.parts[0].clone(),
                };
            }
            leading.map_or(StagingPlan::Idle, take)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(id: PrId, repository: &str, label: &str, state: PrState) -> PullRequest {
        PullRequest {
            id,
            repository: repository.into(),
            number: id,
            target: "main".into(),
            author: "dev".into(),
            head: format!("{id:040}"),
            label: label.into(),
            message: "title".into(),
            draft: false,
            squash: true,
            merge_method: None,
            method_warned: false,
            priority: Priority::Normal,
            state,
            reviewed_by: None,
            delegates: Default::default(),
            batch: None,
            commits_map: Default::default(),
            synced_tags: None,
        }
    }

    #[test]
    fn test_groups_by_label_and_orders_by_priority() {
        let mut urgent = pr(5, "acme/app", "dev:fix", PrState::Opened);
        urgent.priority = Priority::Urgent;
        let prs = vec![
            pr(1, "acme/app", "dev:a", PrState::Ready),
            pr(2, "acme/lib", "dev:a", PrState::Ready),
            pr(3, "acme/app", "dev:b", PrState::Ready),
            pr(4, "acme/app", "dev:c", PrState::Approved),
            urgent,
        ];
        let groups = ready_prs(&prs, "main");
        let ids: Vec<_> = groups.iter().map(Candidate::ids).collect();
        assert_eq!(ids, vec![vec![5], vec![1, 2], vec![3]]);
        assert_eq!(groups[0].priority, Priority::Urgent);
    }

    #[test]
    fn test_patch_labels_are_not_grouped() {
        let prs = vec![
            pr(1, "acme/app", "dev:patch-1", PrState::Ready),
            pr(2, "acme/lib", "dev:patch-1", PrState::Ready),
        ];
        assert_eq!(ready_prs(&prs, "main").len(), 2);
    }

    #[test]
    fn test_terminal_and_batched_prs_are_ignored() {
        let mut batched = pr(2, "acme/lib", "dev:x", PrState::Ready);
        batched.batch = Some(9);
        let mut other_branch = pr(3, "acme/app", "dev:y", PrState::Ready);
        other_branch.target = "stable".into();
        let prs = vec![pr(1, "acme/app", "dev:x", PrState::Merged), batched, other_branch];
        assert!(ready_prs(&prs, "main").is_empty());
    }

    #[test]
    fn test_blocked_group_is_excluded_entirely() {
        let prs = vec![
            pr(1, "acme/app", "dev:a", PrState::Ready),
            pr(2, "acme/lib", "dev:a", PrState::Validated),
        ];
        let groups = ready_prs(&prs, "main");
        assert_eq!(groups.len(), 1);
        assert!(blocked_reason(&groups[0].prs).is_some());
        assert_eq!(plan_staging(groups, &[]), StagingPlan::Idle);
    }

    #[test]
    fn test_urgent_bypasses_review() {
        let mut p = pr(1, "acme/app", "dev:a", PrState::Opened);
        p.priority = Priority::Urgent;
        assert_eq!(blocked_reason(std::slice::from_ref(&p)), None);
        p.state = PrState::Error;
        assert!(blocked_reason(&[p]).is_some());
    }

    #[test]
    fn test_missing_merge_method_blocks() {
        let mut p = pr(1, "acme/app", "dev:a", PrState::Ready);
        p.squash = false;
        assert!(blocked_reason(std::slice::from_ref(&p)).is_some());
        p.merge_method = Some(crate::types::MergeMethod::Merge);
        assert_eq!(blocked_reason(&[p]), None);
    }

    #[test]
    fn test_splits_go_before_normal_work() {
        let split = Split {
            id: 7,
            target: "main".into(),
            parts: vec![vec![10], vec![11]],
        };
        let groups = ready_prs(&[pr(1, "acme/app", "dev:a", PrState::Ready)], "main");
        assert_eq!(
            plan_staging(groups, std::slice::from_ref(&split)),
            StagingPlan::Split {
                split: 7,
                batches: vec![10]
            }
        );
    }

    #[test]
    fn test_pressing_work_preempts_splits() {
        let split = Split {
            id: 7,
            target: "main".into(),
            parts: vec![vec![10]],
        };
        let mut pressing = pr(2, "acme/app", "dev:b", PrState::Ready);
        pressing.priority = Priority::Pressing;
        let prs = vec![pr(1, "acme/app", "dev:a", PrState::Ready), pressing];
        assert_eq!(
            plan_staging(ready_prs(&prs, "main"), &[split]),
            StagingPlan::Fresh(vec![vec![2]])
        );
    }

    #[test]
    fn test_only_leading_priority_is_taken() {
        let mut pressing = pr(3, "acme/app", "dev:c", PrState::Ready);
        pressing.priority = Priority::Pressing;
        let prs = vec![
            pr(1, "acme/app", "dev:a", PrState::Ready),
            pr(2, "acme/app", "dev:b", PrState::Ready),
            pressing,
        ];
        assert_eq!(
            plan_staging(ready_prs(&prs, "main"), &[]),
            StagingPlan::Fresh(vec![vec![3]])
        );

        let prs = vec![
            pr(1, "acme/app", "dev:a", PrState::Ready),
            pr(2, "acme/app", "dev:b", PrState::Ready),
        ];
        assert_eq!(
            plan_staging(ready_prs(&prs, "main"), &[]),
            StagingPlan::Fresh(vec![vec![1], vec![2]])
        );
    }
}
