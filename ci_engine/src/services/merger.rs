//! Request merging rules used by the builder queue.

use std::sync::Arc;

use crate::models::build_request::BuildRequest;
use crate::models::source_stamp::SourceStamp;

/// Whether two stamps describe trees that one build can satisfy.
pub fn compatible_stamps(a: &SourceStamp, b: &SourceStamp) -> bool {
    a.can_merge_with(b)
}

pub fn can_merge(existing: &BuildRequest, incoming: &BuildRequest) -> bool {
    existing.builder == incoming.builder
        && existing.mergeable
        && incoming.mergeable
        && compatible_stamps(&existing.source, &incoming.source)
}

/// Combine two compatible requests. The survivor keeps the identity and
/// timestamp of the older one and a stamp covering both.
pub fn merge(a: BuildRequest, b: BuildRequest) -> BuildRequest {
    let (mut survivor, absorbed) = if a.priority_key() <= b.priority_key() {
        (a, b)
    } else {
        (b, a)
    };

    if survivor.source != absorbed.source {
        survivor.source = Arc::new(survivor.source.merged_with(&absorbed.source));
    }
    survivor.merged.extend(absorbed.constituents());
    survivor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use crate::models::change::{Change, NewChange};
    use crate::models::source_stamp::{Patch, Revision};
    use crate::models::{BuildSetId, ChangeId, PropertyMap, RequestId};

    fn change(id: u64) -> Arc<Change> {
        Arc::new(
            NewChange::new("ann")
                .on_branch("main")
                .into_change(ChangeId(id), Utc::now()),
        )
    }

    fn request(id: u64, at: i64, source: SourceStamp) -> BuildRequest {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        BuildRequest {
            id: RequestId(id),
            build_set_id: BuildSetId(id),
            builder: "b1".into(),
            mergeable: source.patch.is_none(),
            source: Arc::new(source),
            submitted_at: base + Duration::seconds(at),
            reason: String::new(),
            scheduler: None,
            properties: Arc::new(PropertyMap::new()),
            merged: Vec::new(),
        }
    }

    #[test]
    fn latest_on_same_branch_merges_keeping_earliest_timestamp() {
        let main = || SourceStamp::latest(Some("main".into()));
        let early = request(1, 10, main());
        let late = request(2, 20, main());
        assert!(can_merge(&early, &late));

        let merged = merge(late, early);
        assert_eq!(merged.id, RequestId(1));
        assert_eq!(merged.priority_key().0, request(0, 10, main()).submitted_at);
        assert_eq!(merged.merged.len(), 1);
        assert_eq!(merged.merged[0].request_id, RequestId(2));
    }

    #[test]
    fn different_branches_do_not_merge() {
        let a = request(1, 10, SourceStamp::latest(Some("main".into())));
        let b = request(2, 20, SourceStamp::latest(Some("dev".into())));
        assert!(!can_merge(&a, &b));
    }

    #[test]
    fn prefix_merge_adopts_superset_stamp() {
        let a = request(1, 10, SourceStamp::from_changes(vec![change(1)]));
        let b = request(2, 20, SourceStamp::from_changes(vec![change(1), change(2)]));
        assert!(can_merge(&a, &b));

        let merged = merge(a, b);
        assert_eq!(merged.id, RequestId(1));
        let ids: Vec<_> = merged.source.change_ids().map(|c| c.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn consecutive_stable_sets_merge_into_one_stamp() {
        let a = request(1, 10, SourceStamp::from_changes(vec![change(1)]));
        let b = request(2, 20, SourceStamp::from_changes(vec![change(2)]));
        let c = request(3, 30, SourceStamp::from_changes(vec![change(3)]));
        assert!(can_merge(&a, &b));

        let merged = merge(merge(a, b), c);
        assert_eq!(merged.id, RequestId(1));
        let ids: Vec<_> = merged.source.change_ids().map(|c| c.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(merged.merged.len(), 2);
    }

    #[test]
    fn patched_or_pinned_requests_never_merge() {
        let patch = Patch {
            level: 0,
            diff: String::new(),
            subdir: None,
        };
        let latest = || SourceStamp::latest(None);
        let a = request(1, 10, latest());
        let patched = request(2, 20, latest().with_patch(patch));
        assert!(!can_merge(&a, &patched));

        let mut pinned = request(3, 30, SourceStamp::at_revision(None, Revision::Number(4)));
        pinned.mergeable = false;
        assert!(!can_merge(&a, &pinned));
    }

    #[test]
    fn constituents_carry_over_through_repeated_merges() {
        let main = || SourceStamp::latest(Some("main".into()));
        let merged = merge(request(1, 1, main()), request(2, 2, main()));
        let merged = merge(request(3, 3, main()), merged);
        let ids: Vec<_> = merged
            .constituents()
            .iter()
            .map(|c| c.request_id.0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
