//! Per-id last-writer-wins reconciliation of two replicas with tombstones.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::identity::ClientId;
use crate::model::{Alias, AliasId, ReplicaSnapshot, Tombstone};

/// How two alias candidates with the same `lastUpdated` are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    PreferRemote,
    PreferLocal,
    /// Smaller `(name, command, comment, created)` wins, independent of which
    /// side is remote.
    #[default]
    LexicographicMin,
}

/// Who produced a merge result and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub at: Timestamp,
    pub by: ClientId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub live: usize,
    pub deleted: usize,
    /// Ids for which both sides held differing records.
    pub conflicts: usize,
    /// Conflicts that had equal timestamps and fell to the tie-break policy.
    pub ties: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub snapshot: ReplicaSnapshot,
    pub report: MergeReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Remote,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeDecision {
    Live,
    Deleted,
}

/// A tombstone buries the alias only when strictly newer; an exact tie keeps
/// the alias alive.
pub(crate) fn resolve_record(alias: Option<Timestamp>, tombstone: Option<Timestamp>) -> MergeDecision {
    match (alias, tombstone) {
        (Some(updated), Some(deleted)) if deleted > updated => MergeDecision::Deleted,
        (None, Some(_)) => MergeDecision::Deleted,
        _ => MergeDecision::Live,
    }
}

fn alias_key(alias: &Alias) -> (&str, &str, Option<&str>, Timestamp) {
    (&alias.name, &alias.command, alias.comment.as_deref(), alias.created)
}

fn pick_alias<'a>(
    remote: Option<&'a Alias>,
    local: Option<&'a Alias>,
    policy: TieBreakPolicy,
    report: &mut MergeReport,
) -> Option<&'a Alias> {
    let (r, l) = match (remote, local) {
        (Some(r), Some(l)) => (r, l),
        (r, l) => return r.or(l),
    };
    if r == l {
        return Some(r);
    }
    report.conflicts += 1;

    let winner = match r.last_updated.cmp(&l.last_updated) {
        Ordering::Greater => Side::Remote,
        Ordering::Less => Side::Local,
        Ordering::Equal => {
            report.ties += 1;
            match policy {
                TieBreakPolicy::PreferRemote => Side::Remote,
                TieBreakPolicy::PreferLocal => Side::Local,
                TieBreakPolicy::LexicographicMin => {
                    if alias_key(l) < alias_key(r) {
                        Side::Local
                    } else {
                        Side::Remote
                    }
                }
            }
        }
    };

    Some(match winner {
        Side::Remote => r,
        Side::Local => l,
    })
}

fn pick_tombstone<'a>(remote: Option<&'a Tombstone>, local: Option<&'a Tombstone>) -> Option<&'a Tombstone> {
    match (remote, local) {
        (Some(r), Some(l)) if l.deleted_at > r.deleted_at => Some(l),
        (Some(r), _) => Some(r),
        (None, l) => l,
    }
}

/// Reconciles `remote` and `local` into a single snapshot.
///
/// Every id present in either input ends up in exactly one of the result's
/// `aliases` or `deleted` maps. The result is stamped with `stamp`.
pub fn merge(
    remote: &ReplicaSnapshot,
    local: &ReplicaSnapshot,
    stamp: Stamp,
    policy: TieBreakPolicy,
) -> MergeOutcome {
    let ids: BTreeSet<&AliasId> = remote
        .aliases
        .keys()
        .chain(remote.deleted.keys())
        .chain(local.aliases.keys())
        .chain(local.deleted.keys())
        .collect();

    let mut report = MergeReport::default();
    let mut merged = ReplicaSnapshot {
        updated_at: stamp.at,
        updated_by: stamp.by,
        ..ReplicaSnapshot::default()
    };

    for id in ids {
        let alias = pick_alias(remote.aliases.get(id), local.aliases.get(id), policy, &mut report);
        let tombstone = pick_tombstone(remote.deleted.get(id), local.deleted.get(id));

        match resolve_record(alias.map(|a| a.last_updated), tombstone.map(|t| t.deleted_at)) {
            MergeDecision::Deleted => {
                if let Some(t) = tombstone {
                    merged.deleted.insert(id.clone(), t.clone());
                    report.deleted += 1;
                }
            }
            MergeDecision::Live => {
                if let Some(a) = alias {
                    merged.aliases.insert(id.clone(), a.clone());
                    report.live += 1;
                }
            }
        }
    }

    MergeOutcome {
        snapshot: merged,
        report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AliasDraft;

    fn stamp(at: u64) -> Stamp {
        Stamp {
            at: Timestamp::from_millis(at),
            by: ClientId::from("me"),
        }
    }

    fn alias(id: &str, name: &str, command: &str, at: u64) -> Alias {
        Alias::from_draft(
            AliasId::from(id),
            AliasDraft::new(name, command),
            Timestamp::from_millis(at),
        )
    }

    fn with_aliases(aliases: &[Alias]) -> ReplicaSnapshot {
        let mut snap = ReplicaSnapshot::empty();
        for a in aliases {
            snap.aliases.insert(a.id.clone(), a.clone());
        }
        snap
    }

    fn tombstone(id: &str, at: u64) -> Tombstone {
        Tombstone {
            id: AliasId::from(id),
            deleted_at: Timestamp::from_millis(at),
        }
    }

    fn with_tombstones(snap: &mut ReplicaSnapshot, tombstones: &[Tombstone]) {
        for t in tombstones {
            snap.deleted.insert(t.id.clone(), t.clone());
        }
    }

    #[test]
    fn newer_deletion_beats_older_edit() {
        let local = with_aliases(&[alias("a1", "ll", "ls -la", 100)]);
        let mut remote = ReplicaSnapshot::empty();
        with_tombstones(&mut remote, &[tombstone("a1", 200)]);

        let out = merge(&remote, &local, stamp(300), TieBreakPolicy::default());

        assert!(out.snapshot.aliases.is_empty());
        assert_eq!(out.snapshot.deleted.get(&AliasId::from("a1")), Some(&tombstone("a1", 200)));
        assert_eq!(out.report.deleted, 1);
    }

    #[test]
    fn later_remote_edit_wins_and_is_stamped_locally() {
        let local = with_aliases(&[alias("a2", "gs", "git status", 50)]);
        let mut remote = with_aliases(&[alias("a2", "gs", "git status -sb", 80)]);
        remote.updated_by = ClientId::from("other");

        let out = merge(&remote, &local, stamp(90), TieBreakPolicy::default());

        assert_eq!(out.snapshot.aliases[&AliasId::from("a2")].command, "git status -sb");
        assert_eq!(out.snapshot.updated_by, ClientId::from("me"));
        assert_eq!(out.report.conflicts, 1);
        assert_eq!(out.report.ties, 0);
    }

    #[test]
    fn empty_inputs_merge_to_empty_stamped_snapshot() {
        let out = merge(&ReplicaSnapshot::empty(), &ReplicaSnapshot::empty(), stamp(1234), TieBreakPolicy::default());
        assert!(out.snapshot.is_empty());
        assert_eq!(out.snapshot.updated_at.as_millis(), 1234);
        assert_eq!(out.report, MergeReport::default());
    }

    #[test]
    fn tombstone_precedence_boundaries() {
        for (deleted_at, expect_live) in [(99, true), (100, true), (101, false)] {
            let local = with_aliases(&[alias("x", "x", "true", 100)]);
            let mut remote = ReplicaSnapshot::empty();
            with_tombstones(&mut remote, &[tombstone("x", deleted_at)]);

            let out = merge(&remote, &local, stamp(500), TieBreakPolicy::default());
            let id = AliasId::from("x");
            assert_eq!(out.snapshot.aliases.contains_key(&id), expect_live, "deletedAt={deleted_at}");
            assert_eq!(out.snapshot.deleted.contains_key(&id), !expect_live, "deletedAt={deleted_at}");
        }
    }

    #[test]
    fn strictly_newer_recreation_survives_old_tombstone() {
        let mut local = ReplicaSnapshot::empty();
        with_tombstones(&mut local, &[tombstone("r", 10)]);
        let remote = with_aliases(&[alias("r", "r", "echo back", 20)]);

        let out = merge(&remote, &local, stamp(30), TieBreakPolicy::default());
        assert!(out.snapshot.aliases.contains_key(&AliasId::from("r")));
        assert!(out.snapshot.deleted.is_empty());
    }

    #[test]
    fn id_in_both_maps_of_one_snapshot_is_settled() {
        let mut local = with_aliases(&[alias("t", "t", "true", 5)]);
        with_tombstones(&mut local, &[tombstone("t", 6)]);

        let out = merge(&ReplicaSnapshot::empty(), &local, stamp(7), TieBreakPolicy::default());
        assert!(out.snapshot.aliases.is_empty());
        assert_eq!(out.snapshot.deleted.len(), 1);
    }

    #[test]
    fn newest_tombstone_is_kept() {
        let mut local = ReplicaSnapshot::empty();
        with_tombstones(&mut local, &[tombstone("d", 40)]);
        let mut remote = ReplicaSnapshot::empty();
        with_tombstones(&mut remote, &[tombstone("d", 30)]);

        let out = merge(&remote, &local, stamp(50), TieBreakPolicy::default());
        assert_eq!(out.snapshot.deleted[&AliasId::from("d")].deleted_at.as_millis(), 40);
    }

    #[test]
    fn tie_break_policies() {
        let remote = with_aliases(&[alias("k", "k", "zzz", 10)]);
        let local = with_aliases(&[alias("k", "k", "aaa", 10)]);
        let id = AliasId::from("k");

        let pick = |policy| merge(&remote, &local, stamp(11), policy).snapshot.aliases[&id].command.clone();
        assert_eq!(pick(TieBreakPolicy::PreferRemote), "zzz");
        assert_eq!(pick(TieBreakPolicy::PreferLocal), "aaa");
        assert_eq!(pick(TieBreakPolicy::LexicographicMin), "aaa");

        let out = merge(&remote, &local, stamp(11), TieBreakPolicy::LexicographicMin);
        assert_eq!(out.report.ties, 1);
    }

    fn mixed_pair() -> (ReplicaSnapshot, ReplicaSnapshot) {
        let mut a = with_aliases(&[
            alias("1", "one", "echo 1", 10),
            alias("2", "two", "echo 2", 20),
            alias("3", "three", "echo 3", 30),
            alias("6", "six", "echo a", 60),
        ]);
        with_tombstones(&mut a, &[tombstone("4", 40)]);
        let mut b = with_aliases(&[
            alias("2", "two", "echo two", 25),
            alias("4", "four", "echo 4", 35),
            alias("5", "five", "echo 5", 50),
            alias("6", "six", "echo b", 60),
        ]);
        with_tombstones(&mut b, &[tombstone("3", 30), tombstone("1", 11)]);
        (a, b)
    }

    #[test]
    fn merge_is_idempotent() {
        let (a, b) = mixed_pair();
        let once = merge(&a, &b, stamp(100), TieBreakPolicy::default()).snapshot;
        let twice = merge(&once, &once, stamp(200), TieBreakPolicy::default());

        assert_eq!(twice.snapshot.aliases, once.aliases);
        assert_eq!(twice.snapshot.deleted, once.deleted);
        assert_eq!(twice.report.conflicts, 0);
    }

    #[test]
    fn union_is_complete_and_disjoint() {
        let (a, b) = mixed_pair();
        let out = merge(&a, &b, stamp(100), TieBreakPolicy::default()).snapshot;

        let all: BTreeSet<_> = a
            .aliases
            .keys()
            .chain(a.deleted.keys())
            .chain(b.aliases.keys())
            .chain(b.deleted.keys())
            .collect();
        for id in all {
            let live = out.aliases.contains_key(id);
            let dead = out.deleted.contains_key(id);
            assert!(live ^ dead, "id {id} live={live} dead={dead}");
        }
        assert_eq!(out.aliases.len() + out.deleted.len(), 6);
    }

    #[test]
    fn lexicographic_policy_is_commutative() {
        let (a, b) = mixed_pair();
        let ab = merge(&a, &b, stamp(100), TieBreakPolicy::LexicographicMin).snapshot;
        let ba = merge(&b, &a, stamp(100), TieBreakPolicy::LexicographicMin).snapshot;
        assert_eq!(ab, ba);
    }

    #[test]
    fn tie_differing_only_in_creation_time_is_commutative() {
        let mut early = alias("k", "k", "same", 10);
        early.created = Timestamp::from_millis(1);
        let mut late = early.clone();
        late.created = Timestamp::from_millis(5);
        let a = with_aliases(&[early.clone()]);
        let b = with_aliases(&[late]);

        let ab = merge(&a, &b, stamp(20), TieBreakPolicy::LexicographicMin).snapshot;
        let ba = merge(&b, &a, stamp(20), TieBreakPolicy::LexicographicMin).snapshot;
        assert_eq!(ab, ba);
        assert_eq!(ab.aliases[&AliasId::from("k")], early);
    }

    #[test]
    fn expected_outcome_of_mixed_pair() {
        let (a, b) = mixed_pair();
        let out = merge(&a, &b, stamp(100), TieBreakPolicy::default()).snapshot;
        let live: Vec<&str> = out.aliases.keys().map(|k| k.as_str()).collect();
        let dead: Vec<&str> = out.deleted.keys().map(|k| k.as_str()).collect();

        // 1: tombstone@11 > edit@10. 3: tombstone@30 ties edit@30, stays live.
        // 4: tombstone@40 > edit@35.
        assert_eq!(live, vec!["2", "3", "5", "6"]);
        assert_eq!(dead, vec!["1", "4"]);
        assert_eq!(out.aliases[&AliasId::from("2")].command, "echo two");
        assert_eq!(out.aliases[&AliasId::from("6")].command, "echo a");
    }
}
