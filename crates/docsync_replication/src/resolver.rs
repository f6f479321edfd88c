//! Conflict resolution: what to do with one id given both sides and the
//! last agreed state.
//!
//! [`decide`] is pure and is applied identically to documents and to
//! attachments; only the [`DecisionPolicy`] differs between the two levels.

use crate::config::ConflictHandling;

/// One of the two replicated stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The local store.
    Local,
    /// The remote store.
    Remote,
}

/// Class of change observed on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Present now, never seen before.
    Creation,
    /// Present now, different from the signature.
    Modification,
    /// Absent now, present at the last sync.
    Deletion,
}

/// Switches enabling the reaction to each change class on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeChecks {
    /// React to creations.
    pub creation: bool,
    /// React to modifications.
    pub modification: bool,
    /// React to deletions.
    pub deletion: bool,
}

impl ChangeChecks {
    /// Every switch on.
    #[must_use]
    pub fn all() -> Self {
        Self {
            creation: true,
            modification: true,
            deletion: true,
        }
    }

    /// Every switch off.
    #[must_use]
    pub fn none() -> Self {
        Self {
            creation: false,
            modification: false,
            deletion: false,
        }
    }

    /// Sets the creation switch.
    #[must_use]
    pub fn with_creation(mut self, enabled: bool) -> Self {
        self.creation = enabled;
        self
    }

    /// Sets the modification switch.
    #[must_use]
    pub fn with_modification(mut self, enabled: bool) -> Self {
        self.modification = enabled;
        self
    }

    /// Sets the deletion switch.
    #[must_use]
    pub fn with_deletion(mut self, enabled: bool) -> Self {
        self.deletion = enabled;
        self
    }

    /// Returns true if any switch is on.
    #[must_use]
    pub fn any(self) -> bool {
        self.creation || self.modification || self.deletion
    }

    fn allows(self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Creation => self.creation,
            ChangeKind::Modification => self.modification,
            ChangeKind::Deletion => self.deletion,
        }
    }
}

/// Everything [`decide`] needs besides the hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPolicy {
    /// Switches for changes made on the local side.
    pub local: ChangeChecks,
    /// Switches for changes made on the remote side.
    pub remote: ChangeChecks,
    /// What to do when both sides changed differently.
    pub conflict: ConflictHandling,
}

/// The hashes recorded at the last successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline<'a> {
    /// Local hash, if local was seen.
    pub local: Option<&'a str>,
    /// Remote hash, if remote was seen.
    pub remote: Option<&'a str>,
}

/// A change left alone because its switch is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedChange {
    /// Side the change happened on.
    pub side: Side,
    /// Change class.
    pub kind: ChangeKind,
}

/// Action chosen for one id or attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do.
    NoOp,
    /// Both sides already agree; record their hash.
    Record,
    /// Absent on both sides; drop the signature.
    Forget,
    /// Copy local to remote.
    Push {
        /// Remote has never seen the item.
        create: bool,
        /// Chosen by the conflict policy.
        forced: bool,
    },
    /// Copy remote to local.
    Pull {
        /// Local has never seen the item.
        create: bool,
        /// Chosen by the conflict policy.
        forced: bool,
    },
    /// Remove the local copy.
    DeleteLocal,
    /// Remove the remote copy.
    DeleteRemote,
    /// Both sides changed differently and the policy is to fail.
    Conflict,
    /// Both sides changed differently and the policy is to leave them.
    Deferred,
    /// The change is not acted on.
    Skip(SkippedChange),
}

impl Decision {
    /// Returns true if executing the decision writes to a store.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Decision::Push { .. }
                | Decision::Pull { .. }
                | Decision::DeleteLocal
                | Decision::DeleteRemote
        )
    }

    /// Returns true if executing the decision writes the signature.
    #[must_use]
    pub fn settles(self) -> bool {
        self.is_mutation() || matches!(self, Decision::Record | Decision::Forget)
    }
}

fn gated(checks: ChangeChecks, side: Side, kind: ChangeKind, action: Decision) -> Decision {
    if checks.allows(kind) {
        action
    } else {
        Decision::Skip(SkippedChange { side, kind })
    }
}

fn resolve_conflict(handling: ConflictHandling) -> Decision {
    match handling {
        ConflictHandling::Fail => Decision::Conflict,
        ConflictHandling::KeepLocal => Decision::Push {
            create: false,
            forced: true,
        },
        ConflictHandling::KeepRemote => Decision::Pull {
            create: false,
            forced: true,
        },
        ConflictHandling::Continue => Decision::Deferred,
    }
}

/// One side deleted an item the other side still has.
///
/// An untouched survivor follows the deletion. A modified survivor is a
/// conflict: `KeepLocal`/`KeepRemote` pick a side, `Continue` defers and
/// `Fail` re-creates the survivor on the deleting side rather than lose it.
fn deletion_against(deleted: Side, survivor_unchanged: bool, policy: &DecisionPolicy) -> Decision {
    let (delete, recreate, deletion_side_kept) = match deleted {
        Side::Remote => (
            gated(
                policy.remote,
                Side::Remote,
                ChangeKind::Deletion,
                Decision::DeleteLocal,
            ),
            gated(
                policy.local,
                Side::Local,
                ChangeKind::Modification,
                Decision::Push {
                    create: true,
                    forced: true,
                },
            ),
            ConflictHandling::KeepRemote,
        ),
        Side::Local => (
            gated(
                policy.local,
                Side::Local,
                ChangeKind::Deletion,
                Decision::DeleteRemote,
            ),
            gated(
                policy.remote,
                Side::Remote,
                ChangeKind::Modification,
                Decision::Pull {
                    create: true,
                    forced: true,
                },
            ),
            ConflictHandling::KeepLocal,
        ),
    };
    if survivor_unchanged || policy.conflict == deletion_side_kept {
        delete
    } else if policy.conflict == ConflictHandling::Continue {
        Decision::Deferred
    } else {
        recreate
    }
}

/// Decides what to do with one id.
///
/// `local` and `remote` are the current hashes, `None` meaning absent on
/// that side. `baseline` is the signature, `None` meaning never synced.
/// Rules are evaluated in order and the first match wins:
///
/// 1. absent on both sides: forget the signature if there is one
/// 2. never synced, present on both: agree or conflict
/// 3. remote gone but seen before: remote deletion, unless local was
///    modified since, which is resolved as a conflict
/// 4. local gone but seen before: the mirror of rule 3
/// 5. only local has it: local creation
/// 6. only remote has it: remote creation
/// 7. only local changed: local modification
/// 8. only remote changed: remote modification
/// 9. both changed: agree or conflict
/// 10. otherwise nothing to do
#[must_use]
pub fn decide(
    local: Option<&str>,
    remote: Option<&str>,
    baseline: Option<Baseline<'_>>,
    policy: &DecisionPolicy,
) -> Decision {
    let (local, remote) = match (local, remote) {
        (None, None) => {
            return if baseline.is_some() {
                Decision::Forget
            } else {
                Decision::NoOp
            };
        }
        (Some(local), None) => {
            return match baseline.filter(|b| b.remote.is_some()) {
                Some(baseline) => deletion_against(
                    Side::Remote,
                    baseline.local == Some(local),
                    policy,
                ),
                None => gated(
                    policy.local,
                    Side::Local,
                    ChangeKind::Creation,
                    Decision::Push {
                        create: true,
                        forced: false,
                    },
                ),
            };
        }
        (None, Some(remote)) => {
            return match baseline.filter(|b| b.local.is_some()) {
                Some(baseline) => deletion_against(
                    Side::Local,
                    baseline.remote == Some(remote),
                    policy,
                ),
                None => gated(
                    policy.remote,
                    Side::Remote,
                    ChangeKind::Creation,
                    Decision::Pull {
                        create: true,
                        forced: false,
                    },
                ),
            };
        }
        (Some(local), Some(remote)) => (local, remote),
    };

    let Some(baseline) = baseline else {
        return if local == remote {
            Decision::Record
        } else {
            resolve_conflict(policy.conflict)
        };
    };

    let local_changed = baseline.local != Some(local);
    let remote_changed = baseline.remote != Some(remote);

    match (local_changed, remote_changed) {
        (true, false) => gated(
            policy.local,
            Side::Local,
            ChangeKind::Modification,
            Decision::Push {
                create: false,
                forced: false,
            },
        ),
        (false, true) => gated(
            policy.remote,
            Side::Remote,
            ChangeKind::Modification,
            Decision::Pull {
                create: false,
                forced: false,
            },
        ),
        (true, true) if local == remote => Decision::Record,
        (true, true) => resolve_conflict(policy.conflict),
        (false, false) => Decision::NoOp,
    }
}
