//! Reconciler - Create, read and delete ordered rule groups
//!
//! A rule group is a run of entries in a remote ordered list that one
//! resource owns. The device has no group object, so the group is tracked
//! purely through its `CompositeIdentity`: reads find the first member in
//! the remote list and walk forward as long as the names keep matching.
//!
//! Every step is idempotent, so `reconcile` can simply be called again after
//! a partial failure. Callers must not run two reconciliations against the
//! same scope at the same time.

use std::fmt;

use log::{debug, warn};
use thiserror::Error;

use crate::identity::{CompositeIdentity, IdentityError};
use crate::movement::MovementDirective;
use crate::provider::{OrderedListGateway, ProviderError};
use crate::rule::RuleEntry;
use crate::scope::Scope;

/// Progress of a single `reconcile` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    /// Local validation, before any remote call
    Planning,
    /// Upserting the first member
    Pushing,
    /// Deleting formerly owned members
    Pruning,
    /// Upserting the remaining members and moving the block into place
    Ordering,
    Committed,
    Failed,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcilePhase::Planning => "planning",
            ReconcilePhase::Pushing => "pushing",
            ReconcilePhase::Pruning => "pruning",
            ReconcilePhase::Ordering => "ordering",
            ReconcilePhase::Committed => "committed",
            ReconcilePhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum GroupError {
    /// The desired group cannot be applied as declared
    #[error("invalid plan: {0}")]
    InvalidPlan(IdentityError),

    /// Persisted identity could not be decoded
    #[error("{0}")]
    MalformedIdentity(IdentityError),

    /// The anchor of a relative group is gone from the device
    #[error("Can't position group {directive} {anchor:?}: rule is not present")]
    AnchorMissing {
        directive: MovementDirective,
        anchor: String,
    },

    /// Gateway failure, passed through unchanged
    #[error("{context}: {source}")]
    Remote {
        context: RemoteContext,
        source: ProviderError,
    },
}

impl GroupError {
    fn remote(context: RemoteContext) -> impl FnOnce(ProviderError) -> GroupError {
        move |source| GroupError::Remote { context, source }
    }
}

/// Operation that was running when the gateway failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteContext {
    Reconcile(ReconcilePhase),
    Rehydrate,
    Dissolve,
}

impl fmt::Display for RemoteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteContext::Reconcile(phase) => write!(f, "reconcile ({})", phase),
            RemoteContext::Rehydrate => write!(f, "read"),
            RemoteContext::Dissolve => write!(f, "delete"),
        }
    }
}

/// What a read found on the device
#[derive(Debug, Clone, PartialEq)]
pub enum Rehydration<E> {
    /// The first member is gone; the group has to be created again
    Gone,
    Found(GroupReadout<E>),
}

impl<E> Rehydration<E> {
    pub fn is_gone(&self) -> bool {
        matches!(self, Rehydration::Gone)
    }

    pub fn found(&self) -> Option<&GroupReadout<E>> {
        match self {
            Rehydration::Gone => None,
            Rehydration::Found(readout) => Some(readout),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupReadout<E> {
    /// Still-owned members in remote order
    pub entries: Vec<E>,
    /// Whether the block sits where its directive says it should
    pub position_correct: bool,
    /// Members of the identity that are no longer part of the contiguous run
    pub dropped: Vec<String>,
}

impl<E: RuleEntry> GroupReadout<E> {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name()).collect()
    }

    /// True when the device holds every member, in place and in order
    pub fn is_intact(&self) -> bool {
        self.position_correct && self.dropped.is_empty()
    }
}

/// Ordered group reconciliation against one gateway
pub struct GroupReconciler<'a, G: ?Sized> {
    gateway: &'a G,
}

impl<'a, G> GroupReconciler<'a, G>
where
    G: OrderedListGateway + ?Sized,
{
    pub fn new(gateway: &'a G) -> Self {
        Self { gateway }
    }

    /// Push `desired` to the device and place it according to `directive`.
    ///
    /// `previous` is the identity from the last successful apply, if any;
    /// members it owned that are no longer desired are deleted. On success
    /// the new identity is returned. On failure nothing is committed and the
    /// caller keeps its previous identity.
    pub async fn reconcile(
        &self,
        scope: &Scope,
        directive: MovementDirective,
        anchor: &str,
        desired: &[G::Entry],
        previous: Option<&CompositeIdentity>,
    ) -> Result<CompositeIdentity, GroupError> {
        let mut phase = ReconcilePhase::Planning;
        debug!("reconcile {}: {}", scope, phase);

        let names: Vec<String> = desired.iter().map(|e| e.name().to_string()).collect();
        let identity = CompositeIdentity::new(scope.clone(), directive, anchor, names)
            .map_err(GroupError::InvalidPlan)?;

        let result = self.push(&identity, desired, previous, &mut phase).await;
        match result {
            Ok(()) => {
                phase = ReconcilePhase::Committed;
                debug!("reconcile {}: {}", scope, phase);
                Ok(identity)
            }
            Err(err) => {
                warn!("reconcile {} failed while {}: {}", scope, phase, err);
                debug!("reconcile {}: {}", scope, ReconcilePhase::Failed);
                Err(err)
            }
        }
    }

    async fn push(
        &self,
        identity: &CompositeIdentity,
        desired: &[G::Entry],
        previous: Option<&CompositeIdentity>,
        phase: &mut ReconcilePhase,
    ) -> Result<(), GroupError> {
        let scope = identity.scope();

        *phase = ReconcilePhase::Pushing;
        debug!("reconcile {}: {} {:?}", scope, phase, identity.first());
        self.gateway
            .edit(scope, &desired[0])
            .await
            .map_err(GroupError::remote(RemoteContext::Reconcile(*phase)))?;

        *phase = ReconcilePhase::Pruning;
        if let Some(previous) = previous {
            let (prune_scope, stale) = stale_members(previous, identity);
            if !stale.is_empty() {
                if prune_scope != scope {
                    warn!(
                        "group moved from {} to {}, removing {} rule(s) from the old scope",
                        prune_scope,
                        scope,
                        stale.len()
                    );
                }
                debug!("reconcile {}: {} {:?}", scope, phase, stale);
                self.delete_idempotent(prune_scope, &stale)
                    .await
                    .map_err(GroupError::remote(RemoteContext::Reconcile(*phase)))?;
            }
        }

        *phase = ReconcilePhase::Ordering;
        if desired.len() > 1 {
            debug!("reconcile {}: {} set {} rule(s)", scope, phase, desired.len() - 1);
            self.gateway
                .set(scope, &desired[1..])
                .await
                .map_err(GroupError::remote(RemoteContext::Reconcile(*phase)))?;
        }
        debug!(
            "reconcile {}: {} move {} {:?}",
            scope,
            phase,
            identity.directive(),
            identity.anchor()
        );
        self.gateway
            .move_group(
                scope,
                identity.directive(),
                identity.anchor(),
                identity.names(),
            )
            .await
            .map_err(GroupError::remote(RemoteContext::Reconcile(*phase)))?;

        Ok(())
    }

    /// Read back the group described by `identity`
    pub async fn rehydrate(
        &self,
        identity: &CompositeIdentity,
    ) -> Result<Rehydration<G::Entry>, GroupError> {
        let scope = identity.scope();
        let remote = self
            .gateway
            .get_list(scope)
            .await
            .map_err(GroupError::remote(RemoteContext::Rehydrate))?;

        let Some(first_idx) = remote.iter().position(|n| n == identity.first()) else {
            warn!(
                "first rule {:?} of group in {} is missing, group must be recreated",
                identity.first(),
                scope
            );
            return Ok(Rehydration::Gone);
        };

        let anchor_idx = if identity.directive().is_relative() {
            match remote.iter().position(|n| n == identity.anchor()) {
                Some(idx) => Some(idx),
                None => {
                    return Err(GroupError::AnchorMissing {
                        directive: identity.directive(),
                        anchor: identity.anchor().to_string(),
                    });
                }
            }
        } else {
            None
        };

        let mut entries = Vec::with_capacity(identity.names().len());
        for (name, remote_name) in identity.names().iter().zip(&remote[first_idx..]) {
            if name != remote_name {
                break;
            }
            match self
                .gateway
                .get(scope, name)
                .await
                .map_err(GroupError::remote(RemoteContext::Rehydrate))?
            {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }

        let dropped: Vec<String> = identity.names()[entries.len()..].to_vec();
        if !dropped.is_empty() {
            warn!(
                "group in {} is no longer contiguous, {} rule(s) dropped out: {:?}",
                scope,
                dropped.len(),
                dropped
            );
        }

        let position_correct = position_is_correct(
            identity.directive(),
            first_idx,
            anchor_idx,
            identity.names().len(),
            remote.len(),
            dropped.is_empty(),
        );
        if !position_correct {
            warn!(
                "group in {} is not positioned {} {:?}",
                scope,
                identity.directive(),
                identity.anchor()
            );
        }

        Ok(Rehydration::Found(GroupReadout {
            entries,
            position_correct,
            dropped,
        }))
    }

    /// Delete every member of the group. Members already gone are ignored.
    pub async fn dissolve(&self, identity: &CompositeIdentity) -> Result<(), GroupError> {
        debug!(
            "dissolve {}: {} rule(s)",
            identity.scope(),
            identity.names().len()
        );
        self.delete_idempotent(identity.scope(), identity.names())
            .await
            .map_err(GroupError::remote(RemoteContext::Dissolve))
    }

    async fn delete_idempotent(&self, scope: &Scope, names: &[String]) -> Result<(), ProviderError> {
        match self.gateway.delete(scope, names).await {
            Err(err) if err.is_not_found() => {
                debug!("delete in {}: already gone ({})", scope, err);
                Ok(())
            }
            other => other,
        }
    }
}

/// Decode a persisted identity, mapping failures to `MalformedIdentity`
pub fn decode_identity(id: &str) -> Result<CompositeIdentity, GroupError> {
    CompositeIdentity::decode(id).map_err(GroupError::MalformedIdentity)
}

/// Names the previous identity owned that the new one does not, and the
/// scope they have to be removed from
fn stale_members<'p>(
    previous: &'p CompositeIdentity,
    next: &CompositeIdentity,
) -> (&'p Scope, Vec<String>) {
    let same_scope = previous.scope() == next.scope();
    let stale = previous
        .names()
        .iter()
        .filter(|n| !same_scope || !next.owns(n))
        .cloned()
        .collect();
    (previous.scope(), stale)
}

fn position_is_correct(
    directive: MovementDirective,
    first_idx: usize,
    anchor_idx: Option<usize>,
    group_len: usize,
    list_len: usize,
    contiguous: bool,
) -> bool {
    match directive {
        MovementDirective::Unspecified => true,
        MovementDirective::Top => first_idx == 0,
        MovementDirective::Bottom => first_idx + group_len == list_len,
        MovementDirective::Before => anchor_idx == Some(first_idx + group_len),
        MovementDirective::After => anchor_idx.is_some_and(|a| first_idx == a + 1),
        MovementDirective::TopOfGroup | MovementDirective::BottomOfGroup => contiguous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GatewayOp, MemoryDevice, MemoryGateway};
    use crate::rule::BgpExportRule;
    use crate::scope::{DeviceKind, Target};

    fn scope() -> Scope {
        Scope::new(Target::panorama("tmplA", ""), "vr1")
    }

    fn rules(names: &[&str]) -> Vec<BgpExportRule> {
        names.iter().map(|n| BgpExportRule::new(*n)).collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn identity(directive: MovementDirective, anchor: &str, members: &[&str]) -> CompositeIdentity {
        CompositeIdentity::new(scope(), directive, anchor, names(members)).unwrap()
    }

    fn gateway_with(remote: &[&str]) -> MemoryGateway {
        MemoryGateway::new(MemoryDevice::new(DeviceKind::Panorama).with_rules(&scope(), remote))
    }

    async fn remote_names(gateway: &MemoryGateway) -> Vec<String> {
        gateway.get_list(&scope()).await.unwrap()
    }

    #[tokio::test]
    async fn reconcile_places_group_after_anchor() {
        let gateway = gateway_with(&["first", "default", "last"]);
        let reconciler = GroupReconciler::new(&gateway);

        let id = reconciler
            .reconcile(
                &scope(),
                MovementDirective::After,
                "default",
                &rules(&["rule1", "rule2"]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            remote_names(&gateway).await,
            names(&["first", "default", "rule1", "rule2", "last"])
        );
        assert_eq!(id, identity(MovementDirective::After, "default", &["rule1", "rule2"]));
    }

    #[tokio::test]
    async fn reconcile_runs_steps_in_order() {
        let gateway = gateway_with(&["default"]);
        let reconciler = GroupReconciler::new(&gateway);
        let previous = identity(MovementDirective::Top, "", &["a", "old"]);

        reconciler
            .reconcile(
                &scope(),
                MovementDirective::Top,
                "",
                &rules(&["a", "b"]),
                Some(&previous),
            )
            .await
            .unwrap();

        assert_eq!(
            gateway.snapshot().journal(),
            &[
                GatewayOp::Edit,
                GatewayOp::Delete,
                GatewayOp::Set,
                GatewayOp::MoveGroup,
            ]
        );
    }

    #[tokio::test]
    async fn reconcile_prunes_members_no_longer_desired() {
        let gateway = gateway_with(&["default"]);
        let reconciler = GroupReconciler::new(&gateway);

        let first = reconciler
            .reconcile(
                &scope(),
                MovementDirective::Bottom,
                "",
                &rules(&["a", "b", "c"]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(remote_names(&gateway).await, names(&["default", "a", "b", "c"]));

        let second = reconciler
            .reconcile(
                &scope(),
                MovementDirective::Top,
                "",
                &rules(&["c", "a"]),
                Some(&first),
            )
            .await
            .unwrap();

        assert_eq!(remote_names(&gateway).await, names(&["c", "a", "default"]));
        assert_eq!(second.names(), &names(&["c", "a"])[..]);
    }

    #[tokio::test]
    async fn reconcile_prunes_old_scope_when_scope_changes() {
        let other = Scope::new(Target::panorama("tmplB", ""), "vr1");
        let gateway = gateway_with(&[]);
        let reconciler = GroupReconciler::new(&gateway);

        let first = reconciler
            .reconcile(&scope(), MovementDirective::Unspecified, "", &rules(&["a"]), None)
            .await
            .unwrap();
        reconciler
            .reconcile(&other, MovementDirective::Unspecified, "", &rules(&["a"]), Some(&first))
            .await
            .unwrap();

        assert!(remote_names(&gateway).await.is_empty());
        assert_eq!(gateway.get_list(&other).await.unwrap(), names(&["a"]));
    }

    #[tokio::test]
    async fn reconcile_is_reentrant() {
        let gateway = gateway_with(&["default"]);
        let reconciler = GroupReconciler::new(&gateway);
        let desired = rules(&["rule1", "rule2"]);

        for _ in 0..2 {
            reconciler
                .reconcile(&scope(), MovementDirective::Before, "default", &desired, None)
                .await
                .unwrap();
        }
        assert_eq!(
            remote_names(&gateway).await,
            names(&["rule1", "rule2", "default"])
        );
    }

    #[tokio::test]
    async fn reconcile_rejects_invalid_plan_before_remote_calls() {
        let gateway = gateway_with(&["default"]);
        let reconciler = GroupReconciler::new(&gateway);

        let cases: Vec<(MovementDirective, &str, Vec<BgpExportRule>)> = vec![
            (MovementDirective::Before, "", rules(&["a"])),
            (MovementDirective::Top, "default", rules(&["a"])),
            (MovementDirective::Top, "", rules(&[])),
            (MovementDirective::Top, "", rules(&["a", "a"])),
            (MovementDirective::After, "a", rules(&["a", "b"])),
        ];

        for (directive, anchor, desired) in cases {
            let result = reconciler
                .reconcile(&scope(), directive, anchor, &desired, None)
                .await;
            assert!(
                matches!(result, Err(GroupError::InvalidPlan(_))),
                "{:?} {:?} should be rejected",
                directive,
                anchor
            );
        }
        assert!(gateway.snapshot().journal().is_empty());
    }

    #[tokio::test]
    async fn reconcile_failure_reports_phase() {
        let gateway = gateway_with(&["default"]);
        gateway.fail_on(GatewayOp::MoveGroup);
        let reconciler = GroupReconciler::new(&gateway);

        let err = reconciler
            .reconcile(&scope(), MovementDirective::Top, "", &rules(&["a", "b"]), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GroupError::Remote {
                context: RemoteContext::Reconcile(ReconcilePhase::Ordering),
                ..
            }
        ));

        // Partial progress stays, a retry finishes the job
        gateway.recover();
        reconciler
            .reconcile(&scope(), MovementDirective::Top, "", &rules(&["a", "b"]), None)
            .await
            .unwrap();
        assert_eq!(remote_names(&gateway).await, names(&["a", "b", "default"]));
    }

    #[tokio::test]
    async fn reconcile_fails_when_anchor_absent() {
        let gateway = gateway_with(&[]);
        let reconciler = GroupReconciler::new(&gateway);

        let err = reconciler
            .reconcile(&scope(), MovementDirective::After, "default", &rules(&["a"]), None)
            .await
            .unwrap_err();
        match err {
            GroupError::Remote { context, source } => {
                assert_eq!(context, RemoteContext::Reconcile(ReconcilePhase::Ordering));
                assert!(source.is_not_found());
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rehydrate_stops_at_first_mismatch() {
        let gateway = gateway_with(&["a", "b", "x", "c"]);
        let reconciler = GroupReconciler::new(&gateway);

        let found = reconciler
            .rehydrate(&identity(MovementDirective::Unspecified, "", &["a", "b", "c"]))
            .await
            .unwrap();
        let readout = found.found().unwrap();

        assert_eq!(readout.names(), vec!["a", "b"]);
        assert_eq!(readout.dropped, names(&["c"]));
        assert!(!readout.is_intact());
    }

    #[tokio::test]
    async fn rehydrate_position_after_anchor() {
        let id = identity(MovementDirective::After, "z", &["a", "b"]);

        let gateway = gateway_with(&["z", "a", "b"]);
        let readout = GroupReconciler::new(&gateway).rehydrate(&id).await.unwrap();
        assert!(readout.found().unwrap().position_correct);

        let gateway = gateway_with(&["a", "b", "z"]);
        let readout = GroupReconciler::new(&gateway).rehydrate(&id).await.unwrap();
        let readout = readout.found().unwrap();
        assert!(!readout.position_correct);
        assert_eq!(readout.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn rehydrate_position_for_absolute_directives() {
        let gateway = gateway_with(&["a", "b", "x"]);
        let reconciler = GroupReconciler::new(&gateway);

        let top = reconciler
            .rehydrate(&identity(MovementDirective::Top, "", &["a", "b"]))
            .await
            .unwrap();
        assert!(top.found().unwrap().position_correct);

        let bottom = reconciler
            .rehydrate(&identity(MovementDirective::Bottom, "", &["a", "b"]))
            .await
            .unwrap();
        assert!(!bottom.found().unwrap().position_correct);

        let before = reconciler
            .rehydrate(&identity(MovementDirective::Before, "x", &["a", "b"]))
            .await
            .unwrap();
        assert!(before.found().unwrap().position_correct);
    }

    #[tokio::test]
    async fn rehydrate_position_at_bottom() {
        let id = identity(MovementDirective::Bottom, "", &["a", "b"]);

        let gateway = gateway_with(&["x", "a", "b"]);
        let readout = GroupReconciler::new(&gateway).rehydrate(&id).await.unwrap();
        let readout = readout.found().unwrap();
        assert!(readout.position_correct);
        assert!(readout.is_intact());

        let gateway = gateway_with(&["a", "b", "x", "y"]);
        let readout = GroupReconciler::new(&gateway).rehydrate(&id).await.unwrap();
        assert!(!readout.found().unwrap().position_correct);
    }

    #[tokio::test]
    async fn rehydrate_group_relative_directives_need_contiguity() {
        for directive in [MovementDirective::TopOfGroup, MovementDirective::BottomOfGroup] {
            let id = identity(directive, "", &["a", "b", "c"]);

            let gateway = gateway_with(&["x", "a", "b", "c", "y"]);
            let readout = GroupReconciler::new(&gateway).rehydrate(&id).await.unwrap();
            let readout = readout.found().unwrap();
            assert!(readout.position_correct, "{:?} contiguous", directive);
            assert!(readout.dropped.is_empty());

            let gateway = gateway_with(&["a", "b", "x", "c"]);
            let readout = GroupReconciler::new(&gateway).rehydrate(&id).await.unwrap();
            let readout = readout.found().unwrap();
            assert!(!readout.position_correct, "{:?} with a dropped member", directive);
            assert_eq!(readout.dropped, names(&["c"]));
        }
    }

    #[tokio::test]
    async fn rehydrate_vanished_group() {
        let gateway = gateway_with(&["b", "c"]);
        let reconciler = GroupReconciler::new(&gateway);

        let result = reconciler
            .rehydrate(&identity(MovementDirective::Top, "", &["a", "b"]))
            .await
            .unwrap();
        assert!(result.is_gone());
    }

    #[tokio::test]
    async fn rehydrate_missing_anchor_is_drift() {
        let gateway = gateway_with(&["a", "b"]);
        let reconciler = GroupReconciler::new(&gateway);

        let err = reconciler
            .rehydrate(&identity(MovementDirective::After, "default", &["a", "b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::AnchorMissing { .. }));
        assert_eq!(
            err.to_string(),
            "Can't position group after \"default\": rule is not present"
        );
    }

    #[tokio::test]
    async fn rehydrate_returns_full_entries() {
        let gateway = gateway_with(&[]);
        let reconciler = GroupReconciler::new(&gateway);
        let desired = vec![
            BgpExportRule::new("a").with_prefix("10.0.0.0/8", true),
            BgpExportRule::new("b").with_used_by("peers"),
        ];

        let id = reconciler
            .reconcile(&scope(), MovementDirective::Top, "", &desired, None)
            .await
            .unwrap();
        let readout = reconciler.rehydrate(&id).await.unwrap();
        assert_eq!(readout.found().unwrap().entries, desired);
    }

    #[tokio::test]
    async fn dissolve_twice_is_fine() {
        let gateway = gateway_with(&["default", "a", "b"]);
        let reconciler = GroupReconciler::new(&gateway);
        let id = identity(MovementDirective::After, "default", &["a", "b"]);

        reconciler.dissolve(&id).await.unwrap();
        reconciler.dissolve(&id).await.unwrap();
        assert_eq!(remote_names(&gateway).await, names(&["default"]));
    }

    #[test]
    fn decode_identity_maps_errors() {
        assert!(matches!(
            decode_identity("garbage"),
            Err(GroupError::MalformedIdentity(_))
        ));
        let id = identity(MovementDirective::Top, "", &["a"]);
        assert_eq!(decode_identity(&id.encode()).unwrap(), id);
    }
}
