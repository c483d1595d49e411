use std::fmt::Debug;

/// A value the engine can cache, predict and reconcile.
///
/// Implementations define a partial [`Payload::Patch`] type and the shallow
/// merge rules between it and the full value. Merges must be deterministic:
/// the same inputs always produce the same output, because conflict
/// resolution replays patches on top of remote snapshots.
pub trait Payload: Clone + PartialEq + Debug + Send + Sync + 'static {
    /// A partial value. Fields present in the patch overwrite the base,
    /// fields absent from it are retained.
    type Patch: Clone + Debug + Send + Sync + 'static;

    /// Returns `self` with every field set in `patch` overwritten.
    fn apply_patch(&self, patch: &Self::Patch) -> Self;

    /// Folds `later` on top of `earlier`. Fields set in both take `later`'s value.
    ///
    /// Reapplying the fold over a value that already has `earlier` applied
    /// must give the same result as applying the fold to the original:
    /// `base.apply_patch(e).apply_patch(&merge(e, l)) == base.apply_patch(&merge(e, l))`.
    fn merge_patches(earlier: &Self::Patch, later: &Self::Patch) -> Self::Patch;
}
