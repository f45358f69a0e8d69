//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Every balance-holding row in the ledger is an entity: it keeps its identity while its
/// balances move, and stores lock it by that identity.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + Ord + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
