//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Entities live inside an aggregate (an allocation inside its grouped order,
/// a line inside its material request) and are only mutated through the
/// owning aggregate's events.
pub trait Entity {
    /// Identifier, unique within the owning aggregate at least.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
