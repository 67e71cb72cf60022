//! Shared hashing aliases used throughout the crate.

/// A `HashSet` keyed on the crate's default, non-cryptographic hasher.
pub(crate) type HashSet<T> = hashbrown::HashSet<T, rustc_hash::FxBuildHasher>;

/// Alias kept around for call sites that want to name the hasher directly
/// (e.g. when constructing a [`petgraph::graphmap::GraphMap`]).
pub(crate) use rustc_hash::FxBuildHasher as RandomState;
