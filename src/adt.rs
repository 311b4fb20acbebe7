/// Trait for a concurrent set.
pub trait ConcurrentSet<T> {
    /// Returns `true` iff the set contains the value.
    fn contains(&self, value: &T) -> bool;

    /// Adds the value to the set. Returns whether the value was newly inserted.
    fn insert(&self, value: T) -> bool;

    /// Removes the value from the set. Returns whether the value was present in the set.
    fn remove(&self, value: &T) -> bool;

    /// Returns `true` iff the set currently contains no elements.
    fn is_empty(&self) -> bool;
}
