//! Non-cryptographic hash collections for interpreter-internal tables,
//! where keys are never attacker-controlled.

pub type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

pub type FastHashSet<K> = rustc_hash::FxHashSet<K>;
