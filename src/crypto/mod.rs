/// Hashing, signing and field-sealing primitives for the anchoring pipeline.
pub mod hash;
pub mod identity;
pub mod seal;
