//! Codec implementations

pub mod h265;
