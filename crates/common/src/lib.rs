// vigil-common: shared types and wire protocol for the Vigil workspace

pub mod protocol;
pub mod types;
