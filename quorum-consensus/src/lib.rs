pub mod raft;

pub use raft::*;
