pub mod paxos;

pub use paxos::error;
