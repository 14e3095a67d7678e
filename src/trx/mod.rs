//! Transaction FSM (§4.4, C4): master/slave handles and the state machine
//! that governs replication, certification, apply, commit, abort and replay.

pub mod handle;
pub mod state;

pub use handle::{TrxHandleLock, TrxHandleMaster, TrxHandleShared, TrxHandleSlave};
pub use state::{is_legal_transition, TrxState};
