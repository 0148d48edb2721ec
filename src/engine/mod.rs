//! Asynchronous engines of one unit
//!
//! Each engine is a thread draining a FIFO command queue, so commands
//! retire in the order they were issued. The queue handle is the only way
//! to reach an engine; an engine stops once every handle is dropped.

mod copy;
mod mma;
mod store;

pub use copy::{CopyCommand, CopyEngine, CopyQueue, OperandSlice, SliceDestination, StagedOperand};
pub use mma::{MmaCommand, MmaEngine, MmaQueue, MmaShape, PairMember};
pub use store::{StoreCommand, StoreEngine, StoreQueue, StoreTile};

use crossbeam_channel::Sender;

/// Send a command to an engine. A closed queue means the engine thread died
/// with its unit, which leaves the launch without a result; the failure is
/// propagated as a crash of the caller.
fn submit<T>(tx: &Sender<T>, engine: &str, command: T) {
    if tx.send(command).is_err() {
        log::error!("{} engine is no longer accepting commands", engine);
        panic!("{} engine stopped", engine);
    }
}
