use crate::frame::Frame;
use crate::stack::OperandStack;

/// Handle of the fiber execution starts on. A spawned fiber whose entry
/// frame returns switches back here.
pub const MAIN_FIBER: u64 = 0;

/// Saved execution state of a fiber that is not currently running.
///
/// The interpreter keeps one operand stack and instruction pointer per
/// fiber; a context switch swaps these fields wholesale with the running
/// set.
pub(crate) struct ParkedFiber {
    pub id: u64,
    pub stack: OperandStack,
    pub frames: Vec<Frame>,
    pub ip: usize,
}
