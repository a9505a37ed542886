use bytecode::{BlockId, DefId};

/// What a frame is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameUnit {
    Def(DefId),
    Block(BlockId),
}

/// Per-call region of the operand stack.
///
/// A def frame's region starts with `frame_size` bytes of locals at `base`;
/// the pushed arguments occupy the lowest slots. A block frame owns no
/// locals of its own: `base` is the stack pointer at entry and `locals`
/// points into the lexical home frame, so block bodies address the home
/// def's variables directly.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub unit: FrameUnit,
    /// Byte offset of this frame's region; `leave` copies the result here.
    pub base: usize,
    /// Byte offset of the locals this frame addresses.
    pub locals: usize,
    /// Index of the lexical home def frame (self for def frames).
    pub home: usize,
    /// Caller instruction pointer to restore on leave.
    pub return_ip: usize,
    /// Block bound by `call_with_block`: the block id and the frame index
    /// it lexically belongs to.
    pub block: Option<(BlockId, usize)>,
}

impl Frame {
    pub fn is_block(&self) -> bool {
        matches!(self.unit, FrameUnit::Block(_))
    }
}
