use std::rc::Rc;

use gosling_bytecode::Instructions;
use gosling_object::{Closure, CompiledFunction};

/// A call frame: the closure being executed, its instruction pointer, and
/// where its locals begin on the value stack.
pub struct Frame {
    pub closure: Rc<Closure>,
    /// Starts at -1 so the dispatch loop can pre-increment.
    pub ip: i64,
    pub base_pointer: usize,
    pub is_loop: bool,
    pub is_main: bool,
}

impl Frame {
    pub fn new(closure: Rc<Closure>, base_pointer: usize) -> Self {
        Self {
            closure,
            ip: -1,
            base_pointer,
            is_loop: false,
            is_main: false,
        }
    }

    /// A frame for a loop sub-stream; `Continue`/`Break` markers are only
    /// written inside loop frames.
    pub fn loop_frame(closure: Rc<Closure>, base_pointer: usize) -> Self {
        Self {
            is_loop: true,
            ..Self::new(closure, base_pointer)
        }
    }

    /// The compiled function this frame executes. Loop drivers fabricate
    /// compiled functions for their sub-streams, so every live frame wraps
    /// one.
    pub fn function(&self) -> &Rc<CompiledFunction> {
        self.closure
            .function()
            .expect("frame does not wrap a compiled function")
    }

    pub fn instructions(&self) -> &Instructions {
        &self.function().instructions
    }
}
