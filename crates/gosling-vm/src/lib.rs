mod frame;
mod vm;

pub use frame::Frame;
pub use vm::{RuntimeError, VM, GLOBALS_SIZE, MAX_FRAMES, STACK_SIZE};
