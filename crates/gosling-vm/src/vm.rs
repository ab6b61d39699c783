use std::rc::Rc;

use gosling_bytecode::{read_u16, read_u8, OpCode};
use gosling_compiler::Bytecode;
use gosling_object::{
    narrow_float, narrow_int, new_error, Callable, Closure, CompiledFunction, FreeList, FreeRef,
    HashObj, HashPair, TypeTag, Value, BUILTINS,
};
use thiserror::Error;

use crate::frame::Frame;

pub const STACK_SIZE: usize = 2048;
pub const GLOBALS_SIZE: usize = 65536;
pub const MAX_FRAMES: usize = 1024;

/// Runtime errors. `Run` returns the first one synchronously; there is no
/// unwinding beyond it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("calling non-function and non-built-in")]
    NotCallable,
    #[error("execute function wrong number of arguments: want={want}, got={got}")]
    WrongArity { want: usize, got: usize },
    #[error("{0}")]
    Message(String),
}

fn runtime_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Message(message.into())
}

/// What a loop sub-stream run ended with.
enum LoopSignal {
    /// The stream ran to the end of its instructions.
    Finished,
    /// A `return` popped the stream's frame; the wrapper is on top of the
    /// stack and must be propagated out of the enclosing function.
    Returned,
}

/// The gosling virtual machine: a value stack, a globals vector, and a
/// frame stack, all of fixed capacity.
pub struct VM {
    constants: Vec<Value>,
    stack: Vec<Value>,
    /// Points at the first empty slot.
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
}

impl VM {
    pub fn new(bytecode: Bytecode) -> Self {
        let main_fn = Rc::new(CompiledFunction {
            name: String::new(),
            instructions: bytecode.instructions,
            num_locals: 0,
            num_params: 0,
            num_results: 0,
            free_count: 0,
        });
        let main_closure = Rc::new(Closure::new(Callable::Function(main_fn), Vec::new()));
        let mut main_frame = Frame::new(main_closure, bytecode.symbol_table.num_definitions);
        main_frame.is_main = true;

        // Named top-level functions occupy the first global slots, in the
        // order their constants were finalized.
        let mut globals = vec![Value::Null; GLOBALS_SIZE];
        let mut next = 0;
        for constant in &bytecode.constants {
            if let Value::CompiledFunction(func) = constant {
                if !func.name.is_empty() {
                    globals[next] = Value::Closure(Rc::new(Closure::new(
                        Callable::Function(func.clone()),
                        Vec::new(),
                    )));
                    next += 1;
                }
            }
        }

        let mut frames = Vec::with_capacity(MAX_FRAMES);
        frames.push(main_frame);

        Self {
            constants: bytecode.constants,
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames,
        }
    }

    /// The value a final `Pop` left behind: the program's result.
    pub fn last_popped(&self) -> &Value {
        &self.stack[self.sp]
    }

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        self.run_frames(0)
    }

    // ---
    // Stack primitives
    // ---

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    /// Pop the top of stack. The slot keeps its value so `last_popped`
    /// can observe it.
    fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.sp == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("no current frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no current frame")
    }

    // ---
    // Dispatch
    // ---

    /// Run until the current frame's stream is exhausted or the frame
    /// stack drops to `floor`. Loop drivers run sub-streams with the
    /// current depth as floor, so a `return` that pops frames hands
    /// control back to them immediately.
    fn run_frames(&mut self, floor: usize) -> Result<(), RuntimeError> {
        while self.frames.len() > floor {
            let func = self.current_frame().function().clone();
            let len = func.instructions.len() as i64;
            if self.current_frame().ip >= len - 1 {
                break;
            }
            self.current_frame_mut().ip += 1;
            let ip = self.current_frame().ip as usize;
            let ins = &func.instructions;
            let op = OpCode::try_from(ins[ip])
                .map_err(|byte| runtime_error(format!("opcode {} undefined", byte)))?;

            match op {
                OpCode::Pop => self.exec_pop(),
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Null => self.push(Value::Null)?,
                OpCode::Const => {
                    let idx = read_u16(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let value = self.constants[idx].clone();
                    self.push(value)?;
                }
                OpCode::Closure => {
                    let const_idx = read_u16(&ins[ip + 1..]) as usize;
                    let free_count = read_u8(&ins[ip + 3..]) as usize;
                    self.current_frame_mut().ip += 3;
                    self.push_closure(const_idx, free_count)?;
                }
                OpCode::CurrentClosure => {
                    let closure = self.current_frame().closure.clone();
                    self.push(Value::Closure(closure))?;
                }
                OpCode::GetBuiltin => {
                    let idx = read_u8(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 1;
                    self.push(Value::Builtin(idx))?;
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Quo
                | OpCode::Rem
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor
                | OpCode::Shl
                | OpCode::Shr
                | OpCode::AndNot
                | OpCode::Eql
                | OpCode::Neq
                | OpCode::Lss
                | OpCode::Leq
                | OpCode::Gtr
                | OpCode::Geq
                | OpCode::LAnd
                | OpCode::LOr => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let result = binary_op(op, left, right);
                    if let Value::Error(message) = &result {
                        return Err(runtime_error(message.to_string()));
                    }
                    self.push(result)?;
                }
                OpCode::PrefixSub | OpCode::PrefixAdd | OpCode::Not | OpCode::Inc | OpCode::Dec => {
                    let operand = self.pop()?;
                    let result = unary_op(op, operand);
                    if let Value::Error(message) = &result {
                        return Err(runtime_error(message.to_string()));
                    }
                    self.push(result)?;
                }
                OpCode::JumpNotTruthy => {
                    let target = read_u16(&ins[ip + 1..]) as i64;
                    self.current_frame_mut().ip += 2;
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = target - 1;
                    }
                }
                OpCode::Jump => {
                    let target = read_u16(&ins[ip + 1..]) as i64;
                    self.current_frame_mut().ip = target - 1;
                }
                OpCode::GetGlobal => {
                    let idx = read_u16(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let value = self.globals[idx].clone();
                    self.push(value)?;
                }
                OpCode::SetGlobal => {
                    let idx = read_u16(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let value = self.extract_set_value()?;
                    self.globals[idx] = value;
                }
                OpCode::GetLocal => {
                    let idx = read_u16(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let base = self.current_frame().base_pointer;
                    let value = self.stack[base + idx].clone();
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let idx = read_u16(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let value = self.extract_set_value()?;
                    let base = self.current_frame().base_pointer;
                    self.stack[base + idx] = value;
                }
                OpCode::GetFree => {
                    let idx = read_u8(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 1;
                    let value = self.current_frame().closure.free.borrow()[idx].clone();
                    self.push(value)?;
                }
                OpCode::SetFree => {
                    let idx = read_u8(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 1;
                    let value = self.extract_set_value()?;
                    self.current_frame().closure.free.borrow_mut()[idx] = value;
                }
                OpCode::SetNil => {
                    self.extract_set_value()?;
                }
                OpCode::Array => {
                    let count = read_u16(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let array = self.build_array(self.sp - count, self.sp);
                    self.sp -= count;
                    self.push(array)?;
                }
                OpCode::Hash => {
                    let count = read_u16(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let hash = self.build_hash(self.sp - count, self.sp)?;
                    self.sp -= count;
                    self.push(hash)?;
                }
                OpCode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.exec_index(left, index)?;
                }
                OpCode::SetGlobalIndex | OpCode::SetLocalIndex => {
                    self.current_frame_mut().ip += 2;
                    self.exec_set_index()?;
                }
                OpCode::Call => {
                    let arg_count = read_u8(&ins[ip + 1..]) as usize;
                    self.current_frame_mut().ip += 1;
                    self.exec_call(arg_count)?;
                }
                OpCode::ReturnValue => {
                    let count = read_u8(&ins[ip + 1..]) as usize;
                    self.exec_return_value(count)?;
                }
                OpCode::Return => {
                    self.exec_return()?;
                }
                OpCode::ForLoop => {
                    self.exec_for_loop()?;
                }
                OpCode::RangeLoop => {
                    self.exec_range_loop()?;
                }
                OpCode::Continue | OpCode::Break => {
                    self.exec_continue_break(op);
                }
                other => {
                    return Err(runtime_error(format!(
                        "opcode {} not executable",
                        other.name()
                    )));
                }
            }
        }
        Ok(())
    }

    // ---
    // Opcode implementations
    // ---

    /// `Pop` unwraps return and map-exist wrappers so the popped slot —
    /// what `last_popped` reads — holds the user-visible value.
    fn exec_pop(&mut self) {
        if self.sp == 0 {
            return;
        }
        self.sp -= 1;
        let popped = std::mem::replace(&mut self.stack[self.sp], Value::Null);
        self.stack[self.sp] = match popped {
            Value::SingleReturn { value, .. } => *value,
            Value::MapExist { value, .. } => *value,
            other => other,
        };
    }

    /// The extract-data rule for assignment-style opcodes: peel one value
    /// from the top of stack, leaving multi-value wrappers in place until
    /// they are spent.
    fn extract_set_value(&mut self) -> Result<Value, RuntimeError> {
        if self.sp == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        let pos = self.sp - 1;
        let current = self.stack[pos].clone();
        match current {
            Value::MapExist {
                value,
                exists,
                skip_value: false,
            } => {
                self.stack[pos] = Value::MapExist {
                    value: Box::new(Value::Null),
                    exists,
                    skip_value: true,
                };
                Ok(*value)
            }
            Value::MapExist {
                exists,
                skip_value: true,
                ..
            } => {
                self.sp -= 1;
                self.stack[pos] = Value::Bool(exists);
                Ok(Value::Bool(exists))
            }
            Value::MultiReturn {
                mut values,
                from_call,
            } => {
                if values.is_empty() {
                    self.sp -= 1;
                    return Ok(Value::Null);
                }
                let head = values.remove(0);
                if values.is_empty() {
                    self.sp -= 1;
                    self.stack[pos] = head.clone();
                } else {
                    self.stack[pos] = Value::MultiReturn { values, from_call };
                }
                Ok(head)
            }
            Value::SingleReturn { value, .. } => {
                self.sp -= 1;
                self.stack[pos] = (*value).clone();
                Ok(*value)
            }
            other => {
                self.sp -= 1;
                Ok(other)
            }
        }
    }

    fn push_closure(&mut self, const_idx: usize, free_count: usize) -> Result<(), RuntimeError> {
        let mut free = Vec::with_capacity(free_count);
        for i in 0..free_count {
            free.push(self.stack[self.sp - free_count + i].clone());
        }
        self.sp -= free_count;

        let callable = match &self.constants[const_idx] {
            Value::CompiledFunction(func) => Callable::Function(func.clone()),
            Value::ForLoop(template) => Callable::For(template.clone()),
            Value::RangeLoop(template) => Callable::Range(template.clone()),
            other => {
                return Err(runtime_error(format!("not a function: {}", other)));
            }
        };
        self.push(Value::Closure(Rc::new(Closure::new(callable, free))))
    }

    fn build_array(&mut self, start: usize, end: usize) -> Value {
        let elements: Vec<Value> = self.stack[start..end].to_vec();
        let elem_type = elements
            .first()
            .map(|v| v.type_tag())
            .unwrap_or(TypeTag::Null);
        Value::Array(Rc::new(std::cell::RefCell::new(gosling_object::ArrayObj {
            elements,
            elem_type,
            fixed: false,
        })))
    }

    fn build_hash(&mut self, start: usize, end: usize) -> Result<Value, RuntimeError> {
        let mut hash = HashObj::default();
        let mut i = start;
        while i < end {
            let key = self.stack[i].clone();
            let value = self.stack[i + 1].clone();
            let Some(hash_key) = key.hash_key() else {
                return Err(runtime_error(format!(
                    "unusable as hash key: {}",
                    key.type_tag()
                )));
            };
            if hash.key_type.is_none() {
                hash.key_type = Some(key.type_tag());
                hash.value_type = Some(value.type_tag());
            }
            hash.pairs.insert(hash_key, HashPair { key, value });
            i += 2;
        }
        Ok(Value::Hash(Rc::new(std::cell::RefCell::new(hash))))
    }

    fn exec_index(&mut self, left: Value, index: Value) -> Result<(), RuntimeError> {
        match left {
            Value::Array(arr) => {
                let Some(idx) = index.widen() else {
                    return Err(runtime_error(format!(
                        "index operator not supported: {}",
                        index.type_tag()
                    )));
                };
                let arr = arr.borrow();
                let len = arr.elements.len();
                if idx < 0 {
                    return Err(runtime_error(format!("index out of range [{}]", idx)));
                }
                if idx as usize >= len {
                    return Err(runtime_error(format!(
                        "index out of range [{}] with length {}",
                        idx, len
                    )));
                }
                let value = arr.elements[idx as usize].clone();
                drop(arr);
                self.push(value)
            }
            Value::Hash(hash) => {
                let Some(key) = index.hash_key() else {
                    return Err(runtime_error(format!(
                        "unusable as hash key: {}",
                        index.type_tag()
                    )));
                };
                let hash = hash.borrow();
                let (value, exists) = match hash.pairs.get(&key) {
                    Some(pair) => (pair.value.clone(), true),
                    None => {
                        let zero = hash
                            .value_type
                            .map(gosling_object::default_of_tag)
                            .unwrap_or(Value::Null);
                        (zero, false)
                    }
                };
                drop(hash);
                self.push(Value::MapExist {
                    value: Box::new(value),
                    exists,
                    skip_value: false,
                })
            }
            Value::Str(s) => {
                let Some(idx) = index.widen() else {
                    return Err(runtime_error(format!(
                        "index operator not supported: {}",
                        index.type_tag()
                    )));
                };
                let bytes = s.as_bytes();
                if idx < 0 {
                    return Err(runtime_error(format!("index out of range [{}]", idx)));
                }
                if idx as usize >= bytes.len() {
                    return Err(runtime_error(format!(
                        "index out of range [{}] with length {}",
                        idx,
                        bytes.len()
                    )));
                }
                self.push(Value::Uint8(bytes[idx as usize]))
            }
            Value::MapExist { value, .. } => self.exec_index(*value, index),
            Value::SingleReturn { value, .. } => self.exec_index(*value, index),
            other => Err(runtime_error(format!(
                "index operator not supported: {}",
                other.type_tag()
            ))),
        }
    }

    /// Indexed store. Stack, top down: index, container, value. The
    /// container is a reference value, so mutating it through the popped
    /// alias is already visible in its global or local home slot.
    fn exec_set_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop()?;
        let container = self.pop()?;
        let value = self.extract_set_value()?;
        match container {
            Value::Array(arr) => {
                let Some(idx) = index.widen() else {
                    return Err(runtime_error(format!(
                        "index operator not supported: {}",
                        index.type_tag()
                    )));
                };
                let mut arr = arr.borrow_mut();
                let len = arr.elements.len();
                if idx < 0 || idx as usize >= len {
                    return Err(runtime_error(format!(
                        "index out of range [{}] with length {}",
                        idx, len
                    )));
                }
                arr.elements[idx as usize] = value;
                Ok(())
            }
            Value::Hash(hash) => {
                let Some(key) = index.hash_key() else {
                    return Err(runtime_error(format!(
                        "unusable as hash key: {}",
                        index.type_tag()
                    )));
                };
                let mut hash = hash.borrow_mut();
                if hash.key_type.is_none() {
                    hash.key_type = Some(index.type_tag());
                    hash.value_type = Some(value.type_tag());
                }
                hash.pairs.insert(key, HashPair { key: index, value });
                Ok(())
            }
            other => Err(runtime_error(format!(
                "index operator not supported: {}",
                other.type_tag()
            ))),
        }
    }

    fn exec_call(&mut self, arg_count: usize) -> Result<(), RuntimeError> {
        let callee = self.stack[self.sp - 1 - arg_count].clone();
        match callee {
            Value::Closure(closure) => match &closure.callable {
                Callable::Function(_) => self.call_closure(closure.clone(), arg_count),
                _ => Err(RuntimeError::NotCallable),
            },
            Value::Builtin(idx) => self.call_builtin(idx, arg_count),
            Value::SingleReturn { value, .. } => {
                // `f()()`: the inner call's wrapper still holds the callee.
                self.stack[self.sp - 1 - arg_count] = *value;
                self.exec_call(arg_count)
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, arg_count: usize) -> Result<(), RuntimeError> {
        let func = closure.function().expect("callable closure").clone();
        if arg_count != func.num_params + func.num_results {
            return Err(RuntimeError::WrongArity {
                want: func.num_params,
                got: arg_count,
            });
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(runtime_error("exceeded maximum call depth"));
        }

        let base_pointer = self.sp - arg_count;
        self.frames.push(Frame::new(closure, base_pointer));
        self.sp = base_pointer + func.num_locals;
        Ok(())
    }

    fn call_builtin(&mut self, idx: usize, arg_count: usize) -> Result<(), RuntimeError> {
        let args: Vec<Value> = self.stack[self.sp - arg_count..self.sp].to_vec();
        let result = (BUILTINS[idx].func)(&args);
        self.sp = self.sp - arg_count - 1;
        if let Some(value) = result {
            self.push(value)?;
        }
        Ok(())
    }

    fn exec_return_value(&mut self, count: usize) -> Result<(), RuntimeError> {
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            results.push(self.pop()?);
        }
        results.reverse();
        let wrapped = wrap_results(results, false);

        if self.current_frame().is_main {
            self.finish_main(wrapped);
        } else {
            let base_pointer = self.current_frame().base_pointer;
            self.stack[base_pointer - 1] = wrapped;
            self.sp = base_pointer;
            self.frames.pop();
        }
        Ok(())
    }

    fn exec_return(&mut self) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().expect("return without a frame");
        let func = frame.function().clone();

        if func.num_results == 0 {
            self.sp = frame.base_pointer.saturating_sub(1);
            return Ok(());
        }

        // Named results live right after the parameters.
        let mut results = Vec::with_capacity(func.num_results);
        for i in 0..func.num_results {
            results.push(self.stack[frame.base_pointer + func.num_params + i].clone());
        }
        let wrapped = wrap_results(results, true);
        self.stack[frame.base_pointer - 1] = wrapped;
        self.sp = frame.base_pointer;
        Ok(())
    }

    /// A `return` reached the main frame: the result becomes the program
    /// value and execution halts.
    fn finish_main(&mut self, wrapped: Value) {
        let unwrapped = match wrapped {
            Value::SingleReturn { value, .. } => *value,
            other => other,
        };
        self.stack[0] = unwrapped;
        self.sp = 0;
        let len = self.current_frame().instructions().len() as i64;
        self.current_frame_mut().ip = len;
    }

    fn exec_continue_break(&mut self, op: OpCode) {
        let (num_locals, base_pointer, len, is_loop) = {
            let frame = self.current_frame();
            (
                frame.function().num_locals,
                frame.base_pointer,
                frame.instructions().len() as i64,
                frame.is_loop,
            )
        };
        if is_loop {
            self.stack[base_pointer + num_locals] = if op == OpCode::Continue {
                Value::Continue
            } else {
                Value::Break
            };
        }
        self.sp = base_pointer + num_locals + 1;
        self.current_frame_mut().ip = len;
    }

    // ---
    // Loop drivers
    // ---

    /// Run one loop sub-stream to completion in its own frame.
    fn run_loop_stream(
        &mut self,
        instructions: &gosling_bytecode::Instructions,
        free: &FreeList,
        free_count: usize,
        base: usize,
        num_locals: usize,
    ) -> Result<LoopSignal, RuntimeError> {
        let func = Rc::new(CompiledFunction {
            name: String::new(),
            instructions: instructions.clone(),
            num_locals,
            num_params: 0,
            num_results: 0,
            free_count,
        });
        let closure = Rc::new(Closure {
            callable: Callable::Function(func),
            free: free.clone(),
        });

        let floor = self.frames.len();
        self.sp = base + num_locals;
        self.frames.push(Frame::loop_frame(closure, base));
        self.run_frames(floor)?;
        if self.frames.len() == floor {
            Ok(LoopSignal::Returned)
        } else {
            self.frames.pop();
            Ok(LoopSignal::Finished)
        }
    }

    /// After a loop body, decide how the iteration ends.
    fn loop_body_outcome(&mut self) -> LoopBodyOutcome {
        if self.sp == 0 {
            return LoopBodyOutcome::Next;
        }
        match &self.stack[self.sp - 1] {
            Value::Break => {
                self.sp -= 1;
                LoopBodyOutcome::Break
            }
            Value::Continue => {
                self.sp -= 1;
                LoopBodyOutcome::Next
            }
            _ => LoopBodyOutcome::Next,
        }
    }

    fn exec_for_loop(&mut self) -> Result<(), RuntimeError> {
        let pos = self.sp - 1;
        let Value::Closure(closure) = self.stack[pos].clone() else {
            return Err(runtime_error("for loop expects a closure"));
        };
        let Callable::For(template) = closure.callable.clone() else {
            return Err(runtime_error("for loop expects a loop closure"));
        };
        let free = closure.free.clone();
        let free_count = template.free_count();
        let num_locals = template.num_locals;
        let base = self.sp;

        if !template.init.is_empty() {
            if let LoopSignal::Returned =
                self.run_loop_stream(&template.init, &free, free_count, base, num_locals)?
            {
                return self.propagate_loop_return(base);
            }
        }

        loop {
            if let LoopSignal::Returned =
                self.run_loop_stream(&template.cond, &free, free_count, base, num_locals)?
            {
                return self.propagate_loop_return(base);
            }
            let condition = self.pop()?;
            if !condition.is_truthy() {
                break;
            }

            if let LoopSignal::Returned =
                self.run_loop_stream(&template.body, &free, free_count, base, num_locals)?
            {
                return self.propagate_loop_return(base);
            }
            match self.loop_body_outcome() {
                LoopBodyOutcome::Break => break,
                LoopBodyOutcome::Next => {}
            }

            if !template.post.is_empty() {
                if let LoopSignal::Returned =
                    self.run_loop_stream(&template.post, &free, free_count, base, num_locals)?
                {
                    return self.propagate_loop_return(base);
                }
            }
        }

        self.sp = pos;
        self.write_back_frees(&template.frees, &free);
        Ok(())
    }

    fn exec_range_loop(&mut self) -> Result<(), RuntimeError> {
        let pos = self.sp - 1;
        let Value::Closure(closure) = self.stack[pos].clone() else {
            return Err(runtime_error("range loop expects a closure"));
        };
        let Callable::Range(template) = closure.callable.clone() else {
            return Err(runtime_error("range loop expects a loop closure"));
        };
        let free = closure.free.clone();
        let free_count = template.free_count();
        let num_locals = template.num_locals;
        let base = self.sp;

        if let LoopSignal::Returned =
            self.run_loop_stream(&template.x, &free, free_count, base, num_locals)?
        {
            return self.propagate_loop_return(base);
        }
        let mut rangee = self.pop()?;
        loop {
            match rangee {
                Value::SingleReturn { value, .. } => rangee = *value,
                Value::MapExist { value, .. } => rangee = *value,
                other => {
                    rangee = other;
                    break;
                }
            }
        }

        // Each iteration writes the key and value into fixed slots of the
        // shared loop scope; the spilled rangee keeps slot 0 when the
        // rangee was anonymous.
        let (key_slot, value_slot) = if template.is_anonymous {
            (base + 1, base + 2)
        } else {
            (base, base + 1)
        };

        let entries: Vec<(Value, Value)> = match &rangee {
            Value::Array(arr) => arr
                .borrow()
                .elements
                .iter()
                .enumerate()
                .map(|(i, elem)| (Value::Int(i as i64), elem.clone()))
                .collect(),
            Value::Hash(hash) => hash
                .borrow()
                .pairs
                .values()
                .map(|pair| (pair.key.clone(), pair.value.clone()))
                .collect(),
            Value::Str(s) => s
                .bytes()
                .enumerate()
                .map(|(i, byte)| (Value::Int(i as i64), Value::Uint8(byte)))
                .collect(),
            other => {
                return Err(runtime_error(format!(
                    "cannot range over {}",
                    other.type_tag()
                )));
            }
        };

        for (key, value) in entries {
            self.stack[key_slot] = key;
            self.stack[value_slot] = value;

            if let LoopSignal::Returned =
                self.run_loop_stream(&template.body, &free, free_count, base, num_locals)?
            {
                return self.propagate_loop_return(base);
            }
            match self.loop_body_outcome() {
                LoopBodyOutcome::Break => break,
                LoopBodyOutcome::Next => {}
            }
        }

        self.sp = pos;
        self.write_back_frees(&template.frees, &free);
        Ok(())
    }

    /// A `return` escaped a loop body: pop the enclosing frame and hand
    /// the wrapper to its caller, or finish the program when the loop ran
    /// in the main frame. A value-carrying return left `sp` at the loop
    /// base with the wrapper just below; a bare return left `sp` one
    /// lower and carries nothing.
    fn propagate_loop_return(&mut self, base: usize) -> Result<(), RuntimeError> {
        if self.sp == base {
            let wrapper = self.pop()?;
            if self.current_frame().is_main {
                self.finish_main(wrapper);
                return Ok(());
            }
            let frame = self.frames.pop().expect("loop without an enclosing frame");
            self.stack[frame.base_pointer - 1] = wrapper;
            self.sp = frame.base_pointer;
        } else if self.current_frame().is_main {
            self.finish_main(Value::Null);
        } else {
            let frame = self.frames.pop().expect("loop without an enclosing frame");
            self.sp = frame.base_pointer.saturating_sub(1);
        }
        Ok(())
    }

    /// Write captured free slots back to where they came from in the
    /// enclosing frame, so mutations inside the loop are visible after it.
    fn write_back_frees(&mut self, frees: &[FreeRef], free: &FreeList) {
        if frees.is_empty() {
            return;
        }
        let (base_pointer, enclosing_closure) = {
            let frame = self.current_frame();
            (frame.base_pointer, frame.closure.clone())
        };
        let values = free.borrow();
        for (i, origin) in frees.iter().enumerate() {
            match origin {
                FreeRef::Local(idx) => self.stack[base_pointer + idx] = values[i].clone(),
                FreeRef::Free(idx) => {
                    enclosing_closure.free.borrow_mut()[*idx] = values[i].clone();
                }
            }
        }
    }
}

enum LoopBodyOutcome {
    Next,
    Break,
}

fn wrap_results(mut results: Vec<Value>, from_call: bool) -> Value {
    if results.len() > 1 {
        return Value::MultiReturn {
            values: results,
            from_call,
        };
    }
    match results.pop().unwrap_or(Value::Null) {
        wrapper @ (Value::SingleReturn { .. } | Value::MultiReturn { .. }) => wrapper,
        value => Value::SingleReturn {
            value: Box::new(value),
            from_call: true,
        },
    }
}

fn unwrap_operand(value: Value) -> Value {
    match value {
        Value::SingleReturn { value, .. } => *value,
        Value::MapExist { value, .. } => *value,
        other => other,
    }
}

/// Binary dispatch: both operands must share a type tag after unwrapping;
/// integer results keep the left operand's width.
fn binary_op(op: OpCode, left: Value, right: Value) -> Value {
    let left = unwrap_operand(left);
    let right = unwrap_operand(right);

    if left.type_tag() != right.type_tag() {
        return new_error(format!(
            "Binary mismatched types {} and {}",
            left.type_tag(),
            right.type_tag()
        ));
    }

    match left.type_tag() {
        tag if tag.is_integer() => integer_binary_op(op, &left, &right),
        tag if tag.is_float() => float_binary_op(op, &left, &right),
        TypeTag::Bool => bool_binary_op(op, &left, &right),
        TypeTag::Str => string_binary_op(op, &left, &right),
        tag => new_error(format!(
            "unknown operator: {} {} {}",
            tag,
            op.name(),
            tag
        )),
    }
}

fn integer_binary_op(op: OpCode, left: &Value, right: &Value) -> Value {
    let tag = left.type_tag();
    let lv = left.widen().unwrap();
    let rv = right.widen().unwrap();
    match op {
        OpCode::Add => narrow_int(tag, lv.wrapping_add(rv)),
        OpCode::Sub => narrow_int(tag, lv.wrapping_sub(rv)),
        OpCode::Mul => narrow_int(tag, lv.wrapping_mul(rv)),
        OpCode::Quo => match lv.checked_div(rv) {
            Some(v) => narrow_int(tag, v),
            None => new_error("division by zero"),
        },
        OpCode::Rem => match lv.checked_rem(rv) {
            Some(v) => narrow_int(tag, v),
            None => new_error("division by zero"),
        },
        OpCode::And => narrow_int(tag, lv & rv),
        OpCode::Or => narrow_int(tag, lv | rv),
        OpCode::Xor => narrow_int(tag, lv ^ rv),
        OpCode::Shl => {
            if rv < 0 {
                new_error(format!("negative shift amount: {}", rv))
            } else if rv >= 64 {
                narrow_int(tag, 0)
            } else {
                narrow_int(tag, lv << rv)
            }
        }
        OpCode::Shr => {
            if rv < 0 {
                new_error(format!("negative shift amount: {}", rv))
            } else if rv >= 64 {
                narrow_int(tag, lv >> 63)
            } else {
                narrow_int(tag, lv >> rv)
            }
        }
        OpCode::AndNot => narrow_int(tag, lv & !rv),
        OpCode::Eql => Value::Bool(lv == rv),
        OpCode::Neq => Value::Bool(lv != rv),
        OpCode::Lss => Value::Bool(lv < rv),
        OpCode::Leq => Value::Bool(lv <= rv),
        OpCode::Gtr => Value::Bool(lv > rv),
        OpCode::Geq => Value::Bool(lv >= rv),
        _ => new_error(format!(
            "the operator {} is not defined on {}",
            op.name(),
            tag
        )),
    }
}

fn float_binary_op(op: OpCode, left: &Value, right: &Value) -> Value {
    let tag = left.type_tag();
    let lv = left.as_float().unwrap();
    let rv = right.as_float().unwrap();
    match op {
        OpCode::Add => narrow_float(tag, lv + rv),
        OpCode::Sub => narrow_float(tag, lv - rv),
        OpCode::Mul => narrow_float(tag, lv * rv),
        OpCode::Quo => narrow_float(tag, lv / rv),
        OpCode::Eql => Value::Bool(lv == rv),
        OpCode::Neq => Value::Bool(lv != rv),
        OpCode::Lss => Value::Bool(lv < rv),
        OpCode::Leq => Value::Bool(lv <= rv),
        OpCode::Gtr => Value::Bool(lv > rv),
        OpCode::Geq => Value::Bool(lv >= rv),
        _ => new_error(format!(
            "the operator {} is not defined on {}",
            op.name(),
            tag
        )),
    }
}

fn bool_binary_op(op: OpCode, left: &Value, right: &Value) -> Value {
    let (Value::Bool(lv), Value::Bool(rv)) = (left, right) else {
        unreachable!("bool operands expected");
    };
    match op {
        OpCode::LAnd => Value::Bool(*lv && *rv),
        OpCode::LOr => Value::Bool(*lv || *rv),
        OpCode::Eql => Value::Bool(lv == rv),
        OpCode::Neq => Value::Bool(lv != rv),
        _ => new_error(format!("the operator {} is not defined on bool", op.name())),
    }
}

fn string_binary_op(op: OpCode, left: &Value, right: &Value) -> Value {
    let (Value::Str(lv), Value::Str(rv)) = (left, right) else {
        unreachable!("string operands expected");
    };
    match op {
        OpCode::Add => Value::Str(Rc::from(format!("{}{}", lv, rv))),
        OpCode::Eql => Value::Bool(lv == rv),
        OpCode::Neq => Value::Bool(lv != rv),
        _ => new_error(format!(
            "the operator {} is not defined on string",
            op.name()
        )),
    }
}

fn unary_op(op: OpCode, operand: Value) -> Value {
    let operand = unwrap_operand(operand);
    let tag = operand.type_tag();
    match op {
        OpCode::Not => match operand {
            Value::Bool(v) => Value::Bool(!v),
            _ => new_error(format!("operator ! not defined on {}", tag)),
        },
        OpCode::PrefixSub => {
            if let Some(v) = operand.widen() {
                narrow_int(tag, v.wrapping_neg())
            } else if let Some(v) = operand.as_float() {
                narrow_float(tag, -v)
            } else {
                new_error(format!("operator - not defined on {}", tag))
            }
        }
        OpCode::PrefixAdd => {
            if operand.is_integer() || operand.is_float() {
                operand
            } else {
                new_error(format!("operator + not defined on {}", tag))
            }
        }
        OpCode::Inc => {
            if let Some(v) = operand.widen() {
                narrow_int(tag, v.wrapping_add(1))
            } else if let Some(v) = operand.as_float() {
                narrow_float(tag, v + 1.0)
            } else {
                new_error(format!("operator ++ not defined on {}", tag))
            }
        }
        OpCode::Dec => {
            if let Some(v) = operand.widen() {
                narrow_int(tag, v.wrapping_sub(1))
            } else if let Some(v) = operand.as_float() {
                narrow_float(tag, v - 1.0)
            } else {
                new_error(format!("operator -- not defined on {}", tag))
            }
        }
        _ => new_error(format!("unknown unary operator {}", op.name())),
    }
}
