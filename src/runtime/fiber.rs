use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::ptr::NonNull;

use crate::gc::{Cell, Handle, Heap, ObjBody, ObjType, RawObj};
use crate::vm::Vm;

use super::error::{ErrorKind, Result};
use super::function::{Closure, Fn, Upvalue};
use super::str::Str;
use super::value::Value;

/// Capacity of a fiber's value stack. The storage is allocated up front and
/// never moves: open upvalues keep raw pointers into it.
pub const STACK_CAPACITY: usize = 1024;

/// Capacity of a fiber's frame stack.
pub const FRAMES_CAPACITY: usize = 256;

/// One function activation: the function (an Fn or a Closure), the
/// instruction offset to resume at, and where its slots begin on the value
/// stack.
#[derive(Clone, Copy)]
pub struct CallFrame {
    pub fn_: RawObj,
    pub ip: usize,
    pub stack_start: usize,
}

impl CallFrame {
    /// The compiled function behind this frame, unwrapping a closure.
    pub fn fn_of(&self) -> Handle<Fn> {
        match self.fn_.cast::<Fn>() {
            Some(fn_) => fn_,
            None => self
                .fn_
                .cast::<Closure>()
                .expect("frame holds neither an Fn nor a Closure")
                .fn_,
        }
    }
}

/// An independent call stack: the unit of cooperative concurrency.
pub struct Fiber {
    pub frames: Vec<CallFrame>,
    pub stack: Vec<Value>,

    /// Head of the list of upvalues still pointing into the stack, ordered by
    /// descending slot address.
    pub open_upvalues: Option<Handle<Upvalue>>,

    /// The fiber to resume when this one completes or fails.
    pub caller: Option<Handle<Fiber>>,

    /// Non-null once the fiber has failed.
    pub error: Option<Handle<Str>>,

    /// Whether the caller ran this fiber through a try-protected call and
    /// wants the error delivered instead of propagated.
    pub caller_is_trying: bool,

    /// Unique-ish id, usable as a map key.
    pub id: u16,
}

impl Fiber {
    fn new(id: u16, fn_: RawObj) -> Self {
        let mut fiber = Self {
            frames: Vec::with_capacity(FRAMES_CAPACITY),
            stack: Vec::with_capacity(STACK_CAPACITY),
            open_upvalues: None,
            caller: None,
            error: None,
            caller_is_trying: false,
            id,
        };

        fiber.reset(fn_);
        fiber
    }

    /// Re-establishes frame 0 at the base of the value stack with [fn_] (an
    /// Fn or a Closure) about to run from its first instruction.
    pub fn reset(&mut self, fn_: RawObj) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.caller = None;
        self.error = None;
        self.caller_is_trying = false;

        self.frames.push(CallFrame {
            fn_,
            ip: 0,
            stack_start: 0,
        });
    }

    pub fn push(&mut self, value: Value) {
        assert!(self.stack.len() < STACK_CAPACITY, "fiber stack overflow");

        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("fiber stack underflow")
    }

    pub fn peek(&self) -> Value {
        *self.stack.last().expect("fiber stack underflow")
    }

    /// Pushes a call frame for [fn_] whose arguments start [num_args] slots
    /// down from the stack top.
    pub fn push_frame(&mut self, fn_: RawObj, num_args: usize) {
        assert!(self.frames.len() < FRAMES_CAPACITY, "fiber frame overflow");

        self.frames.push(CallFrame {
            fn_,
            ip: 0,
            stack_start: self.stack.len() - num_args,
        });
    }

    pub fn pop_frame(&mut self) -> CallFrame {
        self.frames.pop().expect("fiber frame underflow")
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// A fiber is done when it has finished every frame or has failed.
    pub fn is_done(&self) -> bool {
        self.frames.is_empty() || self.has_error()
    }

    /// Pointer to the value slot at [index]. Stable for the fiber's lifetime:
    /// the stack storage is preallocated and never reallocates.
    pub(crate) fn slot_ptr(&mut self, index: usize) -> NonNull<Value> {
        debug_assert!(index < STACK_CAPACITY);

        unsafe { NonNull::new_unchecked(self.stack.as_mut_ptr().add(index)) }
    }
}

impl ObjBody for Fiber {
    const TY: ObjType = ObjType::Fiber;

    fn trace(&self, heap: &mut Heap) {
        // Stack functions.
        for frame in self.frames.iter() {
            heap.gray_obj(frame.fn_);
        }

        // Every occupied stack slot.
        for slot in self.stack.iter() {
            heap.gray_value(*slot);
        }

        // The whole open-upvalue list; an upvalue's own trace does not follow
        // the list links.
        let mut upvalue = self.open_upvalues;
        while let Some(current) = upvalue {
            heap.gray_obj(current.erase());
            upvalue = current.next;
        }

        if let Some(caller) = self.caller {
            heap.gray_obj(caller.erase());
        }

        if let Some(error) = self.error {
            heap.gray_obj(error.erase());
        }
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Fiber>>()
            + STACK_CAPACITY * mem::size_of::<Value>()
            + FRAMES_CAPACITY * mem::size_of::<CallFrame>()
    }
}

impl Debug for Fiber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber(id: {}, frames: {})", self.id, self.frames.len())
    }
}

impl Vm {
    /// Creates a fiber ready to run [fn_] (an Fn or a Closure). Ids come
    /// from a VM-wide counter so fibers can be used as map keys.
    pub fn new_fiber(&mut self, fn_: RawObj) -> Result<Handle<Fiber>> {
        let class = self.classes.fiber;
        let id = self.next_fiber_id;

        self.next_fiber_id = self.next_fiber_id.wrapping_add(1);

        self.allocate(Fiber::new(id, fn_), class)
    }

    /// Captures the stack slot at [slot] into an upvalue. If an open upvalue
    /// for that slot already exists it is reused, so every closure over one
    /// variable sees the same storage; otherwise a new upvalue is linked into
    /// the list, which stays sorted by descending slot address.
    pub fn capture_upvalue(
        &mut self,
        mut fiber: Handle<Fiber>,
        slot: usize,
    ) -> Result<Handle<Upvalue>> {
        let local = fiber.slot_ptr(slot);
        let addr = local.as_ptr() as usize;

        self.heap.push_root(fiber.erase());

        // Walk towards the bottom of the stack until there's an existing
        // upvalue for the slot or the walk passes where it should be.
        let mut prev: Option<Handle<Upvalue>> = None;
        let mut current = fiber.open_upvalues;

        while let Some(upvalue) = current {
            if upvalue.location() <= addr {
                break;
            }

            prev = Some(upvalue);
            current = upvalue.next;
        }

        if let Some(upvalue) = current {
            if upvalue.location() == addr {
                self.heap.pop_root();
                return Ok(upvalue);
            }
        }

        let mut created = self.allocate(Upvalue::open(local), None)?;

        created.next = current;

        match prev {
            Some(mut prev) => prev.next = Some(created),
            None => fiber.open_upvalues = Some(created),
        }

        self.heap.pop_root();

        Ok(created)
    }

    /// Closes every open upvalue whose slot address is at or above [slot]:
    /// each one copies its slot's value into itself and leaves the list.
    pub fn close_upvalues(&mut self, mut fiber: Handle<Fiber>, slot: usize) {
        let addr = fiber.slot_ptr(slot).as_ptr() as usize;

        while let Some(mut upvalue) = fiber.open_upvalues {
            if upvalue.location() < addr {
                break;
            }

            upvalue.close();
            fiber.open_upvalues = upvalue.next;
            upvalue.next = None;
        }
    }

    /// Transfers control to [target], which will return here when it
    /// completes. With [is_trying], a failure in the target is delivered to
    /// this fiber instead of unwinding past it.
    pub fn call_fiber(
        &mut self,
        target: Handle<Fiber>,
        value: Option<Value>,
        is_trying: bool,
    ) -> Result<()> {
        let mut target = target;

        if target.frames.is_empty() {
            return Err(ErrorKind::FiberFinished.into());
        }
        if target.caller.is_some() {
            return Err(ErrorKind::FiberAlreadyCalled.into());
        }

        // Remember who ran it.
        target.caller = self.fiber;
        target.caller_is_trying = is_trying;

        // If the target was mid-yield, the yield call resumes with the
        // transferred value.
        if !target.stack.is_empty() {
            let top = target.stack.len() - 1;
            target.stack[top] = value.unwrap_or(Value::NULL);
        }

        self.fiber = Some(target);

        Ok(())
    }

    /// Transfers control to [target] without remembering this fiber: the
    /// target inherits this fiber's caller, like a tail call.
    pub fn run_fiber(&mut self, target: Handle<Fiber>, value: Option<Value>) -> Result<()> {
        let mut target = target;

        if target.frames.is_empty() {
            return Err(ErrorKind::FiberFinished.into());
        }

        if target.caller.is_none() && !target.stack.is_empty() {
            let top = target.stack.len() - 1;
            target.stack[top] = value.unwrap_or(Value::NULL);
        }

        let caller = self.fiber.and_then(|fiber| fiber.caller);
        target.caller = caller;

        self.fiber = Some(target);

        Ok(())
    }

    /// Suspends the current fiber, delivering [value] as the result of the
    /// caller's call. With no caller, control returns to the embedder.
    pub fn yield_fiber(&mut self, value: Option<Value>) {
        let Some(mut fiber) = self.fiber else {
            return;
        };

        // Unhook this fiber from the one that called it.
        let caller = fiber.caller;
        fiber.caller = None;
        fiber.caller_is_trying = false;

        if let Some(mut caller) = caller {
            // The caller's call expression resumes with the yielded value.
            let top = caller.stack.len() - 1;
            caller.stack[top] = value.unwrap_or(Value::NULL);
        }

        self.fiber = caller;
    }

    /// Puts the current fiber into a failed state because of [error].
    ///
    /// If the caller ran this fiber with a try-protected call, the error
    /// value becomes the result of that call and control resumes there.
    /// Otherwise the stack trace is reported through the error sink and
    /// control returns to the embedder.
    pub fn abort_fiber(&mut self, error: Value) {
        let Some(mut fiber) = self.fiber else {
            return;
        };

        debug_assert!(!fiber.has_error(), "a fiber can only fail once");

        fiber.error = error.as_obj_of::<Str>();

        if fiber.caller_is_trying {
            let mut caller = fiber.caller.expect("trying fiber has no caller");

            // Make the caller's try call return the error message.
            let top = caller.stack.len() - 1;
            caller.stack[top] = error;

            self.fiber = Some(caller);
            return;
        }

        // Nothing catches the error: report the trace and stop.
        self.report_stack_trace(fiber);
        self.fiber = None;
    }

    /// Reports every frame of [fiber], innermost first, then the error
    /// message, through the configured error sink.
    fn report_stack_trace(&self, fiber: Handle<Fiber>) {
        let error_fn = self.config.error_fn;

        for frame in fiber.frames.iter().rev() {
            let fn_ = frame.fn_of();
            let module = fn_.module.name.as_str().to_string();
            let line = fn_
                .debug
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);

            error_fn(&module, line as usize, &fn_.debug.name);
        }

        if let Some(error) = fiber.error {
            error_fn("", 0, error.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::{Config, Vm};

    use super::*;

    fn stub_fn(vm: &mut Vm) -> RawObj {
        let module = vm.get_module("core").unwrap();
        vm.new_function(
            module,
            &[],
            0,
            0,
            bytes::Bytes::new(),
            vec![],
            None,
            "stub",
        )
        .unwrap()
        .erase()
    }

    #[test]
    fn test_fiber_ids_are_monotonic() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let fn_ = stub_fn(&mut vm);

        let a = vm.new_fiber(fn_).unwrap();
        let b = vm.new_fiber(fn_).unwrap();

        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn test_reset() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let fn_ = stub_fn(&mut vm);

        let mut fiber = vm.new_fiber(fn_).unwrap();

        fiber.push(Value::num(1.0));
        fiber.push(Value::num(2.0));
        fiber.push_frame(fn_, 1);

        assert_eq!(fiber.frames.len(), 2);

        fiber.reset(fn_);

        assert_eq!(fiber.frames.len(), 1);
        assert_eq!(fiber.frames[0].stack_start, 0);
        assert!(fiber.stack.is_empty());
        assert!(!fiber.is_done());
    }

    #[test]
    fn test_call_guards() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let fn_ = stub_fn(&mut vm);

        let main = vm.new_fiber(fn_).unwrap();
        let mut target = vm.new_fiber(fn_).unwrap();

        vm.fiber = Some(main);

        // A finished fiber cannot be called.
        target.frames.clear();

        let err = vm.call_fiber(target, None, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FiberFinished);

        // Nor can a fiber that already has a caller.
        let other = vm.new_fiber(fn_).unwrap();
        vm.call_fiber(other, None, false).unwrap();

        vm.fiber = Some(main);
        let err = vm.call_fiber(other, None, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FiberAlreadyCalled);
    }

    #[test]
    fn test_call_and_yield_round_trip() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let fn_ = stub_fn(&mut vm);

        let mut main = vm.new_fiber(fn_).unwrap();
        let child = vm.new_fiber(fn_).unwrap();

        // The call expression's slot on the calling fiber's stack.
        main.push(Value::NULL);
        vm.fiber = Some(main);

        vm.call_fiber(child, None, false).unwrap();
        assert_eq!(vm.fiber, Some(child));

        vm.yield_fiber(Some(Value::num(42.0)));

        assert_eq!(vm.fiber, Some(main));
        assert_eq!(main.peek().as_num(), 42.0);
        assert!(child.caller.is_none());
    }
}
