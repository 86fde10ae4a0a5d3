use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::ptr::NonNull;

use bytes::Bytes;

use crate::gc::{Cell, Handle, Heap, ObjBody, ObjType};
use crate::vm::Vm;

use super::error::Result;
use super::module::Module;
use super::str::Str;
use super::value::Value;

/// Debug information carried by a compiled function.
pub struct FnDebug {
    /// The function's name, for stack traces.
    pub name: String,

    /// The module's source path, or None for synthesized functions.
    pub source_path: Option<Handle<Str>>,

    /// The source line that generated each bytecode instruction, parallel to
    /// the bytecode.
    pub lines: Vec<u32>,
}

/// A unit of compiled bytecode: the code itself, its constant pool, and
/// enough metadata to call it and to report errors against the source.
pub struct Fn {
    pub module: Handle<Module>,
    pub constants: Vec<Value>,
    pub code: Bytes,
    pub num_upvalues: usize,
    pub arity: usize,
    pub debug: FnDebug,
}

impl ObjBody for Fn {
    const TY: ObjType = ObjType::Fn;

    fn trace(&self, heap: &mut Heap) {
        heap.gray_obj(self.module.erase());

        for constant in self.constants.iter() {
            heap.gray_value(*constant);
        }

        if let Some(path) = self.debug.source_path {
            heap.gray_obj(path.erase());
        }
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Fn>>()
            + self.code.len()
            + self.constants.len() * mem::size_of::<Value>()
            + self.debug.lines.len() * mem::size_of::<u32>()
    }
}

impl Debug for Fn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Fn({})", self.debug.name)
    }
}

/// A function paired with the upvalues it captures.
pub struct Closure {
    pub fn_: Handle<Fn>,
    pub upvalues: Vec<Option<Handle<Upvalue>>>,
}

impl ObjBody for Closure {
    const TY: ObjType = ObjType::Closure;

    fn trace(&self, heap: &mut Heap) {
        heap.gray_obj(self.fn_.erase());

        for upvalue in self.upvalues.iter().flatten() {
            heap.gray_obj(upvalue.erase());
        }
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Closure>>()
            + self.upvalues.len() * mem::size_of::<Option<Handle<Upvalue>>>()
    }
}

impl Debug for Closure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Closure({})", self.fn_.debug.name)
    }
}

/// A captured variable. Open while the captured stack slot is still live (the
/// pointer targets the fiber's stack and the upvalue sits in that fiber's
/// open-upvalue list); closed once the slot dies (the value has been copied
/// into the upvalue and the pointer retargeted at it).
pub struct Upvalue {
    value: NonNull<Value>,
    closed: Value,
    pub(crate) next: Option<Handle<Upvalue>>,
}

impl Upvalue {
    pub(crate) fn open(slot: NonNull<Value>) -> Self {
        Self {
            value: slot,
            closed: Value::NULL,
            next: None,
        }
    }

    /// Address of the stack slot (or of the closed field, once closed);
    /// the open-upvalue list is ordered descending on this.
    pub(crate) fn location(&self) -> usize {
        self.value.as_ptr() as usize
    }

    pub fn is_open(&self) -> bool {
        self.value.as_ptr() as *const Value != &self.closed as *const Value
    }

    pub fn get(&self) -> Value {
        unsafe { *self.value.as_ref() }
    }

    pub fn set(&mut self, value: Value) {
        unsafe {
            *self.value.as_mut() = value;
        }
    }

    /// Copies the captured slot into the upvalue and retargets the pointer at
    /// the copy. Happens exactly once, when the slot goes out of scope.
    pub(crate) fn close(&mut self) {
        self.closed = self.get();
        self.value = NonNull::from(&mut self.closed);
    }
}

impl ObjBody for Upvalue {
    const TY: ObjType = ObjType::Upvalue;

    fn trace(&self, heap: &mut Heap) {
        // The closed field, in case the upvalue has been closed over it.
        heap.gray_value(self.closed);
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Upvalue>>()
    }
}

impl Debug for Upvalue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Upvalue({})",
            if self.is_open() { "open" } else { "closed" }
        )
    }
}

impl Vm {
    /// Creates a function. The constants are copied up front, before the
    /// function object exists, so a collection triggered here can't observe a
    /// half-built function.
    #[allow(clippy::too_many_arguments)]
    pub fn new_function(
        &mut self,
        module: Handle<Module>,
        constants: &[Value],
        num_upvalues: usize,
        arity: usize,
        code: Bytes,
        lines: Vec<u32>,
        source_path: Option<Handle<Str>>,
        name: &str,
    ) -> Result<Handle<Fn>> {
        let class = self.classes.fn_;
        let constants = constants.to_vec();

        self.allocate(
            Fn {
                module,
                constants,
                code,
                num_upvalues,
                arity,
                debug: FnDebug {
                    name: name.to_string(),
                    source_path,
                    lines,
                },
            },
            class,
        )
    }

    /// Wraps [fn_] in a closure. The upvalue array starts out empty (all
    /// None) in case a collection runs after the closure is created but
    /// before its upvalues are populated.
    pub fn new_closure(&mut self, fn_: Handle<Fn>) -> Result<Handle<Closure>> {
        let class = self.classes.fn_;
        let upvalues = vec![None; fn_.num_upvalues];

        self.allocate(Closure { fn_, upvalues }, class)
    }
}
