use std::alloc::Layout;
use std::ptr::NonNull;

use crate::runtime::class::{Class, Instance};
use crate::runtime::error::{ErrorKind, Result};
use crate::runtime::fiber::Fiber;
use crate::runtime::function::{Closure, Fn, Upvalue};
use crate::runtime::list::List;
use crate::runtime::map::Map;
use crate::runtime::module::Module;
use crate::runtime::range::Range;
use crate::runtime::str::Str;
use crate::runtime::value::Value;
use crate::stack::Stack;

mod handle;

pub use handle::{Cell, Handle, Header, ObjType, RawObj};

/// The maximum number of temporary roots that can be live at once. Temporary
/// roots protect freshly allocated objects across a nested allocation; the
/// deepest nesting in the runtime is the metaclass construction dance.
pub const MAX_TEMP_ROOTS: usize = 8;

/// A heap object body. Every object type declares its tag, grays the objects
/// it references, and reports its memory footprint so a collection cycle can
/// re-establish the live byte count.
pub trait ObjBody: Sized + 'static {
    const TY: ObjType;

    fn trace(&self, heap: &mut Heap);

    /// Total footprint in bytes: the cell itself plus any owned storage.
    fn size_bytes(&self) -> usize;
}

/// Owns every heap object through an intrusive list of cells and decides when
/// to collect. Marking uses an explicit gray worklist, so deeply nested
/// object graphs cannot exhaust the native stack.
pub struct Heap {
    /// Head of the linked list of all live objects.
    first: Option<RawObj>,

    /// Bytes proven live after the last collection plus everything allocated
    /// since. Bytes of freed objects are not subtracted; the next mark phase
    /// recounts from scratch.
    bytes_allocated: usize,

    /// Allocated-byte threshold that triggers the next collection.
    next_gc: usize,

    /// Floor for [next_gc] after a collection.
    min_next_gc: usize,

    /// Total heap size relative to live bytes, as a percentage. 150 means the
    /// next collection runs once the heap grows 50% past the live size.
    heap_scale_percent: usize,

    temp_roots: Stack<Value, MAX_TEMP_ROOTS>,
    gray: Vec<RawObj>,
}

impl Heap {
    pub fn new(initial_size: usize, min_size: usize, heap_scale_percent: usize) -> Self {
        Self {
            first: None,
            bytes_allocated: 0,
            next_gc: initial_size,
            min_next_gc: min_size,
            heap_scale_percent,
            temp_roots: Stack::default(),
            gray: vec![],
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Accounts [bytes] of new storage ahead of the allocation that uses it.
    pub fn reserve(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    /// Adjusts the live byte count after a buffer grew or shrank in place.
    pub fn adjust(&mut self, delta: isize) {
        self.bytes_allocated = (self.bytes_allocated as isize + delta).max(0) as usize;
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Allocates a cell for [data] and links it at the head of the object
    /// list, unmarked. Byte accounting is the caller's duty (see
    /// [Heap::reserve]); collection never runs from here.
    pub fn alloc<T: ObjBody>(&mut self, data: T, class: Option<Handle<Class>>) -> Result<Handle<T>> {
        let layout = Layout::new::<Cell<T>>();

        unsafe {
            let ptr = std::alloc::alloc(layout) as *mut Cell<T>;

            let Some(ptr) = NonNull::new(ptr) else {
                return Err(ErrorKind::OutOfMemory.into());
            };

            ptr.as_ptr().write(Cell {
                header: Header {
                    ty: T::TY,
                    marked: false,
                    class,
                    next: self.first,
                },
                data,
            });

            let handle = Handle::new(ptr);
            self.first = Some(handle.erase());

            Ok(handle)
        }
    }

    /// Protects [obj] from collection until the matching [Heap::pop_root].
    pub fn push_root(&mut self, obj: RawObj) {
        self.temp_roots.push(Value::obj(obj));
    }

    /// Like [Heap::push_root] for a value that may not be an object; the slot
    /// is occupied either way, keeping pushes and pops paired.
    pub fn push_root_value(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_root(&mut self) {
        assert!(!self.temp_roots.is_empty(), "no temporary roots to release");

        self.temp_roots.pop();
    }

    /// Marks [obj] reachable and queues it for tracing. A no-op for objects
    /// that are already marked, which is what terminates cycles.
    pub fn gray_obj(&mut self, obj: RawObj) {
        if obj.is_marked() {
            return;
        }

        obj.set_marked(true);
        self.gray.push(obj);
    }

    pub fn gray_value(&mut self, value: Value) {
        if let Some(obj) = value.try_obj() {
            self.gray_obj(obj);
        }
    }

    /// Runs a full mark-sweep cycle. [mark_roots] grays the external root
    /// set; the temporary roots are added here.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub fn collect<F>(&mut self, mark_roots: F)
    where
        F: FnOnce(&mut Heap),
    {
        #[cfg(feature = "tracing")]
        let before = self.bytes_allocated;

        // As objects are marked their sizes are counted again, re-establishing
        // the live byte count without ever needing the size of a freed object.
        self.bytes_allocated = 0;

        mark_roots(self);

        for i in 0..self.temp_roots.len() {
            let value = self.temp_roots.get(i);
            self.gray_value(value);
        }

        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }

        self.sweep();

        self.next_gc = (self.bytes_allocated * self.heap_scale_percent / 100).max(self.min_next_gc);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            before,
            after = self.bytes_allocated,
            next_gc = self.next_gc,
            "collection finished"
        );
    }

    /// Traces one marked object: counts its footprint and grays everything it
    /// references.
    fn blacken(&mut self, obj: RawObj) {
        // The class pointer of a class (its metaclass) and of an instance is
        // load-bearing; every other type reaches its class through the core
        // module variables.
        if matches!(obj.ty(), ObjType::Class | ObjType::Instance) {
            if let Some(class) = obj.class() {
                self.gray_obj(class.erase());
            }
        }

        match obj.ty() {
            ObjType::Class => self.trace_body::<Class>(obj),
            ObjType::Closure => self.trace_body::<Closure>(obj),
            ObjType::Fiber => self.trace_body::<Fiber>(obj),
            ObjType::Fn => self.trace_body::<Fn>(obj),
            ObjType::Instance => self.trace_body::<Instance>(obj),
            ObjType::List => self.trace_body::<List>(obj),
            ObjType::Map => self.trace_body::<Map>(obj),
            ObjType::Module => self.trace_body::<Module>(obj),
            ObjType::Range => self.trace_body::<Range>(obj),
            ObjType::Str => self.trace_body::<Str>(obj),
            ObjType::Upvalue => self.trace_body::<Upvalue>(obj),
        }
    }

    fn trace_body<T: ObjBody>(&mut self, obj: RawObj) {
        let body = unsafe { &(*obj.as_cell_ptr::<T>()).data };

        self.bytes_allocated += body.size_bytes();
        body.trace(self);
    }

    /// Walks the object list: frees everything unmarked, clears the mark bit
    /// on survivors and rethreads the list around the gaps.
    fn sweep(&mut self) {
        let mut prev: Option<RawObj> = None;
        let mut current = self.first;

        while let Some(obj) = current {
            let next = obj.next();

            if obj.is_marked() {
                obj.set_marked(false);
                prev = Some(obj);
            } else {
                match prev {
                    Some(prev) => prev.set_next(next),
                    None => self.first = next,
                }

                unsafe { free_obj(obj) };
            }

            current = next;
        }
    }

    /// Number of objects currently threaded on the all-objects list.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.first;

        while let Some(obj) = current {
            count += 1;
            current = obj.next();
        }

        count
    }

    /// Number of live objects of [ty].
    pub fn count_of(&self, ty: ObjType) -> usize {
        let mut count = 0;
        let mut current = self.first;

        while let Some(obj) = current {
            if obj.ty() == ty {
                count += 1;
            }

            current = obj.next();
        }

        count
    }

    pub(crate) fn objects(&self) -> ObjectIter {
        ObjectIter {
            current: self.first,
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.first;

        while let Some(obj) = current {
            current = obj.next();
            unsafe { free_obj(obj) };
        }
    }
}

pub(crate) struct ObjectIter {
    current: Option<RawObj>,
}

impl Iterator for ObjectIter {
    type Item = RawObj;

    fn next(&mut self) -> Option<RawObj> {
        let obj = self.current?;
        self.current = obj.next();

        Some(obj)
    }
}

unsafe fn free_obj(obj: RawObj) {
    match obj.ty() {
        ObjType::Class => free_cell::<Class>(obj),
        ObjType::Closure => free_cell::<Closure>(obj),
        ObjType::Fiber => free_cell::<Fiber>(obj),
        ObjType::Fn => free_cell::<Fn>(obj),
        ObjType::Instance => free_cell::<Instance>(obj),
        ObjType::List => free_cell::<List>(obj),
        ObjType::Map => free_cell::<Map>(obj),
        ObjType::Module => free_cell::<Module>(obj),
        ObjType::Range => free_cell::<Range>(obj),
        ObjType::Str => free_cell::<Str>(obj),
        ObjType::Upvalue => free_cell::<Upvalue>(obj),
    }
}

// Dropping the cell drops the body, which releases any owned storage.
unsafe fn free_cell<T: ObjBody>(obj: RawObj) {
    let ptr = obj.as_cell_ptr::<T>();

    std::ptr::drop_in_place(ptr);
    std::alloc::dealloc(ptr.cast(), Layout::new::<Cell<T>>());
}
