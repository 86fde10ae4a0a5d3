use std::fmt::{self, Debug, Formatter};
use std::mem;

use crate::buffer::{Buffer, GROW_FACTOR};
use crate::gc::{Cell, Handle, Heap, ObjBody, ObjType};
use crate::vm::Vm;

use super::error::Result;
use super::value::Value;

/// A growable sequence of values.
#[derive(Default)]
pub struct List {
    pub elements: Buffer<Value>,
}

impl List {
    pub fn count(&self) -> usize {
        self.elements.count()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.elements.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.elements.set(index, value);
    }
}

impl ObjBody for List {
    const TY: ObjType = ObjType::List;

    fn trace(&self, heap: &mut Heap) {
        for element in self.elements.iter() {
            heap.gray_value(*element);
        }
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<List>>() + self.elements.capacity() * mem::size_of::<Value>()
    }
}

impl Debug for List {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.elements.iter()).finish()
    }
}

impl Vm {
    /// Creates a list of [num_elements] slots, each holding null.
    pub fn new_list(&mut self, num_elements: usize) -> Result<Handle<List>> {
        let class = self.classes.list;
        let mut list = List::default();

        let mut heap_bytes = 0;
        if num_elements > 0 {
            list.elements.fill(&mut self.heap, Value::NULL, num_elements);
            heap_bytes = list.elements.capacity() * mem::size_of::<Value>();
        }

        // The element storage was counted by fill and is counted again inside
        // allocate; undo one of the two.
        self.heap.adjust(-(heap_bytes as isize));

        self.allocate(list, class)
    }

    /// Inserts [value] at [index], shifting everything after it one slot to
    /// the right.
    pub fn list_insert(&mut self, mut list: Handle<List>, value: Value, index: usize) -> Result<()> {
        self.heap.push_root(list.erase());

        // The append below may grow the buffer and collect; the value is not
        // reachable from the list yet.
        self.heap.push_root_value(value);

        list.elements.write(&mut self.heap, Value::NULL);
        self.maybe_collect();

        self.heap.pop_root();
        self.heap.pop_root();

        // Shift the existing elements down.
        let elements = list.elements.as_mut_slice();
        for i in (index + 1..elements.len()).rev() {
            elements[i] = elements[i - 1];
        }

        elements[index] = value;

        Ok(())
    }

    /// Appends [value] at the end of the list.
    pub fn list_add(&mut self, list: Handle<List>, value: Value) -> Result<()> {
        let count = list.count();
        self.list_insert(list, value, count)
    }

    /// Removes and returns the element at [index], shifting everything after
    /// it one slot to the left.
    pub fn list_remove_at(&mut self, mut list: Handle<List>, index: usize) -> Value {
        let removed = list.elements.as_slice()[index];

        self.heap.push_root(list.erase());
        self.heap.push_root_value(removed);

        let count = list.count();
        let elements = list.elements.as_mut_slice();
        for i in index..count - 1 {
            elements[i] = elements[i + 1];
        }

        list.elements.truncate(count - 1);

        // Shrink aggressively: whenever half the capacity would still hold
        // every element.
        if list.elements.capacity() / GROW_FACTOR >= list.count() {
            list.elements.shrink(&mut self.heap);
        }

        self.heap.pop_root();
        self.heap.pop_root();

        removed
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::{Config, Vm};

    use super::*;

    #[test]
    fn test_insert_at_bounds() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let list = vm.new_list(0).unwrap();

        // Insert at count (append) and at zero (prepend).
        vm.list_insert(list, Value::num(2.0), 0).unwrap();
        vm.list_insert(list, Value::num(3.0), 1).unwrap();
        vm.list_insert(list, Value::num(1.0), 0).unwrap();

        let elements: Vec<f64> = list.elements.iter().map(|v| v.as_num()).collect();

        assert_eq!(elements, &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_new_list_prefills_null() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let list = vm.new_list(3).unwrap();

        assert_eq!(list.count(), 3);
        assert!(list.elements.iter().all(|v| v.is_null()));
    }

    #[test]
    fn test_remove_shifts_and_returns() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let list = vm.new_list(0).unwrap();

        for i in 0..5 {
            vm.list_add(list, Value::num(i as f64)).unwrap();
        }

        let removed = vm.list_remove_at(list, 1);

        assert_eq!(removed.as_num(), 1.0);
        assert_eq!(list.count(), 4);

        let elements: Vec<f64> = list.elements.iter().map(|v| v.as_num()).collect();
        assert_eq!(elements, &[0.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_capacity_policy() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let list = vm.new_list(0).unwrap();

        for i in 0..17 {
            vm.list_add(list, Value::num(i as f64)).unwrap();
        }

        assert_eq!(list.elements.capacity(), 32);

        // Dropping back to half-full shrinks the capacity by half.
        vm.list_remove_at(list, 16);

        assert_eq!(list.count(), 16);
        assert_eq!(list.elements.capacity(), 16);
    }
}
