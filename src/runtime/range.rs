use std::fmt::{self, Debug, Formatter};
use std::mem;

use crate::gc::{Cell, Handle, Heap, ObjBody, ObjType};
use crate::vm::Vm;

use super::error::Result;

/// An immutable numeric interval.
pub struct Range {
    pub from: f64,
    pub to: f64,
    pub is_inclusive: bool,
}

impl Range {
    pub fn new(from: f64, to: f64, is_inclusive: bool) -> Self {
        Self {
            from,
            to,
            is_inclusive,
        }
    }
}

impl ObjBody for Range {
    const TY: ObjType = ObjType::Range;

    fn trace(&self, _heap: &mut Heap) {}

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Range>>()
    }
}

impl Debug for Range {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.from,
            if self.is_inclusive { ".." } else { "..." },
            self.to
        )
    }
}

impl Vm {
    pub fn new_range(&mut self, from: f64, to: f64, is_inclusive: bool) -> Result<Handle<Range>> {
        let class = self.classes.range;
        self.allocate(Range::new(from, to, is_inclusive), class)
    }
}
