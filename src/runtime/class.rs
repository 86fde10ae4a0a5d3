use std::fmt::{self, Debug, Formatter};
use std::mem;

use crate::buffer::Buffer;
use crate::gc::{Cell, Handle, Heap, ObjBody, ObjType, RawObj};
use crate::vm::{ForeignMethodFn, Vm};

use super::error::Result;
use super::str::{FormatArg, Str};
use super::value::Value;

/// What a primitive method tells the interpreter loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveResult {
    /// The result value is in the first argument slot.
    Value,
    /// The first argument slot holds an error to raise.
    Error,
    /// The first argument slot holds a function to push onto the callstack.
    Call,
    /// The first argument slot holds a fiber to switch to (or null to stop).
    RunFiber,
}

/// A built-in method: receives the VM and the stack offset of its argument
/// window (the receiver is the first argument).
pub type PrimitiveFn = fn(&mut Vm, args_start: usize) -> PrimitiveResult;

/// One entry in a class's method table, indexed by the VM-global method
/// symbol.
#[derive(Clone, Copy)]
pub enum Method {
    /// No method bound at this symbol.
    None,
    /// A built-in implemented in the host language.
    Primitive(PrimitiveFn),
    /// An embedder-supplied method.
    Foreign(ForeignMethodFn),
    /// A method compiled from source: an Fn or a Closure.
    Block(RawObj),
    /// Reads the instance field at the index.
    FieldGetter(usize),
    /// Writes the instance field at the index.
    FieldSetter(usize),
}

impl Debug for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Method::None => write!(f, "None"),
            Method::Primitive(_) => write!(f, "Primitive"),
            Method::Foreign(_) => write!(f, "Foreign"),
            Method::Block(_) => write!(f, "Block"),
            Method::FieldGetter(index) => write!(f, "FieldGetter({index})"),
            Method::FieldSetter(index) => write!(f, "FieldSetter({index})"),
        }
    }
}

/// A class: its method table, field count, superclass and name. Every class
/// also has a metaclass (reached through the object header) whose sole
/// instance is the class itself.
pub struct Class {
    pub superclass: Option<Handle<Class>>,

    /// The number of fields of an instance, including superclass fields.
    pub num_fields: usize,

    pub name: Handle<Str>,

    /// Dense table indexed by method symbol; unbound symbols hold
    /// [Method::None] so indices line up across every class.
    pub methods: Buffer<Method>,
}

impl Class {
    pub fn method(&self, symbol: usize) -> Method {
        self.methods.get(symbol).copied().unwrap_or(Method::None)
    }
}

impl ObjBody for Class {
    const TY: ObjType = ObjType::Class;

    fn trace(&self, heap: &mut Heap) {
        // The metaclass is grayed through the header by the collector.
        if let Some(superclass) = self.superclass {
            heap.gray_obj(superclass.erase());
        }

        for method in self.methods.iter() {
            if let Method::Block(obj) = method {
                heap.gray_obj(*obj);
            }
        }

        heap.gray_obj(self.name.erase());
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Class>>() + self.methods.capacity() * mem::size_of::<Method>()
    }
}

impl Debug for Class {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.name.as_str())
    }
}

/// A user-defined object: its class lives in the header, its fields here.
pub struct Instance {
    fields: Box<[Value]>,
}

impl Instance {
    pub fn field(&self, index: usize) -> Value {
        self.fields[index]
    }

    pub fn set_field(&mut self, index: usize, value: Value) {
        self.fields[index] = value;
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }
}

impl ObjBody for Instance {
    const TY: ObjType = ObjType::Instance;

    fn trace(&self, heap: &mut Heap) {
        // The class is grayed through the header by the collector.
        for field in self.fields.iter() {
            heap.gray_value(*field);
        }
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Instance>>() + self.fields.len() * mem::size_of::<Value>()
    }
}

impl Debug for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Instance({} fields)", self.fields.len())
    }
}

impl Vm {
    /// Creates a bare class with no superclass and no metaclass wiring. Only
    /// the bootstrap and [Vm::new_class] should need this.
    pub fn new_single_class(
        &mut self,
        num_fields: usize,
        name: Handle<Str>,
    ) -> Result<Handle<Class>> {
        let class_class = self.classes.class;

        self.heap.push_root(name.erase());

        let class = self.allocate(
            Class {
                superclass: None,
                num_fields,
                name,
                methods: Buffer::new(),
            },
            class_class,
        );

        self.heap.pop_root();

        class
    }

    /// Binds [method] at [symbol], padding the table with [Method::None] so
    /// the symbol indices stay stable.
    pub fn bind_method(&mut self, mut class: Handle<Class>, symbol: usize, method: Method) {
        if symbol >= class.methods.count() {
            let missing = symbol - class.methods.count() + 1;
            class.methods.fill(&mut self.heap, Method::None, missing);
        }

        class.methods.set(symbol, method);
    }

    /// Makes [superclass] the superclass of [subclass]: the field counts are
    /// combined and every method is copied over by symbol index. Inheritance
    /// is this initial copy; later bindings on the subclass overwrite their
    /// slots without consulting the superclass again.
    pub fn bind_superclass(&mut self, mut subclass: Handle<Class>, superclass: Handle<Class>) {
        subclass.superclass = Some(superclass);
        subclass.num_fields += superclass.num_fields;

        for symbol in 0..superclass.methods.count() {
            self.bind_method(subclass, symbol, superclass.method(symbol));
        }
    }

    /// Creates a class named [name] inheriting [superclass], along with its
    /// metaclass. The metaclass has no fields, inherits the root Class, and
    /// has the class as its sole instance.
    pub fn new_class(
        &mut self,
        superclass: Handle<Class>,
        num_fields: usize,
        name: Handle<Str>,
    ) -> Result<Handle<Class>> {
        self.heap.push_root(name.erase());

        let metaclass_name = self.string_format("@ metaclass", &[FormatArg::Str(name)])?;
        self.heap.push_root(metaclass_name.erase());

        let metaclass = self.new_single_class(0, metaclass_name)?;
        metaclass.erase().set_class(self.classes.class);

        self.heap.pop_root();

        // Hold on to the metaclass while the class itself is allocated.
        self.heap.push_root(metaclass.erase());

        // Metaclasses always inherit Class and do not parallel the
        // non-metaclass hierarchy.
        if let Some(class_class) = self.classes.class {
            self.bind_superclass(metaclass, class_class);
        }

        let class = self.new_single_class(num_fields, name)?;

        self.heap.push_root(class.erase());

        class.erase().set_class(Some(metaclass));
        self.bind_superclass(class, superclass);

        self.heap.pop_root();
        self.heap.pop_root();
        self.heap.pop_root();

        Ok(class)
    }

    /// Creates an instance of [class] with every field set to null.
    pub fn new_instance(&mut self, class: Handle<Class>) -> Result<Handle<Instance>> {
        let fields = vec![Value::NULL; class.num_fields].into_boxed_slice();

        self.allocate(Instance { fields }, Some(class))
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::{Config, Vm};

    use super::*;

    #[test]
    fn test_metaclass_wiring() {
        let mut vm = Vm::new(Config::default()).unwrap();

        let name = vm.new_string("Point").unwrap();
        let object = vm.classes.object.unwrap();
        let class = vm.new_class(object, 2, name).unwrap();

        let metaclass = class.erase().class().unwrap();

        assert_eq!(metaclass.name.as_str(), "Point metaclass");
        assert_eq!(metaclass.num_fields, 0);

        // The metaclass inherits the root Class; its own class is Class too.
        let class_class = vm.classes.class.unwrap();

        assert_eq!(metaclass.superclass, Some(class_class));
        assert_eq!(metaclass.erase().class(), Some(class_class));
    }

    #[test]
    fn test_field_count_includes_superclass() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let object = vm.classes.object.unwrap();

        let base_name = vm.new_string("Base").unwrap();
        let base = vm.new_class(object, 2, base_name).unwrap();

        let derived_name = vm.new_string("Derived").unwrap();
        let derived = vm.new_class(base, 3, derived_name).unwrap();

        assert_eq!(base.num_fields, 2);
        assert_eq!(derived.num_fields, 5);
    }

    #[test]
    fn test_method_inheritance_is_a_copy() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let object = vm.classes.object.unwrap();

        fn stub(_vm: &mut Vm, _args: usize) -> PrimitiveResult {
            PrimitiveResult::Value
        }

        let base_name = vm.new_string("Base").unwrap();
        let base = vm.new_class(object, 0, base_name).unwrap();

        let symbol = vm.method_symbol("size");
        vm.bind_method(base, symbol, Method::Primitive(stub));

        let derived_name = vm.new_string("Derived").unwrap();
        let derived = vm.new_class(base, 0, derived_name).unwrap();

        assert!(matches!(derived.method(symbol), Method::Primitive(_)));

        // Binding a method later on the superclass does not affect the
        // subclass: inheritance copied the table once, at bind time.
        let late = vm.method_symbol("late");
        vm.bind_method(base, late, Method::Primitive(stub));

        assert!(matches!(derived.method(late), Method::None));
    }

    #[test]
    fn test_method_table_padding() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let object = vm.classes.object.unwrap();

        let name = vm.new_string("Sparse").unwrap();
        let class = vm.new_class(object, 0, name).unwrap();

        vm.bind_method(class, 9, Method::FieldGetter(0));

        assert_eq!(class.methods.count(), 10);
        assert!(matches!(class.method(9), Method::FieldGetter(0)));
        assert!(matches!(class.method(3), Method::None));
        assert!(matches!(class.method(42), Method::None));
    }

    #[test]
    fn test_instance_fields() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let object = vm.classes.object.unwrap();

        let name = vm.new_string("Pair").unwrap();
        let class = vm.new_class(object, 2, name).unwrap();
        let mut instance = vm.new_instance(class).unwrap();

        assert_eq!(instance.num_fields(), 2);
        assert!(instance.field(0).is_null());

        instance.set_field(1, Value::num(9.0));

        assert_eq!(instance.field(1).as_num(), 9.0);
        assert_eq!(vm.class_of(instance.into()), Some(class));
    }
}
