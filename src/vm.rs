use std::collections::HashMap;

use indexmap::IndexMap;
use wyhash2::WyHash;

use crate::error::CompileError;
use crate::gc::{Handle, Heap, ObjBody, ObjType};
use crate::runtime::class::Class;
use crate::runtime::error::Result;
use crate::runtime::fiber::Fiber;
use crate::runtime::function::Fn;
use crate::runtime::module::Module;
use crate::runtime::str::Str;
use crate::runtime::value::Value;
use crate::utils::SymbolTable;

/// Sink for text printed by the program.
pub type WriteFn = fn(text: &str);

/// Sink for compile and runtime error reporting. During stack-trace
/// reporting it receives one call per frame, innermost first, then the
/// message itself with an empty module name.
pub type ErrorFn = fn(module: &str, line: usize, message: &str);

/// Resolves an imported module name to its source.
pub type LoadModuleFn = fn(vm: &mut Vm, name: &str) -> Option<String>;

/// An embedder-implemented method. Arguments are read and the result is
/// returned through the foreign slot API.
pub type ForeignMethodFn = fn(vm: &mut Vm);

/// Locates the foreign method with [signature] on a class; consulted when the
/// registry has no entry.
pub type BindForeignMethodFn = fn(
    vm: &mut Vm,
    module: &str,
    class_name: &str,
    is_static: bool,
    signature: &str,
) -> Option<ForeignMethodFn>;

pub type FinalizerFn = fn(vm: &mut Vm);

/// The allocation and finalization hooks of a foreign class.
#[derive(Clone, Copy)]
pub struct ForeignClassMethods {
    pub allocate: ForeignMethodFn,
    pub finalize: Option<FinalizerFn>,
}

pub type BindForeignClassFn =
    fn(vm: &mut Vm, module: &str, class_name: &str) -> Option<ForeignClassMethods>;

/// The compiler seam: turns source into a function compiled against a
/// module. The lexer, parser and bytecode compiler live outside the core.
pub type CompileFn = fn(
    vm: &mut Vm,
    module: Handle<Module>,
    source: &str,
) -> std::result::Result<Handle<Fn>, CompileError>;

/// The interpreter seam: drives the VM's current fiber until it completes,
/// returning whether it finished without error. The bytecode dispatch loop
/// lives outside the core.
pub type RunFn = fn(vm: &mut Vm) -> bool;

#[derive(Clone)]
pub struct Config {
    pub load_module_fn: Option<LoadModuleFn>,
    pub bind_foreign_method_fn: Option<BindForeignMethodFn>,
    pub bind_foreign_class_fn: Option<BindForeignClassFn>,
    pub compile_fn: Option<CompileFn>,
    pub run_fn: Option<RunFn>,
    pub write_fn: WriteFn,
    pub error_fn: ErrorFn,

    /// Allocated bytes that trigger the first collection.
    pub initial_heap_size: usize,

    /// Floor for the collection threshold after any collection.
    pub min_heap_size: usize,

    /// How much larger than the live size the heap may grow before the next
    /// collection, as a percentage. 50 means collect once the heap is half
    /// again the live size.
    pub heap_growth_percent: usize,
}

fn default_write(text: &str) {
    print!("{text}");
}

fn default_error(module: &str, line: usize, message: &str) {
    if module.is_empty() {
        eprintln!("{message}");
    } else {
        eprintln!("[{module} line {line}] {message}");
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            load_module_fn: None,
            bind_foreign_method_fn: None,
            bind_foreign_class_fn: None,
            compile_fn: None,
            run_fn: None,
            write_fn: default_write,
            error_fn: default_error,
            initial_heap_size: 1024 * 1024 * 10,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
        }
    }
}

/// The classes every value can resolve through [Vm::class_of]. Their method
/// tables are populated by the (external) library bindings; the core only
/// builds the graph.
#[derive(Default, Clone, Copy)]
pub struct CoreClasses {
    pub object: Option<Handle<Class>>,
    pub class: Option<Handle<Class>>,
    pub bool_: Option<Handle<Class>>,
    pub num: Option<Handle<Class>>,
    pub null: Option<Handle<Class>>,
    pub string: Option<Handle<Class>>,
    pub list: Option<Handle<Class>>,
    pub map: Option<Handle<Class>>,
    pub range: Option<Handle<Class>>,
    pub fn_: Option<Handle<Class>>,
    pub fiber: Option<Handle<Class>>,
}

/// Outcome of [Vm::interpret].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

/// A pinned value: kept alive across collections until released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId(usize);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ForeignKey {
    module: String,
    class: String,
    signature: String,
    is_static: bool,
}

/// A virtual machine: the heap and every object reachable from it. Multiple
/// VMs may coexist in one process and share nothing.
pub struct Vm {
    pub(crate) heap: Heap,
    pub config: Config,
    pub classes: CoreClasses,

    /// The fiber currently running, if any.
    pub fiber: Option<Handle<Fiber>>,

    /// Every loaded module, keyed by name.
    modules: HashMap<String, Handle<Module>, WyHash>,

    /// The single global table of method selectors. Classes index their
    /// method tables with these symbols.
    method_names: SymbolTable,

    /// Values pinned by the embedder.
    handles: Vec<Option<Value>>,

    foreign_methods: IndexMap<ForeignKey, ForeignMethodFn, WyHash>,

    pub(crate) next_fiber_id: u16,

    /// During a foreign call, the stack offset of the argument window (the
    /// receiver is the first argument). Cleared once a result is returned.
    foreign_start: Option<usize>,
    foreign_num_args: usize,
}

impl Vm {
    pub fn new(config: Config) -> Result<Self> {
        let heap = Heap::new(
            config.initial_heap_size,
            config.min_heap_size,
            100 + config.heap_growth_percent,
        );

        let mut vm = Self {
            heap,
            config,
            classes: CoreClasses::default(),
            fiber: None,
            modules: HashMap::default(),
            method_names: SymbolTable::default(),
            handles: vec![],
            foreign_methods: IndexMap::default(),
            next_fiber_id: 0,
            foreign_start: None,
            foreign_num_args: 0,
        };

        vm.bootstrap()?;

        Ok(vm)
    }

    /// Builds the core class graph. Object has to come first and has no
    /// superclass; Class is a subclass of Object; Object's metaclass is a
    /// subclass of Class. The three are wired after the fact because each
    /// needs the others to exist.
    fn bootstrap(&mut self) -> Result<()> {
        let name = self.new_string("core")?;
        let core = self.new_module(name)?;
        self.modules.insert("core".to_string(), core);

        let object = self.define_class(core, "Object", 0)?;
        self.classes.object = Some(object);

        let class_class = self.define_class(core, "Class", 0)?;
        self.classes.class = Some(class_class);
        self.bind_superclass(class_class, object);

        let object_metaclass = self.define_class(core, "Object metaclass", 0)?;

        object.erase().set_class(Some(object_metaclass));
        object_metaclass.erase().set_class(Some(class_class));
        class_class.erase().set_class(Some(class_class));

        // After the wiring, so the metaclass can't be collected while its
        // methods are copied.
        self.bind_superclass(object_metaclass, class_class);

        self.classes.bool_ = Some(self.define_core_class(core, "Bool")?);
        self.classes.num = Some(self.define_core_class(core, "Num")?);
        self.classes.null = Some(self.define_core_class(core, "Null")?);
        self.classes.string = Some(self.define_core_class(core, "String")?);
        self.classes.list = Some(self.define_core_class(core, "List")?);
        self.classes.map = Some(self.define_core_class(core, "Map")?);
        self.classes.range = Some(self.define_core_class(core, "Range")?);
        self.classes.fn_ = Some(self.define_core_class(core, "Fn")?);
        self.classes.fiber = Some(self.define_core_class(core, "Fiber")?);

        // Strings allocated before the String class existed (class names and
        // the module name) have no class yet.
        let string = self.classes.string;
        for obj in self.heap.objects() {
            if obj.ty() == ObjType::Str && obj.class().is_none() {
                obj.set_class(string);
            }
        }

        Ok(())
    }

    /// Creates a bare class and defines it as a core-module variable.
    fn define_class(
        &mut self,
        module: Handle<Module>,
        name: &str,
        num_fields: usize,
    ) -> Result<Handle<Class>> {
        let name_string = self.new_string(name)?;

        self.heap.push_root(name_string.erase());

        let class = self.new_single_class(num_fields, name_string)?;
        self.define_variable(module, name, class.into())?;

        self.heap.pop_root();

        Ok(class)
    }

    /// Creates a full class (with metaclass) under Object and defines it as a
    /// core-module variable.
    fn define_core_class(&mut self, module: Handle<Module>, name: &str) -> Result<Handle<Class>> {
        let object = self.classes.object.expect("bootstrap order");
        let name_string = self.new_string(name)?;

        self.heap.push_root(name_string.erase());

        let class = self.new_class(object, 0, name_string)?;
        self.define_variable(module, name, class.into())?;

        self.heap.pop_root();

        Ok(class)
    }

    /// The class of [value]: the primitive-type classes for non-objects, the
    /// header's class for objects. None only for values that are never
    /// first-class (modules, upvalues, the undefined sentinel).
    pub fn class_of(&self, value: Value) -> Option<Handle<Class>> {
        if value.is_num() {
            return self.classes.num;
        }

        if let Some(obj) = value.try_obj() {
            return obj.class();
        }

        if value.is_bool() {
            return self.classes.bool_;
        }

        if value.is_null() {
            return self.classes.null;
        }

        None
    }

    /// Allocates a heap object. Any allocation may trigger a collection, so
    /// callers must have rooted every object they hold that isn't reachable
    /// otherwise.
    pub(crate) fn allocate<T: ObjBody>(
        &mut self,
        data: T,
        class: Option<Handle<Class>>,
    ) -> Result<Handle<T>> {
        self.heap.reserve(data.size_bytes());

        if self.heap.should_collect() {
            self.collect();
        }

        self.heap.alloc(data, class)
    }

    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect();
        }
    }

    /// Runs a full collection. The roots are the loaded modules, the current
    /// fiber, the pinned handles and the temporary roots.
    pub fn collect(&mut self) {
        let modules = &self.modules;
        let fiber = self.fiber;
        let handles = &self.handles;

        self.heap.collect(|heap| {
            for module in modules.values() {
                heap.gray_obj(module.erase());
            }

            if let Some(fiber) = fiber {
                heap.gray_obj(fiber.erase());
            }

            for value in handles.iter().flatten() {
                heap.gray_value(*value);
            }
        });
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Protects [value] from collection until the matching [Vm::pop_root].
    pub fn push_root(&mut self, value: Value) {
        self.heap.push_root_value(value);
    }

    pub fn pop_root(&mut self) {
        self.heap.pop_root();
    }

    /// Interns [name] in the global method symbol table.
    pub fn method_symbol(&mut self, name: &str) -> usize {
        self.method_names.ensure(name)
    }

    pub fn method_name(&self, symbol: usize) -> &str {
        self.method_names.name(symbol)
    }

    pub fn get_module(&self, name: &str) -> Option<Handle<Module>> {
        self.modules.get(name).copied()
    }

    /// Returns the module named [name], creating and registering it (with
    /// every core-module variable imported) on first use.
    pub fn load_module(&mut self, name: &str) -> Result<Handle<Module>> {
        if let Some(module) = self.get_module(name) {
            return Ok(module);
        }

        let name_string = self.new_string(name)?;
        let module = self.new_module(name_string)?;

        // The registry is a GC root, so the module is safe from here on.
        self.modules.insert(name.to_string(), module);

        if let Some(core) = self.get_module("core") {
            for symbol in 0..core.variable_names.count() {
                let variable = core.variable_names.name(symbol);
                let value = core.variables.as_slice()[symbol];

                self.define_variable(module, variable, value)?;
            }
        }

        Ok(module)
    }

    /// Looks up a top-level variable in a loaded module, for imports.
    pub fn import_variable(&self, module: &str, variable: &str) -> Option<Value> {
        let module = self.get_module(module)?;
        self.find_variable(module, variable)
    }

    /// Loads the source of [name] through the embedder's resolver.
    pub fn load_module_source(&mut self, name: &str) -> Option<String> {
        let load = self.config.load_module_fn?;
        load(self, name)
    }

    /// Compiles and runs [source] in the module named [module_name], driving
    /// the compiler and interpreter seams from the configuration.
    pub fn interpret(&mut self, module_name: &str, source: &str) -> InterpretResult {
        let error_fn = self.config.error_fn;

        let Some(compile) = self.config.compile_fn else {
            error_fn(module_name, 0, "no compiler attached to this VM");
            return InterpretResult::CompileError;
        };

        let module = match self.load_module(module_name) {
            Ok(module) => module,
            Err(err) => {
                error_fn(module_name, 0, &err.to_string());
                return InterpretResult::RuntimeError;
            }
        };

        let fn_ = match compile(self, module, source) {
            Ok(fn_) => fn_,
            Err(err) => {
                error_fn(module_name, err.line, &err.message);
                return InterpretResult::CompileError;
            }
        };

        self.heap.push_root(fn_.erase());
        let fiber = self.new_fiber(fn_.erase());
        self.heap.pop_root();

        let fiber = match fiber {
            Ok(fiber) => fiber,
            Err(err) => {
                error_fn(module_name, 0, &err.to_string());
                return InterpretResult::RuntimeError;
            }
        };

        self.fiber = Some(fiber);

        let run_fn = self.config.run_fn;
        match run_fn {
            Some(run) if !run(self) => InterpretResult::RuntimeError,
            _ => InterpretResult::Success,
        }
    }

    /// Prints [text] through the configured sink.
    pub fn write(&self, text: &str) {
        (self.config.write_fn)(text);
    }

    /// Pins [value] so it survives collections across embedder calls.
    pub fn make_handle(&mut self, value: Value) -> HandleId {
        match self.handles.iter().position(|slot| slot.is_none()) {
            Some(index) => {
                self.handles[index] = Some(value);
                HandleId(index)
            }
            None => {
                self.handles.push(Some(value));
                HandleId(self.handles.len() - 1)
            }
        }
    }

    pub fn handle_value(&self, handle: HandleId) -> Value {
        self.handles[handle.0].expect("handle has been released")
    }

    pub fn release_handle(&mut self, handle: HandleId) {
        self.handles[handle.0] = None;
    }

    /// Registers an embedder method for `module.class.signature`.
    pub fn register_foreign(
        &mut self,
        module: &str,
        class: &str,
        signature: &str,
        is_static: bool,
        method: ForeignMethodFn,
    ) {
        let key = ForeignKey {
            module: module.to_string(),
            class: class.to_string(),
            signature: signature.to_string(),
            is_static,
        };

        self.foreign_methods.insert(key, method);
    }

    /// Finds a foreign method: the registry first, then the configured
    /// binder.
    pub fn find_foreign_method(
        &mut self,
        module: &str,
        class_name: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<ForeignMethodFn> {
        let key = ForeignKey {
            module: module.to_string(),
            class: class_name.to_string(),
            signature: signature.to_string(),
            is_static,
        };

        if let Some(method) = self.foreign_methods.get(&key) {
            return Some(*method);
        }

        let bind = self.config.bind_foreign_method_fn?;
        bind(self, module, class_name, is_static, signature)
    }

    /// Finds the allocate/finalize hooks of a foreign class through the
    /// configured binder.
    pub fn find_foreign_class(
        &mut self,
        module: &str,
        class_name: &str,
    ) -> Option<ForeignClassMethods> {
        let bind = self.config.bind_foreign_class_fn?;
        bind(self, module, class_name)
    }

    /// Invokes [foreign] with the top [num_args] stack slots of the current
    /// fiber as its argument window. Afterwards the arguments are replaced by
    /// the returned value (null when nothing was returned).
    pub fn call_foreign(&mut self, foreign: ForeignMethodFn, num_args: usize) {
        // Every method call has at least the receiver argument.
        assert!(num_args > 0, "foreign call without a receiver");

        let mut fiber = self.fiber.expect("foreign call without a fiber");
        let start = fiber.stack.len() - num_args;

        self.foreign_start = Some(start);
        self.foreign_num_args = num_args;

        foreign(self);

        // Discard the argument slots, leaving one for the result.
        fiber.stack.truncate(start + 1);

        // If nothing was returned, implicitly return null.
        if self.foreign_start.take().is_some() {
            fiber.stack[start] = Value::NULL;
        }
    }

    pub fn foreign_arg_count(&self) -> usize {
        self.foreign_num_args
    }

    /// The argument at [index] of the current foreign call; the receiver is
    /// argument 0.
    pub fn foreign_arg(&self, index: usize) -> Value {
        let start = self.foreign_start.expect("must be in a foreign call");
        assert!(index < self.foreign_num_args, "not that many arguments");

        let fiber = self.fiber.expect("foreign call without a fiber");
        fiber.stack[start + index]
    }

    pub fn foreign_get_num(&self, index: usize) -> f64 {
        let value = self.foreign_arg(index);

        if value.is_num() {
            value.as_num()
        } else {
            0.0
        }
    }

    pub fn foreign_get_bool(&self, index: usize) -> bool {
        let value = self.foreign_arg(index);

        value.is_bool() && value.as_bool()
    }

    pub fn foreign_get_string(&self, index: usize) -> Option<Handle<Str>> {
        self.foreign_arg(index).as_obj_of::<Str>()
    }

    /// Returns [value] from the current foreign call.
    pub fn foreign_return(&mut self, value: Value) {
        let start = self.foreign_start.take().expect("must be in a foreign call");
        let mut fiber = self.fiber.expect("foreign call without a fiber");

        fiber.stack[start] = value;
    }

    pub fn foreign_return_num(&mut self, value: f64) {
        self.foreign_return(Value::num(value));
    }

    pub fn foreign_return_bool(&mut self, value: bool) {
        self.foreign_return(value.into());
    }

    pub fn foreign_return_string(&mut self, text: &str) -> Result<()> {
        let string = self.new_string(text)?;
        self.foreign_return(string.into());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::value::Value;

    use super::*;

    #[test]
    fn test_bootstrap_class_graph() {
        let vm = Vm::new(Config::default()).unwrap();

        let object = vm.classes.object.unwrap();
        let class = vm.classes.class.unwrap();

        // Object ==> Object metaclass ==> Class ==> Class (itself).
        let object_metaclass = object.erase().class().unwrap();

        assert_eq!(object_metaclass.name.as_str(), "Object metaclass");
        assert_eq!(object_metaclass.erase().class(), Some(class));
        assert_eq!(class.erase().class(), Some(class));

        assert_eq!(class.superclass, Some(object));
        assert_eq!(object_metaclass.superclass, Some(class));
        assert!(object.superclass.is_none());
    }

    #[test]
    fn test_core_classes_are_module_variables() {
        let vm = Vm::new(Config::default()).unwrap();
        let core = vm.get_module("core").unwrap();

        for name in ["Object", "Class", "Bool", "Num", "String", "List", "Map"] {
            let value = vm.find_variable(core, name).unwrap();
            assert!(value.is_obj_of(ObjType::Class), "{name}");
        }
    }

    #[test]
    fn test_class_of_primitives() {
        let mut vm = Vm::new(Config::default()).unwrap();

        assert_eq!(vm.class_of(Value::num(1.0)), vm.classes.num);
        assert_eq!(vm.class_of(Value::TRUE), vm.classes.bool_);
        assert_eq!(vm.class_of(Value::FALSE), vm.classes.bool_);
        assert_eq!(vm.class_of(Value::NULL), vm.classes.null);

        let string = vm.new_string("hi").unwrap();
        assert_eq!(vm.class_of(string.into()), vm.classes.string);

        let list = vm.new_list(0).unwrap();
        assert_eq!(vm.class_of(list.into()), vm.classes.list);
    }

    #[test]
    fn test_load_module_imports_core() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let module = vm.load_module("main").unwrap();

        // Core variables are copied into every new module.
        assert!(vm.find_variable(module, "Object").is_some());
        assert!(vm.find_variable(module, "String").is_some());

        // Loading again returns the same module.
        assert_eq!(vm.load_module("main").unwrap(), module);
    }

    #[test]
    fn test_interpret_without_compiler() {
        let mut vm = Vm::new(Config::default()).unwrap();

        assert_eq!(
            vm.interpret("main", "1 + 1"),
            InterpretResult::CompileError
        );
    }

    #[test]
    fn test_interpret_with_stub_compiler() {
        fn compile(
            vm: &mut Vm,
            module: Handle<Module>,
            _source: &str,
        ) -> std::result::Result<Handle<Fn>, CompileError> {
            vm.new_function(
                module,
                &[],
                0,
                0,
                bytes::Bytes::new(),
                vec![],
                None,
                "(script)",
            )
            .map_err(|err| CompileError::new(err.to_string(), 0))
        }

        fn run(vm: &mut Vm) -> bool {
            // Pretend the fiber ran to completion.
            vm.fiber.is_some()
        }

        let mut vm = Vm::new(Config {
            compile_fn: Some(compile),
            run_fn: Some(run),
            ..Config::default()
        })
        .unwrap();

        assert_eq!(vm.interpret("main", ""), InterpretResult::Success);
        assert!(vm.fiber.is_some());
    }

    #[test]
    fn test_method_symbols_are_global() {
        let mut vm = Vm::new(Config::default()).unwrap();

        let a = vm.method_symbol("count");
        let b = vm.method_symbol("add(_)");

        assert_ne!(a, b);
        assert_eq!(vm.method_symbol("count"), a);
        assert_eq!(vm.method_name(b), "add(_)");
    }

    #[test]
    fn test_handles_pin_values() {
        let mut vm = Vm::new(Config::default()).unwrap();

        let string = vm.new_string("pinned").unwrap();
        let handle = vm.make_handle(string.into());

        vm.collect();
        vm.collect();

        let value = vm.handle_value(handle);
        assert_eq!(value.as_obj_of::<Str>().unwrap().as_str(), "pinned");

        vm.release_handle(handle);
    }

    #[test]
    fn test_foreign_registry() {
        fn method(_vm: &mut Vm) {}

        let mut vm = Vm::new(Config::default()).unwrap();

        vm.register_foreign("main", "Point", "length", false, method);

        assert!(vm
            .find_foreign_method("main", "Point", false, "length")
            .is_some());
        assert!(vm
            .find_foreign_method("main", "Point", true, "length")
            .is_none());
        assert!(vm
            .find_foreign_method("main", "Point", false, "size")
            .is_none());
    }

    #[test]
    fn test_foreign_call_slots() {
        fn add(vm: &mut Vm) {
            let result = vm.foreign_get_num(1) + vm.foreign_get_num(2);
            vm.foreign_return_num(result);
        }

        fn silent(_vm: &mut Vm) {}

        let mut vm = Vm::new(Config::default()).unwrap();
        let module = vm.get_module("core").unwrap();
        let fn_ = vm
            .new_function(module, &[], 0, 0, bytes::Bytes::new(), vec![], None, "f")
            .unwrap();
        let mut fiber = vm.new_fiber(fn_.erase()).unwrap();

        fiber.push(Value::NULL);
        fiber.push(Value::num(2.0));
        fiber.push(Value::num(3.0));
        vm.fiber = Some(fiber);

        vm.call_foreign(add, 3);

        assert_eq!(fiber.stack.len(), 1);
        assert_eq!(fiber.peek().as_num(), 5.0);

        // A foreign method that returns nothing yields null.
        fiber.push(Value::num(9.0));
        vm.call_foreign(silent, 1);

        assert!(fiber.peek().is_null());
    }
}
