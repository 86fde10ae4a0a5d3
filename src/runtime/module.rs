use std::fmt::{self, Debug, Formatter};
use std::mem;

use crate::buffer::Buffer;
use crate::gc::{Cell, Handle, Heap, ObjBody, ObjType};
use crate::utils::SymbolTable;
use crate::vm::Vm;

use super::error::{ErrorKind, Result};
use super::str::Str;
use super::value::Value;

/// Ceiling on the number of top-level variables in one module.
pub const MAX_MODULE_VARS: usize = 65536;

/// A module: its name plus the parallel arrays of top-level variable names
/// and values. A slot that has been referenced but not yet defined holds a
/// number (the line of the forward reference) so the compiler can report it
/// if the definition never arrives.
pub struct Module {
    pub name: Handle<Str>,
    pub variable_names: SymbolTable,
    pub variables: Buffer<Value>,
}

impl Module {
    fn new(name: Handle<Str>) -> Self {
        Self {
            name,
            variable_names: SymbolTable::default(),
            variables: Buffer::new(),
        }
    }
}

impl ObjBody for Module {
    const TY: ObjType = ObjType::Module;

    fn trace(&self, heap: &mut Heap) {
        for variable in self.variables.iter() {
            heap.gray_value(*variable);
        }

        heap.gray_obj(self.name.erase());
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Module>>() + self.variables.capacity() * mem::size_of::<Value>()
    }
}

impl Debug for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Module({})", self.name.as_str())
    }
}

impl Vm {
    /// Creates a module. Modules are never first-class values, so they carry
    /// no class.
    pub fn new_module(&mut self, name: Handle<Str>) -> Result<Handle<Module>> {
        self.heap.push_root(name.erase());
        let module = self.allocate(Module::new(name), None);
        self.heap.pop_root();

        module
    }

    /// Declares a forward-referenced top-level variable seen on [line],
    /// returning its symbol. The slot holds the line number until the
    /// definition arrives.
    pub fn declare_variable(
        &mut self,
        mut module: Handle<Module>,
        name: &str,
        line: usize,
    ) -> Result<usize> {
        if module.variables.count() == MAX_MODULE_VARS {
            return Err(ErrorKind::TooManyVariables.into());
        }

        module.variables.write(&mut self.heap, Value::num(line as f64));

        Ok(module.variable_names.add(name))
    }

    /// Defines a top-level variable. Returns its symbol, or None when the
    /// variable is already explicitly defined. Defining a forward-declared
    /// variable (whose slot still holds its line number) resolves it.
    pub fn define_variable(
        &mut self,
        mut module: Handle<Module>,
        name: &str,
        value: Value,
    ) -> Result<Option<usize>> {
        if module.variables.count() == MAX_MODULE_VARS {
            return Err(ErrorKind::TooManyVariables.into());
        }

        self.heap.push_root_value(value);

        let symbol = match module.variable_names.find(name) {
            None => {
                // Brand new variable.
                let symbol = module.variable_names.add(name);
                module.variables.write(&mut self.heap, value);
                self.maybe_collect();

                Some(symbol)
            }
            // Explicitly defining an implicitly declared one.
            Some(symbol) if module.variables.as_slice()[symbol].is_num() => {
                module.variables.set(symbol, value);

                Some(symbol)
            }
            Some(_) => None,
        };

        self.heap.pop_root();

        Ok(symbol)
    }

    /// The value of the top-level variable [name], or None when it has never
    /// been declared.
    pub fn find_variable(&self, module: Handle<Module>, name: &str) -> Option<Value> {
        let symbol = module.variable_names.find(name)?;

        Some(module.variables.as_slice()[symbol])
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::{Config, Vm};

    use super::*;

    #[test]
    fn test_define_and_find() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let module = vm.get_module("core").unwrap();

        let symbol = vm.define_variable(module, "answer", Value::num(42.0)).unwrap();

        assert!(symbol.is_some());
        assert_eq!(vm.find_variable(module, "answer").unwrap().as_num(), 42.0);
        assert!(vm.find_variable(module, "missing").is_none());
    }

    #[test]
    fn test_redefinition_is_rejected() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let module = vm.get_module("core").unwrap();

        vm.define_variable(module, "x", Value::TRUE).unwrap();
        let second = vm.define_variable(module, "x", Value::FALSE).unwrap();

        assert_eq!(second, None);
        assert!(vm.find_variable(module, "x").unwrap().is_true());
    }

    #[test]
    fn test_forward_declaration() {
        let mut vm = Vm::new(Config::default()).unwrap();
        let module = vm.get_module("core").unwrap();

        let declared = vm.declare_variable(module, "later", 7).unwrap();

        // The slot holds the line of the forward reference.
        assert_eq!(vm.find_variable(module, "later").unwrap().as_num(), 7.0);

        let defined = vm.define_variable(module, "later", Value::TRUE).unwrap();

        assert_eq!(defined, Some(declared));
        assert!(vm.find_variable(module, "later").unwrap().is_true());
    }
}
