// SPDX-License-Identifier: BSD-3-Clause
//! The program representation the builder walks. The parser that produces
//! it is an external collaborator; this module only fixes the shape the
//! analysis needs: functions of basic blocks of typed instructions, every
//! value carrying a stable identity usable as a map key, and byte sizes
//! already computed at the boundary (the walker owns the data layout).
//!
//! Values live in one arena, so instructions, arguments, globals, function
//! references, and integer constants are all [`ValueId`]s.

use std::collections::HashMap;

/// Stable identity of any value in a [`Module`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ValueId(u32);

/// Index of a function in a [`Module`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FunctionId(u32);

/// Classification of compiler intrinsics. Only the memory-transfer family
/// and `va_start` are modeled; debug intrinsics are skipped entirely.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Intrinsic {
    Memcpy,
    Memmove,
    Memset,
    VaStart,
    Dbg,
    Other,
}

/// Instruction opcodes. Sizes are in bytes, `0` meaning statically
/// unknown, following the convention of the data-layout queries that
/// produce them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Opcode {
    Alloca {
        size: u64,
    },
    Store {
        value: ValueId,
        pointer: ValueId,
        size: u64,
    },
    Load {
        pointer: ValueId,
        size: u64,
    },
    Ret,
    Call {
        callee: ValueId,
        args: Vec<ValueId>,
        is_asm: bool,
    },
    /// Anything without reaching-definitions relevance.
    Other,
}

#[derive(Clone, Debug)]
pub enum Value {
    Instruction {
        function: FunctionId,
        opcode: Opcode,
    },
    Argument {
        function: FunctionId,
        index: usize,
    },
    Global {
        name: String,
        constant: bool,
    },
    Function(FunctionId),
    ConstantInt {
        bits: u32,
        value: u64,
    },
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub instrs: Vec<ValueId>,
    /// CFG successor blocks, by index within the owning function.
    pub succs: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueId>,
    pub blocks: Vec<Block>,
    pub varargs: bool,
    pub intrinsic: Option<Intrinsic>,
}

impl Function {
    /// A function with no blocks is external: a declaration, an intrinsic,
    /// or a modeled library routine.
    pub fn is_defined(&self) -> bool {
        !self.blocks.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Module {
    values: Vec<Value>,
    functions: Vec<Function>,
    function_values: Vec<ValueId>,
    globals: Vec<ValueId>,
    constants: HashMap<(u32, u64), ValueId>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    fn push_value(&mut self, v: Value) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(v);
        id
    }

    // ------------------------------------------------------------------
    // Construction (driven by the external walker, and by tests)

    pub fn add_function(&mut self, name: &str) -> FunctionId {
        let f = FunctionId(self.functions.len() as u32);
        self.functions.push(Function {
            name: name.to_string(),
            params: Vec::new(),
            blocks: Vec::new(),
            varargs: false,
            intrinsic: None,
        });
        let v = self.push_value(Value::Function(f));
        self.function_values.push(v);
        f
    }

    pub fn set_intrinsic(&mut self, f: FunctionId, intrinsic: Intrinsic) {
        self.functions[f.0 as usize].intrinsic = Some(intrinsic);
    }

    pub fn set_varargs(&mut self, f: FunctionId) {
        self.functions[f.0 as usize].varargs = true;
    }

    pub fn add_param(&mut self, f: FunctionId) -> ValueId {
        let index = self.functions[f.0 as usize].params.len();
        let v = self.push_value(Value::Argument { function: f, index });
        self.functions[f.0 as usize].params.push(v);
        v
    }

    pub fn add_block(&mut self, f: FunctionId) -> usize {
        let func = &mut self.functions[f.0 as usize];
        func.blocks.push(Block::default());
        func.blocks.len() - 1
    }

    pub fn set_successors(&mut self, f: FunctionId, block: usize, succs: Vec<usize>) {
        self.functions[f.0 as usize].blocks[block].succs = succs;
    }

    /// Append an instruction to a block and return its identity.
    pub fn push(&mut self, f: FunctionId, block: usize, opcode: Opcode) -> ValueId {
        let v = self.push_value(Value::Instruction {
            function: f,
            opcode,
        });
        self.functions[f.0 as usize].blocks[block].instrs.push(v);
        v
    }

    /// Integer constants are interned: the same `(bits, value)` pair is
    /// the same identity.
    pub fn constant(&mut self, bits: u32, value: u64) -> ValueId {
        if let Some(id) = self.constants.get(&(bits, value)) {
            return *id;
        }
        let id = self.push_value(Value::ConstantInt { bits, value });
        self.constants.insert((bits, value), id);
        id
    }

    pub fn add_global(&mut self, name: &str, constant: bool) -> ValueId {
        let v = self.push_value(Value::Global {
            name: name.to_string(),
            constant,
        });
        self.globals.push(v);
        v
    }

    // ------------------------------------------------------------------
    // Access

    pub fn value(&self, v: ValueId) -> &Value {
        &self.values[v.0 as usize]
    }

    pub fn function(&self, f: FunctionId) -> &Function {
        &self.functions[f.0 as usize]
    }

    pub fn function_value(&self, f: FunctionId) -> ValueId {
        self.function_values[f.0 as usize]
    }

    pub fn functions(&self) -> impl Iterator<Item = FunctionId> {
        (0..self.functions.len()).map(|i| FunctionId(i as u32))
    }

    pub fn globals(&self) -> &[ValueId] {
        &self.globals
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunctionId(i as u32))
    }

    /// The constant-integer value of `v`, if it is one.
    pub fn constant_value(&self, v: ValueId) -> Option<u64> {
        match self.value(v) {
            Value::ConstantInt { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Coarse call compatibility: the argument count must cover the
    /// parameters exactly, or at least cover them for varargs callees.
    pub fn call_compatible(&self, f: FunctionId, nargs: usize) -> bool {
        let func = self.function(f);
        if func.varargs {
            nargs >= func.params.len()
        } else {
            nargs == func.params.len()
        }
    }

    /// Stack allocations of `f` whose address never escapes: no store has
    /// the alloca as its *value* operand. These cannot be used outside the
    /// function, so a return may mask their definitions.
    pub fn non_address_taken_allocas(&self, f: FunctionId) -> Vec<ValueId> {
        let func = self.function(f);
        let mut allocas = Vec::new();
        for block in &func.blocks {
            for &inst in &block.instrs {
                if let Value::Instruction {
                    opcode: Opcode::Alloca { .. },
                    ..
                } = self.value(inst)
                {
                    allocas.push(inst);
                }
            }
        }
        allocas.retain(|&a| {
            for block in &func.blocks {
                for &inst in &block.instrs {
                    if let Value::Instruction {
                        opcode: Opcode::Store { value, .. },
                        ..
                    } = self.value(inst)
                    {
                        if *value == a {
                            return false;
                        }
                    }
                }
            }
            true
        });
        allocas
    }
}
