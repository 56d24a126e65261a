//! The persistent bytecode container.
//!
//! Byte-for-byte layout, little-endian for multi-byte numerics, strings
//! length-prefixed UTF-8:
//!
//! ```text
//! magic         : length-prefixed ASCII "UABC"
//! version       : u16  (current = 1)
//! constCount    : u32
//! constants[]   : 1-byte tag, then the payload
//!                  0=none  1=int (f64)  2=float (f64)
//!                  3=string  4=bool (u8)  5=function  6=class
//! globalCount   : u32, then length-prefixed names
//! funcCount     : u32, then functions
//! mainLen       : u32, then instructions
//! ```
//!
//! Every instruction is a fixed five bytes: opcode plus a `u32` operand,
//! serialized as zero when unused. Deserialization validates the magic,
//! version, constant tags, and opcode bytes; every violation is a
//! [`Error::Link`].

use std::rc::Rc;

use crate::bytecode::{CompiledFunction, Module, Op, UpvalueDescriptor};
use crate::error::{Error, Result};
use crate::value::{ClassValue, Value};

const MAGIC: &str = "UABC";
const VERSION: u16 = 1;

const TAG_NONE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_FUNCTION: u8 = 5;
const TAG_CLASS: u8 = 6;

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Serialize a module. Fails when a constant is not representable in the
/// container (only primitives, functions, and classes are).
pub fn write_module(module: &Module) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_string(&mut out, MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());

    write_u32(&mut out, module.constants.len() as u32);
    for constant in &module.constants {
        write_constant(&mut out, constant)?;
    }

    write_u32(&mut out, module.globals.len() as u32);
    for name in &module.globals {
        write_string(&mut out, name);
    }

    write_u32(&mut out, module.functions.len() as u32);
    for function in &module.functions {
        write_function(&mut out, function);
    }

    write_code(&mut out, &module.main_code);
    Ok(out)
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

fn write_constant(out: &mut Vec<u8>, constant: &Value) -> Result<()> {
    match constant {
        Value::None => out.push(TAG_NONE),
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&(*i as f64).to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STRING);
            write_string(out, s);
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Function(function) => {
            out.push(TAG_FUNCTION);
            write_function(out, function);
        }
        Value::Class(class) => {
            out.push(TAG_CLASS);
            write_string(out, &class.name);
            write_u32(out, class.fields.len() as u32);
            for field in &class.fields {
                write_string(out, field);
            }
            write_u32(out, class.methods.len() as u32);
            for (name, method) in &class.methods {
                write_string(out, name);
                write_function(out, method);
            }
        }
        other => {
            return Err(Error::Link(format!(
                "constant of type {} is not serializable",
                other.type_name()
            )));
        }
    }
    Ok(())
}

fn write_function(out: &mut Vec<u8>, function: &CompiledFunction) {
    write_string(out, &function.name);
    write_u32(out, function.arity);
    write_u32(out, function.local_count);
    write_u32(out, function.upvalues.len() as u32);
    for upvalue in &function.upvalues {
        out.push(u8::from(upvalue.is_local));
        write_u32(out, upvalue.index);
    }
    write_code(out, &function.code);
}

fn write_code(out: &mut Vec<u8>, code: &[Op]) {
    write_u32(out, code.len() as u32);
    for op in code {
        out.push(op.opcode());
        write_u32(out, op.operand());
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Deserialize a module, validating the container as it goes.
pub fn read_module(bytes: &[u8]) -> Result<Module> {
    let mut cursor = Cursor::new(bytes);

    let magic = cursor.read_string()?;
    if magic != MAGIC {
        return Err(Error::Link(format!(
            "bad magic: expected \"{}\", found \"{}\"",
            MAGIC, magic
        )));
    }
    let version = cursor.read_u16()?;
    if version != VERSION {
        return Err(Error::Link(format!(
            "unsupported bytecode version {} (current is {})",
            version, VERSION
        )));
    }

    let const_count = cursor.read_u32()?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        constants.push(cursor.read_constant()?);
    }

    let global_count = cursor.read_u32()?;
    let mut globals = Vec::with_capacity(global_count as usize);
    for _ in 0..global_count {
        globals.push(cursor.read_string()?);
    }

    let func_count = cursor.read_u32()?;
    let mut functions = Vec::with_capacity(func_count as usize);
    for _ in 0..func_count {
        functions.push(Rc::new(cursor.read_function()?));
    }

    let main_code = cursor.read_code()?;

    if !cursor.at_end() {
        return Err(Error::Link("trailing bytes after module".to_string()));
    }

    Ok(Module {
        constants,
        globals,
        functions,
        main_code,
    })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::Link("unexpected end of bytecode".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Link("invalid UTF-8 in string".to_string()))
    }

    fn read_constant(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        match tag {
            TAG_NONE => Ok(Value::None),
            TAG_INT => Ok(Value::Int(self.read_f64()? as i64)),
            TAG_FLOAT => Ok(Value::Float(self.read_f64()?)),
            TAG_STRING => Ok(Value::Str(self.read_string()?)),
            TAG_BOOL => match self.read_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(Error::Link(format!("invalid bool payload {}", other))),
            },
            TAG_FUNCTION => Ok(Value::Function(Rc::new(self.read_function()?))),
            TAG_CLASS => {
                let name = self.read_string()?;
                let field_count = self.read_u32()?;
                let mut fields = Vec::with_capacity(field_count as usize);
                for _ in 0..field_count {
                    fields.push(self.read_string()?);
                }
                let method_count = self.read_u32()?;
                let mut methods = Vec::with_capacity(method_count as usize);
                for _ in 0..method_count {
                    let method_name = self.read_string()?;
                    methods.push((method_name, Rc::new(self.read_function()?)));
                }
                Ok(Value::Class(Rc::new(ClassValue {
                    name,
                    fields,
                    methods,
                })))
            }
            other => Err(Error::Link(format!("unknown constant tag {}", other))),
        }
    }

    fn read_function(&mut self) -> Result<CompiledFunction> {
        let name = self.read_string()?;
        let arity = self.read_u32()?;
        let local_count = self.read_u32()?;
        let upvalue_count = self.read_u32()?;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = match self.read_u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::Link(format!(
                        "invalid upvalue isLocal flag {}",
                        other
                    )));
                }
            };
            let index = self.read_u32()?;
            upvalues.push(UpvalueDescriptor { is_local, index });
        }
        let code = self.read_code()?;
        Ok(CompiledFunction {
            name,
            arity,
            local_count,
            upvalues,
            code,
        })
    }

    fn read_code(&mut self) -> Result<Vec<Op>> {
        let len = self.read_u32()?;
        let mut code = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let opcode = self.read_u8()?;
            let arg = self.read_u32()?;
            code.push(Op::decode(opcode, arg)?);
        }
        Ok(code)
    }
}
