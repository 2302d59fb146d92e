//! Minimal class file assembler for building synthetic server classes.

#![allow(dead_code)]

use std::collections::HashMap;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SYNTHETIC: u16 = 0x1000;

pub const ALOAD_0: u8 = 0x2a;
pub const ALOAD_1: u8 = 0x2b;
pub const ALOAD_2: u8 = 0x2c;
pub const ALOAD_3: u8 = 0x2d;
pub const ILOAD_1: u8 = 0x1b;
pub const ILOAD_3: u8 = 0x1d;
pub const ISTORE_3: u8 = 0x3e;
pub const ASTORE_2: u8 = 0x4d;
pub const ASTORE_3: u8 = 0x4e;
pub const ALOAD: u8 = 0x19;
pub const ASTORE: u8 = 0x3a;
pub const ICONST_1: u8 = 0x04;
pub const ARRAYLENGTH: u8 = 0xbe;
pub const IRETURN: u8 = 0xac;
pub const ISUB: u8 = 0x64;
pub const LADD: u8 = 0x61;
pub const DMUL: u8 = 0x6b;
pub const D2L: u8 = 0x8f;
pub const POP: u8 = 0x57;
pub const DUP: u8 = 0x59;
pub const LDC: u8 = 0x12;
pub const LDC2_W: u8 = 0x14;
pub const IFEQ: u8 = 0x99;
pub const IFGE: u8 = 0x9c;
pub const IFNULL: u8 = 0xc6;
pub const LRETURN: u8 = 0xad;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const GETFIELD: u8 = 0xb4;
pub const PUTFIELD: u8 = 0xb5;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const NEW: u8 = 0xbb;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;

/// Opcode followed by a two-byte operand.
pub fn op_u16(opcode: u8, operand: u16) -> Vec<u8> {
    let [high, low] = operand.to_be_bytes();
    vec![opcode, high, low]
}

/// Branch opcode followed by a relative offset.
pub fn branch(opcode: u8, offset: i16) -> Vec<u8> {
    let [high, low] = offset.to_be_bytes();
    vec![opcode, high, low]
}

pub fn ldc(index: u16) -> Vec<u8> {
    let index = u8::try_from(index).expect("ldc index fits in one byte");
    vec![LDC, index]
}

pub fn invokeinterface(index: u16, count: u8) -> Vec<u8> {
    let mut code = op_u16(INVOKEINTERFACE, index);
    code.extend([count, 0]);
    code
}

struct Method {
    access_flags: u16,
    name: u16,
    descriptor: u16,
    code: Vec<u8>,
}

/// Builds a public class extending `java/lang/Object`, class file version 52.
pub struct ClassBuilder {
    pool: Vec<u8>,
    next_index: u16,
    interned: HashMap<(u8, Vec<u8>), u16>,
    this_class: u16,
    super_class: u16,
    methods: Vec<Method>,
}

impl ClassBuilder {
    /// `internal_name` uses slashes, e.g. `com/example/Sample`.
    pub fn new(internal_name: &str) -> Self {
        let mut builder = Self {
            pool: Vec::new(),
            next_index: 1,
            interned: HashMap::new(),
            this_class: 0,
            super_class: 0,
            methods: Vec::new(),
        };
        builder.this_class = builder.class(internal_name);
        builder.super_class = builder.class("java/lang/Object");
        builder
    }

    fn intern(&mut self, tag: u8, payload: Vec<u8>, slots: u16) -> u16 {
        if let Some(index) = self.interned.get(&(tag, payload.clone())) {
            return *index;
        }
        let index = self.next_index;
        self.pool.push(tag);
        self.pool.extend_from_slice(&payload);
        self.next_index += slots;
        self.interned.insert((tag, payload), index);
        index
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        let mut payload = (value.len() as u16).to_be_bytes().to_vec();
        payload.extend_from_slice(value.as_bytes());
        self.intern(1, payload, 1)
    }

    pub fn class(&mut self, internal_name: &str) -> u16 {
        let name = self.utf8(internal_name);
        self.intern(7, name.to_be_bytes().to_vec(), 1)
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let text = self.utf8(value);
        self.intern(8, text.to_be_bytes().to_vec(), 1)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.intern(5, value.to_be_bytes().to_vec(), 2)
    }

    pub fn double(&mut self, value: f64) -> u16 {
        self.intern(6, value.to_bits().to_be_bytes().to_vec(), 2)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let mut payload = name.to_be_bytes().to_vec();
        payload.extend_from_slice(&descriptor.to_be_bytes());
        self.intern(12, payload, 1)
    }

    fn member(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
        let owner = self.class(owner);
        let name_and_type = self.name_and_type(name, descriptor);
        let mut payload = owner.to_be_bytes().to_vec();
        payload.extend_from_slice(&name_and_type.to_be_bytes());
        self.intern(tag, payload, 1)
    }

    pub fn field(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(9, owner, name, descriptor)
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(10, owner, name, descriptor)
    }

    pub fn interface_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(11, owner, name, descriptor)
    }

    /// Add a public method whose `Code` attribute holds `code` and, when
    /// given, the raw StackMapTable entries.
    pub fn method(
        &mut self,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        stack_map: Option<(u16, Vec<u8>)>,
    ) -> &mut Self {
        self.method_with_access(
            ACC_PUBLIC, name, descriptor, max_stack, max_locals, code, stack_map,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn method_with_access(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        stack_map: Option<(u16, Vec<u8>)>,
    ) -> &mut Self {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let code_name = self.utf8("Code");
        let mut info = Vec::new();
        info.extend_from_slice(&max_stack.to_be_bytes());
        info.extend_from_slice(&max_locals.to_be_bytes());
        info.extend_from_slice(&(code.len() as u32).to_be_bytes());
        info.extend_from_slice(&code);
        info.extend_from_slice(&0u16.to_be_bytes());
        match stack_map {
            Some((count, entries)) => {
                let table_name = self.utf8("StackMapTable");
                info.extend_from_slice(&1u16.to_be_bytes());
                info.extend_from_slice(&table_name.to_be_bytes());
                info.extend_from_slice(&((entries.len() + 2) as u32).to_be_bytes());
                info.extend_from_slice(&count.to_be_bytes());
                info.extend_from_slice(&entries);
            }
            None => info.extend_from_slice(&0u16.to_be_bytes()),
        }
        let mut attribute = code_name.to_be_bytes().to_vec();
        attribute.extend_from_slice(&(info.len() as u32).to_be_bytes());
        attribute.extend_from_slice(&info);
        self.methods.push(Method {
            access_flags,
            name,
            descriptor,
            code: attribute,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&self.next_index.to_be_bytes());
        out.extend_from_slice(&self.pool);
        out.extend_from_slice(&0x21u16.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend_from_slice(&method.access_flags.to_be_bytes());
            out.extend_from_slice(&method.name.to_be_bytes());
            out.extend_from_slice(&method.descriptor.to_be_bytes());
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&method.code);
        }
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }
}

/// Whether `needle` occurs anywhere in `haystack`, e.g. a UTF-8 pool entry.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

pub mod fixtures;
