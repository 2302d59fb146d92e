use anyhow::{Context, Result};

use crate::constant_pool::{ConstantPool, CpEntry};
use crate::error::PatchError;

pub(crate) const MAGIC: u32 = 0xCAFE_BABE;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_BRIDGE: u16 = 0x0040;
pub(crate) const ACC_SYNTHETIC: u16 = 0x1000;

/// Parsed class container.
///
/// Only the constant pool is decoded symbolically. Fields, methods and attributes
/// keep their raw attribute bytes so untouched members serialize back verbatim.
#[derive(Clone, Debug)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<MemberInfo>,
    pub(crate) methods: Vec<MemberInfo>,
    pub(crate) attributes: Vec<RawAttribute>,
}

/// Field or method entry.
#[derive(Clone, Debug)]
pub(crate) struct MemberInfo {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<RawAttribute>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RawAttribute {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

/// Decoded `Code` attribute with raw sub-attributes.
#[derive(Clone, Debug)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<RawAttribute>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

/// One entry of the `BootstrapMethods` class attribute.
#[derive(Clone, Debug)]
pub(crate) struct BootstrapMethod {
    pub(crate) arguments: Vec<u16>,
}

impl ClassFile {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let magic = read_u32_class(data, &mut offset)?;
        if magic != MAGIC {
            return Err(PatchError::malformed(format!("bad magic 0x{magic:08x}")));
        }
        let minor_version = read_u16_class(data, &mut offset)?;
        let major_version = read_u16_class(data, &mut offset)?;
        let constant_pool =
            ConstantPool::parse(data, &mut offset).context("parse constant pool")?;
        let access_flags = read_u16_class(data, &mut offset)?;
        let this_class = read_u16_class(data, &mut offset)?;
        let super_class = read_u16_class(data, &mut offset)?;
        let interface_count = read_u16_class(data, &mut offset)?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(read_u16_class(data, &mut offset)?);
        }
        let fields = read_members(data, &mut offset).context("parse fields")?;
        let methods = read_members(data, &mut offset).context("parse methods")?;
        let attributes = read_attributes(data, &mut offset).context("parse class attributes")?;
        if offset != data.len() {
            return Err(PatchError::malformed(format!(
                "{} trailing bytes after class file",
                data.len() - offset
            )));
        }

        let class = Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        class.class_name().context("resolve this_class")?;
        Ok(class)
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&self.minor_version.to_be_bytes());
        out.extend_from_slice(&self.major_version.to_be_bytes());
        self.constant_pool.write(&mut out)?;
        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        write_u16_len(&mut out, self.interfaces.len(), "interfaces")?;
        for interface in &self.interfaces {
            out.extend_from_slice(&interface.to_be_bytes());
        }
        write_members(&mut out, &self.fields)?;
        write_members(&mut out, &self.methods)?;
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }

    /// Internal (slash separated) name of this class.
    pub(crate) fn class_name(&self) -> Result<String> {
        self.constant_pool.class_name(self.this_class)
    }

    /// Class file versions from 50 on carry StackMapTable frames.
    pub(crate) fn uses_stack_map_frames(&self) -> bool {
        self.major_version >= 50
    }

    pub(crate) fn member_name(&self, member: &MemberInfo) -> Result<String> {
        self.constant_pool.utf8(member.name_index)
    }

    pub(crate) fn member_descriptor(&self, member: &MemberInfo) -> Result<String> {
        self.constant_pool.utf8(member.descriptor_index)
    }

    pub(crate) fn attribute_name(&self, attribute: &RawAttribute) -> Result<String> {
        self.constant_pool.utf8(attribute.name_index)
    }

    /// Indices of methods whose name passes `matches_name`, optionally
    /// restricted to one descriptor, skipping those carrying any of
    /// `excluded_flags`.
    pub(crate) fn find_methods(
        &self,
        matches_name: impl Fn(&str) -> bool,
        descriptor: Option<&str>,
        excluded_flags: u16,
    ) -> Result<Vec<usize>> {
        let mut found = Vec::new();
        for (index, method) in self.methods.iter().enumerate() {
            if method.access_flags & excluded_flags != 0
                || !matches_name(&self.member_name(method)?)
            {
                continue;
            }
            if let Some(descriptor) = descriptor {
                if self.member_descriptor(method)? != descriptor {
                    continue;
                }
            }
            found.push(index);
        }
        Ok(found)
    }

    /// Position of the `Code` attribute within a method's attribute list.
    pub(crate) fn code_attribute_index(&self, method: &MemberInfo) -> Result<Option<usize>> {
        for (index, attribute) in method.attributes.iter().enumerate() {
            if self.attribute_name(attribute)? == "Code" {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    pub(crate) fn bootstrap_methods(&self) -> Result<Vec<BootstrapMethod>> {
        for attribute in &self.attributes {
            if self.attribute_name(attribute)? != "BootstrapMethods" {
                continue;
            }
            let data = &attribute.info;
            let mut offset = 0;
            let count = read_u16_class(data, &mut offset)?;
            let mut methods = Vec::with_capacity(count as usize);
            for _ in 0..count {
                // Bootstrap method handle, not needed for argument lookup.
                read_u16_class(data, &mut offset)?;
                let argument_count = read_u16_class(data, &mut offset)?;
                let mut arguments = Vec::with_capacity(argument_count as usize);
                for _ in 0..argument_count {
                    arguments.push(read_u16_class(data, &mut offset)?);
                }
                methods.push(BootstrapMethod { arguments });
            }
            return Ok(methods);
        }
        Ok(Vec::new())
    }

    /// String constants passed as static arguments to an invokedynamic bootstrap.
    pub(crate) fn bootstrap_strings(&self, bootstrap_index: u16) -> Result<Vec<String>> {
        let methods = self.bootstrap_methods()?;
        let method = methods.get(bootstrap_index as usize).ok_or_else(|| {
            PatchError::malformed(format!("bootstrap method {bootstrap_index} is missing"))
        })?;
        let mut strings = Vec::new();
        for argument in &method.arguments {
            if let CpEntry::String(utf8_index) = self.constant_pool.get(*argument)? {
                strings.push(self.constant_pool.utf8(*utf8_index)?);
            }
        }
        Ok(strings)
    }
}

impl CodeAttribute {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let max_stack = read_u16_class(data, &mut offset)?;
        let max_locals = read_u16_class(data, &mut offset)?;
        let code_length = read_u32_class(data, &mut offset)? as usize;
        if code_length == 0 || code_length > u16::MAX as usize {
            return Err(PatchError::malformed(format!(
                "invalid code length {code_length}"
            )));
        }
        let code = read_bytes_class(data, &mut offset, code_length)?.to_vec();
        let handler_count = read_u16_class(data, &mut offset)?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionEntry {
                start_pc: read_u16_class(data, &mut offset)?,
                end_pc: read_u16_class(data, &mut offset)?,
                handler_pc: read_u16_class(data, &mut offset)?,
                catch_type: read_u16_class(data, &mut offset)?,
            });
        }
        let attributes = read_attributes(data, &mut offset)?;
        if offset != data.len() {
            return Err(PatchError::malformed("trailing bytes in Code attribute"));
        }
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.max_stack.to_be_bytes());
        out.extend_from_slice(&self.max_locals.to_be_bytes());
        if self.code.is_empty() || self.code.len() > u16::MAX as usize {
            return Err(PatchError::serialization(format!(
                "code length {} is outside 1..=65535",
                self.code.len()
            )));
        }
        out.extend_from_slice(&(self.code.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.code);
        write_u16_len(&mut out, self.exception_table.len(), "exception table")?;
        for entry in &self.exception_table {
            out.extend_from_slice(&entry.start_pc.to_be_bytes());
            out.extend_from_slice(&entry.end_pc.to_be_bytes());
            out.extend_from_slice(&entry.handler_pc.to_be_bytes());
            out.extend_from_slice(&entry.catch_type.to_be_bytes());
        }
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }
}

fn read_members(data: &[u8], offset: &mut usize) -> Result<Vec<MemberInfo>> {
    let count = read_u16_class(data, offset)?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = read_u16_class(data, offset)?;
        let name_index = read_u16_class(data, offset)?;
        let descriptor_index = read_u16_class(data, offset)?;
        let attributes = read_attributes(data, offset)?;
        members.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }
    Ok(members)
}

fn read_attributes(data: &[u8], offset: &mut usize) -> Result<Vec<RawAttribute>> {
    let count = read_u16_class(data, offset)?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = read_u16_class(data, offset)?;
        let length = read_u32_class(data, offset)? as usize;
        let info = read_bytes_class(data, offset, length)?.to_vec();
        attributes.push(RawAttribute { name_index, info });
    }
    Ok(attributes)
}

fn write_members(out: &mut Vec<u8>, members: &[MemberInfo]) -> Result<()> {
    write_u16_len(out, members.len(), "members")?;
    for member in members {
        out.extend_from_slice(&member.access_flags.to_be_bytes());
        out.extend_from_slice(&member.name_index.to_be_bytes());
        out.extend_from_slice(&member.descriptor_index.to_be_bytes());
        write_attributes(out, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn write_attributes(out: &mut Vec<u8>, attributes: &[RawAttribute]) -> Result<()> {
    write_u16_len(out, attributes.len(), "attributes")?;
    for attribute in attributes {
        out.extend_from_slice(&attribute.name_index.to_be_bytes());
        let length = u32::try_from(attribute.info.len())
            .map_err(|_| PatchError::serialization("attribute exceeds u32 length"))?;
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&attribute.info);
    }
    Ok(())
}

fn write_u16_len(out: &mut Vec<u8>, len: usize, what: &str) -> Result<()> {
    let len = u16::try_from(len)
        .map_err(|_| PatchError::serialization(format!("too many {what}: {len}")))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

pub(crate) fn read_u8_class(data: &[u8], offset: &mut usize) -> Result<u8> {
    let value = *data
        .get(*offset)
        .ok_or_else(|| PatchError::malformed(format!("unexpected end of data at {offset}")))?;
    *offset += 1;
    Ok(value)
}

pub(crate) fn read_u16_class(data: &[u8], offset: &mut usize) -> Result<u16> {
    let bytes = read_bytes_class(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32_class(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = read_bytes_class(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_bytes_class<'a>(
    data: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            PatchError::malformed(format!(
                "unexpected end of data reading {len} bytes at {offset}"
            ))
        })?;
    let bytes = &data[*offset..end];
    *offset = end;
    Ok(bytes)
}
