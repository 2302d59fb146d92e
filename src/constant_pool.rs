use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::classfile::{read_bytes_class, read_u8_class, read_u16_class, read_u32_class};
use crate::error::PatchError;

/// One constant pool slot, kept in its raw symbolic form so it can be written back unchanged.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum CpEntry {
    /// Index 0 and the second slot of long/double constants.
    Unusable,
    /// Modified UTF-8 bytes exactly as stored in the class file.
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { kind: u8, reference_index: u16 },
    MethodType(u16),
    Dynamic { bootstrap_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_index: u16, name_and_type_index: u16 },
    Module(u16),
    Package(u16),
}

impl CpEntry {
    fn is_wide(&self) -> bool {
        matches!(self, CpEntry::Long(_) | CpEntry::Double(_))
    }
}

/// Resolved field or method reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) interface: bool,
}

/// Append-only constant pool.
///
/// Existing indices never move, so untouched methods and attributes stay valid
/// after new constants are interned for injected code.
#[derive(Clone, Debug)]
pub(crate) struct ConstantPool {
    entries: Vec<CpEntry>,
    lookup: HashMap<CpEntry, u16>,
    original_len: usize,
}

impl ConstantPool {
    pub(crate) fn parse(data: &[u8], offset: &mut usize) -> Result<Self> {
        let count = read_u16_class(data, offset)?;
        if count == 0 {
            return Err(PatchError::malformed("constant pool count is zero"));
        }
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(CpEntry::Unusable);
        while entries.len() < count as usize {
            let index = entries.len();
            let tag = read_u8_class(data, offset)?;
            let entry = match tag {
                1 => {
                    let len = read_u16_class(data, offset)? as usize;
                    CpEntry::Utf8(read_bytes_class(data, offset, len)?.to_vec())
                }
                3 => CpEntry::Integer(read_u32_class(data, offset)? as i32),
                4 => CpEntry::Float(read_u32_class(data, offset)?),
                5 => {
                    let high = read_u32_class(data, offset)? as u64;
                    let low = read_u32_class(data, offset)? as u64;
                    CpEntry::Long(((high << 32) | low) as i64)
                }
                6 => {
                    let high = read_u32_class(data, offset)? as u64;
                    let low = read_u32_class(data, offset)? as u64;
                    CpEntry::Double((high << 32) | low)
                }
                7 => CpEntry::Class(read_u16_class(data, offset)?),
                8 => CpEntry::String(read_u16_class(data, offset)?),
                9 => CpEntry::Fieldref {
                    class_index: read_u16_class(data, offset)?,
                    name_and_type_index: read_u16_class(data, offset)?,
                },
                10 => CpEntry::Methodref {
                    class_index: read_u16_class(data, offset)?,
                    name_and_type_index: read_u16_class(data, offset)?,
                },
                11 => CpEntry::InterfaceMethodref {
                    class_index: read_u16_class(data, offset)?,
                    name_and_type_index: read_u16_class(data, offset)?,
                },
                12 => CpEntry::NameAndType {
                    name_index: read_u16_class(data, offset)?,
                    descriptor_index: read_u16_class(data, offset)?,
                },
                15 => CpEntry::MethodHandle {
                    kind: read_u8_class(data, offset)?,
                    reference_index: read_u16_class(data, offset)?,
                },
                16 => CpEntry::MethodType(read_u16_class(data, offset)?),
                17 => CpEntry::Dynamic {
                    bootstrap_index: read_u16_class(data, offset)?,
                    name_and_type_index: read_u16_class(data, offset)?,
                },
                18 => CpEntry::InvokeDynamic {
                    bootstrap_index: read_u16_class(data, offset)?,
                    name_and_type_index: read_u16_class(data, offset)?,
                },
                19 => CpEntry::Module(read_u16_class(data, offset)?),
                20 => CpEntry::Package(read_u16_class(data, offset)?),
                _ => {
                    return Err(PatchError::malformed(format!(
                        "unsupported constant pool tag {tag} at index {index}"
                    )));
                }
            };
            let wide = entry.is_wide();
            entries.push(entry);
            if wide {
                if entries.len() >= count as usize {
                    return Err(PatchError::malformed(
                        "long or double constant overruns the constant pool",
                    ));
                }
                entries.push(CpEntry::Unusable);
            }
        }

        let mut lookup = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if *entry != CpEntry::Unusable {
                lookup.entry(entry.clone()).or_insert(index as u16);
            }
        }

        let original_len = entries.len();
        Ok(Self {
            entries,
            lookup,
            original_len,
        })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let count = u16::try_from(self.entries.len())
            .map_err(|_| PatchError::serialization("constant pool exceeds 65535 entries"))?;
        out.extend_from_slice(&count.to_be_bytes());
        for entry in &self.entries {
            match entry {
                CpEntry::Unusable => {}
                CpEntry::Utf8(bytes) => {
                    let len = u16::try_from(bytes.len())
                        .map_err(|_| PatchError::serialization("utf8 constant too long"))?;
                    out.push(1);
                    out.extend_from_slice(&len.to_be_bytes());
                    out.extend_from_slice(bytes);
                }
                CpEntry::Integer(value) => {
                    out.push(3);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                CpEntry::Float(bits) => {
                    out.push(4);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                CpEntry::Long(value) => {
                    out.push(5);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                CpEntry::Double(bits) => {
                    out.push(6);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                CpEntry::Class(index) => push_tag_u16(out, 7, *index),
                CpEntry::String(index) => push_tag_u16(out, 8, *index),
                CpEntry::Fieldref {
                    class_index,
                    name_and_type_index,
                } => push_tag_u16_pair(out, 9, *class_index, *name_and_type_index),
                CpEntry::Methodref {
                    class_index,
                    name_and_type_index,
                } => push_tag_u16_pair(out, 10, *class_index, *name_and_type_index),
                CpEntry::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => push_tag_u16_pair(out, 11, *class_index, *name_and_type_index),
                CpEntry::NameAndType {
                    name_index,
                    descriptor_index,
                } => push_tag_u16_pair(out, 12, *name_index, *descriptor_index),
                CpEntry::MethodHandle {
                    kind,
                    reference_index,
                } => {
                    out.push(15);
                    out.push(*kind);
                    out.extend_from_slice(&reference_index.to_be_bytes());
                }
                CpEntry::MethodType(index) => push_tag_u16(out, 16, *index),
                CpEntry::Dynamic {
                    bootstrap_index,
                    name_and_type_index,
                } => push_tag_u16_pair(out, 17, *bootstrap_index, *name_and_type_index),
                CpEntry::InvokeDynamic {
                    bootstrap_index,
                    name_and_type_index,
                } => push_tag_u16_pair(out, 18, *bootstrap_index, *name_and_type_index),
                CpEntry::Module(index) => push_tag_u16(out, 19, *index),
                CpEntry::Package(index) => push_tag_u16(out, 20, *index),
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries appended since parsing.
    pub(crate) fn added(&self) -> usize {
        self.entries.len() - self.original_len
    }

    pub(crate) fn get(&self, index: u16) -> Result<&CpEntry> {
        match self.entries.get(index as usize) {
            Some(CpEntry::Unusable) | None => Err(PatchError::malformed(format!(
                "invalid constant pool index {index}"
            ))),
            Some(entry) => Ok(entry),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            CpEntry::Utf8(bytes) => decode_modified_utf8(bytes),
            _ => Err(PatchError::malformed(format!(
                "constant {index} is not a utf8 entry"
            ))),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            CpEntry::Class(name_index) => self.utf8(*name_index),
            _ => Err(PatchError::malformed(format!(
                "constant {index} is not a class entry"
            ))),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            CpEntry::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(PatchError::malformed(format!(
                "constant {index} is not a name-and-type entry"
            ))),
        }
    }

    pub(crate) fn member_ref(&self, index: u16) -> Result<MemberRef> {
        let (class_index, name_and_type_index, interface) = match self.get(index)? {
            CpEntry::Fieldref {
                class_index,
                name_and_type_index,
            }
            | CpEntry::Methodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, false),
            CpEntry::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, true),
            _ => {
                return Err(PatchError::malformed(format!(
                    "constant {index} is not a member reference"
                )));
            }
        };
        let owner = self.class_name(class_index).context("resolve member owner")?;
        let (name, descriptor) = self
            .name_and_type(name_and_type_index)
            .context("resolve member name and type")?;
        Ok(MemberRef {
            owner,
            name,
            descriptor,
            interface,
        })
    }

    pub(crate) fn intern_utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(CpEntry::Utf8(encode_modified_utf8(value)))
    }

    pub(crate) fn intern_class(&mut self, internal_name: &str) -> Result<u16> {
        let name_index = self.intern_utf8(internal_name)?;
        self.intern(CpEntry::Class(name_index))
    }

    pub(crate) fn intern_string(&mut self, value: &str) -> Result<u16> {
        let utf8_index = self.intern_utf8(value)?;
        self.intern(CpEntry::String(utf8_index))
    }

    pub(crate) fn intern_integer(&mut self, value: i32) -> Result<u16> {
        self.intern(CpEntry::Integer(value))
    }

    pub(crate) fn intern_float(&mut self, bits: u32) -> Result<u16> {
        self.intern(CpEntry::Float(bits))
    }

    pub(crate) fn intern_long(&mut self, value: i64) -> Result<u16> {
        self.intern(CpEntry::Long(value))
    }

    pub(crate) fn intern_double(&mut self, bits: u64) -> Result<u16> {
        self.intern(CpEntry::Double(bits))
    }

    pub(crate) fn intern_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.intern_utf8(name)?;
        let descriptor_index = self.intern_utf8(descriptor)?;
        self.intern(CpEntry::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub(crate) fn intern_field_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class_index = self.intern_class(owner)?;
        let name_and_type_index = self.intern_name_and_type(name, descriptor)?;
        self.intern(CpEntry::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub(crate) fn intern_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16> {
        let class_index = self.intern_class(owner)?;
        let name_and_type_index = self.intern_name_and_type(name, descriptor)?;
        let entry = if interface {
            CpEntry::InterfaceMethodref {
                class_index,
                name_and_type_index,
            }
        } else {
            CpEntry::Methodref {
                class_index,
                name_and_type_index,
            }
        };
        self.intern(entry)
    }

    fn intern(&mut self, entry: CpEntry) -> Result<u16> {
        if let Some(index) = self.lookup.get(&entry) {
            return Ok(*index);
        }
        let wide = entry.is_wide();
        let needed = if wide { 2 } else { 1 };
        if self.entries.len() + needed > u16::MAX as usize {
            return Err(PatchError::serialization("constant pool is full"));
        }
        let index = self.entries.len() as u16;
        self.entries.push(entry.clone());
        if wide {
            self.entries.push(CpEntry::Unusable);
        }
        self.lookup.insert(entry, index);
        Ok(index)
    }
}

fn push_tag_u16(out: &mut Vec<u8>, tag: u8, value: u16) {
    out.push(tag);
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_tag_u16_pair(out: &mut Vec<u8>, tag: u8, first: u16, second: u16) {
    out.push(tag);
    out.extend_from_slice(&first.to_be_bytes());
    out.extend_from_slice(&second.to_be_bytes());
}

/// Decode the JVM's modified UTF-8 (two-byte NUL, surrogate pairs for supplementary characters).
pub(crate) fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let first = bytes[index] as u16;
        if first & 0x80 == 0 {
            units.push(first);
            index += 1;
        } else if first & 0xe0 == 0xc0 {
            let second = *bytes
                .get(index + 1)
                .ok_or_else(|| PatchError::malformed("truncated utf8 constant"))?
                as u16;
            units.push(((first & 0x1f) << 6) | (second & 0x3f));
            index += 2;
        } else if first & 0xf0 == 0xe0 {
            let tail = bytes
                .get(index + 1..index + 3)
                .ok_or_else(|| PatchError::malformed("truncated utf8 constant"))?;
            units.push(((first & 0x0f) << 12) | ((tail[0] as u16 & 0x3f) << 6) | (tail[1] as u16 & 0x3f));
            index += 3;
        } else {
            return Err(PatchError::malformed("invalid modified utf8 byte"));
        }
    }
    Ok(String::from_utf16_lossy(&units))
}

pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => bytes.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                bytes.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                bytes.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                bytes.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    bytes
}
