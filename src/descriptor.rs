use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

use crate::error::PatchError;

/// Value category of a field descriptor as seen by the operand stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ValueKind {
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl ValueKind {
    pub(crate) fn slots(self) -> usize {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }
}

/// Parameter and return layout of a method descriptor.
#[derive(Clone, Debug)]
pub(crate) struct MethodShape {
    /// Raw field descriptor of each parameter, e.g. `[Ljava/lang/String;`.
    pub(crate) parameters: Vec<String>,
    /// Raw return descriptor, `None` for `V`.
    pub(crate) return_type: Option<String>,
}

impl MethodShape {
    pub(crate) fn parse(descriptor: &str) -> Result<Self> {
        let parsed = MethodDescriptor::from_str(descriptor)
            .map_err(|error| PatchError::malformed(format!("{error:?}")))
            .with_context(|| format!("parse method descriptor {descriptor}"))?;
        let (parameters, return_type) = split_method_descriptor(descriptor)?;
        if parameters.len() != parsed.parameter_types().len() {
            return Err(PatchError::malformed(format!(
                "parameter count mismatch in {descriptor}"
            )));
        }
        for (raw, typed) in parameters.iter().zip(parsed.parameter_types()) {
            let reference = matches!(typed, TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _));
            if reference != is_reference(raw) {
                return Err(PatchError::malformed(format!(
                    "inconsistent parameter {raw} in {descriptor}"
                )));
            }
        }
        Ok(Self {
            parameters,
            return_type,
        })
    }

    /// Number of local slots taken by the parameters, excluding `this`.
    pub(crate) fn parameter_slots(&self) -> Result<usize> {
        self.parameters
            .iter()
            .map(|parameter| Ok(value_kind(parameter)?.slots()))
            .sum()
    }

    /// Local slot of the parameter at `index`.
    pub(crate) fn parameter_slot(&self, index: usize, is_static: bool) -> Result<u16> {
        let mut slot = if is_static { 0 } else { 1 };
        for parameter in self.parameters.iter().take(index) {
            slot += value_kind(parameter)?.slots();
        }
        u16::try_from(slot).map_err(|_| PatchError::malformed("parameter slot overflow"))
    }

    pub(crate) fn return_kind(&self) -> Result<Option<ValueKind>> {
        self.return_type.as_deref().map(value_kind).transpose()
    }
}

pub(crate) fn value_kind(field_descriptor: &str) -> Result<ValueKind> {
    let kind = match field_descriptor.as_bytes().first() {
        Some(b'B' | b'C' | b'I' | b'S' | b'Z') => ValueKind::Int,
        Some(b'F') => ValueKind::Float,
        Some(b'J') => ValueKind::Long,
        Some(b'D') => ValueKind::Double,
        Some(b'L' | b'[') => ValueKind::Reference,
        _ => {
            return Err(PatchError::malformed(format!(
                "invalid field descriptor {field_descriptor}"
            )));
        }
    };
    Ok(kind)
}

pub(crate) fn is_reference(field_descriptor: &str) -> bool {
    matches!(field_descriptor.as_bytes().first(), Some(b'L' | b'['))
}

/// Verification-type class name for a reference descriptor: `Lfoo/Bar;` becomes
/// `foo/Bar`, arrays keep their descriptor form.
pub(crate) fn reference_class_name(field_descriptor: &str) -> Option<String> {
    if field_descriptor.starts_with('[') {
        return Some(field_descriptor.to_string());
    }
    field_descriptor
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .map(str::to_string)
}

/// Descriptor for the element type of an array descriptor.
pub(crate) fn array_element(field_descriptor: &str) -> Option<&str> {
    field_descriptor.strip_prefix('[')
}

fn split_method_descriptor(descriptor: &str) -> Result<(Vec<String>, Option<String>)> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(PatchError::malformed(format!(
            "method descriptor {descriptor} does not start with '('"
        )));
    }
    let mut parameters = Vec::new();
    let mut index = 1;
    while index < bytes.len() && bytes[index] != b')' {
        let end = field_end(bytes, index)
            .ok_or_else(|| PatchError::malformed(format!("bad method descriptor {descriptor}")))?;
        parameters.push(descriptor[index..end].to_string());
        index = end;
    }
    if index >= bytes.len() {
        return Err(PatchError::malformed(format!(
            "unterminated method descriptor {descriptor}"
        )));
    }
    let return_descriptor = &descriptor[index + 1..];
    let return_type = if return_descriptor == "V" {
        None
    } else {
        match field_end(bytes, index + 1) {
            Some(end) if end == bytes.len() => Some(return_descriptor.to_string()),
            _ => {
                return Err(PatchError::malformed(format!(
                    "bad return type in {descriptor}"
                )));
            }
        }
    };
    Ok((parameters, return_type))
}

fn field_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut index = start;
    while bytes.get(index) == Some(&b'[') {
        index += 1;
    }
    match bytes.get(index)? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => Some(index + 1),
        b'L' => bytes[index..]
            .iter()
            .position(|byte| *byte == b';')
            .map(|position| index + position + 1),
        _ => None,
    }
}

/// Stack slots consumed and produced by an invocation, not counting the receiver.
pub(crate) fn invoke_stack_effect(descriptor: &str) -> Result<(usize, usize)> {
    let shape = MethodShape::parse(descriptor)?;
    let arguments = shape.parameter_slots()?;
    let produced = shape.return_kind()?.map(ValueKind::slots).unwrap_or(0);
    Ok((arguments, produced))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parameters_and_return() {
        let shape = MethodShape::parse("(IJ[Ljava/lang/String;Lfoo/Bar;)Ljava/util/List;")
            .expect("parse descriptor");

        assert_eq!(
            vec!["I", "J", "[Ljava/lang/String;", "Lfoo/Bar;"],
            shape.parameters
        );
        assert_eq!(Some("Ljava/util/List;".to_string()), shape.return_type);
        assert_eq!(5, shape.parameter_slots().expect("slots"));
        assert_eq!(4, shape.parameter_slot(2, false).expect("slot"));
        assert_eq!(3, shape.parameter_slot(2, true).expect("slot"));
    }

    #[test]
    fn void_return_has_no_kind() {
        let shape = MethodShape::parse("()V").expect("parse descriptor");

        assert!(shape.parameters.is_empty());
        assert_eq!(None, shape.return_kind().expect("kind"));
    }

    #[test]
    fn reference_names_strip_object_wrapper() {
        assert_eq!(
            Some("foo/Bar".to_string()),
            reference_class_name("Lfoo/Bar;")
        );
        assert_eq!(Some("[I".to_string()), reference_class_name("[I"));
        assert_eq!(None, reference_class_name("I"));
    }

    #[test]
    fn rejects_truncated_descriptor() {
        assert!(MethodShape::parse("(Ljava/lang/String").is_err());
    }
}
