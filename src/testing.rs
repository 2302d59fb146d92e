//! Builders for synthetic class files used across unit tests.

use crate::classfile::{ACC_STATIC, ClassFile, MemberInfo, RawAttribute};
use crate::encode::encode_method;
use crate::ir::MethodBody;

const ACC_PUBLIC: u16 = 0x0001;

/// Public class extending `java/lang/Object` with no members, version 52.
pub(crate) fn empty_class(internal_name: &str) -> ClassFile {
    let mut data = Vec::new();
    data.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    data.extend_from_slice(&52u16.to_be_bytes());
    data.extend_from_slice(&5u16.to_be_bytes());
    data.push(1);
    data.extend_from_slice(&(internal_name.len() as u16).to_be_bytes());
    data.extend_from_slice(internal_name.as_bytes());
    data.push(7);
    data.extend_from_slice(&1u16.to_be_bytes());
    data.push(1);
    data.extend_from_slice(&16u16.to_be_bytes());
    data.extend_from_slice(b"java/lang/Object");
    data.push(7);
    data.extend_from_slice(&3u16.to_be_bytes());
    data.extend_from_slice(&0x21u16.to_be_bytes());
    data.extend_from_slice(&2u16.to_be_bytes());
    data.extend_from_slice(&4u16.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
    ClassFile::parse(&data).expect("parse empty class")
}

/// Encode `body` and append it as a public method.
pub(crate) fn add_method(class: &mut ClassFile, mut body: MethodBody) {
    body.class_name = class.class_name().expect("class name");
    let info = encode_method(class, &mut body).expect("encode method");
    let name_index = class
        .constant_pool
        .intern_utf8(&body.method_name)
        .expect("intern name");
    let descriptor_index = class
        .constant_pool
        .intern_utf8(&body.descriptor)
        .expect("intern descriptor");
    let code_index = class.constant_pool.intern_utf8("Code").expect("intern Code");
    let access_flags = if body.is_static {
        ACC_PUBLIC | ACC_STATIC
    } else {
        ACC_PUBLIC
    };
    class.methods.push(MemberInfo {
        access_flags,
        name_index,
        descriptor_index,
        attributes: vec![RawAttribute {
            name_index: code_index,
            info,
        }],
    });
}

pub(crate) fn class_bytes(internal_name: &str, methods: Vec<MethodBody>) -> Vec<u8> {
    let mut class = empty_class(internal_name);
    for body in methods {
        add_method(&mut class, body);
    }
    class.to_bytes().expect("serialize class")
}
