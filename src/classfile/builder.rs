//! Minimal class-file assembler.
//!
//! Emits structurally valid class files carrying only the parts the decoder
//! reads: header, interfaces, fields, methods and annotation attributes.
//! Methods have no `Code` attribute. Used to produce fixtures without
//! checking binary files into the tree.

use std::collections::HashMap;

use super::constant_pool::encode_modified_utf8;
use super::decode::type_name_descriptor;
use crate::record::{ACC_PUBLIC, AnnotationUsage, ElementValue, Retention};

const ACC_SUPER: u16 = 0x0020;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PoolKey {
    Utf8(String),
    Class(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
}

struct PoolWriter {
    bytes: Vec<u8>,
    next: u16,
    seen: HashMap<PoolKey, u16>,
}

impl PoolWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            next: 1,
            seen: HashMap::new(),
        }
    }

    fn intern(&mut self, key: PoolKey) -> u16 {
        if let Some(index) = self.seen.get(&key) {
            return *index;
        }
        let (index, slots) = match &key {
            PoolKey::Utf8(s) => {
                let encoded = encode_modified_utf8(s);
                self.bytes.push(1);
                self.bytes
                    .extend_from_slice(&(encoded.len() as u16).to_be_bytes());
                self.bytes.extend_from_slice(&encoded);
                (self.next, 1)
            }
            PoolKey::Class(internal) => {
                let name_index = self.utf8(internal);
                self.bytes.push(7);
                self.bytes.extend_from_slice(&name_index.to_be_bytes());
                (self.next, 1)
            }
            PoolKey::Integer(v) => {
                self.bytes.push(3);
                self.bytes.extend_from_slice(&v.to_be_bytes());
                (self.next, 1)
            }
            PoolKey::Float(bits) => {
                self.bytes.push(4);
                self.bytes.extend_from_slice(&bits.to_be_bytes());
                (self.next, 1)
            }
            PoolKey::Long(v) => {
                self.bytes.push(5);
                self.bytes.extend_from_slice(&v.to_be_bytes());
                (self.next, 2)
            }
            PoolKey::Double(bits) => {
                self.bytes.push(6);
                self.bytes.extend_from_slice(&bits.to_be_bytes());
                (self.next, 2)
            }
        };
        self.next += slots;
        self.seen.insert(key, index);
        index
    }

    fn utf8(&mut self, s: &str) -> u16 {
        self.intern(PoolKey::Utf8(s.to_string()))
    }

    fn class(&mut self, dotted: &str) -> u16 {
        self.intern(PoolKey::Class(dotted.replace('.', "/")))
    }
}

struct MemberSpec {
    name: String,
    descriptor: String,
    annotations: Vec<AnnotationUsage>,
    parameters: Vec<Vec<AnnotationUsage>>,
}

/// Builder for a single class file.
pub struct ClassFileBuilder {
    name: String,
    superclass: Option<String>,
    interfaces: Vec<String>,
    access: u16,
    major: u16,
    annotations: Vec<AnnotationUsage>,
    fields: Vec<MemberSpec>,
    methods: Vec<MemberSpec>,
}

impl ClassFileBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: Some("java.lang.Object".to_string()),
            interfaces: Vec::new(),
            access: ACC_PUBLIC | ACC_SUPER,
            major: 52,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn superclass(mut self, name: &str) -> Self {
        self.superclass = Some(name.to_string());
        self
    }

    pub fn no_superclass(mut self) -> Self {
        self.superclass = None;
        self
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn access(mut self, flags: u16) -> Self {
        self.access = flags;
        self
    }

    pub fn version(mut self, major: u16) -> Self {
        self.major = major;
        self
    }

    pub fn annotation(mut self, usage: AnnotationUsage) -> Self {
        self.annotations.push(usage);
        self
    }

    pub fn field(mut self, name: &str, descriptor: &str, annotations: Vec<AnnotationUsage>) -> Self {
        self.fields.push(MemberSpec {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            annotations,
            parameters: Vec::new(),
        });
        self
    }

    pub fn method(
        mut self,
        name: &str,
        descriptor: &str,
        annotations: Vec<AnnotationUsage>,
        parameters: Vec<Vec<AnnotationUsage>>,
    ) -> Self {
        self.methods.push(MemberSpec {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            annotations,
            parameters,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut pool = PoolWriter::new();
        let mut body = Vec::new();

        let this_index = pool.class(&self.name);
        let super_index = self.superclass.as_deref().map_or(0, |s| pool.class(s));
        put_u2(&mut body, self.access);
        put_u2(&mut body, this_index);
        put_u2(&mut body, super_index);

        put_u2(&mut body, self.interfaces.len() as u16);
        for iface in &self.interfaces {
            let index = pool.class(iface);
            put_u2(&mut body, index);
        }

        for members in [&self.fields, &self.methods] {
            put_u2(&mut body, members.len() as u16);
            for member in members {
                put_u2(&mut body, 0x0001);
                put_u2(&mut body, pool.utf8(&member.name));
                put_u2(&mut body, pool.utf8(&member.descriptor));
                let mut attributes = annotation_attributes(&mut pool, &member.annotations);
                if member.parameters.iter().any(|p| !p.is_empty()) {
                    attributes.extend(parameter_attributes(&mut pool, &member.parameters));
                }
                write_attributes(&mut body, &attributes);
            }
        }

        let attributes = annotation_attributes(&mut pool, &self.annotations);
        write_attributes(&mut body, &attributes);

        let mut out = Vec::with_capacity(10 + pool.bytes.len() + body.len());
        out.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        put_u2(&mut out, 0);
        put_u2(&mut out, self.major);
        put_u2(&mut out, pool.next);
        out.extend_from_slice(&pool.bytes);
        out.extend_from_slice(&body);
        out
    }
}

fn put_u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[(u16, Vec<u8>)]) {
    put_u2(out, attributes.len() as u16);
    for (name_index, payload) in attributes {
        put_u2(out, *name_index);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
    }
}

fn annotation_attributes(pool: &mut PoolWriter, usages: &[AnnotationUsage]) -> Vec<(u16, Vec<u8>)> {
    let mut out = Vec::new();
    for (retention, attr) in [
        (Retention::Runtime, "RuntimeVisibleAnnotations"),
        (Retention::Class, "RuntimeInvisibleAnnotations"),
    ] {
        let selected: Vec<&AnnotationUsage> =
            usages.iter().filter(|u| u.retention == retention).collect();
        if selected.is_empty() {
            continue;
        }
        let mut payload = Vec::new();
        put_u2(&mut payload, selected.len() as u16);
        for usage in selected {
            write_annotation(pool, &mut payload, usage);
        }
        out.push((pool.utf8(attr), payload));
    }
    out
}

fn parameter_attributes(
    pool: &mut PoolWriter,
    parameters: &[Vec<AnnotationUsage>],
) -> Vec<(u16, Vec<u8>)> {
    let mut out = Vec::new();
    for (retention, attr) in [
        (Retention::Runtime, "RuntimeVisibleParameterAnnotations"),
        (Retention::Class, "RuntimeInvisibleParameterAnnotations"),
    ] {
        if !parameters
            .iter()
            .flatten()
            .any(|u| u.retention == retention)
        {
            continue;
        }
        let mut payload = vec![parameters.len() as u8];
        for param in parameters {
            let selected: Vec<&AnnotationUsage> =
                param.iter().filter(|u| u.retention == retention).collect();
            put_u2(&mut payload, selected.len() as u16);
            for usage in selected {
                write_annotation(pool, &mut payload, usage);
            }
        }
        out.push((pool.utf8(attr), payload));
    }
    out
}

fn write_annotation(pool: &mut PoolWriter, out: &mut Vec<u8>, usage: &AnnotationUsage) {
    put_u2(out, pool.utf8(&type_name_descriptor(&usage.type_name)));
    put_u2(out, usage.elements.len() as u16);
    for (name, value) in usage.elements.iter() {
        put_u2(out, pool.utf8(name));
        write_element(pool, out, value);
    }
}

fn write_element(pool: &mut PoolWriter, out: &mut Vec<u8>, value: &ElementValue) {
    match value {
        ElementValue::Byte(v) => {
            out.push(b'B');
            put_u2(out, pool.intern(PoolKey::Integer(*v as i32)));
        }
        ElementValue::Char(v) => {
            out.push(b'C');
            put_u2(out, pool.intern(PoolKey::Integer(*v as i32)));
        }
        ElementValue::Short(v) => {
            out.push(b'S');
            put_u2(out, pool.intern(PoolKey::Integer(*v as i32)));
        }
        ElementValue::Int(v) => {
            out.push(b'I');
            put_u2(out, pool.intern(PoolKey::Integer(*v)));
        }
        ElementValue::Boolean(v) => {
            out.push(b'Z');
            put_u2(out, pool.intern(PoolKey::Integer(*v as i32)));
        }
        ElementValue::Long(v) => {
            out.push(b'J');
            put_u2(out, pool.intern(PoolKey::Long(*v)));
        }
        ElementValue::Float(v) => {
            out.push(b'F');
            put_u2(out, pool.intern(PoolKey::Float(v.to_bits())));
        }
        ElementValue::Double(v) => {
            out.push(b'D');
            put_u2(out, pool.intern(PoolKey::Double(v.to_bits())));
        }
        ElementValue::String(v) => {
            out.push(b's');
            put_u2(out, pool.utf8(v));
        }
        ElementValue::Enum {
            type_name,
            constant,
        } => {
            out.push(b'e');
            put_u2(out, pool.utf8(&type_name_descriptor(type_name)));
            put_u2(out, pool.utf8(constant));
        }
        ElementValue::Class(name) => {
            out.push(b'c');
            put_u2(out, pool.utf8(&type_name_descriptor(name)));
        }
        ElementValue::Annotation(nested) => {
            out.push(b'@');
            write_annotation(pool, out, nested);
        }
        ElementValue::Array(items) => {
            out.push(b'[');
            put_u2(out, items.len() as u16);
            for item in items {
                write_element(pool, out, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_entries_are_shared() {
        let mut pool = PoolWriter::new();
        let a = pool.utf8("x");
        let b = pool.utf8("x");
        assert_eq!(a, b);
        let long = pool.intern(PoolKey::Long(1));
        let after = pool.utf8("y");
        assert_eq!(after, long + 2);
    }

    #[test]
    fn build_starts_with_magic_and_version() {
        let bytes = ClassFileBuilder::new("a.B").version(61).build();
        assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 61);
    }
}
