//! Class Record Decoder.
//!
//! A pure structural reader: it never follows references to other classes
//! and never resolves enum or class literals against loaded types. The header
//! (through the interface table) must decode cleanly, otherwise the class is
//! [`DecodeError::MalformedClass`]. Damage after that point yields
//! [`DecodeError::IncompleteClass`] carrying whatever was decoded so far.

use super::constant_pool::ConstantPool;
use super::reader::{ClassReader, ParseError};
use crate::error::DecodeError;
use crate::record::{
    AnnotationUsage, ClassRecord, ElementValue, Modifiers, Retention, method_key,
};

pub const MIN_MAJOR_VERSION: u16 = 45;
pub const MAX_MAJOR_VERSION: u16 = 69;
pub const MAX_NESTING: usize = 64;

const ACC_MODULE: u16 = 0x8000;

const RUNTIME_VISIBLE: &str = "RuntimeVisibleAnnotations";
const RUNTIME_INVISIBLE: &str = "RuntimeInvisibleAnnotations";
const RUNTIME_VISIBLE_PARAMETER: &str = "RuntimeVisibleParameterAnnotations";
const RUNTIME_INVISIBLE_PARAMETER: &str = "RuntimeInvisibleParameterAnnotations";

/// Decodes one class file.
pub fn decode(bytes: &[u8]) -> Result<ClassRecord, DecodeError> {
    let mut reader = ClassReader::new(bytes);
    let (pool, mut record) =
        decode_header(&mut reader).map_err(|e| DecodeError::malformed(e.to_string()))?;

    let mut duplicates = false;
    match decode_body(&mut reader, &pool, &mut record, &mut duplicates) {
        Ok(()) if !duplicates => Ok(record),
        Ok(()) => {
            record.partial = true;
            Err(DecodeError::IncompleteClass {
                partial: Box::new(record),
                reason: "duplicate annotation element name".to_string(),
            })
        }
        Err(err) => {
            record.partial = true;
            Err(DecodeError::IncompleteClass {
                partial: Box::new(record),
                reason: err.to_string(),
            })
        }
    }
}

fn decode_header(reader: &mut ClassReader<'_>) -> Result<(ConstantPool, ClassRecord), ParseError> {
    reader.expect_magic()?;
    let minor = reader.read_u2()?;
    let major = reader.read_u2()?;
    if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major) {
        return Err(ParseError::UnsupportedVersion { major, minor });
    }

    let pool = ConstantPool::parse(reader)?;

    let access_flags = reader.read_u2()?;
    let this_class = reader.read_u2()?;
    let super_class = reader.read_u2()?;

    let name = internal_to_dotted(pool.class_name(this_class)?);
    let superclass = if super_class == 0 {
        if name != "java.lang.Object" && access_flags & ACC_MODULE == 0 {
            return Err(ParseError::MissingSuperclass(name));
        }
        None
    } else {
        Some(internal_to_dotted(pool.class_name(super_class)?))
    };

    let interfaces_count = reader.read_u2()?;
    let mut interfaces: Vec<String> = Vec::with_capacity(interfaces_count as usize);
    for _ in 0..interfaces_count {
        let iface = internal_to_dotted(pool.class_name(reader.read_u2()?)?);
        if !interfaces.contains(&iface) {
            interfaces.push(iface);
        }
    }

    let mut record = ClassRecord::new(name);
    record.superclass = superclass;
    record.interfaces = interfaces;
    record.modifiers = Modifiers(access_flags);
    Ok((pool, record))
}

fn decode_body(
    reader: &mut ClassReader<'_>,
    pool: &ConstantPool,
    record: &mut ClassRecord,
    duplicates: &mut bool,
) -> Result<(), ParseError> {
    let fields_count = reader.read_u2()?;
    for _ in 0..fields_count {
        let _access_flags = reader.read_u2()?;
        let name = pool.utf8(reader.read_u2()?)?.to_string();
        let _descriptor = pool.utf8(reader.read_u2()?)?;
        let attributes_count = reader.read_u2()?;

        let mut usages = Vec::new();
        for _ in 0..attributes_count {
            let (attr_name, body) = read_attribute(reader, pool)?;
            if let Some(retention) = annotation_retention(attr_name) {
                let mut parser = AnnotationParser::new(pool, attr_name);
                usages.extend(parser.annotations(body, retention)?);
                *duplicates |= parser.duplicates;
            }
        }
        if !usages.is_empty() {
            record.field_annotations.entry(name).or_default().extend(usages);
        }
    }

    let methods_count = reader.read_u2()?;
    for _ in 0..methods_count {
        let _access_flags = reader.read_u2()?;
        let name = pool.utf8(reader.read_u2()?)?;
        let descriptor = pool.utf8(reader.read_u2()?)?;
        let key = method_key(name, descriptor);
        let attributes_count = reader.read_u2()?;

        let mut usages = Vec::new();
        let mut parameters: Vec<Vec<AnnotationUsage>> = Vec::new();
        for _ in 0..attributes_count {
            let (attr_name, body) = read_attribute(reader, pool)?;
            if let Some(retention) = annotation_retention(attr_name) {
                let mut parser = AnnotationParser::new(pool, attr_name);
                usages.extend(parser.annotations(body, retention)?);
                *duplicates |= parser.duplicates;
            } else if let Some(retention) = parameter_retention(attr_name) {
                let mut parser = AnnotationParser::new(pool, attr_name);
                let per_param = parser.parameter_annotations(body, retention)?;
                *duplicates |= parser.duplicates;
                if parameters.len() < per_param.len() {
                    parameters.resize_with(per_param.len(), Vec::new);
                }
                for (slot, found) in parameters.iter_mut().zip(per_param) {
                    slot.extend(found);
                }
            }
        }
        if !usages.is_empty() {
            record
                .method_annotations
                .entry(key.clone())
                .or_default()
                .extend(usages);
        }
        if parameters.iter().any(|p| !p.is_empty()) {
            record.parameter_annotations.insert(key, parameters);
        }
    }

    let attributes_count = reader.read_u2()?;
    for _ in 0..attributes_count {
        let (attr_name, body) = read_attribute(reader, pool)?;
        if let Some(retention) = annotation_retention(attr_name) {
            let mut parser = AnnotationParser::new(pool, attr_name);
            let usages = parser.annotations(body, retention)?;
            *duplicates |= parser.duplicates;
            record.class_annotations.extend(usages);
        }
    }

    Ok(())
}

fn read_attribute<'a, 'p>(
    reader: &mut ClassReader<'a>,
    pool: &'p ConstantPool,
) -> Result<(&'p str, &'a [u8]), ParseError> {
    let name = pool.utf8(reader.read_u2()?)?;
    let length = reader.read_u4()? as usize;
    let body = reader.read_slice(length)?;
    Ok((name, body))
}

fn annotation_retention(attr_name: &str) -> Option<Retention> {
    match attr_name {
        RUNTIME_VISIBLE => Some(Retention::Runtime),
        RUNTIME_INVISIBLE => Some(Retention::Class),
        _ => None,
    }
}

fn parameter_retention(attr_name: &str) -> Option<Retention> {
    match attr_name {
        RUNTIME_VISIBLE_PARAMETER => Some(Retention::Runtime),
        RUNTIME_INVISIBLE_PARAMETER => Some(Retention::Class),
        _ => None,
    }
}

struct AnnotationParser<'p> {
    pool: &'p ConstantPool,
    attribute: &'p str,
    depth: usize,
    duplicates: bool,
}

impl<'p> AnnotationParser<'p> {
    fn new(pool: &'p ConstantPool, attribute: &'p str) -> Self {
        Self {
            pool,
            attribute,
            depth: 0,
            duplicates: false,
        }
    }

    fn annotations(
        &mut self,
        body: &[u8],
        retention: Retention,
    ) -> Result<Vec<AnnotationUsage>, ParseError> {
        let mut reader = ClassReader::new(body);
        let count = reader.read_u2().map_err(|e| self.invalid(e))?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.annotation(&mut reader, retention)?);
        }
        self.expect_consumed(&reader)?;
        Ok(out)
    }

    fn parameter_annotations(
        &mut self,
        body: &[u8],
        retention: Retention,
    ) -> Result<Vec<Vec<AnnotationUsage>>, ParseError> {
        let mut reader = ClassReader::new(body);
        let num_parameters = reader.read_u1().map_err(|e| self.invalid(e))?;
        let mut out = Vec::with_capacity(num_parameters as usize);
        for _ in 0..num_parameters {
            let count = reader.read_u2().map_err(|e| self.invalid(e))?;
            let mut usages = Vec::with_capacity(count as usize);
            for _ in 0..count {
                usages.push(self.annotation(&mut reader, retention)?);
            }
            out.push(usages);
        }
        self.expect_consumed(&reader)?;
        Ok(out)
    }

    fn annotation(
        &mut self,
        reader: &mut ClassReader<'_>,
        retention: Retention,
    ) -> Result<AnnotationUsage, ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ParseError::NestingTooDeep(MAX_NESTING));
        }

        let type_index = reader.read_u2().map_err(|e| self.invalid(e))?;
        let type_name = descriptor_type_name(self.pool.utf8(type_index)?)?;
        let mut usage = AnnotationUsage::new(type_name, retention);

        let pairs = reader.read_u2().map_err(|e| self.invalid(e))?;
        for _ in 0..pairs {
            let name_index = reader.read_u2().map_err(|e| self.invalid(e))?;
            let name = self.pool.utf8(name_index)?;
            let value = self.element_value(reader, retention)?;
            if !usage.elements.insert(name, value) {
                self.duplicates = true;
            }
        }

        self.depth -= 1;
        Ok(usage)
    }

    fn element_value(
        &mut self,
        reader: &mut ClassReader<'_>,
        retention: Retention,
    ) -> Result<ElementValue, ParseError> {
        let tag = reader.read_u1().map_err(|e| self.invalid(e))?;
        let pool = self.pool;
        let value = match tag {
            b'B' | b'C' | b'I' | b'S' | b'Z' => {
                let index = reader.read_u2().map_err(|e| self.invalid(e))?;
                let v = pool.integer(index)?;
                match tag {
                    b'B' => ElementValue::Byte(v as i8),
                    b'C' => ElementValue::Char(
                        char::from_u32(v as u32 & 0xFFFF).unwrap_or(char::REPLACEMENT_CHARACTER),
                    ),
                    b'S' => ElementValue::Short(v as i16),
                    b'Z' => ElementValue::Boolean(v != 0),
                    _ => ElementValue::Int(v),
                }
            }
            b'J' => ElementValue::Long(pool.long(reader.read_u2().map_err(|e| self.invalid(e))?)?),
            b'F' => {
                ElementValue::Float(pool.float(reader.read_u2().map_err(|e| self.invalid(e))?)?)
            }
            b'D' => {
                ElementValue::Double(pool.double(reader.read_u2().map_err(|e| self.invalid(e))?)?)
            }
            b's' => ElementValue::String(
                pool.utf8(reader.read_u2().map_err(|e| self.invalid(e))?)?
                    .to_string(),
            ),
            b'e' => {
                let type_index = reader.read_u2().map_err(|e| self.invalid(e))?;
                let const_index = reader.read_u2().map_err(|e| self.invalid(e))?;
                ElementValue::Enum {
                    type_name: descriptor_type_name(pool.utf8(type_index)?)?,
                    constant: pool.utf8(const_index)?.to_string(),
                }
            }
            b'c' => {
                let index = reader.read_u2().map_err(|e| self.invalid(e))?;
                ElementValue::Class(descriptor_type_name(pool.utf8(index)?)?)
            }
            b'@' => ElementValue::Annotation(Box::new(self.annotation(reader, retention)?)),
            b'[' => {
                self.depth += 1;
                if self.depth > MAX_NESTING {
                    return Err(ParseError::NestingTooDeep(MAX_NESTING));
                }
                let count = reader.read_u2().map_err(|e| self.invalid(e))?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.element_value(reader, retention)?);
                }
                self.depth -= 1;
                ElementValue::Array(items)
            }
            other => {
                return Err(ParseError::InvalidAttribute {
                    name: self.attribute.to_string(),
                    reason: format!("unknown element value tag {:?}", other as char),
                });
            }
        };
        Ok(value)
    }

    fn expect_consumed(&self, reader: &ClassReader<'_>) -> Result<(), ParseError> {
        if reader.remaining() != 0 {
            return Err(ParseError::InvalidAttribute {
                name: self.attribute.to_string(),
                reason: format!("{} trailing bytes", reader.remaining()),
            });
        }
        Ok(())
    }

    fn invalid(&self, err: ParseError) -> ParseError {
        ParseError::InvalidAttribute {
            name: self.attribute.to_string(),
            reason: err.to_string(),
        }
    }
}

/// `java/lang/String` to `java.lang.String`.
pub fn internal_to_dotted(name: &str) -> String {
    name.replace('/', ".")
}

/// Converts a field descriptor (or `V`) to a readable type name:
/// `Ljava/util/List;` to `java.util.List`, `[[I` to `int[][]`.
pub fn descriptor_type_name(descriptor: &str) -> Result<String, ParseError> {
    let dims = descriptor.bytes().take_while(|b| *b == b'[').count();
    let element = &descriptor[dims..];
    let base = match element {
        "B" => "byte".to_string(),
        "C" => "char".to_string(),
        "D" => "double".to_string(),
        "F" => "float".to_string(),
        "I" => "int".to_string(),
        "J" => "long".to_string(),
        "S" => "short".to_string(),
        "Z" => "boolean".to_string(),
        "V" if dims == 0 => "void".to_string(),
        _ => match element
            .strip_prefix('L')
            .and_then(|rest| rest.strip_suffix(';'))
        {
            Some(name) if !name.is_empty() && !name.contains(';') => internal_to_dotted(name),
            _ => return Err(ParseError::InvalidDescriptor(descriptor.to_string())),
        },
    };
    Ok(format!("{base}{}", "[]".repeat(dims)))
}

/// Inverse of [`descriptor_type_name`].
pub fn type_name_descriptor(type_name: &str) -> String {
    let mut dims = 0;
    let mut base = type_name;
    while let Some(stripped) = base.strip_suffix("[]") {
        dims += 1;
        base = stripped;
    }
    let element = match base {
        "byte" => "B".to_string(),
        "char" => "C".to_string(),
        "double" => "D".to_string(),
        "float" => "F".to_string(),
        "int" => "I".to_string(),
        "long" => "J".to_string(),
        "short" => "S".to_string(),
        "boolean" => "Z".to_string(),
        "void" => "V".to_string(),
        other => format!("L{};", other.replace('.', "/")),
    };
    format!("{}{element}", "[".repeat(dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassFileBuilder;
    use crate::record::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC};

    fn runtime(name: &str) -> AnnotationUsage {
        AnnotationUsage::new(name, Retention::Runtime)
    }

    #[test]
    fn decodes_structure_and_class_annotations() {
        let bytes = ClassFileBuilder::new("org.example.UserService")
            .superclass("org.example.BaseService")
            .interface("org.example.Service")
            .interface("java.io.Serializable")
            .annotation(
                runtime("org.example.Component")
                    .with_element("value", ElementValue::String("users".into())),
            )
            .annotation(AnnotationUsage::new("org.example.Audit", Retention::Class))
            .build();

        let record = decode(&bytes).unwrap();
        assert_eq!(record.name, "org.example.UserService");
        assert_eq!(record.superclass.as_deref(), Some("org.example.BaseService"));
        assert_eq!(
            record.interfaces,
            vec!["org.example.Service", "java.io.Serializable"]
        );
        assert!(record.modifiers.is_public());
        assert!(!record.partial);

        assert_eq!(record.class_annotations.len(), 2);
        let component = record.class_annotation("org.example.Component").unwrap();
        assert!(component.is_runtime_visible());
        assert_eq!(
            component.elements.get("value"),
            Some(&ElementValue::String("users".into()))
        );
        let audit = record.class_annotation("org.example.Audit").unwrap();
        assert_eq!(audit.retention, Retention::Class);
    }

    #[test]
    fn decodes_field_method_and_parameter_annotations() {
        let bytes = ClassFileBuilder::new("a.Resource")
            .field("em", "Ljavax/persistence/EntityManager;", vec![runtime("a.Inject")])
            .field("plain", "I", vec![])
            .method(
                "find",
                "(Ljava/lang/String;)Ljava/lang/Object;",
                vec![runtime("a.GET")],
                vec![vec![runtime("a.PathParam").with_element("value", ElementValue::String("id".into()))]],
            )
            .method("find", "(I)Ljava/lang/Object;", vec![runtime("a.POST")], vec![])
            .build();

        let record = decode(&bytes).unwrap();
        assert_eq!(record.field_annotations.len(), 1);
        assert_eq!(record.field_annotations["em"][0].type_name, "a.Inject");

        assert_eq!(record.method_annotations.len(), 2);
        let by_string = method_key("find", "(Ljava/lang/String;)Ljava/lang/Object;");
        let by_int = method_key("find", "(I)Ljava/lang/Object;");
        assert_eq!(record.method_annotations[&by_string][0].type_name, "a.GET");
        assert_eq!(record.method_annotations[&by_int][0].type_name, "a.POST");

        let params = &record.parameter_annotations[&by_string];
        assert_eq!(params.len(), 1);
        assert_eq!(params[0][0].type_name, "a.PathParam");
        assert!(!record.parameter_annotations.contains_key(&by_int));
    }

    #[test]
    fn decodes_every_literal_kind() {
        let nested = runtime("a.Nested").with_element("n", ElementValue::Int(1));
        let usage = runtime("a.All")
            .with_element("b", ElementValue::Byte(-3))
            .with_element("c", ElementValue::Char('x'))
            .with_element("s", ElementValue::Short(300))
            .with_element("i", ElementValue::Int(-7))
            .with_element("j", ElementValue::Long(1 << 40))
            .with_element("f", ElementValue::Float(1.5))
            .with_element("d", ElementValue::Double(-2.25))
            .with_element("z", ElementValue::Boolean(true))
            .with_element("str", ElementValue::String("text".into()))
            .with_element(
                "e",
                ElementValue::Enum {
                    type_name: "java.lang.annotation.ElementType".into(),
                    constant: "TYPE".into(),
                },
            )
            .with_element("cls", ElementValue::Class("java.lang.String[]".into()))
            .with_element("v", ElementValue::Class("void".into()))
            .with_element("at", ElementValue::Annotation(Box::new(nested)))
            .with_element(
                "arr",
                ElementValue::Array(vec![ElementValue::Int(1), ElementValue::Int(2)]),
            );
        let bytes = ClassFileBuilder::new("a.Literals")
            .annotation(usage.clone())
            .build();

        let record = decode(&bytes).unwrap();
        assert_eq!(record.class_annotations, vec![usage]);
    }

    #[test]
    fn object_has_no_superclass() {
        let bytes = ClassFileBuilder::new("java.lang.Object").no_superclass().build();
        let record = decode(&bytes).unwrap();
        assert_eq!(record.superclass, None);
    }

    #[test]
    fn missing_superclass_elsewhere_is_malformed() {
        let bytes = ClassFileBuilder::new("a.Orphan").no_superclass().build();
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::MalformedClass { .. })
        ));
    }

    #[test]
    fn bad_magic_and_version_are_malformed() {
        let mut bytes = ClassFileBuilder::new("a.A").build();
        bytes[0] = 0;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedClass { .. }));
        assert!(err.reason().contains("magic"));

        let bytes = ClassFileBuilder::new("a.A").version(MAX_MAJOR_VERSION + 1).build();
        let err = decode(&bytes).unwrap_err();
        assert!(err.reason().contains("unsupported class file version"));

        assert!(matches!(
            decode(&[]),
            Err(DecodeError::MalformedClass { .. })
        ));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let bytes = ClassFileBuilder::new("a.A").interface("a.I").build();
        // Cut inside the constant pool.
        assert!(matches!(
            decode(&bytes[..12]),
            Err(DecodeError::MalformedClass { .. })
        ));
    }

    #[test]
    fn truncated_body_returns_partial_record() {
        let bytes = ClassFileBuilder::new("a.Partial")
            .superclass("a.Base")
            .interface("a.I")
            .method("run", "()V", vec![runtime("a.Timed")], vec![])
            .annotation(runtime("a.Marker"))
            .build();
        let cut = &bytes[..bytes.len() - 3];

        match decode(cut) {
            Err(DecodeError::IncompleteClass { partial, .. }) => {
                assert_eq!(partial.name, "a.Partial");
                assert_eq!(partial.superclass.as_deref(), Some("a.Base"));
                assert_eq!(partial.interfaces, vec!["a.I"]);
                assert!(partial.partial);
                assert!(partial.method_annotations.contains_key("run()V"));
                assert!(partial.class_annotations.is_empty());
            }
            other => panic!("expected incomplete class, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_interfaces_are_collapsed() {
        let bytes = ClassFileBuilder::new("a.Twice")
            .interface("a.I")
            .interface("a.I")
            .build();
        let record = decode(&bytes).unwrap();
        assert_eq!(record.interfaces, vec!["a.I"]);
    }

    #[test]
    fn interface_modifiers_are_reported() {
        let bytes = ClassFileBuilder::new("a.Api")
            .access(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .build();
        let record = decode(&bytes).unwrap();
        assert!(record.modifiers.is_interface());
        assert!(record.modifiers.is_abstract());
    }

    #[test]
    fn descriptor_names_round_trip() {
        for (descriptor, name) in [
            ("Ljava/lang/String;", "java.lang.String"),
            ("[[I", "int[][]"),
            ("[La/B;", "a.B[]"),
            ("V", "void"),
            ("Z", "boolean"),
        ] {
            assert_eq!(descriptor_type_name(descriptor).unwrap(), name);
            assert_eq!(type_name_descriptor(name), descriptor);
        }
        assert!(descriptor_type_name("Lbroken").is_err());
        assert!(descriptor_type_name("[V").is_err());
        assert!(descriptor_type_name("Q").is_err());
    }
}
