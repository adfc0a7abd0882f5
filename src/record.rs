//! Structural facts extracted from one class file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_ANNOTATION: u16 = 0x2000;
pub const ACC_ENUM: u16 = 0x4000;

/// Class-level access flags as stored in the class file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modifiers(pub u16);

impl Modifiers {
    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_public(self) -> bool {
        self.0 & ACC_PUBLIC != 0
    }

    pub fn is_final(self) -> bool {
        self.0 & ACC_FINAL != 0
    }

    pub fn is_interface(self) -> bool {
        self.0 & ACC_INTERFACE != 0
    }

    pub fn is_abstract(self) -> bool {
        self.0 & ACC_ABSTRACT != 0
    }

    pub fn is_synthetic(self) -> bool {
        self.0 & ACC_SYNTHETIC != 0
    }

    pub fn is_annotation(self) -> bool {
        self.0 & ACC_ANNOTATION != 0
    }

    pub fn is_enum(self) -> bool {
        self.0 & ACC_ENUM != 0
    }

    /// Source-level keywords, in declaration order.
    pub fn keywords(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.is_public() {
            out.push("public");
        }
        if self.is_abstract() && !self.is_interface() {
            out.push("abstract");
        }
        if self.is_final() {
            out.push("final");
        }
        if self.is_annotation() {
            out.push("@interface");
        } else if self.is_interface() {
            out.push("interface");
        } else if self.is_enum() {
            out.push("enum");
        } else {
            out.push("class");
        }
        out
    }
}

/// Which class-file attribute an annotation usage came from.
///
/// Source-retained annotations never reach the class file, so they have no
/// variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Retention {
    /// `RuntimeVisible*Annotations`
    Runtime,
    /// `RuntimeInvisible*Annotations` (class retention)
    Class,
}

/// A literal annotation element value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementValue {
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    Enum { type_name: String, constant: String },
    Class(String),
    Annotation(Box<AnnotationUsage>),
    Array(Vec<ElementValue>),
}

impl fmt::Display for ElementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "'{v}'"),
            Self::Short(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}L"),
            Self::Float(v) => write!(f, "{v}f"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Enum {
                type_name,
                constant,
            } => write!(f, "{type_name}.{constant}"),
            Self::Class(v) => write!(f, "{v}.class"),
            Self::Annotation(a) => write!(f, "{a}"),
            Self::Array(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Insertion-ordered element name to value mapping with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementValues(Vec<(String, ElementValue)>);

impl ElementValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `name = value`. Returns `false` and keeps the existing value
    /// when `name` is already present.
    pub fn insert(&mut self, name: impl Into<String>, value: ElementValue) -> bool {
        let name = name.into();
        if self.0.iter().any(|(n, _)| *n == name) {
            return false;
        }
        self.0.push((name, value));
        true
    }

    pub fn get(&self, name: &str) -> Option<&ElementValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ElementValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One annotation applied to a class, field, method or parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationUsage {
    pub type_name: String,
    pub retention: Retention,
    pub elements: ElementValues,
}

impl AnnotationUsage {
    pub fn new(type_name: impl Into<String>, retention: Retention) -> Self {
        Self {
            type_name: type_name.into(),
            retention,
            elements: ElementValues::new(),
        }
    }

    pub fn with_element(mut self, name: &str, value: ElementValue) -> Self {
        self.elements.insert(name, value);
        self
    }

    pub fn is_runtime_visible(&self) -> bool {
        self.retention == Retention::Runtime
    }
}

impl fmt::Display for AnnotationUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.type_name)?;
        if self.elements.is_empty() {
            return Ok(());
        }
        f.write_str("(")?;
        for (i, (name, value)) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str(")")
    }
}

/// Key for method-level maps: name immediately followed by the descriptor,
/// e.g. `find(Ljava/lang/String;)Ljava/lang/Object;`.
pub fn method_key(name: &str, descriptor: &str) -> String {
    format!("{name}{descriptor}")
}

/// One scanned class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRecord {
    /// Fully-qualified, dot separated. Nested classes keep their `$`.
    pub name: String,
    /// Absent only for `java.lang.Object` (and module descriptors).
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub modifiers: Modifiers,
    pub class_annotations: Vec<AnnotationUsage>,
    pub field_annotations: BTreeMap<String, Vec<AnnotationUsage>>,
    pub method_annotations: BTreeMap<String, Vec<AnnotationUsage>>,
    /// Per method key, one list per declared parameter.
    pub parameter_annotations: BTreeMap<String, Vec<Vec<AnnotationUsage>>>,
    /// Set when the class file was only partly decodable.
    pub partial: bool,
}

impl ClassRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            interfaces: Vec::new(),
            modifiers: Modifiers::default(),
            class_annotations: Vec::new(),
            field_annotations: BTreeMap::new(),
            method_annotations: BTreeMap::new(),
            parameter_annotations: BTreeMap::new(),
            partial: false,
        }
    }

    pub fn package(&self) -> &str {
        package_of(&self.name)
    }

    pub fn simple_name(&self) -> &str {
        self.name.rsplit_once('.').map_or(&self.name, |(_, s)| s)
    }

    pub fn class_annotation_names(&self) -> impl Iterator<Item = &str> {
        self.class_annotations.iter().map(|a| a.type_name.as_str())
    }

    pub fn has_class_annotation(&self, type_name: &str) -> bool {
        self.class_annotation_names().any(|n| n == type_name)
    }

    pub fn class_annotation(&self, type_name: &str) -> Option<&AnnotationUsage> {
        self.class_annotations
            .iter()
            .find(|a| a.type_name == type_name)
    }

    pub fn has_field_annotation(&self, type_name: &str) -> bool {
        self.field_annotations
            .values()
            .flatten()
            .any(|a| a.type_name == type_name)
    }

    /// Method or method-parameter annotation.
    pub fn has_method_annotation(&self, type_name: &str) -> bool {
        self.method_annotations
            .values()
            .flatten()
            .any(|a| a.type_name == type_name)
            || self
                .parameter_annotations
                .values()
                .flatten()
                .flatten()
                .any(|a| a.type_name == type_name)
    }

    /// Superclass followed by the directly implemented interfaces.
    pub fn direct_supertypes(&self) -> impl Iterator<Item = &str> {
        self.superclass
            .as_deref()
            .into_iter()
            .chain(self.interfaces.iter().map(String::as_str))
    }
}

/// Package segment of a dotted class name; empty for the default package.
pub fn package_of(class_name: &str) -> &str {
    class_name.rsplit_once('.').map_or("", |(pkg, _)| pkg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_values_keep_insertion_order_and_reject_duplicates() {
        let mut values = ElementValues::new();
        assert!(values.insert("value", ElementValue::String("a".into())));
        assert!(values.insert("name", ElementValue::Int(3)));
        assert!(!values.insert("value", ElementValue::String("b".into())));

        assert_eq!(values.names().collect::<Vec<_>>(), vec!["value", "name"]);
        assert_eq!(values.get("value"), Some(&ElementValue::String("a".into())));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn annotation_display_renders_elements() {
        let usage = AnnotationUsage::new("javax.ws.rs.Path", Retention::Runtime)
            .with_element("value", ElementValue::String("/users".into()))
            .with_element(
                "kinds",
                ElementValue::Array(vec![
                    ElementValue::Enum {
                        type_name: "a.Kind".into(),
                        constant: "ONE".into(),
                    },
                    ElementValue::Class("java.lang.String".into()),
                ]),
            );
        assert_eq!(
            usage.to_string(),
            r#"@javax.ws.rs.Path(value="/users", kinds={a.Kind.ONE, java.lang.String.class})"#
        );
    }

    #[test]
    fn package_and_simple_name() {
        let record = ClassRecord::new("org.example.web.Controller$Inner");
        assert_eq!(record.package(), "org.example.web");
        assert_eq!(record.simple_name(), "Controller$Inner");
        assert_eq!(package_of("Toplevel"), "");
    }

    #[test]
    fn modifiers_keywords() {
        let m = Modifiers(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT | ACC_ANNOTATION);
        assert_eq!(m.keywords(), vec!["public", "@interface"]);
        assert!(m.is_annotation());

        let m = Modifiers(ACC_PUBLIC | ACC_FINAL | ACC_ENUM);
        assert_eq!(m.keywords(), vec!["public", "final", "enum"]);
    }

    #[test]
    fn method_annotation_lookup_includes_parameters() {
        let mut record = ClassRecord::new("a.Service");
        record.parameter_annotations.insert(
            method_key("find", "(Ljava/lang/String;)V"),
            vec![vec![AnnotationUsage::new("a.NotNull", Retention::Runtime)]],
        );
        assert!(record.has_method_annotation("a.NotNull"));
        assert!(!record.has_field_annotation("a.NotNull"));
    }
}
