//! Java method signatures in source form and their JNI descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A method identified by erased Java source-level type names.
///
/// `argument_types` and `return_type` use names such as `int`,
/// `java.util.function.Predicate` or `java.lang.Object[]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSignature {
    pub containing_class: String,
    pub name: String,
    pub argument_types: Vec<String>,
    pub return_type: String,
}

impl MethodSignature {
    pub fn new<I, S>(
        containing_class: impl Into<String>,
        name: impl Into<String>,
        argument_types: I,
        return_type: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            containing_class: containing_class.into(),
            name: name.into(),
            argument_types: argument_types.into_iter().map(Into::into).collect(),
            return_type: return_type.into(),
        }
    }

    /// Builds a signature from a JNI method descriptor such as `(I)Ljava/lang/String;`.
    pub fn from_descriptor(
        containing_class: impl Into<String>,
        name: impl Into<String>,
        descriptor: &str,
    ) -> Option<Self> {
        let (argument_types, return_type) = parse_method_descriptor(descriptor)?;
        Some(Self {
            containing_class: containing_class.into(),
            name: name.into(),
            argument_types,
            return_type,
        })
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::from("(");
        for arg in &self.argument_types {
            out.push_str(&type_name_to_signature(arg));
        }
        out.push(')');
        out.push_str(&type_name_to_signature(&self.return_type));
        out
    }

    /// Whether a live method with `name` and JNI `descriptor` is this method.
    pub fn matches(&self, name: &str, descriptor: &str) -> bool {
        self.name == name && self.descriptor() == descriptor
    }

    /// JDWP argument slots of the method's frame, paired with each slot's JNI signature.
    ///
    /// Slot 0 holds `this` for instance methods; `long` and `double` take two slots.
    pub fn argument_slots(&self, is_static: bool) -> Vec<(u32, String)> {
        let mut slot = u32::from(!is_static);
        let mut slots = Vec::with_capacity(self.argument_types.len());
        for arg in &self.argument_types {
            let signature = type_name_to_signature(arg);
            let width = if matches!(signature.as_str(), "J" | "D") { 2 } else { 1 };
            slots.push((slot, signature));
            slot += width;
        }
        slots
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.containing_class,
            self.name,
            self.argument_types.join(", ")
        )
    }
}

/// `int` -> `I`, `java.lang.String` -> `Ljava/lang/String;`, `int[]` -> `[I`.
pub fn type_name_to_signature(type_name: &str) -> String {
    if let Some(component) = type_name.strip_suffix("[]") {
        return format!("[{}", type_name_to_signature(component));
    }
    match type_name {
        "boolean" => "Z".to_string(),
        "byte" => "B".to_string(),
        "char" => "C".to_string(),
        "short" => "S".to_string(),
        "int" => "I".to_string(),
        "long" => "J".to_string(),
        "float" => "F".to_string(),
        "double" => "D".to_string(),
        "void" => "V".to_string(),
        _ => format!("L{};", type_name.replace('.', "/")),
    }
}

/// Inverse of [`type_name_to_signature`]. Returns `None` for malformed input.
pub fn signature_to_type_name(signature: &str) -> Option<String> {
    let (name, rest) = split_field_signature(signature)?;
    rest.is_empty().then_some(name)
}

/// The name `Class.forName` expects: binary names for classes, descriptor-like
/// names (`[I`, `[Ljava.lang.String;`) for arrays.
pub fn class_for_name(type_name: &str) -> String {
    if type_name.ends_with("[]") {
        type_name_to_signature(type_name).replace('/', ".")
    } else {
        type_name.to_string()
    }
}

fn parse_method_descriptor(descriptor: &str) -> Option<(Vec<String>, String)> {
    let mut rest = descriptor.strip_prefix('(')?;
    let mut args = Vec::new();
    while !rest.starts_with(')') {
        let (arg, tail) = split_field_signature(rest)?;
        args.push(arg);
        rest = tail;
    }
    let return_type = signature_to_type_name(&rest[1..])?;
    Some((args, return_type))
}

fn split_field_signature(signature: &str) -> Option<(String, &str)> {
    let first = signature.chars().next()?;
    let rest = &signature[1..];
    let primitive = match first {
        'Z' => "boolean",
        'B' => "byte",
        'C' => "char",
        'S' => "short",
        'I' => "int",
        'J' => "long",
        'F' => "float",
        'D' => "double",
        'V' => "void",
        'L' => {
            let end = rest.find(';')?;
            return Some((rest[..end].replace('/', "."), &rest[end + 1..]));
        }
        '[' => {
            let (component, tail) = split_field_signature(rest)?;
            return Some((format!("{component}[]"), tail));
        }
        _ => return None,
    };
    Some((primitive.to_string(), rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn descriptor_uses_jni_names() {
        let sig = MethodSignature::new(
            "java.util.stream.Stream",
            "filter",
            ["java.util.function.Predicate"],
            "java.util.stream.Stream",
        );
        assert_eq!(
            sig.descriptor(),
            "(Ljava/util/function/Predicate;)Ljava/util/stream/Stream;"
        );
        assert!(sig.matches(
            "filter",
            "(Ljava/util/function/Predicate;)Ljava/util/stream/Stream;"
        ));
        assert!(!sig.matches(
            "filter",
            "(Ljava/util/function/IntPredicate;)Ljava/util/stream/IntStream;"
        ));
    }

    #[test]
    fn descriptors_parse_back_into_signatures() {
        let sig = MethodSignature::from_descriptor(
            "java.lang.ClassLoader",
            "defineClass",
            "(Ljava/lang/String;[BII)Ljava/lang/Class;",
        )
        .unwrap();
        assert_eq!(
            sig.argument_types,
            vec!["java.lang.String", "byte[]", "int", "int"]
        );
        assert_eq!(sig.return_type, "java.lang.Class");
        assert_eq!(sig.descriptor(), "(Ljava/lang/String;[BII)Ljava/lang/Class;");
        assert_eq!(MethodSignature::from_descriptor("A", "m", "(Q)V"), None);
    }

    #[test]
    fn wide_arguments_take_two_slots() {
        let sig = MethodSignature::new("A", "m", ["long", "int", "double", "java.lang.Object"], "void");
        assert_eq!(
            sig.argument_slots(false),
            vec![
                (1, "J".to_string()),
                (3, "I".to_string()),
                (4, "D".to_string()),
                (6, "Ljava/lang/Object;".to_string()),
            ]
        );
        assert_eq!(sig.argument_slots(true)[0], (0, "J".to_string()));
    }

    #[test]
    fn array_names_for_class_lookup() {
        assert_eq!(class_for_name("int[]"), "[I");
        assert_eq!(class_for_name("java.lang.Throwable[]"), "[Ljava.lang.Throwable;");
        assert_eq!(class_for_name("java.util.LinkedHashMap"), "java.util.LinkedHashMap");
        assert_eq!(signature_to_type_name("[[J").as_deref(), Some("long[][]"));
    }
}
