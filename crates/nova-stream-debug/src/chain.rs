//! The typed stream chain handed to the tracer.
//!
//! Chains come from an external parser. They are plain data: every call
//! records its name, erased argument types, declaring stream type and the
//! element type flowing in and out of it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TraceError;
use crate::signature::MethodSignature;

/// Element type of a stream at some point in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    #[serde(rename = "java.lang.Object")]
    Object,
    #[serde(rename = "java.lang.Integer")]
    Int,
    #[serde(rename = "java.lang.Long")]
    Long,
    #[serde(rename = "java.lang.Double")]
    Double,
}

impl ElementType {
    pub fn type_name(self) -> &'static str {
        match self {
            ElementType::Object => "java.lang.Object",
            ElementType::Int => "java.lang.Integer",
            ElementType::Long => "java.lang.Long",
            ElementType::Double => "java.lang.Double",
        }
    }

    /// The stream interface carrying elements of this type.
    pub fn stream_type(self) -> &'static str {
        match self {
            ElementType::Object => "java.util.stream.Stream",
            ElementType::Int => "java.util.stream.IntStream",
            ElementType::Long => "java.util.stream.LongStream",
            ElementType::Double => "java.util.stream.DoubleStream",
        }
    }

    pub fn from_stream_type(type_name: &str) -> Option<Self> {
        Some(match type_name {
            "java.util.stream.Stream" => ElementType::Object,
            "java.util.stream.IntStream" => ElementType::Int,
            "java.util.stream.LongStream" => ElementType::Long,
            "java.util.stream.DoubleStream" => ElementType::Double,
            _ => return None,
        })
    }

    /// Descriptor of `peek` on [`ElementType::stream_type`].
    pub fn peek_descriptor(self) -> &'static str {
        match self {
            ElementType::Object => "(Ljava/util/function/Consumer;)Ljava/util/stream/Stream;",
            ElementType::Int => "(Ljava/util/function/IntConsumer;)Ljava/util/stream/IntStream;",
            ElementType::Long => {
                "(Ljava/util/function/LongConsumer;)Ljava/util/stream/LongStream;"
            }
            ElementType::Double => {
                "(Ljava/util/function/DoubleConsumer;)Ljava/util/stream/DoubleStream;"
            }
        }
    }

    /// Static formatter on the helper utilities turning a collected map into
    /// `{int[] keys, X[] values}`.
    pub fn format_method(self) -> &'static str {
        match self {
            ElementType::Object => "formatObjectMap",
            ElementType::Int => "formatIntMap",
            ElementType::Long => "formatLongMap",
            ElementType::Double => "formatDoubleMap",
        }
    }
}

impl FromStr for ElementType {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "java.lang.Object" => ElementType::Object,
            "java.lang.Integer" | "int" => ElementType::Int,
            "java.lang.Long" | "long" => ElementType::Long,
            "java.lang.Double" | "double" => ElementType::Double,
            other => {
                return Err(TraceError::ValueInstantiation {
                    class_name: other.to_string(),
                    reason: "no stream element type for this class".to_string(),
                })
            }
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRange {
    pub start: u32,
    pub end: u32,
}

/// One `.name(args)` segment of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCall {
    pub name: String,
    /// Erased Java type names of the declared parameters.
    pub arguments: Vec<String>,
    /// The stream interface the call is made on, e.g. `java.util.stream.IntStream`.
    pub declaring_type: String,
    pub type_before: Option<ElementType>,
    pub type_after: Option<ElementType>,
    #[serde(default)]
    pub text_range: TextRange,
}

impl StreamCall {
    pub fn new<I, S>(
        name: impl Into<String>,
        declaring_type: impl Into<String>,
        arguments: I,
        type_before: Option<ElementType>,
        type_after: Option<ElementType>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            declaring_type: declaring_type.into(),
            type_before,
            type_after,
            text_range: TextRange::default(),
        }
    }

    pub fn with_text_range(mut self, start: u32, end: u32) -> Self {
        self.text_range = TextRange { start, end };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatorCall {
    #[serde(flatten)]
    pub call: StreamCall,
    /// Erased Java type of the terminal result, `void` when there is none.
    pub result_type: String,
}

impl TerminatorCall {
    pub fn new(call: StreamCall, result_type: impl Into<String>) -> Self {
        Self {
            call,
            result_type: result_type.into(),
        }
    }

    pub fn returns_void(&self) -> bool {
        self.result_type == "void"
    }
}

/// The expression producing the source stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QualifierExpression {
    /// A local variable already holding the stream (`numbers.filter(...)`).
    #[serde(rename_all = "camelCase")]
    Variable { text: String, variable_name: String },
    /// A call producing the stream (`list.stream()`).
    MethodCall {
        text: String,
        signature: MethodSignature,
    },
}

impl QualifierExpression {
    pub fn text(&self) -> &str {
        match self {
            QualifierExpression::Variable { text, .. } | QualifierExpression::MethodCall { text, .. } => {
                text
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChain {
    pub text: String,
    pub qualifier_expression: QualifierExpression,
    pub intermediate_calls: Vec<StreamCall>,
    pub termination_call: TerminatorCall,
}

impl StreamChain {
    pub fn new(
        text: impl Into<String>,
        qualifier_expression: QualifierExpression,
        intermediate_calls: Vec<StreamCall>,
        termination_call: TerminatorCall,
    ) -> Self {
        Self {
            text: text.into(),
            qualifier_expression,
            intermediate_calls,
            termination_call,
        }
    }

    /// Element type entering the first traced call.
    pub fn source_element_type(&self) -> Option<ElementType> {
        self.intermediate_calls
            .first()
            .unwrap_or(&self.termination_call.call)
            .type_before
    }

    pub fn has_source_call(&self) -> bool {
        matches!(
            self.qualifier_expression,
            QualifierExpression::MethodCall { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn element_types_parse_from_java_names() {
        assert_eq!("java.lang.Integer".parse::<ElementType>().unwrap(), ElementType::Int);
        assert_eq!("double".parse::<ElementType>().unwrap(), ElementType::Double);
        let err = "java.lang.String".parse::<ElementType>().unwrap_err();
        assert!(matches!(err, TraceError::ValueInstantiation { ref class_name, .. } if class_name == "java.lang.String"));
    }

    #[test]
    fn chain_serializes_with_java_type_names() {
        let chain = StreamChain::new(
            "numbers.filter(x -> x > 1).count()",
            QualifierExpression::Variable {
                text: "numbers".to_string(),
                variable_name: "numbers".to_string(),
            },
            vec![StreamCall::new(
                "filter",
                "java.util.stream.IntStream",
                ["java.util.function.IntPredicate"],
                Some(ElementType::Int),
                Some(ElementType::Int),
            )
            .with_text_range(7, 26)],
            TerminatorCall::new(
                StreamCall::new(
                    "count",
                    "java.util.stream.IntStream",
                    Vec::<String>::new(),
                    Some(ElementType::Int),
                    None,
                ),
                "long",
            ),
        );

        let json = serde_json::to_value(&chain).unwrap();
        assert_eq!(json["qualifierExpression"]["kind"], "variable");
        assert_eq!(json["qualifierExpression"]["variableName"], "numbers");
        assert_eq!(json["intermediateCalls"][0]["typeBefore"], "java.lang.Integer");
        assert_eq!(json["terminationCall"]["resultType"], "long");
        assert_eq!(json["terminationCall"]["name"], "count");

        let back: StreamChain = serde_json::from_value(json).unwrap();
        assert_eq!(back, chain);
        assert_eq!(back.source_element_type(), Some(ElementType::Int));
        assert!(!back.has_source_call());
    }
}
