//! Mapping chain calls to the JDK methods that get breakpoints.

use serde::{Deserialize, Serialize};

use crate::chain::{ElementType, StreamCall, StreamChain};
use crate::error::{Result, TraceError};
use crate::signature::MethodSignature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChainBreakpointPlaces {
    /// `None` when the qualifier is a bare variable.
    pub qualifier_expression_method: Option<MethodSignature>,
    pub intermediate_steps_methods: Vec<MethodSignature>,
    pub termination_operation_method: MethodSignature,
}

impl StreamChainBreakpointPlaces {
    /// Source (if any), intermediates, terminal.
    pub fn all(&self) -> impl Iterator<Item = &MethodSignature> {
        self.qualifier_expression_method
            .iter()
            .chain(&self.intermediate_steps_methods)
            .chain(std::iter::once(&self.termination_operation_method))
    }
}

pub trait BreakpointResolver: Send + Sync {
    fn find_places(&self, chain: &StreamChain) -> Result<StreamChainBreakpointPlaces>;
}

/// Resolves calls against the `java.util.stream` interfaces of the JDK.
#[derive(Debug, Clone, Copy, Default)]
pub struct JdkStreamResolver;

impl BreakpointResolver for JdkStreamResolver {
    fn find_places(&self, chain: &StreamChain) -> Result<StreamChainBreakpointPlaces> {
        let qualifier_expression_method = match &chain.qualifier_expression {
            crate::chain::QualifierExpression::Variable { .. } => None,
            crate::chain::QualifierExpression::MethodCall { signature, .. } => {
                Some(signature.clone())
            }
        };
        let intermediate_steps_methods = chain
            .intermediate_calls
            .iter()
            .map(resolve_call)
            .collect::<Result<Vec<_>>>()?;
        let termination_operation_method = resolve_call(&chain.termination_call.call)?;

        Ok(StreamChainBreakpointPlaces {
            qualifier_expression_method,
            intermediate_steps_methods,
            termination_operation_method,
        })
    }
}

fn resolve_call(call: &StreamCall) -> Result<MethodSignature> {
    let not_found = |reason: &str| TraceError::PlaceForBreakpointNotFound {
        call: call.name.clone(),
        reason: reason.to_string(),
    };

    let element = ElementType::from_stream_type(&call.declaring_type)
        .ok_or_else(|| not_found("declaring type is not a stream interface"))?;
    let arg_count = call.arguments.len();
    let resolved = match element {
        ElementType::Object => resolve_stream_method_stream(&call.name, arg_count),
        primitive => resolve_stream_method_primitive(primitive, &call.name, arg_count),
    };
    let (containing_class, return_type) =
        resolved.ok_or_else(|| not_found("no such stream method"))?;

    Ok(MethodSignature {
        containing_class: containing_class
            .unwrap_or(call.declaring_type.as_str())
            .to_string(),
        name: call.name.clone(),
        argument_types: call.arguments.clone(),
        return_type: return_type.to_string(),
    })
}

const BASE_STREAM: &str = "java.util.stream.BaseStream";

/// Returns `(declaring class override, erased return type)`.
fn resolve_stream_method_stream(
    name: &str,
    arg_count: usize,
) -> Option<(Option<&'static str>, &'static str)> {
    let return_type = match (name, arg_count) {
        ("map", 1)
        | ("filter", 1)
        | ("flatMap", 1)
        | ("mapMulti", 1)
        | ("sorted", 0)
        | ("sorted", 1)
        | ("distinct", 0)
        | ("limit", 1)
        | ("skip", 1)
        | ("takeWhile", 1)
        | ("dropWhile", 1)
        | ("peek", 1) => "java.util.stream.Stream",
        ("mapToInt", 1) | ("flatMapToInt", 1) => "java.util.stream.IntStream",
        ("mapToLong", 1) | ("flatMapToLong", 1) => "java.util.stream.LongStream",
        ("mapToDouble", 1) | ("flatMapToDouble", 1) => "java.util.stream.DoubleStream",
        ("parallel", 0) | ("sequential", 0) | ("unordered", 0) | ("onClose", 1) => {
            return Some((Some(BASE_STREAM), BASE_STREAM))
        }
        ("count", 0) => "long",
        ("anyMatch", 1) | ("allMatch", 1) | ("noneMatch", 1) => "boolean",
        ("findFirst", 0) | ("findAny", 0) | ("min", 1) | ("max", 1) | ("reduce", 1) => {
            "java.util.Optional"
        }
        ("collect", 1) | ("collect", 3) | ("reduce", 2) | ("reduce", 3) => "java.lang.Object",
        ("toList", 0) => "java.util.List",
        ("toArray", 0) | ("toArray", 1) => "java.lang.Object[]",
        ("forEach", 1) | ("forEachOrdered", 1) => "void",
        _ => return None,
    };
    Some((None, return_type))
}

fn resolve_stream_method_primitive(
    element: ElementType,
    name: &str,
    arg_count: usize,
) -> Option<(Option<&'static str>, &'static str)> {
    let (primitive, optional, statistics) = match element {
        ElementType::Int => ("int", "java.util.OptionalInt", "java.util.IntSummaryStatistics"),
        ElementType::Long => ("long", "java.util.OptionalLong", "java.util.LongSummaryStatistics"),
        ElementType::Double => (
            "double",
            "java.util.OptionalDouble",
            "java.util.DoubleSummaryStatistics",
        ),
        ElementType::Object => return None,
    };
    let own_stream = element.stream_type();
    let array = match element {
        ElementType::Int => "int[]",
        ElementType::Long => "long[]",
        _ => "double[]",
    };

    let return_type = match (name, arg_count) {
        ("map", 1)
        | ("filter", 1)
        | ("flatMap", 1)
        | ("sorted", 0)
        | ("distinct", 0)
        | ("limit", 1)
        | ("skip", 1)
        | ("takeWhile", 1)
        | ("dropWhile", 1)
        | ("peek", 1)
        | ("parallel", 0)
        | ("sequential", 0) => own_stream,
        ("unordered", 0) | ("onClose", 1) => return Some((Some(BASE_STREAM), BASE_STREAM)),
        ("mapToObj", 1) | ("boxed", 0) => "java.util.stream.Stream",
        ("mapToInt", 1) => "java.util.stream.IntStream",
        ("mapToLong", 1) | ("asLongStream", 0) => "java.util.stream.LongStream",
        ("mapToDouble", 1) | ("asDoubleStream", 0) => "java.util.stream.DoubleStream",
        ("count", 0) => "long",
        ("sum", 0) => primitive,
        ("reduce", 2) => primitive,
        ("anyMatch", 1) | ("allMatch", 1) | ("noneMatch", 1) => "boolean",
        ("findFirst", 0) | ("findAny", 0) | ("min", 0) | ("max", 0) | ("reduce", 1) => optional,
        ("average", 0) => "java.util.OptionalDouble",
        ("summaryStatistics", 0) => statistics,
        ("collect", 3) => "java.lang.Object",
        ("toArray", 0) => array,
        ("forEach", 1) | ("forEachOrdered", 1) => "void",
        _ => return None,
    };
    Some((None, return_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{QualifierExpression, TerminatorCall};
    use pretty_assertions::assert_eq;

    fn call(name: &str, declaring: &str, args: &[&str]) -> StreamCall {
        StreamCall::new(name, declaring, args.iter().copied(), None, None)
    }

    #[test]
    fn places_cover_source_intermediates_and_terminal() {
        let stream = MethodSignature::new(
            "java.util.Collection",
            "stream",
            Vec::<String>::new(),
            "java.util.stream.Stream",
        );
        let chain = StreamChain::new(
            "list.stream().filter(p).parallel().count()",
            QualifierExpression::MethodCall {
                text: "list.stream()".to_string(),
                signature: stream.clone(),
            },
            vec![
                call("filter", "java.util.stream.Stream", &["java.util.function.Predicate"]),
                call("parallel", "java.util.stream.Stream", &[]),
            ],
            TerminatorCall::new(call("count", "java.util.stream.Stream", &[]), "long"),
        );

        let places = JdkStreamResolver.find_places(&chain).unwrap();
        assert_eq!(places.qualifier_expression_method, Some(stream));
        assert_eq!(
            places.intermediate_steps_methods[0].descriptor(),
            "(Ljava/util/function/Predicate;)Ljava/util/stream/Stream;"
        );
        assert_eq!(
            places.intermediate_steps_methods[1],
            MethodSignature::new(
                "java.util.stream.BaseStream",
                "parallel",
                Vec::<String>::new(),
                "java.util.stream.BaseStream"
            )
        );
        assert_eq!(places.termination_operation_method.descriptor(), "()J");
        assert_eq!(places.all().count(), 4);
    }

    #[test]
    fn primitive_streams_use_their_own_optional_types() {
        let sig = resolve_call(&call("findFirst", "java.util.stream.IntStream", &[])).unwrap();
        assert_eq!(sig.descriptor(), "()Ljava/util/OptionalInt;");
        let sig = resolve_call(&call(
            "anyMatch",
            "java.util.stream.LongStream",
            &["java.util.function.LongPredicate"],
        ))
        .unwrap();
        assert_eq!(sig.descriptor(), "(Ljava/util/function/LongPredicate;)Z");
    }

    #[test]
    fn unknown_calls_have_no_place() {
        let err = resolve_call(&call("frobnicate", "java.util.stream.Stream", &[])).unwrap_err();
        assert!(
            matches!(err, TraceError::PlaceForBreakpointNotFound { ref call, .. } if call == "frobnicate"),
            "{err:?}"
        );
        let err = resolve_call(&call("map", "java.util.List", &["x"])).unwrap_err();
        assert!(matches!(err, TraceError::PlaceForBreakpointNotFound { .. }));
    }
}
