//! Per-stage value interception.
//!
//! A handler wraps the stream flowing into and out of its call with `peek`
//! collectors, optionally rewrites the call's arguments, and finally turns
//! what was collected into a remote result array for the formatter.

use nova_jdwp::JdwpValue;

use crate::bridge::ValueBridge;
use crate::chain::{ElementType, StreamCall, TerminatorCall};
use crate::error::{Result, TraceError};
use crate::helpers::{
    matcher_for_predicate, ATOMIC_INTEGER, FORMAT_MAP_DESCRIPTOR, JAVA_UTIL_MAP, LINKED_HASH_MAP,
    STREAM_DEBUGGER_UTILS, UNIVERSAL_COLLECTOR, UNIVERSAL_COLLECTOR_CTOR,
};

const SEQUENTIAL_DESCRIPTOR: &str = "()Ljava/util/stream/BaseStream;";

/// What a trace shares between its handlers: the bridge and the remote
/// `AtomicInteger` used as the logical clock.
pub struct TraceContext<'a> {
    pub bridge: &'a ValueBridge,
    pub time: JdwpValue,
}

impl<'a> TraceContext<'a> {
    pub async fn new(bridge: &'a ValueBridge) -> Result<Self> {
        let time = bridge.instance(ATOMIC_INTEGER, "()V", &[]).await?;
        Ok(Self { bridge, time })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    SourcePassthrough,
    PeekIntermediate,
    PeekTerminal,
    MatchShortCircuit,
    OptionalProducing,
    ToCollection,
    ParallelMarker,
}

/// Collector maps inserted before and after one call.
#[derive(Debug, Clone, Default)]
pub struct PeekState {
    type_before: Option<ElementType>,
    type_after: Option<ElementType>,
    before: Option<JdwpValue>,
    after: Option<JdwpValue>,
}

impl PeekState {
    pub fn new(type_before: Option<ElementType>, type_after: Option<ElementType>) -> Self {
        Self {
            type_before,
            type_after,
            before: None,
            after: None,
        }
    }

    async fn before_call(&mut self, cx: &TraceContext<'_>, value: JdwpValue) -> Result<JdwpValue> {
        let (value, map) = collect(cx, self.type_before, value, false).await?;
        if map.is_some() {
            self.before = map;
        }
        Ok(value)
    }

    async fn after_call(&mut self, cx: &TraceContext<'_>, value: JdwpValue) -> Result<JdwpValue> {
        let (value, map) = collect(cx, self.type_after, value, true).await?;
        if map.is_some() {
            self.after = map;
        }
        Ok(value)
    }

    /// `[before, after]`, each formatted or the empty sentinel.
    async fn result(&self, cx: &TraceContext<'_>) -> Result<JdwpValue> {
        let before = format_side(cx, self.type_before, self.before).await?;
        let after = format_side(cx, self.type_after, self.after).await?;
        cx.bridge.array(&[before, after]).await
    }
}

/// Inserts `peek(new UniversalCollector(map, time, tick))` after `value`.
async fn collect(
    cx: &TraceContext<'_>,
    element: Option<ElementType>,
    value: JdwpValue,
    tick: bool,
) -> Result<(JdwpValue, Option<JdwpValue>)> {
    let Some(element) = element else {
        return Ok((value, None));
    };
    if value.object_id().is_none() {
        return Ok((value, None));
    }

    let map = cx.bridge.instance(LINKED_HASH_MAP, "()V", &[]).await?;
    let collector = cx
        .bridge
        .instance(
            UNIVERSAL_COLLECTOR,
            UNIVERSAL_COLLECTOR_CTOR,
            &[map, cx.time, JdwpValue::Boolean(tick)],
        )
        .await?;
    let peeked = cx
        .bridge
        .invoke(value, "peek", element.peek_descriptor(), &[collector])
        .await?;
    Ok((peeked, Some(map)))
}

async fn format_side(
    cx: &TraceContext<'_>,
    element: Option<ElementType>,
    map: Option<JdwpValue>,
) -> Result<JdwpValue> {
    match (element, map) {
        (Some(element), Some(map)) => format_map(cx, element, map).await,
        _ => empty_sentinel(cx).await,
    }
}

async fn format_map(cx: &TraceContext<'_>, element: ElementType, map: JdwpValue) -> Result<JdwpValue> {
    cx.bridge.assert_instance_of(map, JAVA_UTIL_MAP).await?;
    cx.bridge
        .invoke_static(
            STREAM_DEBUGGER_UTILS,
            element.format_method(),
            FORMAT_MAP_DESCRIPTOR,
            &[map],
        )
        .await
}

/// `[int[0], Object[0]]`
async fn empty_sentinel(cx: &TraceContext<'_>) -> Result<JdwpValue> {
    let keys = cx.bridge.array_of("int", &[]).await?;
    let values = cx.bridge.array_of("java.lang.Object", &[]).await?;
    cx.bridge.array(&[keys, values]).await
}

/// `[result]`, or a one-slot `Object[]` when there is no result.
async fn wrap_result(cx: &TraceContext<'_>, result: Option<JdwpValue>) -> Result<JdwpValue> {
    match result {
        Some(value) if value != JdwpValue::Void => cx.bridge.array(&[value]).await,
        _ => {
            cx.bridge
                .instance("java.lang.Object[]", "(I)V", &[JdwpValue::Int(1)])
                .await
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageHandler {
    /// The qualifier method: forces sequential execution and ticks the clock
    /// for every source element.
    SourcePassthrough {
        element: Option<ElementType>,
        sequential: bool,
    },
    PeekIntermediate(PeekState),
    /// `parallel()`: switched back to sequential before the after-peek.
    ParallelMarker(PeekState),
    PeekTerminal {
        peek: PeekState,
        result: Option<JdwpValue>,
    },
    MatchShortCircuit {
        element: Option<ElementType>,
        predicate_type: String,
        maps: Option<(JdwpValue, JdwpValue)>,
        result: Option<JdwpValue>,
    },
    OptionalProducing {
        peek: PeekState,
        result: Option<JdwpValue>,
    },
    ToCollection {
        peek: PeekState,
        result: Option<JdwpValue>,
    },
}

impl StageHandler {
    pub fn source(element: Option<ElementType>, sequential: bool) -> Self {
        StageHandler::SourcePassthrough {
            element,
            sequential,
        }
    }

    pub fn for_intermediate(call: &StreamCall) -> Self {
        let peek = PeekState::new(call.type_before, call.type_after);
        match call.name.as_str() {
            "parallel" => StageHandler::ParallelMarker(peek),
            _ => StageHandler::PeekIntermediate(peek),
        }
    }

    pub fn for_terminal(terminator: &TerminatorCall) -> Self {
        let call = &terminator.call;
        let peek = PeekState::new(call.type_before, None);
        match (call.name.as_str(), call.arguments.len()) {
            ("anyMatch" | "allMatch" | "noneMatch", _) => StageHandler::MatchShortCircuit {
                element: call.type_before,
                predicate_type: call.arguments.first().cloned().unwrap_or_default(),
                maps: None,
                result: None,
            },
            ("findFirst" | "findAny" | "min" | "max", _) | ("reduce", 1) => {
                StageHandler::OptionalProducing { peek, result: None }
            }
            ("collect" | "toList" | "toArray", _) => StageHandler::ToCollection { peek, result: None },
            _ => StageHandler::PeekTerminal { peek, result: None },
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            StageHandler::SourcePassthrough { .. } => HandlerKind::SourcePassthrough,
            StageHandler::PeekIntermediate(_) => HandlerKind::PeekIntermediate,
            StageHandler::ParallelMarker(_) => HandlerKind::ParallelMarker,
            StageHandler::PeekTerminal { .. } => HandlerKind::PeekTerminal,
            StageHandler::MatchShortCircuit { .. } => HandlerKind::MatchShortCircuit,
            StageHandler::OptionalProducing { .. } => HandlerKind::OptionalProducing,
            StageHandler::ToCollection { .. } => HandlerKind::ToCollection,
        }
    }

    /// The helper matcher wrapping this stage's predicate, if any.
    pub fn matcher_type(&self) -> Option<&'static str> {
        match self {
            StageHandler::MatchShortCircuit { predicate_type, .. } => {
                matcher_for_predicate(predicate_type).map(|(matcher, _)| matcher)
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            HandlerKind::PeekTerminal
                | HandlerKind::MatchShortCircuit
                | HandlerKind::OptionalProducing
                | HandlerKind::ToCollection
        )
    }

    /// Rewrites the arguments of the call on method entry.
    pub async fn transform_arguments(
        &mut self,
        cx: &TraceContext<'_>,
        args: Vec<JdwpValue>,
    ) -> Result<Vec<JdwpValue>> {
        let StageHandler::MatchShortCircuit {
            predicate_type,
            maps,
            ..
        } = self
        else {
            return Ok(args);
        };

        let [predicate] = args.as_slice() else {
            return Err(TraceError::Tracing(format!(
                "match call expects a single predicate argument, got {}",
                args.len()
            )));
        };
        let (matcher, ctor) = matcher_for_predicate(predicate_type).ok_or_else(|| {
            TraceError::IncorrectValueType {
                expected: "java.util.function.Predicate".to_string(),
                actual: predicate_type.clone(),
            }
        })?;

        let before = cx.bridge.instance(LINKED_HASH_MAP, "()V", &[]).await?;
        let after = cx.bridge.instance(LINKED_HASH_MAP, "()V", &[]).await?;
        let wrapped = cx
            .bridge
            .instance(matcher, &ctor, &[before, after, cx.time, *predicate])
            .await?;
        *maps = Some((before, after));
        Ok(vec![wrapped])
    }

    /// Wraps the stream entering this call.
    pub async fn before_call(&mut self, cx: &TraceContext<'_>, value: JdwpValue) -> Result<JdwpValue> {
        match self {
            StageHandler::SourcePassthrough { .. } | StageHandler::MatchShortCircuit { .. } => {
                Ok(value)
            }
            StageHandler::PeekIntermediate(peek)
            | StageHandler::ParallelMarker(peek)
            | StageHandler::PeekTerminal { peek, .. }
            | StageHandler::OptionalProducing { peek, .. }
            | StageHandler::ToCollection { peek, .. } => peek.before_call(cx, value).await,
        }
    }

    /// Wraps the value returned by this call. Terminal handlers record it instead.
    pub async fn after_call(&mut self, cx: &TraceContext<'_>, value: JdwpValue) -> Result<JdwpValue> {
        match self {
            StageHandler::SourcePassthrough {
                element,
                sequential,
            } => {
                if value.object_id().is_none() {
                    return Ok(value);
                }
                let stream = if *sequential {
                    cx.bridge
                        .invoke(value, "sequential", SEQUENTIAL_DESCRIPTOR, &[])
                        .await?
                } else {
                    value
                };
                let ticker = cx
                    .bridge
                    .instance(
                        UNIVERSAL_COLLECTOR,
                        UNIVERSAL_COLLECTOR_CTOR,
                        &[JdwpValue::NULL, cx.time, JdwpValue::Boolean(true)],
                    )
                    .await?;
                let element = element.unwrap_or(ElementType::Object);
                cx.bridge
                    .invoke(stream, "peek", element.peek_descriptor(), &[ticker])
                    .await
            }
            StageHandler::PeekIntermediate(peek) => peek.after_call(cx, value).await,
            StageHandler::ParallelMarker(peek) => {
                let value = if value.object_id().is_some() {
                    cx.bridge
                        .invoke(value, "sequential", SEQUENTIAL_DESCRIPTOR, &[])
                        .await?
                } else {
                    value
                };
                peek.after_call(cx, value).await
            }
            StageHandler::PeekTerminal { result, .. }
            | StageHandler::MatchShortCircuit { result, .. }
            | StageHandler::OptionalProducing { result, .. }
            | StageHandler::ToCollection { result, .. } => {
                *result = Some(value);
                Ok(value)
            }
        }
    }

    /// The remote result array of this stage; `None` for the source.
    pub async fn result(&self, cx: &TraceContext<'_>) -> Result<Option<JdwpValue>> {
        let value = match self {
            StageHandler::SourcePassthrough { .. } => return Ok(None),
            StageHandler::PeekIntermediate(peek) | StageHandler::ParallelMarker(peek) => {
                peek.result(cx).await?
            }
            StageHandler::PeekTerminal { peek, result } => {
                let info = peek.result(cx).await?;
                let wrapped = wrap_result(cx, *result).await?;
                cx.bridge.array(&[info, wrapped]).await?
            }
            StageHandler::MatchShortCircuit {
                element,
                maps,
                result,
                ..
            } => {
                let (before, after) = match maps {
                    Some((before, after)) => (Some(*before), Some(*after)),
                    None => (None, None),
                };
                let before = format_side(cx, *element, before).await?;
                let after = format_side(cx, *element, after).await?;
                let info = cx.bridge.array(&[before, after]).await?;
                let wrapped = wrap_result(cx, *result).await?;
                let payload = cx.bridge.array(&[info, wrapped]).await?;
                cx.bridge.array(&[payload, wrapped]).await?
            }
            StageHandler::OptionalProducing { peek, result } => {
                let info = peek.result(cx).await?;
                let wrapped = wrap_result(cx, *result).await?;
                let (present, value) = optional_content(cx, *result).await?;
                let present = cx.bridge.array(&[present]).await?;
                let value = cx.bridge.array(&[value]).await?;
                let optional = cx.bridge.array(&[present, value]).await?;
                let payload = cx.bridge.array(&[info, optional]).await?;
                cx.bridge.array(&[payload, wrapped]).await?
            }
            StageHandler::ToCollection { peek, result } => {
                let info = peek.result(cx).await?;
                let wrapped = wrap_result(cx, *result).await?;
                let time = cx.bridge.invoke(cx.time, "get", "()I", &[]).await?;
                let time = cx.bridge.array_of("int", &[time]).await?;
                let payload = cx.bridge.array(&[info, time]).await?;
                cx.bridge.array(&[payload, wrapped]).await?
            }
        };
        Ok(Some(value))
    }
}

/// `(isPresent(), orElse(default))` of an optional result. A missing result
/// reads as empty.
async fn optional_content(
    cx: &TraceContext<'_>,
    result: Option<JdwpValue>,
) -> Result<(JdwpValue, JdwpValue)> {
    let Some(optional) = result.filter(|value| value.object_id().is_some()) else {
        return Ok((JdwpValue::Boolean(false), JdwpValue::NULL));
    };

    let type_name = cx.bridge.type_of(optional).await?;
    let or_else = match type_name.as_str() {
        "java.util.Optional" => "(Ljava/lang/Object;)Ljava/lang/Object;",
        "java.util.OptionalInt" => "(I)I",
        "java.util.OptionalLong" => "(J)J",
        "java.util.OptionalDouble" => "(D)D",
        _ => {
            return Err(TraceError::IncorrectValueType {
                expected: "java.util.Optional".to_string(),
                actual: type_name,
            })
        }
    };
    let present = cx.bridge.invoke(optional, "isPresent", "()Z", &[]).await?;
    let default = JdwpValue::default_for_signature(&or_else[1..]);
    let value = cx
        .bridge
        .invoke(optional, "orElse", or_else, &[default])
        .await?;
    Ok((present, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn call(name: &str, args: &[&str]) -> StreamCall {
        StreamCall::new(
            name,
            "java.util.stream.Stream",
            args.iter().copied(),
            Some(ElementType::Object),
            Some(ElementType::Object),
        )
    }

    #[test]
    fn handlers_are_chosen_by_call_name() {
        assert_eq!(
            StageHandler::for_intermediate(&call("parallel", &[])).kind(),
            HandlerKind::ParallelMarker
        );
        assert_eq!(
            StageHandler::for_intermediate(&call("map", &["java.util.function.Function"])).kind(),
            HandlerKind::PeekIntermediate
        );

        let terminal = |name: &str, args: &[&str]| {
            StageHandler::for_terminal(&TerminatorCall::new(call(name, args), "java.lang.Object"))
                .kind()
        };
        assert_eq!(
            terminal("noneMatch", &["java.util.function.Predicate"]),
            HandlerKind::MatchShortCircuit
        );
        assert_eq!(terminal("findAny", &[]), HandlerKind::OptionalProducing);
        assert_eq!(
            terminal("reduce", &["java.util.function.BinaryOperator"]),
            HandlerKind::OptionalProducing
        );
        assert_eq!(
            terminal("reduce", &["java.lang.Object", "java.util.function.BinaryOperator"]),
            HandlerKind::PeekTerminal
        );
        assert_eq!(terminal("toList", &[]), HandlerKind::ToCollection);
        assert_eq!(terminal("count", &[]), HandlerKind::PeekTerminal);
        assert!(StageHandler::for_terminal(&TerminatorCall::new(call("count", &[]), "long")).is_terminal());
        assert!(!StageHandler::source(None, true).is_terminal());
    }

    #[test]
    fn only_match_stages_need_a_matcher() {
        let any_match = StageHandler::for_terminal(&TerminatorCall::new(
            call("anyMatch", &["java.util.function.IntPredicate"]),
            "boolean",
        ));
        assert_eq!(any_match.matcher_type(), Some(crate::helpers::INT_MATCHER));
        assert_eq!(
            StageHandler::for_intermediate(&call("filter", &["java.util.function.Predicate"]))
                .matcher_type(),
            None
        );
    }
}
