//! Packing handler results into one remote array and reading it back.

use nova_jdwp::wire::TAG_STRING;
use nova_jdwp::{JdwpValue, ObjectId};
use serde::{Deserialize, Serialize};

use crate::bridge::ValueBridge;
use crate::chain::StreamChain;
use crate::error::{Result, TraceError};
use crate::handlers::{HandlerKind, StageHandler};

const THROWABLE: &str = "java.lang.Throwable";
const THROWABLE_ARRAY: &str = "java.lang.Throwable[]";

/// Raw remote results of one trace, ready for formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTraceValues {
    /// One `[before, after]` array per intermediate stage, in chain order.
    pub intermediate_values: Vec<JdwpValue>,
    /// The terminal handler's `[info, wrapped]` result.
    pub terminal: JdwpValue,
    /// Exception that escaped the pipeline.
    pub thrown: Option<ObjectId>,
    pub elapsed_ms: i64,
}

/// `[infoArray, streamResult, long[]{elapsedMillis}]`.
pub async fn format_trace_result(bridge: &ValueBridge, values: &StreamTraceValues) -> Result<JdwpValue> {
    let terminal = bridge.read_array(values.terminal).await?;
    let [terminal_info, terminal_result] = terminal.as_slice() else {
        return Err(TraceError::Interpret(format!(
            "terminal result has {} slots, expected 2",
            terminal.len()
        )));
    };

    let mut info = values.intermediate_values.clone();
    info.push(*terminal_info);
    let info = bridge.array(&info).await?;

    let stream_result = match values.thrown {
        Some(exception) => {
            bridge
                .array_of(THROWABLE, &[JdwpValue::object(exception)])
                .await?
        }
        None => *terminal_result,
    };
    let elapsed = bridge
        .array_of("long", &[JdwpValue::Long(values.elapsed_ms)])
        .await?;

    bridge.array(&[info, stream_result, elapsed]).await
}

/// A value read back from the debuggee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum TraceValue {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    #[serde(rename_all = "camelCase")]
    Object { type_name: String, id: ObjectId },
}

/// An element observed by a collector at logical time `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedValue {
    pub time: i32,
    pub value: TraceValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTrace {
    pub call: String,
    pub before: Vec<TracedValue>,
    pub after: Vec<TracedValue>,
}

/// What the terminal operation reported beyond its before/after values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TerminalPayload {
    None,
    Match { result: TraceValue },
    Optional { present: bool, value: TraceValue },
    Collection { time: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum TraceOutcome {
    Returned(TraceValue),
    Thrown(TraceValue),
    Void,
}

/// The host-side trace of a whole chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTrace {
    /// Intermediate stages followed by the terminal.
    pub stages: Vec<StageTrace>,
    pub terminal: TerminalPayload,
    pub outcome: TraceOutcome,
    pub elapsed_ms: i64,
}

impl ChainTrace {
    pub fn stage(&self, call: &str) -> Option<&StageTrace> {
        self.stages.iter().find(|stage| stage.call == call)
    }

    pub fn is_thrown(&self) -> bool {
        matches!(self.outcome, TraceOutcome::Thrown(_))
    }
}

/// Reads a formatted trace back into a [`ChainTrace`].
pub async fn interpret(
    bridge: &ValueBridge,
    chain: &StreamChain,
    formatted: JdwpValue,
) -> Result<ChainTrace> {
    let reader = Reader { bridge };
    let [info, stream_result, elapsed] = reader.fixed::<3>(formatted, "trace").await?;

    let info = bridge.read_array(info).await?;
    let expected = chain.intermediate_calls.len() + 1;
    if info.len() != expected {
        return Err(TraceError::Interpret(format!(
            "expected {expected} stage results, got {}",
            info.len()
        )));
    }

    let mut stages = Vec::with_capacity(expected);
    for (call, value) in chain.intermediate_calls.iter().zip(&info) {
        let (before, after) = reader.before_after(*value).await?;
        stages.push(StageTrace {
            call: call.name.clone(),
            before,
            after,
        });
    }

    let terminal_info = info[expected - 1];
    let terminal_call = &chain.termination_call;
    let (before_after, terminal) = match StageHandler::for_terminal(terminal_call).kind() {
        HandlerKind::MatchShortCircuit => {
            let [before_after, result] = reader.fixed::<2>(terminal_info, "match info").await?;
            let [result] = reader.fixed::<1>(result, "match result").await?;
            let result = reader.value(result).await?;
            (before_after, TerminalPayload::Match { result })
        }
        HandlerKind::OptionalProducing => {
            let [before_after, optional] =
                reader.fixed::<2>(terminal_info, "optional info").await?;
            let [present, value] = reader.fixed::<2>(optional, "optional content").await?;
            let [present] = reader.fixed::<1>(present, "isPresent").await?;
            let [value] = reader.fixed::<1>(value, "orElse").await?;
            let present = present.as_bool().ok_or_else(|| {
                TraceError::Interpret("isPresent is not a boolean".to_string())
            })?;
            let value = if present {
                reader.value(value).await?
            } else {
                TraceValue::Null
            };
            (before_after, TerminalPayload::Optional { present, value })
        }
        HandlerKind::ToCollection => {
            let [before_after, time] = reader.fixed::<2>(terminal_info, "collection info").await?;
            let [time] = reader.fixed::<1>(time, "collection time").await?;
            let time = time
                .as_int()
                .ok_or_else(|| TraceError::Interpret("time is not an int".to_string()))?;
            (before_after, TerminalPayload::Collection { time })
        }
        _ => (terminal_info, TerminalPayload::None),
    };
    let (before, after) = reader.before_after(before_after).await?;
    stages.push(StageTrace {
        call: terminal_call.call.name.clone(),
        before,
        after,
    });

    let outcome = reader.outcome(stream_result, terminal_call.returns_void()).await?;
    let [elapsed] = reader.fixed::<1>(elapsed, "elapsed time").await?;
    let elapsed_ms = elapsed
        .as_long()
        .ok_or_else(|| TraceError::Interpret("elapsed time is not a long".to_string()))?;

    Ok(ChainTrace {
        stages,
        terminal,
        outcome,
        elapsed_ms,
    })
}

struct Reader<'a> {
    bridge: &'a ValueBridge,
}

impl Reader<'_> {
    async fn fixed<const N: usize>(&self, value: JdwpValue, what: &str) -> Result<[JdwpValue; N]> {
        let values = self.bridge.read_array(value).await.map_err(interpret_error)?;
        let len = values.len();
        values.try_into().map_err(|_| {
            TraceError::Interpret(format!("{what} has {len} slots, expected {N}"))
        })
    }

    async fn before_after(&self, value: JdwpValue) -> Result<(Vec<TracedValue>, Vec<TracedValue>)> {
        let [before, after] = self.fixed::<2>(value, "stage result").await?;
        Ok((self.side(before).await?, self.side(after).await?))
    }

    /// `{int[] keys, X[] values}`
    async fn side(&self, value: JdwpValue) -> Result<Vec<TracedValue>> {
        let [keys, values] = self.fixed::<2>(value, "collected values").await?;
        let keys = self.bridge.read_array(keys).await.map_err(interpret_error)?;
        let values = self.bridge.read_array(values).await.map_err(interpret_error)?;
        if keys.len() != values.len() {
            return Err(TraceError::Interpret(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }

        let mut traced = Vec::with_capacity(keys.len());
        for (key, value) in keys.into_iter().zip(values) {
            let time = key
                .as_int()
                .ok_or_else(|| TraceError::Interpret("collector key is not an int".to_string()))?;
            traced.push(TracedValue {
                time,
                value: self.value(value).await?,
            });
        }
        Ok(traced)
    }

    async fn outcome(&self, value: JdwpValue, returns_void: bool) -> Result<TraceOutcome> {
        let type_name = self.bridge.type_of(value).await?;
        let [first] = self.fixed::<1>(value, "stream result").await?;
        if type_name == THROWABLE_ARRAY {
            return Ok(TraceOutcome::Thrown(self.value(first).await?));
        }
        if returns_void {
            return Ok(TraceOutcome::Void);
        }
        Ok(TraceOutcome::Returned(self.value(first).await?))
    }

    async fn value(&self, value: JdwpValue) -> Result<TraceValue> {
        Ok(match value {
            JdwpValue::Boolean(v) => TraceValue::Boolean(v),
            JdwpValue::Byte(v) => TraceValue::Byte(v),
            JdwpValue::Char(v) => TraceValue::Char(v),
            JdwpValue::Short(v) => TraceValue::Short(v),
            JdwpValue::Int(v) => TraceValue::Int(v),
            JdwpValue::Long(v) => TraceValue::Long(v),
            JdwpValue::Float(v) => TraceValue::Float(v),
            JdwpValue::Double(v) => TraceValue::Double(v),
            JdwpValue::Void => TraceValue::Null,
            JdwpValue::Object { id: 0, .. } => TraceValue::Null,
            JdwpValue::Object { tag: TAG_STRING, .. } => {
                TraceValue::String(self.bridge.read_string(value).await?)
            }
            JdwpValue::Object { id, .. } => TraceValue::Object {
                type_name: self.bridge.type_of(value).await?,
                id,
            },
        })
    }
}

fn interpret_error(err: TraceError) -> TraceError {
    match err {
        TraceError::IncorrectValueType { expected, actual } => {
            TraceError::Interpret(format!("expected {expected}, found {actual}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chain_trace_serializes_with_tagged_values() {
        let trace = ChainTrace {
            stages: vec![StageTrace {
                call: "count".to_string(),
                before: vec![TracedValue {
                    time: 1,
                    value: TraceValue::String("a".to_string()),
                }],
                after: Vec::new(),
            }],
            terminal: TerminalPayload::None,
            outcome: TraceOutcome::Returned(TraceValue::Long(1)),
            elapsed_ms: 3,
        };

        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "stages": [{
                    "call": "count",
                    "before": [{"time": 1, "value": {"kind": "string", "value": "a"}}],
                    "after": []
                }],
                "terminal": {"kind": "none"},
                "outcome": {"kind": "returned", "value": {"kind": "long", "value": 1}},
                "elapsedMs": 3
            })
        );
        assert!(!trace.is_thrown());
        assert_eq!(trace.stage("count").map(|s| s.before.len()), Some(1));
    }
}
