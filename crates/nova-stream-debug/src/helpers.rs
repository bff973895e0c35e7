//! Helper classes injected into the debuggee and where their bytecode comes from.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Result, TraceError};

pub const STREAM_DEBUGGER_UTILS: &str = "nova.streamdebug.StreamDebuggerUtils";
pub const UNIVERSAL_COLLECTOR: &str = "nova.streamdebug.UniversalCollector";
pub const OBJECT_MATCHER: &str = "nova.streamdebug.ObjectMatcher";
pub const INT_MATCHER: &str = "nova.streamdebug.IntMatcher";
pub const LONG_MATCHER: &str = "nova.streamdebug.LongMatcher";
pub const DOUBLE_MATCHER: &str = "nova.streamdebug.DoubleMatcher";

/// Every class a trace may define in the debuggee.
pub const HELPER_CLASSES: [&str; 6] = [
    STREAM_DEBUGGER_UTILS,
    UNIVERSAL_COLLECTOR,
    OBJECT_MATCHER,
    INT_MATCHER,
    LONG_MATCHER,
    DOUBLE_MATCHER,
];

/// `UniversalCollector(Map map, AtomicInteger time, boolean tick)`; `map` may be null.
pub const UNIVERSAL_COLLECTOR_CTOR: &str =
    "(Ljava/util/Map;Ljava/util/concurrent/atomic/AtomicInteger;Z)V";

/// `StreamDebuggerUtils.formatXMap(Map)`, returning `{int[] keys, X[] values}`.
pub const FORMAT_MAP_DESCRIPTOR: &str = "(Ljava/util/Map;)[Ljava/lang/Object;";

pub const LINKED_HASH_MAP: &str = "java.util.LinkedHashMap";
pub const ATOMIC_INTEGER: &str = "java.util.concurrent.atomic.AtomicInteger";
pub const JAVA_UTIL_MAP: &str = "java.util.Map";

/// Matcher class and constructor wrapping a predicate of the given declared type.
pub fn matcher_for_predicate(predicate_type: &str) -> Option<(&'static str, String)> {
    let class = match predicate_type {
        "java.util.function.Predicate" => OBJECT_MATCHER,
        "java.util.function.IntPredicate" => INT_MATCHER,
        "java.util.function.LongPredicate" => LONG_MATCHER,
        "java.util.function.DoublePredicate" => DOUBLE_MATCHER,
        _ => return None,
    };
    let ctor = format!(
        "(Ljava/util/Map;Ljava/util/Map;Ljava/util/concurrent/atomic/AtomicInteger;L{};)V",
        predicate_type.replace('.', "/")
    );
    Some((class, ctor))
}

/// Source of precompiled helper class files, looked up by binary class name.
#[async_trait]
pub trait BytecodeProvider: Send + Sync {
    /// `Ok(None)` when the provider has no bytecode for `class_name`.
    async fn class_bytes(&self, class_name: &str) -> Result<Option<Vec<u8>>>;
}

/// Reads `<root>/<binary/name>.class`.
#[derive(Debug, Clone)]
pub struct DirectoryBytecodeProvider {
    root: PathBuf,
}

impl DirectoryBytecodeProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn class_path(&self, class_name: &str) -> PathBuf {
        self.root
            .join(format!("{}.class", class_name.replace('.', "/")))
    }
}

#[async_trait]
impl BytecodeProvider for DirectoryBytecodeProvider {
    async fn class_bytes(&self, class_name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.class_path(class_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TraceError::ValueInstantiation {
                class_name: class_name.to_string(),
                reason: format!("failed to read {}: {err}", path.display()),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBytecodeProvider {
    classes: HashMap<String, Vec<u8>>,
}

impl InMemoryBytecodeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(class_name, bytes);
        self
    }

    pub fn insert(&mut self, class_name: impl Into<String>, bytes: Vec<u8>) {
        self.classes.insert(class_name.into(), bytes);
    }
}

#[async_trait]
impl BytecodeProvider for InMemoryBytecodeProvider {
    async fn class_bytes(&self, class_name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.classes.get(class_name).cloned())
    }
}

/// Provider with nothing registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBytecode;

#[async_trait]
impl BytecodeProvider for NoBytecode {
    async fn class_bytes(&self, _class_name: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn matcher_is_chosen_by_predicate_type() {
        let (class, ctor) = matcher_for_predicate("java.util.function.IntPredicate").unwrap();
        assert_eq!(class, INT_MATCHER);
        assert_eq!(
            ctor,
            "(Ljava/util/Map;Ljava/util/Map;Ljava/util/concurrent/atomic/AtomicInteger;Ljava/util/function/IntPredicate;)V"
        );
        assert_eq!(matcher_for_predicate("java.util.function.Function"), None);
    }

    #[tokio::test]
    async fn directory_provider_reads_binary_name_paths() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nova/streamdebug");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("UniversalCollector.class"), [0xca, 0xfe]).unwrap();

        let provider = DirectoryBytecodeProvider::new(dir.path());
        assert_eq!(
            provider.class_bytes(UNIVERSAL_COLLECTOR).await.unwrap(),
            Some(vec![0xca, 0xfe])
        );
        assert_eq!(provider.class_bytes(INT_MATCHER).await.unwrap(), None);
    }
}
