use std::sync::Arc;

use weft_core::error::Result;
use weft_core::routing::RoutingValue;

use super::builder::NodeRef;
use crate::context::ExecutionContext;

type Predicate = Arc<dyn Fn(&RoutingValue) -> bool + Send + Sync>;
type MapFn = Arc<dyn Fn(RoutingValue, &ExecutionContext) -> Result<RoutingValue> + Send + Sync>;

/// Condition for traversing an edge, evaluated against the source node's output.
#[derive(Clone, Default)]
pub enum Guard {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only if the output has this kind.
    Kind(String),
    /// Traverse if the output has any of these kinds.
    KindIn(Vec<String>),
    /// Traverse if the guard does not match.
    Not(Box<Guard>),
    /// Arbitrary pure predicate.
    Predicate(Predicate),
}

impl Guard {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Kind(kind.into())
    }

    pub fn kind_in<S: Into<String>>(kinds: impl IntoIterator<Item = S>) -> Self {
        Self::KindIn(kinds.into_iter().map(Into::into).collect())
    }

    pub fn when(f: impl Fn(&RoutingValue) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn matches(&self, value: &RoutingValue) -> bool {
        match self {
            Self::Always => true,
            Self::Kind(kind) => value.kind == *kind,
            Self::KindIn(kinds) => kinds.iter().any(|k| *k == value.kind),
            Self::Not(inner) => !inner.matches(value),
            Self::Predicate(f) => f(value),
        }
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Kind(k) => f.debug_tuple("Kind").field(k).finish(),
            Self::KindIn(ks) => f.debug_tuple("KindIn").field(ks).finish(),
            Self::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Maps the source node's output to the destination node's input.
#[derive(Clone, Default)]
pub enum Transform {
    #[default]
    Identity,
    Map(MapFn),
}

impl Transform {
    pub fn apply(&self, value: RoutingValue, ctx: &ExecutionContext) -> Result<RoutingValue> {
        match self {
            Self::Identity => Ok(value),
            Self::Map(f) => f(value, ctx),
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity => f.write_str("Identity"),
            Self::Map(_) => f.write_str("Map(..)"),
        }
    }
}

/// An edge as declared on a builder.
#[derive(Debug, Clone)]
pub struct EdgeDef {
    pub(crate) from: NodeRef,
    pub(crate) to: NodeRef,
    pub(crate) guard: Guard,
    pub(crate) transform: Transform,
}

impl EdgeDef {
    /// Create an unconditional edge.
    pub fn always(from: &NodeRef, to: &NodeRef) -> Self {
        Self {
            from: from.clone(),
            to: to.clone(),
            guard: Guard::Always,
            transform: Transform::Identity,
        }
    }

    /// Create an edge taken when the output has the given kind.
    pub fn on_kind(from: &NodeRef, to: &NodeRef, kind: impl Into<String>) -> Self {
        Self::always(from, to).with_guard(Guard::kind(kind))
    }

    /// Create an edge taken when the predicate holds.
    pub fn when(
        from: &NodeRef,
        to: &NodeRef,
        f: impl Fn(&RoutingValue) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::always(from, to).with_guard(Guard::when(f))
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    /// Set a transform that may read (not mutate) the run's context.
    pub fn with_transform(
        mut self,
        f: impl Fn(RoutingValue, &ExecutionContext) -> Result<RoutingValue> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Transform::Map(Arc::new(f));
        self
    }

    /// Set an infallible transform over the payload; the kind is reset to the default.
    pub fn map_payload(
        self,
        f: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.with_transform(move |value, _ctx| Ok(RoutingValue::new(f(value.payload))))
    }

    pub fn from(&self) -> &NodeRef {
        &self.from
    }

    pub fn to(&self) -> &NodeRef {
        &self.to
    }
}

/// An edge in a built graph.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub guard: Guard,
    pub transform: Transform,
    /// Declaration index; edges sharing a source are tried in this order.
    pub order: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_kinds() {
        let ok = RoutingValue::unit("ok");
        let retry = RoutingValue::unit("retry");

        assert!(Guard::Always.matches(&ok));
        assert!(Guard::kind("ok").matches(&ok));
        assert!(!Guard::kind("ok").matches(&retry));
        assert!(Guard::kind_in(["ok", "retry"]).matches(&retry));
        assert!(Guard::kind("ok").negate().matches(&retry));
    }

    #[test]
    fn guard_predicate() {
        let big = Guard::when(|v| v.as_i64().is_some_and(|n| n > 10));
        assert!(big.matches(&RoutingValue::from(11i64)));
        assert!(!big.matches(&RoutingValue::from(3i64)));
        assert_eq!(format!("{:?}", big), "Predicate(..)");
    }

    #[test]
    fn edge_def_builders() {
        let a = NodeRef::named("a");
        let b = NodeRef::named("b");

        let e = EdgeDef::always(&a, &b);
        assert_eq!(e.from().id(), "a");
        assert_eq!(e.to().id(), "b");
        assert!(matches!(e.guard, Guard::Always));
        assert!(matches!(e.transform, Transform::Identity));

        let e = EdgeDef::on_kind(&a, &b, "done");
        assert!(matches!(e.guard, Guard::Kind(ref k) if k == "done"));
    }

    #[test]
    fn transforms_apply() {
        let ctx = ExecutionContext::detached("t");
        let def = EdgeDef::always(&NodeRef::named("a"), &NodeRef::named("b"))
            .map_payload(|p| serde_json::json!({ "wrapped": p }));
        let out = def
            .transform
            .apply(RoutingValue::tagged("x", serde_json::json!(1)), &ctx)
            .unwrap();
        assert!(out.is(RoutingValue::DEFAULT_KIND));
        assert_eq!(out.payload["wrapped"], 1);

        let same = Transform::Identity
            .apply(RoutingValue::unit("k"), &ctx)
            .unwrap();
        assert!(same.is("k"));
    }
}
