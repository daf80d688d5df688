//! Plan documents, the expression language, and the compiler.
//!
//! A plan is a YAML document with `meta`, `features`, `rules`,
//! `order_plans`, `execution`, and `risk` sections (plus optional explicit
//! `states`/`transitions`). [`compile`] turns the text into a [`CompiledIr`]
//! the engine executes; all schema and expression errors are caught here,
//! before a plan ever goes ACTIVE.

mod compiler;
mod doc;
mod expr;
mod features;
mod ir;

pub use compiler::{compile, CompileError};
pub use doc::{
    ExecutionDoc, MetaDoc, OrderPlanDoc, PlanDoc, RiskDoc, RulesDoc, StateDoc, TargetDoc,
    TransitionDoc,
};
pub use expr::{Env, EvalError, Expr, ParseError, Value};
pub use features::FeatureSpec;
pub use ir::{
    state_requires_streaming, CompiledIr, ExecutionSpec, OrderPlanSpec, RiskSpec, StateSpec,
    TargetSpec, TransitionSpec,
};
