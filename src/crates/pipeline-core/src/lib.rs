//! Pipeline orchestration core: a dependency-graph execution engine, an
//! inter-agent message bus, a scoped shared context store, an expression
//! substitution language, a declarative pipeline factory, an SLO monitor,
//! and a pipeline-level metrics aggregator, wired together by
//! [`runtime::Runtime`].

pub mod bus;
pub mod context;
pub mod error;
pub mod events;
pub mod expression;
pub mod factory;
pub mod graph;
pub mod handlers;
pub mod monitor;
pub mod runtime;
pub mod slo;
pub mod value;

pub use error::{PipelineError, Result};
pub use runtime::{Runtime, RuntimeConfig};
