//! Request resolution, execution and bulk testing.

pub mod bulk;
pub mod cancel;
pub mod execute;
pub mod expect;
pub mod headers;
pub mod http;
pub mod runner;
pub mod schedule;
pub mod variables;

pub use bulk::{BulkCollectionTree, BulkSelection, RunFilter, plan_from_filters, plan_from_selection};
pub use cancel::CancelRegistry;
pub use execute::{ExecuteOutcome, ExecuteRequest, execute_direct};
pub use http::{HttpEngine, HttpSettings, ResponseSnapshot};
pub use runner::{RunOptions, RunReport, RunTarget, run_plan};
pub use schedule::{Schedule, run_scheduled};
pub use variables::VariableResolver;
