//! `nodes` crate: backend contracts, parameter values and built-in backends.
//!
//! The task executor in the engine crate dispatches every backend call through
//! the traits defined here: [`HttpClient`], [`FunctionInvoker`],
//! [`BatchScheduler`] and, for `SIMPLE` tasks, [`ExecutableTask`].

pub mod batch;
pub mod error;
pub mod function;
pub mod http;
pub mod mock;
pub mod traits;
pub mod value;

pub use batch::LocalBatchScheduler;
pub use error::NodeError;
pub use function::HttpFunctionInvoker;
pub use http::ReqwestHttpClient;
pub use traits::{
    BatchScheduler, ExecutableTask, FunctionInvoker, FunctionOutput, HttpClient, HttpRequest,
    HttpResponse, JobEvent, JobKey, JobSpec, JobWatch, TaskContext,
};
pub use value::{params_to_json, ParamMap, ParamValue};
