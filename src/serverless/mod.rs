//! Host adapters that feed function invocations into a
//! [`FunctionEndpoint`](crate::endpoint::FunctionEndpoint).
//!
//! # Feature Flag
//!
//! This module is only available when the `serverless-lambda` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! hostbus = { version = "0.1", features = ["serverless-lambda"] }
//! ```
//!
//! # AWS Lambda with SQS
//!
//! [`SqsTrigger`] turns each SQS record into one `process` call and reports
//! partial batch failures; [`run`] wires it into `lambda_runtime`.

#[cfg(feature = "serverless-lambda")]
#[cfg_attr(docsrs, doc(cfg(feature = "serverless-lambda")))]
pub mod aws_lambda;

#[cfg(feature = "serverless-lambda")]
#[cfg_attr(docsrs, doc(cfg(feature = "serverless-lambda")))]
pub use aws_lambda::*;
