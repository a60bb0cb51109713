//! # stackeval - phase-aware evaluation of stack configurations
//!
//! ## Introduction for developers
//!
//! Read this to understand how `stackeval` works internally.
//!
//! ### Configuration
//!
//! A configuration is one or more `.stack.hcl` documents. In hcl terms...
//! - a file gets parsed as a `body`
//! - ...which is just a list of `structures`
//! - ...where there are two kinds:
//!   - `attribute`: a "key = value" pair
//!   - or `block`: 1 `identifier`, 0 or more `labels` and a `body` enclosed in `{` and `}`
//!
//! Only blocks are allowed at the root:
//! ```hcl
//! variable "region" {
//!   type    = string
//!   default = "eu-west-1"
//! }
//!
//! locals {
//!   prefix = "app-${var.region}"
//! }
//!
//! stack "network" {
//!   count  = 2
//!   inputs = { name = "${local.prefix}-${count.index}" }
//!
//!   variable "name" { type = string }
//!   output "id" { value = "net-${var.name}" }
//! }
//!
//! output "network_ids" {
//!   type  = list(string)
//!   value = [for net in stack.network : net.id]
//! }
//! ```
//!
//! [hcl_documents::HclDocuments] collects the root attributes and blocks of all documents and
//! remembers which file they came from. [config::StackConfig::new] turns them into
//! declarations, reporting every problem it finds at once. An embedded `stack` block carries
//! its own declarations, so configurations form a tree.
//!
//! ### Nodes
//!
//! [engine::Main] owns the configuration and creates a [stack::Stack] for each stack instance
//! on first access. A stack instance owns one node per declaration:
//! [input_variable::InputVariable], [local_value::LocalValue], [output_value::OutputValue] and
//! [stack_call::StackCall] (which in turn owns a [stack_call::StackCallInstance] per instance
//! key).
//!
//! Every node has a value in each [phase::EvalPhase]. Values are computed at most once per
//! node and phase: the node keeps a [promising::Once] per phase and all concurrent requests
//! share its result. A node's result is an [eval::Outcome] plus [diagnostics::Diagnostics];
//! errors are reported as diagnostics, never by failing the request. The only errors a request
//! can return are [promising::Canceled] and, inside the promise layer, a detected cycle which
//! the nodes turn into a "Self-dependent items" diagnostic.
//!
//! A value that cannot be known in a phase (e.g. input variables during validation, or
//! anything inside a stack whose `count` is unknown) is a [value::Value::Unknown] placeholder
//! of the expected type. Unknowns spread to everything that references them.
//!
//! ### Evaluation
//!
//! We use [hcl::eval] to evaluate the hcl expressions. Before evaluating, the expression tree
//! is walked for traversals like `var.region` or `stack.network[0].id` and each reference is
//! replaced by an internal variable name. References are then resolved one at a time through
//! an [expr::ExpressionScope] and declared in a [hcl::eval::Context].
//!
//! Given the example above `local.prefix` is rewritten to `ref__local__prefix`.
//!
//! ### Walking
//!
//! [walk::validate_all] and [walk::plan_all] visit every node reachable in a phase, each in
//! its own tokio task, and collect the diagnostics. After apply, [apply::ApplyResult] records
//! which resource instance objects the plan could have touched.
//!
pub mod addrs;
pub mod apply;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod eval;
pub mod expr;
pub mod hcl_documents;
pub mod input_variable;
pub mod local_value;
pub mod output_value;
pub mod phase;
pub mod plan;
pub mod promising;
pub mod stack;
pub mod stack_call;
pub mod types;
mod util;
pub mod value;
mod visit;
pub mod walk;
