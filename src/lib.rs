// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackform
//!
//! A declarative, dependency-ordered provisioning orchestrator for
//! static-site hosting stacks.
//!
//! ## Overview
//!
//! Stackform reads YAML declarations of cloud resources (buckets, bucket
//! policies, CDN distributions and friends), works out what depends on
//! what, and brings the provider in line with the declarations:
//!
//! - References like `${bucket.site.domain_name}` become dependency edges
//! - Cycles are rejected before any provider call
//! - Plans are staged so independent resources are provisioned together
//! - Every successful step is persisted, so a failed apply resumes cleanly
//!
//! ## Architecture
//!
//! 1. **Declarations**: loaded from YAML, variables resolved
//! 2. **State Record**: what the last apply created, with provider ids
//! 3. **Planner**: refreshes recorded resources, diffs, orders and stages steps
//! 4. **Executor**: runs the steps against the [`provider::Provider`]
//!
//! ## Modules
//!
//! - [`config`]: Settings parsing and validation
//! - [`declaration`]: Declaration documents, expressions and variables
//! - [`planner`]: Dependency graph, diff, plan and execution
//! - [`provider`]: Provider seam, resource catalog, HTTP and in-memory providers
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - kind: bucket
//!     name: site
//!     attributes:
//!       bucket_name: docs-assets
//!   - kind: distribution
//!     name: cdn
//!     attributes:
//!       origin_domain: "${bucket.site.domain_name}"
//! outputs:
//!   url:
//!     value: "https://${distribution.cdn.domain_name}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod declaration;
pub mod error;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigValidator, Settings, SettingsParser};
pub use declaration::{DeclarationHasher, DeclarationLoader, Declarations};
pub use error::{Result, StackformError};
pub use planner::{DiffEngine, Plan, PlanExecutor, Planner};
pub use provider::{HttpProvider, MemoryProvider, Provider, RetryPolicy};
pub use state::{LocalStateStore, S3StateStore, StateRecord, StateStore};
