//! Staging-directive resolution
//!
//! Tasks describe data movement declaratively: five lists of directive
//! strings of the form `SOURCE` or `SOURCE > TARGET`. This crate turns
//! those lists into concrete source/target/action triples for the
//! execution backend, and builds the full [`UnitDescription`] for a task.
//!
//! Keeping "what to move" separate from "how to move it" lets the backend
//! adapter decide transport mechanics while the workflow description stays
//! backend-agnostic: entries from the *link* and *copy* lists carry an
//! explicit action, entries from the *upload* and *download* lists carry
//! none and fall back to the backend's default transfer semantics.
//!
//! ```rust
//! use ensembly_types::{StagingAction, Task};
//! use ensembly_staging::resolve_input_directives;
//!
//! let mut task = Task::new("sim");
//! task.upload_input_data = vec!["input/a.dat".into()];
//! task.link_input_data = vec!["$HOME/ref.dat > reference.dat".into()];
//!
//! let resolved = resolve_input_directives(&task).unwrap();
//! assert_eq!(resolved[0].target, "a.dat");
//! assert!(resolved[0].action.is_none());
//! assert_eq!(resolved[1].target, "reference.dat");
//! assert_eq!(resolved[1].action, Some(StagingAction::Link));
//! ```

#![deny(unsafe_code)]

pub mod resolver;

pub use resolver::{describe_unit, resolve_input_directives, resolve_output_directives};
