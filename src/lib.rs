//! SchemaX - database schema diagrams with a two-way DBML text view
//!
//! The diagram model lives in a [`core::DiagramSession`]. Schema text is
//! compiled into the model by parsing it and reconciling the result with the
//! live entities, so ids survive renames and every edit is one undo step.

pub mod core;
