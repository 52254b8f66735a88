//! Shardline AST - parsed statements, physical rewriting and binding
//!
//! SQL text parsing happens upstream; this crate starts from the parsed tree.

pub mod ast;
mod render;
mod substitute;
mod to_rel;

pub use ast::*;
pub use render::{render, render_select, RenderError, RenderMode, Rendered};
pub use substitute::Substitution;
pub use to_rel::{insert_columns, BindError, Binder};
