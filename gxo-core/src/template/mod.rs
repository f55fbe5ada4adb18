//! Template rendering (spec §4.2).
//!
//! A minimal, Go-template-flavored expression language: dotted-path
//! variable references (`.a.b.c`), string literals, and single-level
//! function calls (`env`, `eq`, `secret`). See [`ast`] for the grammar and
//! [`render::Renderer`] for the evaluation contract.

pub mod ast;
mod render;

pub use render::{lookup_var, Renderer};
