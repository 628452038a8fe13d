// src/lib.rs
//
// =============================================================================
// TDLC: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.
//
// Pipeline: lexer -> parser (into a CompilationUnit) -> deps -> codegen.

// 1. Declare Modules
pub mod artifacts;
pub mod codegen;
pub mod deps;
pub mod detect;
pub mod error;
pub mod lexer;
pub mod model;
mod parser;
pub mod resources;
pub mod setarith;
pub mod unit;

// 2. Re-exports (The Public API)

pub use artifacts::Artifacts;
pub use error::{Location, Result, TdlError};
pub use model::{Arena, Runnable, ScopeId, Value};
pub use unit::CompilationUnit;
