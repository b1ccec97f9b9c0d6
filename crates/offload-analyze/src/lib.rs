//! Static dependency analysis of a captured Python callable.
//!
//! The dispatch surface hands this crate the function's own source text (not
//! the whole enclosing module — Rust has no way to introspect a Python
//! callable at runtime the way the original tool used `inspect.getsource`, so
//! the caller captures the text up front). [`analyze`] walks it with a
//! hand-rolled tokenizer and reports the imports, calls, and file touches the
//! bundle packager needs to decide what to ship alongside the function.
//!
//! # Example
//!
//! ```
//! use offload_analyze::analyze;
//!
//! let source = "def add(a, b):\n    return a + b\n";
//! let report = analyze(source, "add").unwrap();
//! assert!(report.imports.is_empty());
//! ```

pub mod error;
pub mod lexer;
pub mod loops;
pub mod normalize;
pub mod report;
pub mod span;

pub use error::{AnalyzeError, AnalyzeErrorKind};
pub use loops::{LoopInfo, LoopKind, analyze_loops};
pub use normalize::normalize_source;
pub use report::{
    DataRef, DependencyReport, FileRef, FileRefKind, FsCall, ImportRecord, LocalCall, analyze,
};
pub use span::{Span, Spanned};
