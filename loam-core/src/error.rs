//! Error types for the compiler.
//!
//! Every pass reports failures through [`CompilerError`]; there are no
//! panics on user-reachable paths. Errors carry the source span of the
//! offending node so the driver can format them uniformly.

use crate::ast::Span;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompilerError>;

/// Semantic failure kinds raised by the typechecker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    UnboundVar,
    UnknownField,
    UnknownConstructor,
    TypeMismatch,
    ArityMismatch,
    ForbiddenEffect,
    BadBigMap,
    UnannotatedSum,
}

impl std::fmt::Display for TypeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            TypeErrorKind::UnboundVar => "unbound variable",
            TypeErrorKind::UnknownField => "unknown field",
            TypeErrorKind::UnknownConstructor => "unknown constructor",
            TypeErrorKind::TypeMismatch => "type mismatch",
            TypeErrorKind::ArityMismatch => "arity mismatch",
            TypeErrorKind::ForbiddenEffect => "forbidden effect",
            TypeErrorKind::BadBigMap => "bad big map",
            TypeErrorKind::UnannotatedSum => "unannotated sum",
        };
        write!(f, "{}", s)
    }
}

/// Failure kinds raised while decompiling a stack program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompileErrorKind {
    /// Control-flow branches rejoin with incompatible stack shapes.
    UnstructuredProgram,
    /// An instruction addresses a stack position that does not exist.
    UnboundStackPosition,
    /// Variable annotations disagree between rejoining branches.
    AnnotationConflict,
}

impl std::fmt::Display for DecompileErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            DecompileErrorKind::UnstructuredProgram => "unstructured program",
            DecompileErrorKind::UnboundStackPosition => "unbound stack position",
            DecompileErrorKind::AnnotationConflict => "annotation conflict",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CompilerError {
    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("{kind}: {message} at {span}")]
    Type {
        kind: TypeErrorKind,
        message: String,
        span: Span,
        /// Optional "expected here" location.
        secondary: Option<Span>,
    },

    #[error("encoding error: {message} at {span}")]
    Encode { message: String, span: Span },

    #[error("code generation error: {message} at {span}")]
    Gen { message: String, span: Span },

    #[error("decompilation error: {kind}: {message}")]
    Decompile {
        kind: DecompileErrorKind,
        message: String,
    },

    /// Invariant violation inside a pass. These are compiler bugs, not
    /// user errors, and name the stage that detected them.
    #[error("internal error in {stage}: {message}")]
    Internal { stage: &'static str, message: String },
}

impl CompilerError {
    pub fn is_annotation_conflict(&self) -> bool {
        matches!(
            self,
            CompilerError::Decompile {
                kind: DecompileErrorKind::AnnotationConflict,
                ..
            }
        )
    }
}

#[macro_export]
macro_rules! err_parse {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Parse { message: format!($($arg)*) }
    };
}

#[macro_export]
macro_rules! err_type_at {
    ($span:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::Type {
            kind: $crate::error::TypeErrorKind::TypeMismatch,
            message: format!($($arg)*),
            span: $span,
            secondary: None,
        }
    };
}

#[macro_export]
macro_rules! bail_type_at {
    ($span:expr, $($arg:tt)*) => {
        return Err($crate::err_type_at!($span, $($arg)*))
    };
}

#[macro_export]
macro_rules! err_kind_at {
    ($kind:ident, $span:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::Type {
            kind: $crate::error::TypeErrorKind::$kind,
            message: format!($($arg)*),
            span: $span,
            secondary: None,
        }
    };
}

#[macro_export]
macro_rules! err_unbound_at {
    ($span:expr, $($arg:tt)*) => {
        $crate::err_kind_at!(UnboundVar, $span, $($arg)*)
    };
}

#[macro_export]
macro_rules! err_effect_at {
    ($span:expr, $($arg:tt)*) => {
        $crate::err_kind_at!(ForbiddenEffect, $span, $($arg)*)
    };
}

#[macro_export]
macro_rules! err_encode_at {
    ($span:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::Encode {
            message: format!($($arg)*),
            span: $span,
        }
    };
}

#[macro_export]
macro_rules! bail_encode_at {
    ($span:expr, $($arg:tt)*) => {
        return Err($crate::err_encode_at!($span, $($arg)*))
    };
}

#[macro_export]
macro_rules! err_gen_at {
    ($span:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::Gen {
            message: format!($($arg)*),
            span: $span,
        }
    };
}

#[macro_export]
macro_rules! err_internal {
    ($stage:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::Internal {
            stage: $stage,
            message: format!($($arg)*),
        }
    };
}

#[macro_export]
macro_rules! err_decompile {
    ($kind:ident, $($arg:tt)*) => {
        $crate::error::CompilerError::Decompile {
            kind: $crate::error::DecompileErrorKind::$kind,
            message: format!($($arg)*),
        }
    };
}
