/// Uncaught-error rendering
///
/// When an exception reaches the outermost VM frame uncaught, the embedder
/// API surfaces it as an error-tagged value (§7 "user-visible behavior");
/// this module is how the CLI shell renders that into the `name: message`
/// plus source-span-and-caret text a developer expects, via
/// `miette::Diagnostic` the same way the teacher's `diagnostics.rs` renders
/// `AXM_*` codes. This crate's codes live in their own `JS_*` namespace.
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::errors::JsErrorKind;

/// Stable diagnostic codes, grouped by the error kind that produces them.
/// Unlike the teacher's `AXM_1xx`..`AXM_6xx` ranges (lexer/parser/type/
/// runtime/compile/internal), this crate has no lexer or parser in scope,
/// so the ranges collapse to runtime (`JS_1xx`) and internal (`JS_9xx`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorCode {
    Runtime(JsErrorKind),
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Runtime(JsErrorKind::Error) => "JS_100",
            ErrorCode::Runtime(JsErrorKind::EvalError) => "JS_101",
            ErrorCode::Runtime(JsErrorKind::RangeError) => "JS_102",
            ErrorCode::Runtime(JsErrorKind::ReferenceError) => "JS_103",
            ErrorCode::Runtime(JsErrorKind::SyntaxError) => "JS_104",
            ErrorCode::Runtime(JsErrorKind::TypeError) => "JS_105",
            ErrorCode::Runtime(JsErrorKind::UriError) => "JS_106",
            ErrorCode::Runtime(JsErrorKind::AggregateError) => "JS_107",
            ErrorCode::Internal => "JS_900",
        }
    }
}

/// A rendered uncaught exception: the script name/name:message line, plus
/// a byte-offset span into the originating compiled unit's source map
/// (when `CompiledCode::source_name` and line info are present).
#[derive(Error, Debug, Diagnostic)]
#[error("{name}: {message}")]
#[diagnostic(code(jseng::uncaught))]
pub struct UncaughtError {
    pub name: &'static str,
    pub message: String,
    pub error_code: ErrorCode,
    #[source_code]
    pub src: NamedSource<String>,
    #[label("thrown here")]
    pub span: SourceSpan,
}

impl UncaughtError {
    pub fn new(kind: JsErrorKind, message: String, source_name: &str, source_text: String, offset: usize, len: usize) -> Self {
        UncaughtError {
            name: kind.name(),
            message,
            error_code: ErrorCode::Runtime(kind),
            src: NamedSource::new(source_name.to_string(), source_text),
            span: (offset, len).into(),
        }
    }

    pub fn render(self) -> String {
        format!("{:?}", miette::Report::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_namespace_is_js_not_axm() {
        assert!(ErrorCode::Runtime(JsErrorKind::TypeError).as_str().starts_with("JS_"));
    }

    #[test]
    fn uncaught_error_renders_name_and_message() {
        let e = UncaughtError::new(
            JsErrorKind::ReferenceError,
            "x is not defined".to_string(),
            "demo.jsb",
            "GetVar x".to_string(),
            0,
            7,
        );
        let rendered = e.render();
        assert!(rendered.contains("ReferenceError"));
        assert!(rendered.contains("x is not defined"));
    }
}
