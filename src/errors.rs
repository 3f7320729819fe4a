// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::trap::TrapKind;
use core::fmt;

/// Convenience macro for creating an `Error::Unsupported` variant.
#[macro_export]
macro_rules! wasm_unsupported {
    ($($arg:tt)*) => { $crate::Error::Unsupported(::std::format!($($arg)*)) }
}

/// Error type for the crate.
#[derive(Debug)]
pub enum Error {
    /// The input bytes are not a well-formed WebAssembly binary.
    Decode {
        /// A string describing the decoding error.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// The input WebAssembly violated a type or structural rule.
    Validation {
        /// A string describing the validation error.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// A required import was not provided, or was provided with the wrong
    /// type.
    Link {
        /// The module name of the import.
        module: String,
        /// The field name of the import.
        field: String,
        /// A human-readable description of what went wrong.
        message: String,
    },
    /// The name is already defined in the linker.
    AlreadyDefined {
        /// The defined module name.
        module: String,
        /// The defined field name.
        field: String,
    },
    /// The backend could not encode a function.
    Compile(CompileError),
    /// The WebAssembly code used an unsupported feature.
    Unsupported(String),
    /// A WebAssembly trap occurred.
    Trap {
        /// The trap that occurred.
        kind: TrapKind,
        /// The exported function (if known) the trap unwound out of.
        func_name: Option<String>,
    },
    /// The guest requested an orderly exit through the system interface.
    Exit {
        /// The exit code passed by the guest.
        code: u32,
    },
    /// An error returned by a user-supplied host function.
    Host(Box<dyn core::error::Error + Send + Sync>),
    /// The module or instance was closed and can no longer be used.
    Closed,
    /// Memory mapping failed.
    Mmap(rustix::io::Errno),
}

impl Error {
    /// Constructs a trap error with no source-site information.
    pub(crate) fn trap(kind: TrapKind) -> Self {
        Error::Trap {
            kind,
            func_name: None,
        }
    }

    /// The exit code carried by an [`Error::Exit`], if this is one.
    pub fn exit_code(&self) -> Option<u32> {
        match self {
            Error::Exit { code } => Some(*code),
            _ => None,
        }
    }

    /// The trap kind carried by an [`Error::Trap`], if this is one.
    pub fn trap_kind(&self) -> Option<TrapKind> {
        match self {
            Error::Trap { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Errors produced by the instruction encoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// An operand was not valid for the instruction, e.g. a static constant
    /// with an odd byte length.
    InvalidOperand {
        /// Mnemonic of the rejected instruction.
        instruction: &'static str,
    },
    /// A displacement or immediate did not fit its encoding.
    DisplacementOverflow,
    /// The function body grew past the encodable range.
    CodeTooLarge,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::InvalidOperand { instruction } => {
                f.write_fmt(format_args!("invalid operand for {instruction}"))
            }
            CompileError::DisplacementOverflow => f.write_str("displacement out of range"),
            CompileError::CodeTooLarge => f.write_str("code for function is too large"),
        }
    }
}

impl core::error::Error for CompileError {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode { message, offset } => {
                f.write_fmt(format_args!("malformed WASM input at {offset}: {message}"))
            }
            Self::Validation { message, offset } => {
                f.write_fmt(format_args!("invalid WASM input at {offset}: {message}"))
            }
            Self::Link {
                module,
                field,
                message,
            } => f.write_fmt(format_args!("link error for {module}::{field}: {message}")),
            Self::AlreadyDefined { module, field } => {
                f.write_fmt(format_args!("name {module}::{field} is already defined"))
            }
            Self::Compile(e) => f.write_fmt(format_args!("failed to compile function: {e}")),
            Self::Unsupported(feature) => f.write_fmt(format_args!(
                "feature used by the WebAssembly code is not supported: {feature}"
            )),
            Self::Trap { kind, func_name } => {
                if let Some(name) = func_name {
                    f.write_fmt(format_args!("wasm trap in {name}: {kind}"))
                } else {
                    f.write_fmt(format_args!("wasm trap: {kind}"))
                }
            }
            Self::Exit { code } => f.write_fmt(format_args!("module exited with code {code}")),
            Self::Host(e) => f.write_fmt(format_args!("host function error: {e}")),
            Self::Closed => f.write_str("module or instance has been closed"),
            Self::Mmap(errno) => f.write_fmt(format_args!("memory mapping failed: {errno}")),
        }
    }
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        Self::Decode {
            message: e.message().into(),
            offset: e.offset(),
        }
    }
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Host(e) => Some(&**e),
            Self::Compile(e) => Some(e),
            _ => None,
        }
    }
}

/// Maps an error coming out of a `wasmparser::Validator` call to
/// [`Error::Validation`]; plain reader errors stay [`Error::Decode`].
pub(crate) fn validation_error(e: wasmparser::BinaryReaderError) -> Error {
    Error::Validation {
        message: e.message().into(),
        offset: e.offset(),
    }
}
