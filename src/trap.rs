// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// A typed runtime failure raised from guest code.
///
/// Both engines report traps through the same status word: generated code
/// returns it in a register, the interpreter threads it through its dispatch
/// loop. The numeric encoding below is that status word (offset by one so
/// zero can mean "no trap").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrapKind {
    /// Code that was supposed to have been unreachable was reached.
    Unreachable,
    /// An out-of-bounds memory or table access.
    OutOfBounds,
    /// Signature mismatch on indirect call.
    IndirectCallTypeMismatch,
    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow,
    /// An integer division by zero.
    IntegerDivideByZero,
    /// Failed float-to-int conversion.
    InvalidConversionToInteger,
    /// Indirect call through a null or out-of-bounds table element.
    UndefinedElement,
    /// The current stack space was exhausted.
    StackExhausted,
    /// The invocation was cancelled through its cancellation token.
    Cancelled,
    /// A wasm atomic wait was attempted against non-shared memory.
    AtomicWaitNonSharedMemory,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapKind::Unreachable => f.write_str("unreachable code executed"),
            TrapKind::OutOfBounds => f.write_str("out of bounds memory access"),
            TrapKind::IndirectCallTypeMismatch => {
                f.write_str("indirect call signature mismatch")
            }
            TrapKind::IntegerOverflow => f.write_str("integer overflow"),
            TrapKind::IntegerDivideByZero => f.write_str("integer divide by zero"),
            TrapKind::InvalidConversionToInteger => f.write_str("invalid conversion to integer"),
            TrapKind::UndefinedElement => f.write_str("accessed undefined table element"),
            TrapKind::StackExhausted => f.write_str("call stack exhausted"),
            TrapKind::Cancelled => f.write_str("invocation cancelled"),
            TrapKind::AtomicWaitNonSharedMemory => {
                f.write_str("atomic wait on non-shared memory")
            }
        }
    }
}

impl core::error::Error for TrapKind {}

impl From<TrapKind> for u8 {
    fn from(value: TrapKind) -> Self {
        match value {
            TrapKind::Unreachable => 0,
            TrapKind::OutOfBounds => 1,
            TrapKind::IndirectCallTypeMismatch => 2,
            TrapKind::IntegerOverflow => 3,
            TrapKind::IntegerDivideByZero => 4,
            TrapKind::InvalidConversionToInteger => 5,
            TrapKind::UndefinedElement => 6,
            TrapKind::StackExhausted => 7,
            TrapKind::Cancelled => 8,
            TrapKind::AtomicWaitNonSharedMemory => 9,
        }
    }
}

impl TryFrom<u8> for TrapKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unreachable),
            1 => Ok(Self::OutOfBounds),
            2 => Ok(Self::IndirectCallTypeMismatch),
            3 => Ok(Self::IntegerOverflow),
            4 => Ok(Self::IntegerDivideByZero),
            5 => Ok(Self::InvalidConversionToInteger),
            6 => Ok(Self::UndefinedElement),
            7 => Ok(Self::StackExhausted),
            8 => Ok(Self::Cancelled),
            9 => Ok(Self::AtomicWaitNonSharedMemory),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_round_trip() {
        for kind in [
            TrapKind::Unreachable,
            TrapKind::OutOfBounds,
            TrapKind::IndirectCallTypeMismatch,
            TrapKind::IntegerOverflow,
            TrapKind::IntegerDivideByZero,
            TrapKind::InvalidConversionToInteger,
            TrapKind::UndefinedElement,
            TrapKind::StackExhausted,
            TrapKind::Cancelled,
            TrapKind::AtomicWaitNonSharedMemory,
        ] {
            assert_eq!(TrapKind::try_from(u8::from(kind)), Ok(kind));
        }
        assert!(TrapKind::try_from(10).is_err());
    }
}
