//! Argument placement for each calling convention.
//!
//! System V assigns integer and floating point registers from two
//! independent counters; Windows x64 assigns the first four arguments by
//! position, so an `f64` in position 1 consumes both `rdx` and `xmm1`.
//! Whatever does not fit in registers is passed in 8-byte stack slots in
//! argument order.

use super::{CallConvention, ValueType};
use crate::{Error, Result};

/// Upper bound on stack-passed arguments a stub supports.
pub const MAX_STACK_ARGS: usize = 16;

/// Where one argument lives at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    /// Index into the convention's integer argument registers.
    Int(usize),
    /// Index into the convention's floating point argument registers.
    Float(usize),
    /// Index of the 8-byte stack slot (after any shadow space).
    Stack(usize),
}

/// Placement of every argument of a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgLayout {
    pub slots: Vec<ArgSlot>,
    pub stack_slots: usize,
}

impl ArgLayout {
    /// Bytes a caller reserves below its frame for the outgoing call:
    /// shadow space plus stack slots, rounded to keep `rsp` 16-byte aligned.
    pub fn outgoing_bytes(&self, convention: CallConvention) -> usize {
        let bytes = convention.shadow_space() + self.stack_slots * 8;
        (bytes + 15) & !15
    }
}

/// Compute where each parameter is passed under `convention`.
pub fn classify(convention: CallConvention, params: &[ValueType]) -> Result<ArgLayout> {
    let mut slots = Vec::with_capacity(params.len());
    let mut next_int = 0;
    let mut next_float = 0;
    let mut next_stack = 0;

    for (position, ty) in params.iter().enumerate() {
        let slot = if convention.is_positional() {
            if position < convention.int_arg_count() {
                if ty.is_float() {
                    ArgSlot::Float(position)
                } else {
                    ArgSlot::Int(position)
                }
            } else {
                next_stack += 1;
                ArgSlot::Stack(next_stack - 1)
            }
        } else if ty.is_float() && next_float < convention.float_arg_count() {
            next_float += 1;
            ArgSlot::Float(next_float - 1)
        } else if !ty.is_float() && next_int < convention.int_arg_count() {
            next_int += 1;
            ArgSlot::Int(next_int - 1)
        } else {
            next_stack += 1;
            ArgSlot::Stack(next_stack - 1)
        };
        slots.push(slot);
    }

    if next_stack > MAX_STACK_ARGS {
        return Err(Error::UnsupportedSignature(format!(
            "{} stack arguments under {} (at most {})",
            next_stack, convention, MAX_STACK_ARGS
        )));
    }

    Ok(ArgLayout {
        slots,
        stack_slots: next_stack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ValueType::*;

    #[test]
    fn sysv_counts_classes_independently() {
        let layout = classify(CallConvention::SysV64, &[I64, F64, Pointer, F32, I32]).unwrap();
        assert_eq!(
            layout.slots,
            vec![
                ArgSlot::Int(0),
                ArgSlot::Float(0),
                ArgSlot::Int(1),
                ArgSlot::Float(1),
                ArgSlot::Int(2),
            ]
        );
        assert_eq!(layout.stack_slots, 0);
        assert_eq!(layout.outgoing_bytes(CallConvention::SysV64), 0);
    }

    #[test]
    fn win64_assigns_by_position() {
        let layout = classify(CallConvention::Win64, &[I64, F64, Pointer, F32, I32, F64]).unwrap();
        assert_eq!(
            layout.slots,
            vec![
                ArgSlot::Int(0),
                ArgSlot::Float(1),
                ArgSlot::Int(2),
                ArgSlot::Float(3),
                ArgSlot::Stack(0),
                ArgSlot::Stack(1),
            ]
        );
        assert_eq!(layout.stack_slots, 2);
        // 32 bytes of shadow space plus two slots
        assert_eq!(layout.outgoing_bytes(CallConvention::Win64), 48);
    }

    #[test]
    fn sysv_spills_each_class_separately() {
        let params = [I64, I64, I64, I64, I64, I64, I64, F64];
        let layout = classify(CallConvention::SysV64, &params).unwrap();
        assert_eq!(layout.slots[6], ArgSlot::Stack(0));
        assert_eq!(layout.slots[7], ArgSlot::Float(0));
        assert_eq!(layout.stack_slots, 1);
        assert_eq!(layout.outgoing_bytes(CallConvention::SysV64), 16);
    }

    #[test]
    fn too_many_stack_arguments() {
        let params = vec![I64; 4 + MAX_STACK_ARGS + 1];
        assert!(matches!(
            classify(CallConvention::Win64, &params),
            Err(Error::UnsupportedSignature(_))
        ));
        let params = vec![I64; 4 + MAX_STACK_ARGS];
        assert!(classify(CallConvention::Win64, &params).is_ok());
    }
}
