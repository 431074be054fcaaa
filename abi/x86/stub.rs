//! Downcall and upcall stub synthesis.
//!
//! Both stub kinds move arguments through a [`CallFrame`]:
//!
//! - A downcall stub is entered from Rust as `extern "C" fn(*mut CallFrame)`.
//!   It copies stack arguments below its own frame, loads every argument
//!   register of the target convention from the frame, calls the target and
//!   stores RAX/XMM0 back into the frame.
//! - An upcall stub is entered from native code under the binder's
//!   convention. It spills every argument register and the incoming stack
//!   arguments into a frame on its own stack, calls [`upcall_dispatch`] under
//!   the host convention, then loads RAX/XMM0 from the frame and returns.
//!
//! A Windows x64 caller expects RSI, RDI and XMM6-XMM15 to survive the call,
//! but the host convention treats them as scratch, so foreign upcall stubs
//! save and restore them around the dispatch.

use super::assembler::{Assembler, R11, R12, RAX, RBP, RBX, RDI, RSI, RSP};
use super::{CallFrame, ExecutableBuffer, int_arg_registers};
use crate::abi::{ArgLayout, ArgSlot, CallConvention, Signature, UpcallFn, Value, classify};
use crate::{Error, Result};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use tracing::{debug, error};

/// Stack offsets inside an upcall stub's locals (relative to RSP).
const SAVE_RSI: i32 = CallFrame::SIZE as i32;
const SAVE_RDI: i32 = SAVE_RSI + 8;
const SAVE_XMM: i32 = SAVE_RDI + 8;
const SAVED_XMM_COUNT: u8 = 10;
const UPCALL_LOCALS: u32 = ((SAVE_XMM as u32 + 16 * SAVED_XMM_COUNT as u32) + 15) & !15;

/// A callable handle for a native function under a fixed convention and signature.
///
/// `'t` bounds how long the target code stays mapped. Handles for addresses
/// inside a loaded image borrow that image.
pub struct Downcall<'t> {
    code: ExecutableBuffer,
    address: NonNull<c_void>,
    convention: CallConvention,
    signature: Signature,
    layout: ArgLayout,
    _target: PhantomData<&'t ()>,
}

// SAFETY: the handle only holds immutable code and a code address.
unsafe impl Send for Downcall<'_> {}
unsafe impl Sync for Downcall<'_> {}

impl Downcall<'static> {
    pub(crate) fn new(
        convention: CallConvention,
        address: NonNull<c_void>,
        signature: &Signature,
    ) -> Result<Self> {
        let layout = classify(convention, signature.params())?;
        let code = ExecutableBuffer::new(&emit_downcall(convention, &layout))?;
        debug!(
            "Downcall stub for {:p} ({}) at {:p}",
            address,
            convention,
            code.as_ptr()
        );
        Ok(Self {
            code,
            address,
            convention,
            signature: signature.clone(),
            layout,
            _target: PhantomData,
        })
    }
}

impl Downcall<'_> {
    pub fn address(&self) -> NonNull<c_void> {
        self.address
    }

    pub fn convention(&self) -> CallConvention {
        self.convention
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Call the target with `args`.
    ///
    /// # Safety
    ///
    /// The target must be a function of this handle's signature under this
    /// handle's convention, and any pointer arguments must be valid for it.
    pub unsafe fn invoke(&self, args: &[Value]) -> Result<Value> {
        let params = self.signature.params();
        if args.len() != params.len() {
            return Err(Error::ArgumentMismatch(format!(
                "expected {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }

        let mut frame = CallFrame {
            target: self.address.as_ptr() as u64,
            ..CallFrame::default()
        };
        for (index, ((arg, param), slot)) in args.iter().zip(params).zip(&self.layout.slots).enumerate() {
            if arg.value_type() != Some(*param) {
                return Err(Error::ArgumentMismatch(format!(
                    "argument {} is {:?}, expected {:?}",
                    index, arg, param
                )));
            }
            match *slot {
                ArgSlot::Int(i) => frame.int_regs[i] = arg.to_bits(),
                ArgSlot::Float(i) => frame.float_regs[i] = arg.to_bits(),
                ArgSlot::Stack(i) => frame.stack[i] = arg.to_bits(),
            }
        }

        unsafe {
            let entry: unsafe extern "C" fn(*mut CallFrame) = std::mem::transmute(self.code.as_ptr());
            entry(&mut frame);
        }

        Ok(match self.signature.ret() {
            None => Value::Void,
            Some(ty) if ty.is_float() => Value::from_bits(ty, frame.ret_float),
            Some(ty) => Value::from_bits(ty, frame.ret_int),
        })
    }
}

/// Everything an upcall stub needs once it reaches Rust.
pub(crate) struct UpcallTarget {
    signature: Signature,
    layout: ArgLayout,
    callback: UpcallFn,
}

/// Native-callable code that forwards to a Rust closure.
///
/// The stub address stays valid until this value is dropped.
pub struct UpcallStub {
    code: ExecutableBuffer,
    convention: CallConvention,
    // Referenced by address from the stub code; must outlive `code`.
    _target: Box<UpcallTarget>,
}

impl UpcallStub {
    pub(crate) fn new(
        convention: CallConvention,
        signature: &Signature,
        callback: UpcallFn,
    ) -> Result<Self> {
        let layout = classify(convention, signature.params())?;
        let target = Box::new(UpcallTarget {
            signature: signature.clone(),
            layout,
            callback,
        });
        let code = emit_upcall(
            convention,
            &target.layout,
            &*target as *const UpcallTarget as u64,
            upcall_dispatch as *const () as u64,
        );
        let code = ExecutableBuffer::new(&code)?;
        debug!("Upcall stub ({}) at {:p}", convention, code.as_ptr());
        Ok(Self {
            code,
            convention,
            _target: target,
        })
    }

    /// Address native code should call.
    pub fn address(&self) -> NonNull<c_void> {
        self.code.entry()
    }

    pub fn convention(&self) -> CallConvention {
        self.convention
    }
}

/// Host-convention entry point of every upcall stub.
///
/// # Safety
///
/// Only called by stub code, with the stub's own target and a frame the stub
/// has filled according to the target's layout.
unsafe extern "C" fn upcall_dispatch(target: *const UpcallTarget, frame: *mut CallFrame) {
    let target = unsafe { &*target };
    let frame = unsafe { &mut *frame };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let args: Vec<Value> = target
            .signature
            .params()
            .iter()
            .zip(&target.layout.slots)
            .map(|(ty, slot)| {
                let bits = match *slot {
                    ArgSlot::Int(i) => frame.int_regs[i],
                    ArgSlot::Float(i) => frame.float_regs[i],
                    ArgSlot::Stack(i) => frame.stack[i],
                };
                Value::from_bits(*ty, bits)
            })
            .collect();
        (target.callback)(&args)
    }));

    let value = match outcome {
        Ok(value) => value,
        Err(_) => {
            error!("Upcall target panicked; unwinding into native code is not possible");
            std::process::abort();
        }
    };

    let expected = target.signature.ret();
    if value.value_type() != expected {
        error!("Upcall returned {:?}, signature expects {:?}", value, expected);
        std::process::abort();
    }
    match expected {
        None => {}
        Some(ty) if ty.is_float() => frame.ret_float = value.to_bits(),
        Some(_) => frame.ret_int = value.to_bits(),
    }
}

/// Emit a downcall stub: `extern "C" fn(frame: *mut CallFrame)`.
pub fn emit_downcall(convention: CallConvention, layout: &ArgLayout) -> Vec<u8> {
    let mut asm = Assembler::new();
    let outgoing = layout.outgoing_bytes(convention) as u32;
    let shadow = convention.shadow_space() as i32;

    // Prologue; R12 is pushed only to keep RSP 16-byte aligned at the call
    asm.emit_push_reg64(RBP);
    asm.emit_mov_reg_to_reg(RBP, RSP);
    asm.emit_push_reg64(RBX);
    asm.emit_push_reg64(R12);
    asm.emit_mov_reg_to_reg(RBX, RDI);
    if outgoing > 0 {
        asm.emit_sub_rsp_imm32(outgoing);
    }

    for slot in 0..layout.stack_slots as i32 {
        asm.emit_load64(RAX, RBX, CallFrame::STACK + 8 * slot);
        asm.emit_store64(RSP, shadow + 8 * slot, RAX);
    }
    for (i, reg) in int_arg_registers(convention).iter().enumerate() {
        asm.emit_load64(*reg, RBX, CallFrame::INT_REGS + 8 * i as i32);
    }
    for xmm in 0..convention.float_arg_count() as u8 {
        asm.emit_movsd_load(xmm, RBX, CallFrame::FLOAT_REGS + 8 * xmm as i32);
    }

    asm.emit_load64(R11, RBX, CallFrame::TARGET);
    asm.emit_call_reg(R11);
    asm.emit_store64(RBX, CallFrame::RET_INT, RAX);
    asm.emit_movsd_store(RBX, CallFrame::RET_FLOAT, 0);

    if outgoing > 0 {
        asm.emit_add_rsp_imm32(outgoing);
    }
    asm.emit_pop_reg64(R12);
    asm.emit_pop_reg64(RBX);
    asm.emit_pop_reg64(RBP);
    asm.emit_ret();
    asm.finish()
}

/// Emit an upcall stub that calls `dispatch(target, frame)`.
pub fn emit_upcall(
    convention: CallConvention,
    layout: &ArgLayout,
    target: u64,
    dispatch: u64,
) -> Vec<u8> {
    let mut asm = Assembler::new();
    let preserve_sysv_scratch = convention == CallConvention::Win64;

    asm.emit_push_reg64(RBP);
    asm.emit_mov_reg_to_reg(RBP, RSP);
    asm.emit_sub_rsp_imm32(UPCALL_LOCALS);

    for (i, reg) in int_arg_registers(convention).iter().enumerate() {
        asm.emit_store64(RSP, CallFrame::INT_REGS + 8 * i as i32, *reg);
    }
    for xmm in 0..convention.float_arg_count() as u8 {
        asm.emit_movsd_store(RSP, CallFrame::FLOAT_REGS + 8 * xmm as i32, xmm);
    }

    // Incoming stack arguments sit above the saved RBP, return address and shadow space
    let incoming = 16 + convention.shadow_space() as i32;
    for slot in 0..layout.stack_slots as i32 {
        asm.emit_load64(RAX, RBP, incoming + 8 * slot);
        asm.emit_store64(RSP, CallFrame::STACK + 8 * slot, RAX);
    }

    if preserve_sysv_scratch {
        asm.emit_store64(RSP, SAVE_RSI, RSI);
        asm.emit_store64(RSP, SAVE_RDI, RDI);
        for i in 0..SAVED_XMM_COUNT {
            asm.emit_movdqu_store(RSP, SAVE_XMM + 16 * i as i32, 6 + i);
        }
    }

    asm.emit_mov_imm64(RDI, target);
    asm.emit_mov_reg_to_reg(RSI, RSP);
    asm.emit_mov_imm64(RAX, dispatch);
    asm.emit_call_reg(RAX);

    asm.emit_load64(RAX, RSP, CallFrame::RET_INT);
    asm.emit_movsd_load(0, RSP, CallFrame::RET_FLOAT);

    if preserve_sysv_scratch {
        asm.emit_load64(RSI, RSP, SAVE_RSI);
        asm.emit_load64(RDI, RSP, SAVE_RDI);
        for i in 0..SAVED_XMM_COUNT {
            asm.emit_movdqu_load(6 + i, RSP, SAVE_XMM + 16 * i as i32);
        }
    }

    asm.emit_mov_reg_to_reg(RSP, RBP);
    asm.emit_pop_reg64(RBP);
    asm.emit_ret();
    asm.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ValueType, foreign_binder, host_binder};
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn decode(code: &[u8]) -> Vec<iced_x86::Instruction> {
        let mut decoder = Decoder::new(64, code, DecoderOptions::NONE);
        decoder.iter().collect()
    }

    fn address_of(f: *const ()) -> NonNull<c_void> {
        NonNull::new(f as *mut c_void).unwrap()
    }

    extern "C" fn host_mix(a: i64, b: f64, c: i32, d: f32) -> f64 {
        a as f64 + b + c as f64 + d as f64
    }

    extern "win64" fn win_mix(a: i64, b: f64, c: i32, d: f32, e: i64, f: f64) -> f64 {
        a as f64 * 1.0 + b * 10.0 + c as f64 * 100.0 + d as f64 * 1000.0 + e as f64 * 10000.0 + f * 100000.0
    }

    #[allow(clippy::too_many_arguments)]
    extern "win64" fn win_weighted(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64, h: i64) -> i64 {
        a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h
    }

    extern "win64" fn win_negate(x: i32) -> i32 {
        -x
    }

    #[test]
    fn emitted_stubs_decode_cleanly() {
        for convention in [CallConvention::SysV64, CallConvention::Win64] {
            let layout = classify(convention, &[ValueType::I64; 10]).unwrap();
            for code in [
                emit_downcall(convention, &layout),
                emit_upcall(convention, &layout, 0x1000, 0x2000),
            ] {
                let insns = decode(&code);
                assert!(insns.iter().all(|insn| !insn.is_invalid()), "{convention}");
                assert_eq!(insns.last().unwrap().mnemonic(), Mnemonic::Ret);
                let calls = insns.iter().filter(|insn| insn.mnemonic() == Mnemonic::Call).count();
                assert_eq!(calls, 1);
            }
        }
    }

    #[test]
    fn foreign_upcall_preserves_win64_callee_saved_state() {
        let layout = classify(CallConvention::Win64, &[]).unwrap();
        let insns = decode(&emit_upcall(CallConvention::Win64, &layout, 0, 0));
        let saves = insns.iter().filter(|insn| insn.mnemonic() == Mnemonic::Movdqu).count();
        assert_eq!(saves, 2 * SAVED_XMM_COUNT as usize);

        let layout = classify(CallConvention::SysV64, &[]).unwrap();
        let insns = decode(&emit_upcall(CallConvention::SysV64, &layout, 0, 0));
        assert!(insns.iter().all(|insn| insn.mnemonic() != Mnemonic::Movdqu));
    }

    #[test]
    fn host_downcall_mixes_classes() {
        let signature = Signature::of(
            ValueType::F64,
            &[ValueType::I64, ValueType::F64, ValueType::I32, ValueType::F32],
        );
        let downcall = host_binder()
            .unwrap()
            .downcall(address_of(host_mix as *const ()), &signature)
            .unwrap();
        let result = unsafe {
            downcall.invoke(&[Value::I64(1), Value::F64(0.5), Value::I32(-3), Value::F32(0.25)])
        }
        .unwrap();
        assert_eq!(result, Value::F64(-1.25));
    }

    #[test]
    fn foreign_downcall_passes_stack_arguments() {
        let signature = Signature::of(
            ValueType::F64,
            &[
                ValueType::I64,
                ValueType::F64,
                ValueType::I32,
                ValueType::F32,
                ValueType::I64,
                ValueType::F64,
            ],
        );
        let downcall = foreign_binder()
            .unwrap()
            .downcall(address_of(win_mix as *const ()), &signature)
            .unwrap();
        let result = unsafe {
            downcall.invoke(&[
                Value::I64(1),
                Value::F64(2.0),
                Value::I32(3),
                Value::F32(4.0),
                Value::I64(5),
                Value::F64(6.0),
            ])
        }
        .unwrap();
        assert_eq!(result, Value::F64(654321.0));
    }

    #[test]
    fn foreign_downcall_keeps_argument_order() {
        let signature = Signature::of(ValueType::I64, &[ValueType::I64; 8]);
        let downcall = foreign_binder()
            .unwrap()
            .downcall(address_of(win_weighted as *const ()), &signature)
            .unwrap();
        let args: Vec<Value> = (1..=8).map(Value::I64).collect();
        let result = unsafe { downcall.invoke(&args) }.unwrap();
        // sum of i * i for i in 1..=8
        assert_eq!(result, Value::I64(204));
    }

    #[test]
    fn narrow_return_is_sign_extended() {
        let signature = Signature::of(ValueType::I32, &[ValueType::I32]);
        let downcall = foreign_binder()
            .unwrap()
            .downcall(address_of(win_negate as *const ()), &signature)
            .unwrap();
        assert_eq!(unsafe { downcall.invoke(&[Value::I32(7)]) }.unwrap(), Value::I32(-7));
    }

    #[test]
    fn downcall_rejects_mismatched_arguments() {
        let signature = Signature::of(ValueType::I32, &[ValueType::I32]);
        let downcall = foreign_binder()
            .unwrap()
            .downcall(address_of(win_negate as *const ()), &signature)
            .unwrap();
        assert!(matches!(
            unsafe { downcall.invoke(&[]) },
            Err(Error::ArgumentMismatch(_))
        ));
        assert!(matches!(
            unsafe { downcall.invoke(&[Value::I64(7)]) },
            Err(Error::ArgumentMismatch(_))
        ));
    }

    #[test]
    fn foreign_upcall_is_callable_as_win64() {
        let signature = Signature::of(ValueType::I64, &[ValueType::I64, ValueType::I64]);
        let stub = foreign_binder()
            .unwrap()
            .upcall(
                &signature,
                Box::new(|args| Value::I64(args[0].as_i64().unwrap() * 10 + args[1].as_i64().unwrap())),
            )
            .unwrap();
        let f: extern "win64" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(stub.address().as_ptr()) };
        assert_eq!(f(4, 2), 42);
        assert_eq!(f(-1, 5), -5);
    }

    #[test]
    fn foreign_upcall_reads_floats_and_stack_slots() {
        let signature = Signature::of(
            ValueType::F64,
            &[
                ValueType::I32,
                ValueType::F64,
                ValueType::I64,
                ValueType::F32,
                ValueType::I64,
                ValueType::F64,
            ],
        );
        let stub = foreign_binder()
            .unwrap()
            .upcall(
                &signature,
                Box::new(|args| {
                    let a = args[0].as_i32().unwrap() as f64;
                    let b = args[1].as_f64().unwrap();
                    let c = args[2].as_i64().unwrap() as f64;
                    let d = args[3].as_f32().unwrap() as f64;
                    let e = args[4].as_i64().unwrap() as f64;
                    let f = args[5].as_f64().unwrap();
                    Value::F64(a + b * 10.0 + c * 100.0 + d * 1000.0 + e * 10000.0 + f * 100000.0)
                }),
            )
            .unwrap();
        let f: extern "win64" fn(i32, f64, i64, f32, i64, f64) -> f64 =
            unsafe { std::mem::transmute(stub.address().as_ptr()) };
        assert_eq!(f(1, 2.0, 3, 4.0, 5, 6.0), 654321.0);
    }

    #[test]
    fn host_upcall_is_callable_as_c() {
        let signature = Signature::of(ValueType::I32, &[ValueType::I32]);
        let stub = host_binder()
            .unwrap()
            .upcall(&signature, Box::new(|args| Value::I32(args[0].as_i32().unwrap() + 1)))
            .unwrap();
        let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(stub.address().as_ptr()) };
        assert_eq!(f(41), 42);
    }

    #[test]
    fn foreign_downcall_into_foreign_upcall() {
        let signature = Signature::of_void(&[ValueType::Pointer]);
        let stub = foreign_binder()
            .unwrap()
            .upcall(
                &signature,
                Box::new(|args| {
                    let out = args[0].as_ptr().unwrap() as *mut u64;
                    unsafe { *out = 0xfeed };
                    Value::Void
                }),
            )
            .unwrap();
        let downcall = foreign_binder().unwrap().downcall(stub.address(), &signature).unwrap();

        let mut out = 0u64;
        let result = unsafe { downcall.invoke(&[Value::Pointer(&mut out as *mut u64 as *mut c_void)]) };
        assert_eq!(result.unwrap(), Value::Void);
        assert_eq!(out, 0xfeed);
    }

    #[test]
    fn foreign_upcall_restores_win64_callee_saved_registers() {
        use std::arch::asm;

        let signature = Signature::of(ValueType::I64, &[ValueType::I64]);
        let stub = foreign_binder()
            .unwrap()
            .upcall(
                &signature,
                Box::new(|args| {
                    // Scratch under System V, callee-saved under Windows x64
                    unsafe {
                        asm!(
                            "xor esi, esi",
                            "xor edi, edi",
                            "xorps xmm6, xmm6",
                            out("rsi") _,
                            out("rdi") _,
                            out("xmm6") _,
                        )
                    };
                    Value::I64(args[0].as_i64().unwrap() * 2)
                }),
            )
            .unwrap();

        let rsi: u64;
        let rdi: u64;
        let xmm6: f64;
        let result: i64;
        unsafe {
            asm!(
                "sub rsp, 32",
                "call {entry}",
                "add rsp, 32",
                entry = in(reg) stub.address().as_ptr(),
                inout("rcx") 21i64 => _,
                inout("rsi") 0x1111u64 => rsi,
                inout("rdi") 0x2222u64 => rdi,
                inout("xmm6") f64::from_bits(0x3333) => xmm6,
                lateout("rax") result,
                clobber_abi("win64"),
            )
        };

        assert_eq!(result, 42);
        assert_eq!(rsi, 0x1111);
        assert_eq!(rdi, 0x2222);
        assert_eq!(xmm6.to_bits(), 0x3333);
    }
}
