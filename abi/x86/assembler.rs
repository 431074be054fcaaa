/// x86-64 assembler for call stub generation
///
/// Code is emitted into an owned buffer and copied into executable memory
/// once complete, so every operand that refers to another address is an
/// absolute 64-bit immediate rather than a rel32 displacement.
pub struct Assembler {
    code: Vec<u8>,
}

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R11: u8 = 11;
pub const R12: u8 = 12;

impl Assembler {
    pub fn new() -> Self {
        Self {
            code: Vec::with_capacity(256),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    /// Loads a 64-bit immediate value into a register
    /// MOV reg, imm64
    pub fn emit_mov_imm64(&mut self, reg: u8, value: u64) {
        // REX.W + B8+rd imm64
        let rex = 0x48 | if reg >= 8 { 1 } else { 0 };
        self.emit_u8(rex);
        self.emit_u8(0xb8 + (reg & 7));
        self.emit_u64(value);
    }

    /// Emits a CALL instruction to a register (CALL reg)
    pub fn emit_call_reg(&mut self, reg: u8) {
        if reg >= 8 {
            self.emit_u8(0x41); // REX.B prefix for R8-R15
        }
        self.emit_u8(0xff); // CALL r/m64
        self.emit_u8(0xd0 | (reg & 0x7)); // ModRM: 11 010 reg
    }

    /// PUSH r64
    pub fn emit_push_reg64(&mut self, reg: u8) {
        if reg >= 8 {
            self.emit_u8(0x41);
        }
        self.emit_u8(0x50 + (reg & 7));
    }

    /// POP r64
    pub fn emit_pop_reg64(&mut self, reg: u8) {
        if reg >= 8 {
            self.emit_u8(0x41);
        }
        self.emit_u8(0x58 + (reg & 7));
    }

    /// MOV dst, src
    pub fn emit_mov_reg_to_reg(&mut self, dst: u8, src: u8) {
        // For opcode 0x89 (MOV r/m, r) src goes in REG, dst in R/M
        self.emit_u8(rex(true, src, dst));
        self.emit_u8(0x89);
        self.emit_u8(0xc0 | ((src & 7) << 3) | (dst & 7));
    }

    /// SUB RSP, imm32
    pub fn emit_sub_rsp_imm32(&mut self, value: u32) {
        self.emit_u8(0x48);
        self.emit_u8(0x81);
        self.emit_u8(0xec); // ModRM: 11 101 100
        self.emit_u32(value);
    }

    /// ADD RSP, imm32
    pub fn emit_add_rsp_imm32(&mut self, value: u32) {
        self.emit_u8(0x48);
        self.emit_u8(0x81);
        self.emit_u8(0xc4); // ModRM: 11 000 100
        self.emit_u32(value);
    }

    /// MOV dst, [base + disp32]
    pub fn emit_load64(&mut self, dst: u8, base: u8, disp: i32) {
        self.emit_u8(rex(true, dst, base));
        self.emit_u8(0x8b);
        self.emit_mem_operand(dst, base, disp);
    }

    /// MOV [base + disp32], src
    pub fn emit_store64(&mut self, base: u8, disp: i32, src: u8) {
        self.emit_u8(rex(true, src, base));
        self.emit_u8(0x89);
        self.emit_mem_operand(src, base, disp);
    }

    /// MOVSD xmm, [base + disp32]
    pub fn emit_movsd_load(&mut self, xmm: u8, base: u8, disp: i32) {
        self.emit_sse(0xf2, 0x10, xmm, base, disp);
    }

    /// MOVSD [base + disp32], xmm
    pub fn emit_movsd_store(&mut self, base: u8, disp: i32, xmm: u8) {
        self.emit_sse(0xf2, 0x11, xmm, base, disp);
    }

    /// MOVDQU xmm, [base + disp32]
    pub fn emit_movdqu_load(&mut self, xmm: u8, base: u8, disp: i32) {
        self.emit_sse(0xf3, 0x6f, xmm, base, disp);
    }

    /// MOVDQU [base + disp32], xmm
    pub fn emit_movdqu_store(&mut self, base: u8, disp: i32, xmm: u8) {
        self.emit_sse(0xf3, 0x7f, xmm, base, disp);
    }

    /// RET
    pub fn emit_ret(&mut self) {
        self.emit_u8(0xc3);
    }

    /// Mandatory prefix, optional REX, 0F opcode, then a disp32 memory operand.
    fn emit_sse(&mut self, prefix: u8, opcode: u8, xmm: u8, base: u8, disp: i32) {
        assert!(xmm < 16, "Invalid XMM register number: {}", xmm);
        // The mandatory prefix must precede REX
        self.emit_u8(prefix);
        let rex = rex(false, xmm, base);
        if rex != 0x40 {
            self.emit_u8(rex);
        }
        self.emit_u8(0x0f);
        self.emit_u8(opcode);
        self.emit_mem_operand(xmm, base, disp);
    }

    /// ModRM (mod=10) with a 32-bit displacement. RSP and R12 as a base need a SIB byte.
    fn emit_mem_operand(&mut self, reg: u8, base: u8, disp: i32) {
        self.emit_u8(0x80 | ((reg & 7) << 3) | (base & 7));
        if (base & 7) == 4 {
            self.emit_u8(0x24); // SIB: scale=0, index=none, base=RSP/R12
        }
        self.emit_u32(disp as u32);
    }

    fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// REX prefix with REX.R taken from `reg` and REX.B from `base`.
fn rex(wide: bool, reg: u8, base: u8) -> u8 {
    let mut rex = 0x40;
    if wide {
        rex |= 0x08;
    }
    if reg >= 8 {
        rex |= 0x04;
    }
    if base >= 8 {
        rex |= 0x01;
    }
    rex
}
